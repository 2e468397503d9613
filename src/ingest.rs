//! Reading a visibility store and gridding its samples.

use log::{info, warn};
use num_complex::Complex64;

use crate::error::AlignmentError;
use crate::grid::{Grid, GriddedDataset};
use crate::{ARCSEC, SPEED_OF_LIGHT};

/// One visibility row as exposed by a [`VisibilityStore`].
///
/// `data` and `flags` hold one entry per channel for each of the two
/// polarization products; `weights` is per polarization.
#[derive(Clone, Debug)]
pub struct VisibilityRow {
    /// First antenna of the baseline.
    pub antenna1: usize,
    /// Second antenna of the baseline.
    pub antenna2: usize,
    /// Baseline vector (u, v, w) in meters.
    pub uvw: [f64; 3],
    /// Per-polarization weights.
    pub weights: [f64; 2],
    /// Per-polarization, per-channel complex visibilities.
    pub data: [Vec<Complex64>; 2],
    /// Per-polarization, per-channel flags.
    pub flags: [Vec<bool>; 2],
}

/// External visibility storage, addressed by dataset identifier.
///
/// Implementations wrap whatever holds the raw data (a measurement set, a
/// test fixture); the ingestor only ever reads through this trait.
pub trait VisibilityStore {
    /// Number of astronomical fields in the dataset.
    fn field_count(&self, dataset: &str) -> Result<usize, AlignmentError>;

    /// Channel rest frequencies in Hz for the given spectral window.
    fn channel_frequencies(&self, dataset: &str, spectral_window: usize)
    -> Result<Vec<f64>, AlignmentError>;

    /// All visibility rows of the given spectral window.
    fn rows(&self, dataset: &str, spectral_window: usize)
    -> Result<Vec<VisibilityRow>, AlignmentError>;
}

/// Grid one spectral window of a dataset onto an `npix` x `npix` uv grid
/// with an image-plane cell size of `cell_size` arcseconds.
///
/// Polarizations are averaged to a single visibility per sample
/// (`(p0 + p1) / 2`, weights summed) and the baseline is converted from
/// meters to wavelengths per channel, flattening the channel axis against
/// the rows. Autocorrelations, fully flagged samples and samples outside
/// the grid extent are dropped; out-of-grid samples raise
/// [`AlignmentError::Coverage`] when `must_cover_all_data` is set.
///
/// Rows whose per-channel vectors disagree with the channel list are
/// reported as [`AlignmentError::Store`] rather than trusted.
pub fn ingest<S: VisibilityStore + ?Sized>(
    store: &S,
    dataset: &str,
    npix: usize,
    cell_size: f64,
    spectral_window: usize,
    must_cover_all_data: bool,
) -> Result<GriddedDataset, AlignmentError> {
    let fields = store.field_count(dataset)?;
    if fields != 1 {
        return Err(AlignmentError::MultiField {
            dataset: dataset.to_owned(),
            fields,
        });
    }

    let chan_freqs = store.channel_frequencies(dataset, spectral_window)?;
    let rows = store.rows(dataset, spectral_window)?;
    info!(
        "Ingesting {} rows x {} channels of {dataset}.",
        rows.len(),
        chan_freqs.len()
    );

    let mut uu = Vec::with_capacity(rows.len() * chan_freqs.len());
    let mut vv = Vec::with_capacity(uu.capacity());
    let mut vis = Vec::with_capacity(uu.capacity());
    let mut wgts = Vec::with_capacity(uu.capacity());
    for row in &rows {
        // Autocorrelation placeholders carry no spatial information.
        if row.antenna1 == row.antenna2 {
            continue;
        }
        if row.data.iter().any(|d| d.len() != chan_freqs.len())
            || row.flags.iter().any(|f| f.len() != chan_freqs.len())
        {
            return Err(AlignmentError::Store(format!(
                "a row of {dataset} does not carry {} channels per polarization",
                chan_freqs.len()
            )));
        }
        let weight = row.weights[0] + row.weights[1];
        for (channel, &freq) in chan_freqs.iter().enumerate() {
            // A sample is only discarded when every polarization flags it.
            if row.flags[0][channel] && row.flags[1][channel] {
                continue;
            }
            uu.push(row.uvw[0] * freq / SPEED_OF_LIGHT);
            vv.push(row.uvw[1] * freq / SPEED_OF_LIGHT);
            vis.push((row.data[0][channel] + row.data[1][channel]) / 2.0);
            wgts.push(weight);
        }
    }

    let cell_rad = cell_size * ARCSEC;
    let du = 1.0 / npix as f64 / cell_rad;
    let dv = 1.0 / npix as f64 / cell_rad;
    let mut grid = Grid::new(npix, du, dv)?;

    // Toss away samples that fall outside of the grid.
    let (min_uu, max_uu) = grid.u_extent();
    let (min_vv, max_vv) = grid.v_extent();
    let inside =
        |u: f64, v: f64| min_uu < u && u < max_uu && min_vv < v && v < max_vv;
    let total = uu.len();
    let mut kept = 0;
    for i in 0..total {
        if inside(uu[i], vv[i]) {
            uu[kept] = uu[i];
            vv[kept] = vv[i];
            vis[kept] = vis[i];
            wgts[kept] = wgts[i];
            kept += 1;
        }
    }
    if kept < total {
        warn!("{} samples of {dataset} are outside the uv grid.", total - kept);
        if must_cover_all_data {
            return Err(AlignmentError::Coverage {
                dataset: dataset.to_owned(),
                samples: total - kept,
            });
        }
    }
    uu.truncate(kept);
    vv.truncate(kept);
    vis.truncate(kept);
    wgts.truncate(kept);

    #[cfg(feature = "parallel")]
    grid.accumulate_par(&uu, &vv, &vis, &wgts);
    #[cfg(not(feature = "parallel"))]
    grid.accumulate(&uu, &vv, &vis, &wgts);

    Ok(GriddedDataset {
        grid,
        source: dataset.to_owned(),
        cell_size,
    })
}
