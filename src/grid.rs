//! Regular uv grids and the scatter-accumulate engine that fills them.

use itertools::izip;
use log::debug;
use ndarray::Array2;
use num_complex::Complex64;

use crate::error::AlignmentError;

/// A square uv grid holding accumulated visibilities.
///
/// Every sample is accumulated twice: once at its forward cell and once,
/// conjugated, at the point reflection of that cell through the grid center,
/// so the grid always satisfies Hermitian symmetry. Cells never visited stay
/// at zero visibility, weight and count.
#[derive(Clone, Debug)]
pub struct Grid {
    /// Accumulated complex visibilities. Shape `(npix, npix)`.
    pub vis: Array2<Complex64>,
    /// Accumulated weights. Shape `(npix, npix)`.
    pub weight: Array2<f64>,
    /// Number of samples accumulated per cell. Shape `(npix, npix)`.
    pub count: Array2<u32>,
    /// u coordinate of each cell center in wavelengths. Varies along axis 0.
    pub uu: Array2<f64>,
    /// v coordinate of each cell center in wavelengths. Varies along axis 1.
    pub vv: Array2<f64>,
    npix: usize,
    du: f64,
    dv: f64,
}

impl Grid {
    /// Create an empty grid with `npix` cells of `du` x `dv` wavelengths.
    ///
    /// The cell-center coordinates run from `(-npix/2 + 0.5) * du` in steps
    /// of `du` (and analogously for v). The number of steps is derived with
    /// the same `ceil((stop - start) / step)` rule the coordinate arrays of
    /// the original pipeline used; certain `(cell_size, npix)` combinations
    /// make this come out one element too long, which is reported as
    /// [`AlignmentError::GridShape`] so the caller can perturb `npix`.
    pub fn new(npix: usize, du: f64, dv: f64) -> Result<Self, AlignmentError> {
        let half = npix as f64 / 2.0;
        let start_u = (-half + 0.5) * du;
        let start_v = (-half + 0.5) * dv;
        let stop_u = (half + 0.5) * du;
        let stop_v = (half + 0.5) * dv;
        let len_u = ((stop_u - start_u) / du).ceil() as usize;
        let len_v = ((stop_v - start_v) / dv).ceil() as usize;
        if len_u != npix || len_v != npix {
            return Err(AlignmentError::GridShape {
                npix,
                rows: len_u,
                cols: len_v,
            });
        }

        Ok(Self {
            vis: Array2::zeros((npix, npix)),
            weight: Array2::zeros((npix, npix)),
            count: Array2::zeros((npix, npix)),
            uu: Array2::from_shape_fn((npix, npix), |(i, _)| start_u + i as f64 * du),
            vv: Array2::from_shape_fn((npix, npix), |(_, j)| start_v + j as f64 * dv),
            npix,
            du,
            dv,
        })
    }

    /// Number of cells along each axis.
    pub fn npix(&self) -> usize {
        self.npix
    }

    /// Cell size along u in wavelengths.
    pub fn du(&self) -> f64 {
        self.du
    }

    /// Cell size along v in wavelengths.
    pub fn dv(&self) -> f64 {
        self.dv
    }

    /// Smallest and largest u cell-center coordinate.
    pub fn u_extent(&self) -> (f64, f64) {
        (self.uu[[0, 0]], self.uu[[self.npix - 1, 0]])
    }

    /// Smallest and largest v cell-center coordinate.
    pub fn v_extent(&self) -> (f64, f64) {
        (self.vv[[0, 0]], self.vv[[0, self.npix - 1]])
    }

    /// Scatter-accumulate a flat list of samples onto the grid.
    ///
    /// All four slices must have the same length. Every `(u, v)` must fall
    /// strictly inside the grid extent; [`ingest`](crate::ingest::ingest)
    /// guarantees this by dropping out-of-grid samples beforehand.
    ///
    /// This is the only hot loop in the crate and runs over up to ~1e7
    /// samples, so it does nothing but index arithmetic and accumulation.
    pub fn accumulate(&mut self, uu: &[f64], vv: &[f64], vis: &[Complex64], wgts: &[f64]) {
        debug!("Gridding {} samples.", uu.len());
        scatter(
            &mut self.vis,
            &mut self.weight,
            &mut self.count,
            self.npix,
            self.du,
            self.dv,
            uu,
            vv,
            vis,
            wgts,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn scatter(
    grid_vis: &mut Array2<Complex64>,
    grid_wgts: &mut Array2<f64>,
    grid_nvis: &mut Array2<u32>,
    npix: usize,
    du: f64,
    dv: f64,
    uu: &[f64],
    vv: &[f64],
    vis: &[Complex64],
    wgts: &[f64],
) {
    let half = npix as f64 / 2.0;
    for (&u, &v, &s, &w) in izip!(uu, vv, vis, wgts) {
        let uidx_a = (half + u / du + 0.5) as usize;
        let uidx_b = (half - u / du + 0.5) as usize;
        let vidx_a = (half + v / dv + 0.5) as usize;
        let vidx_b = (half - v / dv + 0.5) as usize;
        grid_vis[[uidx_a, vidx_a]] += s;
        grid_vis[[uidx_b, vidx_b]] += s.conj();
        grid_wgts[[uidx_a, vidx_a]] += w;
        grid_wgts[[uidx_b, vidx_b]] += w;
        grid_nvis[[uidx_a, vidx_a]] += 1;
        grid_nvis[[uidx_b, vidx_b]] += 1;
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use super::*;
    use ndarray::Zip;
    use rayon::prelude::*;

    /// Samples per partition. Each partition accumulates into its own grid
    /// copy, so this trades memory against scheduling overhead.
    const PARTITION: usize = 1 << 18;

    impl Grid {
        /// Scatter-accumulate in parallel.
        ///
        /// The sample list is split into partitions, each partition is
        /// gridded into a private copy, and the copies are summed. Results
        /// are identical to [`accumulate`](Grid::accumulate) up to
        /// floating-point addition order.
        pub fn accumulate_par(&mut self, uu: &[f64], vv: &[f64], vis: &[Complex64], wgts: &[f64]) {
            debug!("Gridding {} samples in parallel.", uu.len());
            let npix = self.npix;
            let (du, dv) = (self.du, self.dv);

            let partials = uu
                .par_chunks(PARTITION)
                .zip(vv.par_chunks(PARTITION))
                .zip(vis.par_chunks(PARTITION))
                .zip(wgts.par_chunks(PARTITION))
                .map(|(((cu, cv), cs), cw)| {
                    let mut part_vis = Array2::zeros((npix, npix));
                    let mut part_wgts = Array2::zeros((npix, npix));
                    let mut part_nvis = Array2::zeros((npix, npix));
                    scatter(
                        &mut part_vis,
                        &mut part_wgts,
                        &mut part_nvis,
                        npix,
                        du,
                        dv,
                        cu,
                        cv,
                        cs,
                        cw,
                    );
                    (part_vis, part_wgts, part_nvis)
                })
                .reduce_with(|(va, wa, na), (vb, wb, nb)| (va + vb, wa + wb, na + nb));

            if let Some((part_vis, part_wgts, part_nvis)) = partials {
                Zip::from(&mut self.vis)
                    .and(&part_vis)
                    .for_each(|a, &b| *a += b);
                Zip::from(&mut self.weight)
                    .and(&part_wgts)
                    .for_each(|a, &b| *a += b);
                Zip::from(&mut self.count)
                    .and(&part_nvis)
                    .for_each(|a, &b| *a += b);
            }
        }
    }
}

/// A gridded dataset together with its provenance.
///
/// Produced once per alignment call by [`ingest`](crate::ingest::ingest) and
/// never mutated afterwards; overlap masking returns fresh copies.
#[derive(Clone, Debug)]
pub struct GriddedDataset {
    /// The accumulated uv grid.
    pub grid: Grid,
    /// Identifier of the dataset the grid was built from.
    pub source: String,
    /// Image-plane cell size in arcseconds used to derive the grid.
    pub cell_size: f64,
}

impl GriddedDataset {
    /// Number of grid cells along each axis.
    pub fn npix(&self) -> usize {
        self.grid.npix()
    }
}
