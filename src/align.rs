//! Orchestration: frame normalization, offset derivation and application.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};

use crate::error::AlignmentError;
use crate::ingest::{VisibilityStore, ingest};
use crate::objective::Residual;
use crate::optimize::find_offset;
use crate::{ARCSEC, Offset};

/// Celestial reference frame of a phase center.
///
/// Only the two frames the alignment pipeline can encounter are modeled;
/// anything else fails at parse time with [`AlignmentError::UnknownFrame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Frame {
    /// International Celestial Reference System.
    Icrs,
    /// FK5 at equinox J2000.
    J2000,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Icrs => write!(f, "ICRS"),
            Frame::J2000 => write!(f, "J2000"),
        }
    }
}

impl FromStr for Frame {
    type Err = AlignmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ICRS" => Ok(Frame::Icrs),
            "J2000" => Ok(Frame::J2000),
            other => Err(AlignmentError::UnknownFrame(other.to_owned())),
        }
    }
}

/// A phase-center coordinate tagged with its reference frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseCenter {
    /// Reference frame of the coordinate.
    pub frame: Frame,
    /// Right ascension in radians.
    pub ra: f64,
    /// Declination in radians.
    pub dec: f64,
}

impl PhaseCenter {
    /// Shift the coordinate by an [`Offset`], dividing the right-ascension
    /// component by `cos(dec)` to convert the angular separation into a
    /// coordinate difference.
    pub fn shifted(self, offset: Offset) -> Self {
        Self {
            frame: self.frame,
            ra: self.ra + offset.ra * ARCSEC / self.dec.cos(),
            dec: self.dec + offset.dec * ARCSEC,
        }
    }
}

/// External astrometry service.
///
/// Covers everything the orchestrator cannot do itself: reading and
/// rewriting stored phase centers, coordinate-frame transforms and creating
/// temporary frame-converted dataset copies.
pub trait AstrometryService {
    /// Phase center of the dataset.
    fn phase_center(&self, dataset: &str) -> Result<PhaseCenter, AlignmentError>;

    /// Transform a coordinate to J2000. A no-op for J2000 input.
    fn to_j2000(&self, coord: PhaseCenter) -> Result<PhaseCenter, AlignmentError>;

    /// Create a temporary copy of the dataset reprojected to `frame` and
    /// return its identifier.
    fn reproject(&mut self, dataset: &str, frame: Frame) -> Result<String, AlignmentError>;

    /// Rewrite the dataset's phase center to `new_center`, reconciling any
    /// ephemeris-relative direction bookkeeping against `reference_center`.
    /// Both coordinates must be J2000.
    fn set_phase_center(
        &mut self,
        dataset: &str,
        new_center: PhaseCenter,
        reference_center: PhaseCenter,
    ) -> Result<(), AlignmentError>;

    /// Delete a temporary dataset copy created by
    /// [`reproject`](AstrometryService::reproject).
    fn remove(&mut self, dataset: &str) -> Result<(), AlignmentError>;
}

/// The central struct of this library.
///
/// Aligns the phase centers of comparison datasets to a reference dataset.
/// Construct with [`Aligner::new()`] and adjust the gridding and search
/// parameters via the `with_*()` functions; see the module-level
/// documentation for the sequence of steps one alignment performs.
pub struct Aligner<'a, S: VisibilityStore, A: AstrometryService> {
    store: &'a S,
    astrometry: &'a mut A,
    npix: usize,
    cell_size: f64,
    spectral_window: usize,
    fail_silently: bool,
    residual: Residual,
    precomputed: HashMap<String, Offset>,
}

impl<'a, S: VisibilityStore, A: AstrometryService> Aligner<'a, S, A> {
    /// Create an aligner with the default grid (1024 cells of 0.01 arcsec)
    /// reading spectral window 0.
    pub fn new(store: &'a S, astrometry: &'a mut A) -> Self {
        Self {
            store,
            astrometry,
            npix: 1024,
            cell_size: 0.01,
            spectral_window: 0,
            fail_silently: false,
            residual: Residual::default(),
            precomputed: HashMap::new(),
        }
    }

    /// Set the number of grid cells along each axis.
    pub fn with_grid_size(mut self, npix: usize) -> Self {
        self.npix = npix;
        self
    }

    /// Set the image-plane cell size in arcseconds. Coarser cells suit
    /// short-baseline data, finer cells long-baseline data.
    pub fn with_cell_size(mut self, cell_size: f64) -> Self {
        self.cell_size = cell_size;
        self
    }

    /// Set the spectral window to align on.
    pub fn with_spectral_window(mut self, spectral_window: usize) -> Self {
        self.spectral_window = spectral_window;
        self
    }

    /// Substitute a zero offset when the minimization fails instead of
    /// raising an error. The caller accepts the risk of a wrong "no shift"
    /// being applied downstream.
    pub fn with_fail_silently(mut self, fail_silently: bool) -> Self {
        self.fail_silently = fail_silently;
        self
    }

    /// Choose the residual definition of the coherence objective.
    pub fn with_residual(mut self, residual: Residual) -> Self {
        self.residual = residual;
        self
    }

    /// Provide offsets for some datasets upfront; those skip the
    /// minimization and are applied as given.
    pub fn with_precomputed_offsets(mut self, offsets: HashMap<String, Offset>) -> Self {
        self.precomputed = offsets;
        self
    }

    /// Dataset identifier to compute offsets on: the dataset itself when its
    /// phase center is already J2000, otherwise a temporary J2000-reprojected
    /// copy. The flag says whether a temporary copy was created.
    fn normalized(&mut self, dataset: &str) -> Result<(String, bool), AlignmentError> {
        let center = self.astrometry.phase_center(dataset)?;
        match center.frame {
            Frame::J2000 => {
                debug!("{dataset} is already in J2000.");
                Ok((dataset.to_owned(), false))
            }
            Frame::Icrs => {
                debug!("{dataset} is in ICRS; using a J2000 copy for the offset.");
                let copy = self.astrometry.reproject(dataset, Frame::J2000)?;
                Ok((copy, true))
            }
        }
    }

    /// Grid both datasets and minimize the coherence cost between them.
    /// Expects both identifiers to refer to J2000 data.
    fn offset_between(&self, reference: &str, comparison: &str) -> Result<Offset, AlignmentError> {
        let reference_grid = ingest(
            self.store,
            reference,
            self.npix,
            self.cell_size,
            self.spectral_window,
            false,
        )?;
        let comparison_grid = ingest(
            self.store,
            comparison,
            self.npix,
            self.cell_size,
            self.spectral_window,
            true,
        )?;
        find_offset(
            &reference_grid,
            &comparison_grid,
            self.residual,
            self.fail_silently,
        )
    }

    /// Remove a temporary reprojected copy. A removal failure is propagated
    /// only when `result` carries no earlier error; otherwise it is logged
    /// and the primary error kept.
    fn remove_temp<T>(
        &mut self,
        dataset: &str,
        result: Result<T, AlignmentError>,
    ) -> Result<T, AlignmentError> {
        match (self.astrometry.remove(dataset), result) {
            (Ok(()), result) => result,
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(primary)) => {
                warn!("Leaving the temporary copy {dataset} behind: {err}");
                Err(primary)
            }
        }
    }

    /// Derive the offset of a single comparison dataset relative to the
    /// reference, without applying it.
    pub fn find_offset(
        &mut self,
        reference: &str,
        comparison: &str,
    ) -> Result<Offset, AlignmentError> {
        let (reference_id, reference_is_temp) = self.normalized(reference)?;
        let (comparison_id, comparison_is_temp) = self.normalized(comparison)?;

        // Temporary copies are removed regardless of the outcome.
        let mut result = self.offset_between(&reference_id, &comparison_id);
        if comparison_is_temp {
            result = self.remove_temp(&comparison_id, result);
        }
        if reference_is_temp {
            result = self.remove_temp(&reference_id, result);
        }
        result
    }

    /// Align every comparison dataset to the reference.
    ///
    /// For each comparison this derives the offset (or takes the precomputed
    /// one), shifts the comparison's J2000 phase center by it and rewrites
    /// the stored phase center anchored to the reference's own J2000
    /// coordinate. Returns the offset applied to each dataset.
    pub fn align(
        &mut self,
        reference: &str,
        comparisons: &[&str],
    ) -> Result<HashMap<String, Offset>, AlignmentError> {
        let reference_center = self.astrometry.phase_center(reference)?;
        let reference_center = self.astrometry.to_j2000(reference_center)?;
        let (reference_id, reference_is_temp) = self.normalized(reference)?;

        let mut applied = HashMap::with_capacity(comparisons.len());
        for &comparison in comparisons {
            let result = self.align_one(reference, &reference_id, reference_center, comparison);
            match result {
                Ok(offset) => {
                    applied.insert(comparison.to_owned(), offset);
                }
                Err(err) if reference_is_temp => {
                    return self.remove_temp(&reference_id, Err(err));
                }
                Err(err) => return Err(err),
            }
        }

        if reference_is_temp {
            self.astrometry.remove(&reference_id)?;
        }
        Ok(applied)
    }

    fn align_one(
        &mut self,
        reference: &str,
        reference_id: &str,
        reference_center: PhaseCenter,
        comparison: &str,
    ) -> Result<Offset, AlignmentError> {
        let offset = if comparison == reference {
            if let Some(precomputed) = self.precomputed.get(comparison) {
                if *precomputed != Offset::ZERO {
                    warn!("Ignoring the nonzero precomputed offset of the reference dataset.");
                }
            }
            info!("{comparison} is the reference; no shift.");
            Offset::ZERO
        } else if let Some(&precomputed) = self.precomputed.get(comparison) {
            info!("Using the given offset {precomputed} for {comparison}.");
            precomputed
        } else {
            let (comparison_id, comparison_is_temp) = self.normalized(comparison)?;
            let mut result = self.offset_between(reference_id, &comparison_id);
            if comparison_is_temp {
                result = self.remove_temp(&comparison_id, result);
            }
            let offset = result?;
            info!("{comparison} requires a shift of {offset}.");
            offset
        };

        let center = self.astrometry.phase_center(comparison)?;
        let shifted = self.astrometry.to_j2000(center)?.shifted(offset);
        self.astrometry
            .set_phase_center(comparison, shifted, reference_center)?;
        Ok(offset)
    }
}
