#![warn(missing_docs)]

//! Alignment of the astrometric phase centers of interferometric
//! observations of the same sky field, so that their visibility data can be
//! combined coherently. \
//! Given a reference dataset and one or more comparison datasets, the
//! library grids each one onto a shared regular spatial-frequency (u,v)
//! plane and searches for the 2-parameter sky offset that best removes the
//! complex-visibility mismatch over the region of common coverage.
//!
//! ## Interface
//! The central struct of this library is [`Aligner`]. It is created with
//! [`Aligner::new()`] from two external collaborators: a
//! [`VisibilityStore`] that exposes the raw visibility rows, and an
//! [`AstrometryService`] that owns reference-frame bookkeeping and the
//! final rewrite of a dataset's stored phase center. Gridding and search
//! parameters are set via `Aligner::with_*()` functions.
//!
//! Example:
//! ```rust,ignore
//! let offsets = Aligner::new(&store, &mut astrometry)
//!     .with_grid_size(1024)
//!     .with_cell_size(0.01)
//!     .align("reference.ms", &["comparison_a.ms", "comparison_b.ms"])?;
//! ```
//!
//! One alignment performs, per comparison dataset: frame normalization
//! (ICRS datasets are measured on a temporary J2000 copy), ingestion and
//! gridding of both datasets, masking to the overlapping uv cells, a
//! quasi-Newton minimization of the coherence cost, and the application of
//! the resulting offset through the astrometry service. The lower-level
//! pieces ([`ingest`](ingest::ingest), [`find_offset`], [`mask_overlap`],
//! [`phase_shift`]) are public for callers that want to work on
//! [`GriddedDataset`]s directly.
//!
//! ## Parameters
//! - `grid_size`: Number of uv cells along each axis (default 1024).
//! - `cell_size`: Image-plane cell size in arcseconds (default 0.01).
//!     Together with `grid_size` this fixes the uv resolution; pick a
//!     coarser grid for short-baseline data and a finer one for
//!     long-baseline data.
//! - `fail_silently`: Substitute a zero offset when the minimization does
//!     not converge instead of failing the batch.

pub mod align;
pub mod error;
pub mod grid;
pub mod ingest;
pub(crate) mod objective;
pub(crate) mod optimize;

pub use align::{Aligner, AstrometryService, Frame, PhaseCenter};
pub use error::AlignmentError;
pub use grid::{Grid, GriddedDataset};
pub use ingest::{VisibilityRow, VisibilityStore, ingest};
pub use objective::{Residual, mask_overlap, phase_shift};
pub use optimize::find_offset;

/// One arcsecond in radians.
pub(crate) const ARCSEC: f64 = std::f64::consts::PI / 180.0 / 3600.0;

/// Speed of light in m/s.
pub(crate) const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// A sky-position offset in arcseconds.
///
/// The right-ascension component is an angular separation; any `cos(dec)`
/// correction is applied only when the offset is folded into a coordinate
/// (see [`PhaseCenter::shifted`]).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Offset {
    /// Right ascension offset in arcseconds.
    pub ra: f64,
    /// Declination offset in arcseconds.
    pub dec: f64,
}

impl Offset {
    /// The null offset.
    pub const ZERO: Self = Self { ra: 0.0, dec: 0.0 };

    /// Create an offset from its right-ascension and declination components
    /// in arcseconds.
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:+.5}, {:+.5}) arcsec", self.ra, self.dec)
    }
}

impl From<nalgebra::Vector2<f64>> for Offset {
    fn from(x: nalgebra::Vector2<f64>) -> Self {
        Self { ra: x[0], dec: x[1] }
    }
}

impl From<Offset> for nalgebra::Vector2<f64> {
    fn from(offset: Offset) -> Self {
        Self::new(offset.ra, offset.dec)
    }
}
