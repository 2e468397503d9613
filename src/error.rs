//! Error type shared by the gridding, optimization and alignment stages.

use thiserror::Error;

/// All errors that can occur while deriving or applying a phase-center offset.
#[derive(Error, Debug)]
pub enum AlignmentError {
    /// The dataset contains more than one astronomical field.
    /// Alignment assumes exactly one field per dataset.
    #[error("dataset {dataset} contains {fields} fields; expected exactly one")]
    MultiField {
        /// Identifier of the offending dataset.
        dataset: String,
        /// Number of fields found.
        fields: usize,
    },

    /// The chosen grid does not cover all visibility samples and strict
    /// coverage was requested. Retry with a larger `npix` or `cell_size`.
    #[error("{samples} samples of {dataset} fall outside the uv grid")]
    Coverage {
        /// Identifier of the offending dataset.
        dataset: String,
        /// Number of samples outside the grid extent.
        samples: usize,
    },

    /// Floating-point edge case in the grid-coordinate construction produced
    /// a mis-sized coordinate array. Retry with a slightly different `npix`.
    #[error("uv coordinate grid came out {rows}x{cols} instead of {npix}x{npix}; choose a slightly different npix")]
    GridShape {
        /// Requested grid size.
        npix: usize,
        /// Number of u coordinates actually produced.
        rows: usize,
        /// Number of v coordinates actually produced.
        cols: usize,
    },

    /// The phase-center reference frame is neither ICRS nor J2000.
    #[error("unable to determine the reference frame of {0:?}")]
    UnknownFrame(String),

    /// The offset minimization did not converge.
    #[error("offset minimization failed: {0}")]
    Optimization(String),

    /// The visibility store reported an error.
    #[error("visibility store: {0}")]
    Store(String),

    /// The astrometry service reported an error.
    #[error("astrometry service: {0}")]
    Astrometry(String),
}
