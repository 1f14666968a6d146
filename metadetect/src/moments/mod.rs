//! Weighted-moments shape measurement.
//!
//! - [`weighted`]: the estimator for a single exposure
//! - [`measurer`]: per-object driver with bad-pixel checks, coaddition and flags

pub mod measurer;
pub mod weighted;

pub use measurer::{MomentsMeasurer, MomentsOutput, MomentsRow, ObjectState};
pub use weighted::{weighted_moments, MomentsResult, NPARS};
