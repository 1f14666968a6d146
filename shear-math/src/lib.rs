//! Numerical building blocks shared by the shear measurement pipeline.
//!
//! - [`matrix2`]: 2x2 inversion and the area-preserving shear matrix
//! - [`stats`]: NaN-aware median and population variance
//! - [`bilinear`]: pixel-grid interpolation used to resample sheared images
//! - [`levmar`]: Levenberg-Marquardt least squares with numerical Jacobians

pub mod bilinear;
pub mod levmar;
pub mod matrix2;
pub mod stats;

pub use bilinear::{GridInterpolator, InterpolationError};
pub use levmar::{minimize, LeastSquaresModel, LmConfig, LmError, LmResult};
pub use matrix2::{invert_matrix, shear_matrix, transform, ShearMagnitudeError, SingularMatrixError};
pub use stats::{median, variance, StatsError};
