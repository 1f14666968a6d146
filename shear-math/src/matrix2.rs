//! 2x2 matrix utilities using nalgebra
//!
//! Provides the inversions and shear distortions needed when mapping between
//! pixel and sky coordinates, with error handling for singular matrices and
//! unphysical shears.

use nalgebra::{Matrix2, Vector2};
use thiserror::Error;

/// Error when matrix inversion fails due to singular matrix
#[derive(Error, Debug, Clone, PartialEq)]
#[error("singular matrix: determinant={determinant:.6e}")]
pub struct SingularMatrixError {
    /// The determinant value (zero or near-zero)
    pub determinant: f64,
}

/// Error when a reduced shear has magnitude at or beyond one
#[derive(Error, Debug, Clone, PartialEq)]
#[error("shear magnitude {magnitude:.6} must be below 1")]
pub struct ShearMagnitudeError {
    /// |g| of the rejected shear
    pub magnitude: f64,
}

/// Threshold for considering a determinant as zero
const DETERMINANT_EPSILON: f64 = 1e-10;

/// Invert a 2x2 matrix with error handling for singular matrices
///
/// # Arguments
/// * `matrix` - The 2x2 matrix to invert
///
/// # Returns
/// * `Ok(Matrix2<f64>)` - The inverse matrix
/// * `Err(SingularMatrixError)` - If matrix is singular
pub fn invert_matrix(matrix: &Matrix2<f64>) -> Result<Matrix2<f64>, SingularMatrixError> {
    let det = matrix.determinant();

    if det.abs() < DETERMINANT_EPSILON {
        return Err(SingularMatrixError { determinant: det });
    }

    matrix
        .try_inverse()
        .ok_or(SingularMatrixError { determinant: det })
}

/// Area-preserving distortion matrix for a reduced shear (g1, g2)
///
/// Acts on (u, v) = (x, y) offsets:
///
/// ```text
/// A = 1/sqrt(1 - |g|^2) * [[1 + g1, g2], [g2, 1 - g1]]
/// ```
///
/// A point at `x` in the unsheared frame lands at `A x` in the sheared frame.
///
/// # Returns
/// * `Ok(Matrix2<f64>)` - Distortion with unit determinant
/// * `Err(ShearMagnitudeError)` - If |g| >= 1
pub fn shear_matrix(g1: f64, g2: f64) -> Result<Matrix2<f64>, ShearMagnitudeError> {
    let gsq = g1 * g1 + g2 * g2;
    if !gsq.is_finite() || gsq >= 1.0 {
        return Err(ShearMagnitudeError {
            magnitude: gsq.sqrt(),
        });
    }

    let norm = 1.0 / (1.0 - gsq).sqrt();
    Ok(Matrix2::new(1.0 + g1, g2, g2, 1.0 - g1) * norm)
}

/// Apply a 2x2 matrix to the offset (a, b) and return the components
pub fn transform(matrix: &Matrix2<f64>, a: f64, b: f64) -> (f64, f64) {
    let out = matrix * Vector2::new(a, b);
    (out.x, out.y)
}
