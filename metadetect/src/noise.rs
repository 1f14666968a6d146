//! Gaussian noise fields.
//!
//! Noise images are drawn from a caller-supplied random source so that every
//! stochastic step in the pipeline is reproducible from its seed.

use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use shear_math::stats::median;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NoiseError {
    #[error("noise level {0} must be finite and non-negative")]
    InvalidSigma(f64),
    #[error("median weight {0} must be positive to set a noise level")]
    NonPositiveWeight(f64),
}

fn normal_dist(std_dev: f64) -> Result<Normal<f64>, NoiseError> {
    if !(std_dev >= 0.0 && std_dev.is_finite()) {
        return Err(NoiseError::InvalidSigma(std_dev));
    }
    Normal::new(0.0, std_dev).map_err(|_| NoiseError::InvalidSigma(std_dev))
}

/// Draw a zero-mean Gaussian noise image.
///
/// # Arguments
/// * `size` - Tuple of (rows, cols) for the output array
/// * `std_dev` - Standard deviation of every pixel
/// * `rng` - Random source; pixels are drawn in row-major order
pub fn normal_noise_array<R: Rng + ?Sized>(
    size: (usize, usize),
    std_dev: f64,
    rng: &mut R,
) -> Result<Array2<f64>, NoiseError> {
    let normal = normal_dist(std_dev)?;
    Ok(Array2::from_shape_fn(size, |_| normal.sample(&mut *rng)))
}

/// Median of a weight map and the matching per-pixel noise, `sqrt(1 / median)`.
pub fn median_weight_noise(weight: &Array2<f64>) -> Result<(f64, f64), NoiseError> {
    let values: Vec<f64> = weight.iter().copied().collect();
    let medweight = median(&values).unwrap_or(f64::NAN);
    if !(medweight > 0.0) {
        return Err(NoiseError::NonPositiveWeight(medweight));
    }
    Ok((medweight, (1.0 / medweight).sqrt()))
}
