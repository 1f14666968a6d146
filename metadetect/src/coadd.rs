//! Weighted coaddition of registered exposures.
//!
//! All exposures in an observation set are assumed to share one pixel grid and
//! one Jacobian; only shapes are checked.
//!
//! # Algorithm
//!
//! For each exposure with a positive median weight `m`:
//! 1. Draw a noise image at the level `sqrt(1 / m)`
//! 2. Accumulate `m × image` and `m × noise`
//!
//! The coadd is the accumulated image divided by `Σm`. Its weight map is uniform,
//! `1 / var(Σ m × noise / Σm)`, so it reflects the noise of the combination rather
//! than any single input. The PSF images are combined the same way with their own
//! weights and noise draws. The bad-pixel mask is the OR of all inputs.

use log::warn;
use ndarray::Array2;
use rand::Rng;
use shear_math::stats::variance;
use thiserror::Error;

use crate::noise::{median_weight_noise, normal_noise_array, NoiseError};
use crate::observation::{Exposure, ObservationError, ObservationSet};

#[derive(Error, Debug)]
pub enum CoaddError {
    #[error("exposure {index} has no PSF")]
    MissingPsf { index: usize },

    #[error("{what} of exposure {index} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("{what}: sum of median weights {wsum} is not positive")]
    ZeroWeightSum { what: &'static str, wsum: f64 },

    #[error("{what}: coadded noise variance {variance} is not positive")]
    DegenerateNoise { what: &'static str, variance: f64 },

    #[error("noise generation failed: {0}")]
    Noise(#[from] NoiseError),

    #[error(transparent)]
    Observation(#[from] ObservationError),
}

/// Running weighted sums for one image plane and its noise realization.
struct Accumulator {
    what: &'static str,
    image: Array2<f64>,
    noise: Array2<f64>,
    wsum: f64,
}

impl Accumulator {
    fn new(what: &'static str, dims: (usize, usize)) -> Self {
        Self {
            what,
            image: Array2::zeros(dims),
            noise: Array2::zeros(dims),
            wsum: 0.0,
        }
    }

    /// Add one plane, drawing its noise from `rng`. Planes with non-positive
    /// median weight are skipped and draw nothing.
    fn add<R: Rng + ?Sized>(
        &mut self,
        index: usize,
        image: &Array2<f64>,
        weight: &Array2<f64>,
        rng: &mut R,
    ) -> Result<(), CoaddError> {
        let (medweight, sigma) = match median_weight_noise(weight) {
            Ok(pair) => pair,
            Err(NoiseError::NonPositiveWeight(m)) => {
                warn!("{}: skipping exposure {index} with median weight {m}", self.what);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let noise = normal_noise_array(self.image.dim(), sigma, rng)?;
        self.image.scaled_add(medweight, image);
        self.noise.scaled_add(medweight, &noise);
        self.wsum += medweight;
        Ok(())
    }

    /// Normalized image and its uniform weight map.
    fn finish(mut self) -> Result<(Array2<f64>, Array2<f64>), CoaddError> {
        if !(self.wsum > 0.0) {
            return Err(CoaddError::ZeroWeightSum {
                what: self.what,
                wsum: self.wsum,
            });
        }

        let norm = 1.0 / self.wsum;
        self.image.mapv_inplace(|v| v * norm);
        self.noise.mapv_inplace(|v| v * norm);

        let var = variance(self.noise.iter()).unwrap_or(f64::NAN);
        if !(var > 0.0) {
            return Err(CoaddError::DegenerateNoise {
                what: self.what,
                variance: var,
            });
        }

        let weight = Array2::from_elem(self.image.dim(), 1.0 / var);
        Ok((self.image, weight))
    }
}

fn check_dims(
    what: &'static str,
    index: usize,
    expected: (usize, usize),
    found: (usize, usize),
) -> Result<(), CoaddError> {
    if expected != found {
        return Err(CoaddError::ShapeMismatch {
            what,
            index,
            expected,
            found,
        });
    }
    Ok(())
}

/// Coadd all bands and epochs of an observation set into one exposure.
///
/// A set holding a single exposure is returned as an unchanged copy and draws no
/// random numbers.
///
/// # Arguments
/// * `obs` - Registered exposures, each with a PSF
/// * `rng` - Source for the noise realizations, consumed in band-major order,
///   image before PSF for each exposure
///
/// # Returns
/// * `Ok(Exposure)` - Coadd carrying the first exposure's Jacobian
/// * `Err(CoaddError)` - On missing PSFs, shape mismatches, or degenerate weights
pub fn coadd_observation_set<R: Rng + ?Sized>(
    obs: &ObservationSet,
    rng: &mut R,
) -> Result<Exposure, CoaddError> {
    if obs.is_single() {
        return Ok(obs.first().clone());
    }

    let first = obs.first();
    let dims = first.dim();
    let psf_dims = first
        .psf()
        .map(Exposure::dim)
        .ok_or(CoaddError::MissingPsf { index: 0 })?;

    let mut image_acc = Accumulator::new("image", dims);
    let mut psf_acc = Accumulator::new("psf", psf_dims);
    let mut bmask = Array2::<i32>::zeros(dims);

    for (index, exposure) in obs.exposures().enumerate() {
        check_dims("image", index, dims, exposure.dim())?;
        let psf = exposure.psf().ok_or(CoaddError::MissingPsf { index })?;
        check_dims("psf", index, psf_dims, psf.dim())?;

        image_acc.add(index, exposure.image(), exposure.weight(), rng)?;
        psf_acc.add(index, psf.image(), psf.weight(), rng)?;

        bmask.zip_mut_with(exposure.bmask(), |acc, &b| *acc |= b);
    }

    let (image, weight) = image_acc.finish()?;
    let (psf_image, psf_weight) = psf_acc.finish()?;

    let mut coadd = first.clone();
    coadd.replace_pixels(image, weight, bmask)?;
    if let Some(psf) = coadd.psf_mut() {
        let psf_bmask = psf.bmask().clone();
        psf.replace_pixels(psf_image, psf_weight, psf_bmask)?;
    }

    Ok(coadd)
}
