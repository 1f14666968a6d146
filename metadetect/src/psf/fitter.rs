//! Gaussian-mixture fits to PSF images.
//!
//! The model is rendered at pixel centers in sky coordinates and compared to the
//! PSF image with inverse-variance weights. Parameters are laid out as
//!
//! ```text
//! Gauss:              [v0, u0, g1, g2, T, F]
//! Coellip { ngauss }: [v0, u0, g1, g2, T_1..T_n, F_1..F_n]
//! ```
//!
//! # Algorithm
//!
//! 1. Collect every pixel with positive weight as a (v, u, value, sqrt(w)) sample
//! 2. Start from T = 4 × pixel area (or the configured guess) and the summed flux
//! 3. Perturb the start slightly with the caller's random source and run
//!    Levenberg-Marquardt; repeat up to `ntry` times until a fit is accepted
//! 4. Accept only converged fits with finite parameters, a positive-definite
//!    covariance, |g| < 1, positive sizes and positive total flux

use log::debug;
use rand::Rng;
use shear_math::{minimize, LeastSquaresModel, LmError, LmResult};
use thiserror::Error;

use crate::config::{PsfFitConfig, PsfModel};
use crate::gmix::{GMix, GMixError};
use crate::observation::{Exposure, ObservationSet};

/// Relative size of the random perturbation applied to each starting point.
const GUESS_JITTER: f64 = 0.01;

/// Why a PSF fit failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PsfFitError {
    #[error("exposure has no PSF attached")]
    MissingPsf,
    #[error("PSF image has no pixels with positive weight")]
    NoUsablePixels,
    #[error("fit did not converge after {tries} tries")]
    NoConvergence { tries: usize },
    #[error("fit covariance is singular or not positive")]
    DegenerateCovariance,
    #[error("fit produced non-finite parameters")]
    NonFinite,
    #[error("fitted model is unphysical: {0}")]
    InvalidModel(#[from] GMixError),
    #[error("optimizer could not run: {0}")]
    Optimizer(#[from] LmError),
}

/// Bookkeeping from the most recent fit of a PSF exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct PsfFitMeta {
    pub model: PsfModel,
    /// Attempts made, including the accepted one
    pub tries: usize,
    /// Optimizer iterations summed over all attempts
    pub iterations: usize,
    /// Chi² of the last attempt
    pub chi2: f64,
    pub converged: bool,
}

struct PixelSample {
    v: f64,
    u: f64,
    value: f64,
    sqrt_w: f64,
}

/// Mixture rendered at pixel centers, compared against one image.
struct MixtureModel {
    ngauss: usize,
    area: f64,
    pixels: Vec<PixelSample>,
}

impl MixtureModel {
    fn from_exposure(psf: &Exposure, ngauss: usize) -> Result<Self, PsfFitError> {
        let jacobian = psf.jacobian();
        let image = psf.image();

        let pixels: Vec<PixelSample> = psf
            .weight()
            .indexed_iter()
            .filter(|(_, &w)| w > 0.0)
            .map(|((row, col), &w)| {
                let (v, u) = jacobian.to_sky(row as f64, col as f64);
                PixelSample {
                    v,
                    u,
                    value: image[[row, col]],
                    sqrt_w: w.sqrt(),
                }
            })
            .collect();

        if pixels.is_empty() {
            return Err(PsfFitError::NoUsablePixels);
        }

        Ok(Self {
            ngauss,
            area: jacobian.area(),
            pixels,
        })
    }

    fn n_params(&self) -> usize {
        4 + 2 * self.ngauss
    }

    fn gmix(&self, params: &[f64]) -> Result<GMix, GMixError> {
        let n = self.ngauss;
        GMix::coellip(
            params[0],
            params[1],
            params[2],
            params[3],
            &params[4..4 + n],
            &params[4 + n..4 + 2 * n],
        )
    }

    fn flux_guess(&self) -> f64 {
        let flux: f64 = self.pixels.iter().map(|p| p.value).sum();
        if flux > 0.0 {
            flux
        } else {
            1.0
        }
    }
}

impl LeastSquaresModel for MixtureModel {
    fn n_data(&self) -> usize {
        self.pixels.len()
    }

    fn residuals(&self, params: &[f64], out: &mut [f64]) -> bool {
        let Ok(gmix) = self.gmix(params) else {
            return false;
        };
        for (r, px) in out.iter_mut().zip(&self.pixels) {
            *r = px.sqrt_w * (gmix.eval(px.v, px.u) * self.area - px.value);
        }
        true
    }
}

/// Size and flux fractions for the coelliptic components, relative to the guess.
fn component_fractions(ngauss: usize) -> (&'static [f64], &'static [f64]) {
    match ngauss {
        1 => (&[1.0], &[1.0]),
        2 => (&[0.5, 2.0], &[0.6, 0.4]),
        _ => (&[0.3, 1.0, 3.0], &[0.2, 0.5, 0.3]),
    }
}

fn perturbed_guess<R: Rng + ?Sized>(
    ngauss: usize,
    scale: f64,
    t_guess: f64,
    flux_guess: f64,
    rng: &mut R,
) -> Vec<f64> {
    let mut jitter = || rng.gen_range(-GUESS_JITTER..GUESS_JITTER);

    let mut guess = vec![
        scale * jitter(),
        scale * jitter(),
        jitter(),
        jitter(),
    ];

    let (t_fracs, f_fracs) = component_fractions(ngauss);
    for &frac in t_fracs.iter().take(ngauss) {
        guess.push(t_guess * frac * (1.0 + jitter()));
    }
    for &frac in f_fracs.iter().take(ngauss) {
        guess.push(flux_guess * frac * (1.0 + jitter()));
    }
    guess
}

fn accept(model: &MixtureModel, result: &LmResult, tries: usize) -> Result<GMix, PsfFitError> {
    if !result.converged {
        return Err(PsfFitError::NoConvergence { tries });
    }
    if result.params.iter().any(|p| !p.is_finite()) {
        return Err(PsfFitError::NonFinite);
    }

    let covariance = result
        .covariance
        .as_ref()
        .ok_or(PsfFitError::DegenerateCovariance)?;
    if covariance
        .diagonal()
        .iter()
        .any(|&var| !(var > 0.0) || !var.is_finite())
    {
        return Err(PsfFitError::DegenerateCovariance);
    }

    let gmix = model.gmix(&result.params)?;
    if !(gmix.total_flux() > 0.0) {
        return Err(GMixError::ZeroFlux.into());
    }
    // Rejects |g| >= 1 and T <= 0 of the combined mixture
    gmix.shape()?;
    Ok(gmix)
}

/// Fit a Gaussian-mixture model to a PSF exposure.
///
/// On success the fitted mixture is stored on the exposure and returned. On failure
/// the exposure's model slot keeps whatever it held before. Fit metadata is
/// recorded either way.
///
/// # Arguments
/// * `psf` - PSF image with its weight map and Jacobian
/// * `config` - Model family, optimizer settings and number of tries
/// * `rng` - Source for the starting-point perturbations
pub fn fit_psf<'a, R: Rng + ?Sized>(
    psf: &'a mut Exposure,
    config: &PsfFitConfig,
    rng: &mut R,
) -> Result<&'a GMix, PsfFitError> {
    let mut meta = PsfFitMeta {
        model: config.model,
        tries: 0,
        iterations: 0,
        chi2: f64::NAN,
        converged: false,
    };

    let ngauss = config.model.ngauss();
    let model = match MixtureModel::from_exposure(psf, ngauss) {
        Ok(model) => model,
        Err(e) => {
            psf.set_fit_meta(meta);
            return Err(e);
        }
    };

    let scale = psf.jacobian().scale();
    let t_guess = config.t_guess.unwrap_or(4.0 * scale * scale);
    let flux_guess = model.flux_guess();
    let lm_config = config.lm_pars.to_lm_config();

    let mut last_error = PsfFitError::NoConvergence { tries: 0 };
    for attempt in 1..=config.ntry {
        meta.tries = attempt;
        let guess = perturbed_guess(ngauss, scale, t_guess, flux_guess, rng);

        let outcome = minimize(&model, &guess, &lm_config)
            .map_err(PsfFitError::from)
            .and_then(|result| {
                meta.iterations += result.iterations;
                meta.chi2 = result.chi2;
                meta.converged = result.converged;
                accept(&model, &result, attempt)
            });

        match outcome {
            Ok(gmix) => {
                debug!(
                    "PSF fit accepted on try {attempt}: chi2={:.3e} iterations={}",
                    meta.chi2, meta.iterations
                );
                psf.set_fit_meta(meta);
                return Ok(psf.store_gmix(gmix));
            }
            Err(e) => {
                debug!("PSF fit try {attempt}/{} failed: {e}", config.ntry);
                last_error = e;
            }
        }
    }

    psf.set_fit_meta(meta);
    Err(last_error)
}

/// Fit the PSF of every exposure in band-major order.
///
/// Returns one result per exposure; exposures without a PSF report
/// [`PsfFitError::MissingPsf`].
pub fn fit_all_psfs<R: Rng + ?Sized>(
    obs: &mut ObservationSet,
    config: &PsfFitConfig,
    rng: &mut R,
) -> Vec<Result<(), PsfFitError>> {
    obs.exposures_mut()
        .map(|exposure| match exposure.psf_mut() {
            Some(psf) => fit_psf(psf, config, rng).map(|_| ()),
            None => Err(PsfFitError::MissingPsf),
        })
        .collect()
}
