//! Synthetic observations for metadetect tests.
//!
//! Objects and PSFs are round or elliptical Gaussians rendered through a
//! diagonal Jacobian centered on the image. Noise is drawn from one `StdRng`
//! seeded by the caller, band-major, image before PSF for each exposure.

use metadetect::gmix::{fwhm_to_t, GMix};
use metadetect::noise::normal_noise_array;
use metadetect::{Exposure, Jacobian, ObservationSet};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Side length of every PSF image.
pub const PSF_DIM: usize = 25;

/// Layout and noise of a simulated observation set.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub dims: (usize, usize),
    /// Arcsec per pixel
    pub scale: f64,
    /// PSF FWHM in arcsec
    pub psf_fwhm: f64,
    /// Per-pixel noise of the science images, must be positive
    pub noise: f64,
    pub nband: usize,
    pub nepoch: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dims: (64, 64),
            scale: 0.2,
            psf_fwhm: 0.9,
            noise: 0.1,
            nband: 1,
            nepoch: 1,
        }
    }
}

/// One simulated source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimObject {
    pub row: f64,
    pub col: f64,
    pub flux: f64,
    /// Intrinsic size before the PSF; zero for a star
    pub t: f64,
    pub g1: f64,
    pub g2: f64,
}

impl SimObject {
    pub fn star(row: f64, col: f64, flux: f64) -> Self {
        Self {
            row,
            col,
            flux,
            t: 0.0,
            g1: 0.0,
            g2: 0.0,
        }
    }

    pub fn galaxy(row: f64, col: f64, flux: f64, t: f64) -> Self {
        Self {
            t,
            ..Self::star(row, col, flux)
        }
    }
}

fn center(dims: (usize, usize)) -> (f64, f64) {
    ((dims.0 - 1) as f64 / 2.0, (dims.1 - 1) as f64 / 2.0)
}

/// A noisy PSF image with a weight map matching its noise, peak / 1000.
pub fn make_psf_exposure(config: &SimConfig, rng: &mut StdRng) -> Exposure {
    let (row0, col0) = center((PSF_DIM, PSF_DIM));
    let jac = Jacobian::diagonal(row0, col0, config.scale).expect("valid scale");
    let psf = GMix::round(0.0, 0.0, fwhm_to_t(config.psf_fwhm), 1.0).expect("valid psf");

    let mut image = psf.render((PSF_DIM, PSF_DIM), &jac);
    let peak = image.iter().copied().fold(f64::MIN, f64::max);
    let noise = peak / 1000.0;
    image += &normal_noise_array((PSF_DIM, PSF_DIM), noise, rng).expect("valid noise");

    let weight = Array2::from_elem((PSF_DIM, PSF_DIM), 1.0 / (noise * noise));
    Exposure::new(image, weight, jac).expect("consistent psf exposure")
}

/// Render `objects` convolved with the PSF into every band and epoch.
///
/// Positions are in pixels. Each exposure gets independent noise and its own
/// noisy PSF image.
pub fn make_observation_set(config: &SimConfig, objects: &[SimObject], seed: u64) -> ObservationSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let (row0, col0) = center(config.dims);
    let jac = Jacobian::diagonal(row0, col0, config.scale).expect("valid scale");
    let t_psf = fwhm_to_t(config.psf_fwhm);

    let mut clean = Array2::zeros(config.dims);
    for obj in objects {
        let (v, u) = jac.to_sky(obj.row, obj.col);
        let gm = GMix::gauss(v, u, obj.g1, obj.g2, obj.t + t_psf, obj.flux).expect("valid object");
        clean += &gm.render(config.dims, &jac);
    }

    let weight = 1.0 / (config.noise * config.noise);
    let bands = (0..config.nband)
        .map(|_| {
            (0..config.nepoch)
                .map(|_| {
                    let noise = normal_noise_array(config.dims, config.noise, &mut rng)
                        .expect("valid noise");
                    let psf = make_psf_exposure(config, &mut rng);
                    Exposure::new(&clean + &noise, Array2::from_elem(config.dims, weight), jac)
                        .expect("consistent exposure")
                        .with_psf(psf)
                })
                .collect()
        })
        .collect();

    ObservationSet::new(bands).expect("non-empty observation set")
}

/// OR `bits` into every pixel of every exposure's bad-pixel mask.
pub fn mask_everything(obs: &mut ObservationSet, bits: i32) {
    for exposure in obs.exposures_mut() {
        exposure.bmask_mut().mapv_inplace(|b| b | bits);
    }
}
