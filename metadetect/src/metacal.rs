//! Sheared realizations of an observation set.
//!
//! Each [`ShearLabel`] names one synthetic distortion. [`ResampleMetacal`]
//! produces them by resampling every image, and its PSF image, through the shear
//! matrix about the exposure's Jacobian center:
//!
//! ```text
//! I'(u, v) = I(S(g)⁻¹ (u, v))
//! ```
//!
//! The shear has unit determinant, so flux is preserved. Output pixels whose
//! source position falls off the input grid get zero image and weight and the
//! [`bmask::EDGE`] bit.
//!
//! With `use_noise_image`, one noise image per exposure is drawn before any label
//! is produced, sheared by the opposite shear, and added to every realization,
//! including `noshear`; weights are halved to account for the doubled variance.
//! All labels therefore share the same noise realization.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use log::debug;
use ndarray::Array2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shear_math::{shear_matrix, transform, GridInterpolator, InterpolationError, ShearMagnitudeError};
use thiserror::Error;

use crate::config::MetacalConfig;
use crate::flags::bmask;
use crate::noise::{median_weight_noise, normal_noise_array, NoiseError};
use crate::observation::{Exposure, ObservationError, ObservationSet};

/// Identifier of one synthetic distortion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShearLabel {
    #[serde(rename = "noshear")]
    NoShear,
    #[serde(rename = "1p")]
    Plus1,
    #[serde(rename = "1m")]
    Minus1,
    #[serde(rename = "2p")]
    Plus2,
    #[serde(rename = "2m")]
    Minus2,
}

impl ShearLabel {
    pub const ALL: [ShearLabel; 5] = [
        ShearLabel::NoShear,
        ShearLabel::Plus1,
        ShearLabel::Minus1,
        ShearLabel::Plus2,
        ShearLabel::Minus2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ShearLabel::NoShear => "noshear",
            ShearLabel::Plus1 => "1p",
            ShearLabel::Minus1 => "1m",
            ShearLabel::Plus2 => "2p",
            ShearLabel::Minus2 => "2m",
        }
    }

    /// Fixed position in [`ShearLabel::ALL`], independent of which labels run.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Applied shear `(g1, g2)` for a step size.
    pub fn shear(self, step: f64) -> (f64, f64) {
        match self {
            ShearLabel::NoShear => (0.0, 0.0),
            ShearLabel::Plus1 => (step, 0.0),
            ShearLabel::Minus1 => (-step, 0.0),
            ShearLabel::Plus2 => (0.0, step),
            ShearLabel::Minus2 => (0.0, -step),
        }
    }
}

impl fmt::Display for ShearLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown shear label {0:?}")]
pub struct ParseShearLabelError(pub String);

impl FromStr for ShearLabel {
    type Err = ParseShearLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShearLabel::ALL
            .into_iter()
            .find(|label| label.as_str() == s)
            .ok_or_else(|| ParseShearLabelError(s.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetacalError {
    #[error("invalid shear: {0}")]
    Shear(#[from] ShearMagnitudeError),
    #[error("cannot resample image: {0}")]
    Interpolation(#[from] InterpolationError),
    #[error("cannot draw noise image: {0}")]
    Noise(#[from] NoiseError),
    #[error("invalid sheared exposure: {0}")]
    Observation(#[from] ObservationError),
}

/// Produces one sheared observation set per requested label.
pub trait Metacal {
    fn get_all_metacal(
        &self,
        obs: &ObservationSet,
        rng: &mut dyn RngCore,
    ) -> Result<BTreeMap<ShearLabel, ObservationSet>, MetacalError>;
}

impl<M: Metacal + ?Sized> Metacal for &M {
    fn get_all_metacal(
        &self,
        obs: &ObservationSet,
        rng: &mut dyn RngCore,
    ) -> Result<BTreeMap<ShearLabel, ObservationSet>, MetacalError> {
        (**self).get_all_metacal(obs, rng)
    }
}

/// Shear by resampling pixels.
#[derive(Debug, Clone)]
pub struct ResampleMetacal {
    config: MetacalConfig,
}

/// Resampled planes of one exposure.
struct Sheared {
    image: Array2<f64>,
    weight: Array2<f64>,
    bmask: Array2<i32>,
}

/// Resample `data` on the grid of `exposure` through the shear `(g1, g2)`.
///
/// Returns the new plane and the mask of output pixels that had no source.
fn shear_plane(
    exposure: &Exposure,
    data: &Array2<f64>,
    g1: f64,
    g2: f64,
) -> Result<(Array2<f64>, Array2<bool>), MetacalError> {
    if g1 == 0.0 && g2 == 0.0 {
        return Ok((data.clone(), Array2::from_elem(data.dim(), false)));
    }
    // Output position x maps to source position S⁻¹ x, and S(g)⁻¹ = S(-g)
    let inverse = shear_matrix(-g1, -g2)?;
    let jacobian = exposure.jacobian();
    let interp = GridInterpolator::new(data.view())?;

    Ok(interp.resample(data.dim(), 0.0, |row, col| {
        let (v, u) = jacobian.to_sky(row as f64, col as f64);
        let (su, sv) = transform(&inverse, u, v);
        jacobian.to_pixel(sv, su)
    }))
}

fn shear_exposure(exposure: &Exposure, g1: f64, g2: f64) -> Result<Sheared, MetacalError> {
    let (image, outside) = shear_plane(exposure, exposure.image(), g1, g2)?;
    let mut weight = exposure.weight().clone();
    let mut mask = exposure.bmask().clone();
    for ((w, b), &off) in weight.iter_mut().zip(mask.iter_mut()).zip(outside.iter()) {
        if off {
            *w = 0.0;
            *b |= bmask::EDGE;
        }
    }
    Ok(Sheared {
        image,
        weight,
        bmask: mask,
    })
}

impl ResampleMetacal {
    pub fn new(config: MetacalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MetacalConfig {
        &self.config
    }

    /// One noise image per exposure, band-major, at `sqrt(1 / median weight)`.
    fn draw_noise(
        &self,
        obs: &ObservationSet,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Array2<f64>>, MetacalError> {
        obs.exposures()
            .map(|exposure| {
                let (_, sigma) = median_weight_noise(exposure.weight())?;
                Ok::<_, MetacalError>(normal_noise_array(exposure.dim(), sigma, &mut *rng)?)
            })
            .collect()
    }

    fn make_realization(
        &self,
        obs: &ObservationSet,
        label: ShearLabel,
        noise: Option<&[Array2<f64>]>,
    ) -> Result<ObservationSet, MetacalError> {
        let (g1, g2) = label.shear(self.config.step);
        let mut index = 0;

        obs.try_map(|exposure| {
            let mut sheared = shear_exposure(exposure, g1, g2)?;

            if let Some(noise) = noise {
                let (noise_image, _) = shear_plane(exposure, &noise[index], -g1, -g2)?;
                sheared.image += &noise_image;
                sheared.weight.mapv_inplace(|w| w * 0.5);
            }
            index += 1;

            let mut out = exposure.clone();
            out.replace_pixels(sheared.image, sheared.weight, sheared.bmask)?;
            if let Some(psf) = out.psf_mut() {
                let sheared_psf = shear_exposure(psf, g1, g2)?;
                psf.replace_pixels(sheared_psf.image, sheared_psf.weight, sheared_psf.bmask)?;
            }
            Ok::<_, MetacalError>(out)
        })
    }
}

impl Metacal for ResampleMetacal {
    fn get_all_metacal(
        &self,
        obs: &ObservationSet,
        rng: &mut dyn RngCore,
    ) -> Result<BTreeMap<ShearLabel, ObservationSet>, MetacalError> {
        let noise = if self.config.use_noise_image {
            Some(self.draw_noise(obs, rng)?)
        } else {
            None
        };

        let mut out = BTreeMap::new();
        for &label in &self.config.types {
            debug!("making metacal realization {}", label);
            let realization = self.make_realization(obs, label, noise.as_deref())?;
            out.insert(label, realization);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmix::GMix;
    use crate::jacobian::Jacobian;
    use crate::moments::weighted_moments;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn exposure(dim: usize, weight: f64) -> Exposure {
        let center = (dim / 2) as f64;
        let jac = Jacobian::diagonal(center, center, 0.2).unwrap();
        let image = GMix::round(0.0, 0.0, 0.5, 10.0).unwrap().render((dim, dim), &jac);
        let psf_jac = Jacobian::diagonal(12.0, 12.0, 0.2).unwrap();
        let psf_image = GMix::round(0.0, 0.0, 0.3, 1.0).unwrap().render((25, 25), &psf_jac);
        let psf = Exposure::new(psf_image, Array2::from_elem((25, 25), 1e6), psf_jac).unwrap();
        Exposure::new(image, Array2::from_elem((dim, dim), weight), jac)
            .unwrap()
            .with_psf(psf)
    }

    fn metacal(types: Vec<ShearLabel>, use_noise_image: bool) -> ResampleMetacal {
        ResampleMetacal::new(MetacalConfig {
            step: 0.01,
            types,
            use_noise_image,
        })
    }

    #[test]
    fn test_label_strings() {
        for label in ShearLabel::ALL {
            assert_eq!(label.as_str().parse::<ShearLabel>().unwrap(), label);
            assert_eq!(label.to_string(), label.as_str());
        }
        assert!("3p".parse::<ShearLabel>().is_err());
        assert_eq!(serde_json::to_string(&ShearLabel::Minus2).unwrap(), "\"2m\"");
        assert_eq!(ShearLabel::ALL.map(ShearLabel::index), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_all_labels_produced() {
        let obs = ObservationSet::single(exposure(41, 100.0));
        let mut rng = StdRng::seed_from_u64(3);

        let out = metacal(ShearLabel::ALL.to_vec(), false)
            .get_all_metacal(&obs, &mut rng)
            .unwrap();

        assert_eq!(out.keys().copied().collect::<Vec<_>>(), ShearLabel::ALL.to_vec());
        assert_eq!(out[&ShearLabel::NoShear].first().image(), obs.first().image());
    }

    #[test]
    fn test_subset_of_labels() {
        let obs = ObservationSet::single(exposure(41, 100.0));
        let mut rng = StdRng::seed_from_u64(3);

        let out = metacal(vec![ShearLabel::Plus2], false)
            .get_all_metacal(&obs, &mut rng)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.contains_key(&ShearLabel::Plus2));
    }

    #[test]
    fn test_shear_sign() {
        let obs = ObservationSet::single(exposure(61, 100.0));
        let mut rng = StdRng::seed_from_u64(3);
        let out = ResampleMetacal::new(MetacalConfig {
            step: 0.1,
            ..MetacalConfig::default()
        })
        .get_all_metacal(&obs, &mut rng)
        .unwrap();

        let mut weight = GMix::round(0.0, 0.0, 1.0, 1.0).unwrap();
        weight.normalize_peak().unwrap();
        let g = |label: ShearLabel| {
            weighted_moments(out[&label].first(), &weight, f64::INFINITY).g
        };

        assert!(g(ShearLabel::Plus1)[0] > 0.01);
        assert!(g(ShearLabel::Minus1)[0] < -0.01);
        assert!(g(ShearLabel::Plus2)[1] > 0.01);
        assert!(g(ShearLabel::Minus2)[1] < -0.01);
        assert_relative_eq!(g(ShearLabel::Plus1)[0], -g(ShearLabel::Minus1)[0], max_relative = 1e-6);
    }

    #[test]
    fn test_flux_preserved_and_psf_sheared() {
        let obs = ObservationSet::single(exposure(61, 100.0));
        let mut rng = StdRng::seed_from_u64(3);
        let out = metacal(ShearLabel::ALL.to_vec(), false)
            .get_all_metacal(&obs, &mut rng)
            .unwrap();

        let sheared = out[&ShearLabel::Plus1].first();
        assert_relative_eq!(sheared.image().sum(), obs.first().image().sum(), max_relative = 1e-3);

        let psf = sheared.psf().unwrap();
        assert_ne!(psf.image(), obs.first().psf().unwrap().image());
        assert!(psf.gmix().is_none());
    }

    #[test]
    fn test_edges_flagged() {
        let obs = ObservationSet::single(exposure(41, 100.0));
        let mut rng = StdRng::seed_from_u64(3);
        let out = metacal(vec![ShearLabel::Plus1], false)
            .get_all_metacal(&obs, &mut rng)
            .unwrap();

        let sheared = out[&ShearLabel::Plus1].first();
        // Stretching along u pulls corner pixels from off the grid
        assert_eq!(sheared.bmask()[[0, 0]] & bmask::EDGE, bmask::EDGE);
        assert_eq!(sheared.weight()[[0, 0]], 0.0);
        assert_eq!(sheared.bmask()[[20, 20]], 0);
    }

    #[test]
    fn test_noise_image_shared_across_labels() {
        let obs = ObservationSet::single(exposure(41, 100.0));
        let mut rng = StdRng::seed_from_u64(11);

        let mc = metacal(ShearLabel::ALL.to_vec(), true);
        let out = mc.get_all_metacal(&obs, &mut rng).unwrap();

        let noshear = out[&ShearLabel::NoShear].first();
        assert_relative_eq!(noshear.weight()[[20, 20]], 50.0);

        // noshear gets the unsheared draw itself
        let mut replay = StdRng::seed_from_u64(11);
        let expected_noise = normal_noise_array((41, 41), 0.1, &mut replay).unwrap();
        let added = noshear.image() - obs.first().image();
        for (a, b) in added.iter().zip(expected_noise.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }

        // Same draw for a subset run
        let mut rng = StdRng::seed_from_u64(11);
        let subset = metacal(vec![ShearLabel::NoShear], true)
            .get_all_metacal(&obs, &mut rng)
            .unwrap();
        assert_eq!(subset[&ShearLabel::NoShear].first().image(), noshear.image());
    }
}
