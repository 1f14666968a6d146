//! Pipeline configuration.
//!
//! Configuration is read from JSON into a [`MetadetectConfigBuilder`], whose
//! sections mirror the pipeline stages, and validated once into an immutable
//! [`MetadetectConfig`]. The `metacal`, `detection` (alias `sx`) and `meds`
//! sections are required; the rest fall back to defaults. Unknown keys are
//! rejected at every level.
//!
//! # Usage
//!
//! ```
//! use metadetect::config::MetadetectConfig;
//!
//! let config = MetadetectConfig::from_json_str(
//!     r#"{
//!         "bmask_flags": 0,
//!         "metacal": {"use_noise_image": true},
//!         "psf": {"model": "gauss", "ntry": 2},
//!         "weight": {"fwhm": 1.2},
//!         "sx": {"detect_thresh": 5.0, "minarea": 4},
//!         "meds": {"min_box_size": 32, "max_box_size": 256}
//!     }"#,
//! )
//! .unwrap();
//! assert_eq!(config.psf().ntry, 2);
//! ```

use serde::{Deserialize, Serialize};
use shear_math::LmConfig;
use thiserror::Error;

use crate::flags::bmask;
use crate::metacal::ShearLabel;

/// Configuration failures. All are raised before any processing starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required config section '{0}'")]
    MissingSection(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// PSF model family.
///
/// In JSON either `"gauss"` or `{"coellip": {"ngauss": 2}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum PsfModel {
    #[default]
    Gauss,
    Coellip { ngauss: usize },
}

impl PsfModel {
    /// Largest supported number of coelliptic components.
    pub const MAX_NGAUSS: usize = 3;

    pub fn ngauss(&self) -> usize {
        match self {
            PsfModel::Gauss => 1,
            PsfModel::Coellip { ngauss } => *ngauss,
        }
    }
}

/// Levenberg-Marquardt settings for the PSF fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LmPars {
    pub maxfev: usize,
    pub ftol: f64,
    pub xtol: f64,
}

impl Default for LmPars {
    fn default() -> Self {
        Self {
            maxfev: 4000,
            ftol: 1e-5,
            xtol: 1e-5,
        }
    }
}

impl LmPars {
    pub fn to_lm_config(&self) -> LmConfig {
        LmConfig {
            max_evaluations: self.maxfev,
            ftol: self.ftol,
            xtol: self.xtol,
            ..LmConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PsfFitConfig {
    pub model: PsfModel,
    pub lm_pars: LmPars,
    /// Fit attempts from perturbed starting points before giving up
    pub ntry: usize,
    /// Starting size in arcsec²; defaults to four times the pixel area
    pub t_guess: Option<f64>,
}

impl Default for PsfFitConfig {
    fn default() -> Self {
        Self {
            model: PsfModel::Gauss,
            lm_pars: LmPars::default(),
            ntry: 2,
            t_guess: None,
        }
    }
}

/// Fixed round Gaussian weight used for the moments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeightConfig {
    /// FWHM in arcsec
    pub fwhm: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self { fwhm: 1.2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetacalConfig {
    /// Shear applied for the sheared realizations
    pub step: f64,
    /// Realizations to produce
    pub types: Vec<ShearLabel>,
    /// Add a counter-sheared noise image to cancel correlated noise
    pub use_noise_image: bool,
}

impl Default for MetacalConfig {
    fn default() -> Self {
        Self {
            step: 0.01,
            types: ShearLabel::ALL.to_vec(),
            use_noise_image: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    /// Threshold in units of the detection image noise
    pub detect_thresh: f64,
    /// Minimum connected pixels above threshold
    pub minarea: usize,
    /// Gaussian smoothing FWHM in pixels applied before thresholding
    pub filter_fwhm: Option<f64>,
    /// Zero the weight of pixels belonging to other detections inside a stamp
    pub mask_neighbors: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            detect_thresh: 5.0,
            minarea: 4,
            filter_fwhm: None,
            mask_neighbors: false,
        }
    }
}

/// How stamp sizes are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxType {
    /// Radius from the isophotal area, `sqrt(npix / pi)`
    #[default]
    IsoRadius,
}

/// Cutout box sizing, from the isophotal radius of each detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StampConfig {
    pub box_type: BoxType,
    pub min_box_size: usize,
    pub max_box_size: usize,
    pub rad_min: f64,
    pub rad_fac: f64,
    pub box_padding: usize,
}

impl Default for StampConfig {
    fn default() -> Self {
        Self {
            box_type: BoxType::IsoRadius,
            min_box_size: 32,
            max_box_size: 256,
            rad_min: 4.0,
            rad_fac: 2.0,
            box_padding: 2,
        }
    }
}

/// Settings consumed by the moments measurer.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentsConfig {
    pub weight_fwhm: f64,
    pub bmask_flags: i32,
}

/// Unvalidated configuration, as read from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadetectConfigBuilder {
    /// Bad-pixel bits that reject an object; defaults to the stamp edge bit
    pub bmask_flags: Option<i32>,
    pub metacal: Option<MetacalConfig>,
    #[serde(default)]
    pub psf: PsfFitConfig,
    #[serde(default)]
    pub weight: WeightConfig,
    #[serde(alias = "sx")]
    pub detection: Option<DetectionConfig>,
    pub meds: Option<StampConfig>,
    /// Worker threads for the per-label stage; `None` uses the global pool
    pub n_threads: Option<usize>,
}

impl MetadetectConfigBuilder {
    /// Builder with every required section present at its defaults.
    pub fn with_default_sections() -> Self {
        Self {
            metacal: Some(MetacalConfig::default()),
            detection: Some(DetectionConfig::default()),
            meds: Some(StampConfig::default()),
            ..Self::default()
        }
    }

    /// Validate every section and freeze the configuration.
    pub fn build(self) -> Result<MetadetectConfig, ConfigError> {
        let metacal = self.metacal.ok_or(ConfigError::MissingSection("metacal"))?;
        let detection = self
            .detection
            .ok_or(ConfigError::MissingSection("detection"))?;
        let meds = self.meds.ok_or(ConfigError::MissingSection("meds"))?;

        if !(metacal.step > 0.0 && metacal.step < 1.0) {
            return Err(invalid("metacal.step", format!("{} not in (0, 1)", metacal.step)));
        }
        if metacal.types.is_empty() {
            return Err(invalid("metacal.types", "at least one shear type is required"));
        }

        let ngauss = self.psf.model.ngauss();
        if !(1..=PsfModel::MAX_NGAUSS).contains(&ngauss) {
            return Err(invalid(
                "psf.model",
                format!("ngauss {ngauss} not in 1..={}", PsfModel::MAX_NGAUSS),
            ));
        }
        if let Some(t) = self.psf.t_guess {
            if !(t > 0.0) {
                return Err(invalid("psf.t_guess", "must be positive"));
            }
        }
        if self.psf.ntry == 0 {
            return Err(invalid("psf.ntry", "must be at least 1"));
        }
        if self.psf.lm_pars.maxfev == 0 {
            return Err(invalid("psf.lm_pars.maxfev", "must be at least 1"));
        }
        if !(self.psf.lm_pars.ftol > 0.0 && self.psf.lm_pars.xtol > 0.0) {
            return Err(invalid("psf.lm_pars", "tolerances must be positive"));
        }

        if !(self.weight.fwhm > 0.0 && self.weight.fwhm.is_finite()) {
            return Err(invalid("weight.fwhm", format!("{} must be positive", self.weight.fwhm)));
        }

        if !(detection.detect_thresh > 0.0) {
            return Err(invalid("detection.detect_thresh", "must be positive"));
        }
        if detection.minarea == 0 {
            return Err(invalid("detection.minarea", "must be at least 1"));
        }
        if let Some(fwhm) = detection.filter_fwhm {
            if !(fwhm > 0.0) {
                return Err(invalid("detection.filter_fwhm", "must be positive"));
            }
        }

        if meds.min_box_size < 2 || meds.min_box_size > meds.max_box_size {
            return Err(invalid(
                "meds",
                format!(
                    "box sizes must satisfy 2 <= min ({}) <= max ({})",
                    meds.min_box_size, meds.max_box_size
                ),
            ));
        }
        if !(meds.rad_min >= 0.0 && meds.rad_fac > 0.0) {
            return Err(invalid("meds", "rad_min must be >= 0 and rad_fac > 0"));
        }

        if self.n_threads == Some(0) {
            return Err(invalid("n_threads", "must be at least 1"));
        }

        Ok(MetadetectConfig {
            bmask_flags: self.bmask_flags.unwrap_or(bmask::EDGE),
            metacal,
            psf: self.psf,
            weight: self.weight,
            detection,
            meds,
            n_threads: self.n_threads,
        })
    }
}

/// Validated, immutable pipeline configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadetectConfig {
    bmask_flags: i32,
    metacal: MetacalConfig,
    psf: PsfFitConfig,
    weight: WeightConfig,
    detection: DetectionConfig,
    meds: StampConfig,
    n_threads: Option<usize>,
}

impl MetadetectConfig {
    pub fn builder() -> MetadetectConfigBuilder {
        MetadetectConfigBuilder::with_default_sections()
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let builder: MetadetectConfigBuilder = serde_json::from_str(json)?;
        builder.build()
    }

    pub fn bmask_flags(&self) -> i32 {
        self.bmask_flags
    }

    pub fn metacal(&self) -> &MetacalConfig {
        &self.metacal
    }

    pub fn psf(&self) -> &PsfFitConfig {
        &self.psf
    }

    pub fn weight(&self) -> &WeightConfig {
        &self.weight
    }

    pub fn detection(&self) -> &DetectionConfig {
        &self.detection
    }

    pub fn meds(&self) -> &StampConfig {
        &self.meds
    }

    pub fn n_threads(&self) -> Option<usize> {
        self.n_threads
    }

    pub fn moments(&self) -> MomentsConfig {
        MomentsConfig {
            weight_fwhm: self.weight.fwhm,
            bmask_flags: self.bmask_flags,
        }
    }
}

impl Default for MetadetectConfig {
    fn default() -> Self {
        Self {
            bmask_flags: bmask::EDGE,
            metacal: MetacalConfig::default(),
            psf: PsfFitConfig::default(),
            weight: WeightConfig::default(),
            detection: DetectionConfig::default(),
            meds: StampConfig::default(),
            n_threads: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "bmask_flags": 0,
        "metacal": {"use_noise_image": true, "types": ["noshear", "1p"]},
        "psf": {"model": {"coellip": {"ngauss": 2}}, "lm_pars": {"maxfev": 2000}, "ntry": 3},
        "weight": {"fwhm": 1.5},
        "sx": {"detect_thresh": 0.8, "minarea": 4, "filter_fwhm": 0.9},
        "meds": {"box_type": "iso_radius", "min_box_size": 32, "max_box_size": 256, "rad_min": 4, "rad_fac": 2, "box_padding": 2}
    }"#;

    #[test]
    fn test_parse_full_config() {
        let config = MetadetectConfig::from_json_str(FULL).unwrap();

        assert_eq!(config.bmask_flags(), 0);
        assert!(config.metacal().use_noise_image);
        assert_eq!(config.metacal().types, vec![ShearLabel::NoShear, ShearLabel::Plus1]);
        assert_eq!(config.psf().model, PsfModel::Coellip { ngauss: 2 });
        assert_eq!(config.psf().lm_pars.maxfev, 2000);
        assert_eq!(config.psf().lm_pars.ftol, 1e-5);
        assert_eq!(config.psf().ntry, 3);
        assert_eq!(config.weight().fwhm, 1.5);
        assert_eq!(config.detection().detect_thresh, 0.8);
        assert_eq!(config.detection().filter_fwhm, Some(0.9));
        assert_eq!(config.meds().max_box_size, 256);
        assert_eq!(config.moments().weight_fwhm, 1.5);
    }

    #[test]
    fn test_missing_sections() {
        let err = MetadetectConfig::from_json_str(r#"{"sx": {}, "meds": {}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("metacal")));

        let err = MetadetectConfig::from_json_str(r#"{"metacal": {}, "meds": {}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("detection")));

        let err = MetadetectConfig::from_json_str(r#"{"metacal": {}, "sx": {}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("meds")));
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config =
            MetadetectConfig::from_json_str(r#"{"metacal": {}, "detection": {}, "meds": {}}"#)
                .unwrap();
        assert_eq!(config.bmask_flags(), bmask::EDGE);
        assert_eq!(config.psf(), &PsfFitConfig::default());
        assert_eq!(config.weight().fwhm, 1.2);
        assert_eq!(config.metacal().types.len(), 5);
        assert_eq!(config, MetadetectConfig::default());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = MetadetectConfig::from_json_str(
            r#"{"metacal": {}, "sx": {}, "meds": {}, "verbose": true}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = MetadetectConfig::from_json_str(
            r#"{"metacal": {"psf": "fitgauss"}, "sx": {}, "meds": {}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut builder = MetadetectConfig::builder();
        builder.weight.fwhm = -1.0;
        assert!(matches!(
            builder.build(),
            Err(ConfigError::Invalid { field: "weight.fwhm", .. })
        ));

        let mut builder = MetadetectConfig::builder();
        builder.psf.model = PsfModel::Coellip { ngauss: 5 };
        assert!(matches!(
            builder.build(),
            Err(ConfigError::Invalid { field: "psf.model", .. })
        ));

        let mut builder = MetadetectConfig::builder();
        builder.psf.ntry = 0;
        assert!(builder.build().is_err());

        let mut builder = MetadetectConfig::builder();
        builder.meds = Some(StampConfig {
            min_box_size: 64,
            max_box_size: 32,
            ..StampConfig::default()
        });
        assert!(matches!(builder.build(), Err(ConfigError::Invalid { field: "meds", .. })));

        let mut builder = MetadetectConfig::builder();
        builder.n_threads = Some(0);
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_psf_model_ngauss() {
        assert_eq!(PsfModel::Gauss.ngauss(), 1);
        assert_eq!(PsfModel::Coellip { ngauss: 3 }.ngauss(), 3);
    }
}
