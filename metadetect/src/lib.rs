//! Shear-calibrated object detection and weighted-moments measurement.
//!
//! A run takes one multi-band, multi-epoch [`ObservationSet`], characterizes its
//! PSF once, makes artificially sheared copies of it, and for each copy detects
//! objects and measures their weighted moments. The result is one [`Catalog`]
//! per [`ShearLabel`].
//!
//! # Modules
//!
//! - [`observation`]: exposures, Jacobians and observation sets
//! - [`psf`]: PSF mixture fits and their weighted aggregate
//! - [`coadd`]: weighted coaddition of registered exposures
//! - [`moments`]: weighted moments and the per-object flag state machine
//! - [`metacal`]: sheared realizations
//! - [`detection`]: segmentation detection and stamp extraction
//! - [`metadetect`]: the orchestrator
//! - [`catalog`]: output rows and model-prefixed field names

pub mod catalog;
pub mod coadd;
pub mod config;
pub mod detection;
pub mod error;
pub mod flags;
pub mod gmix;
pub mod jacobian;
pub mod metacal;
pub mod metadetect;
pub mod moments;
pub mod noise;
pub mod observation;
pub mod psf;

pub use catalog::{Catalog, CatalogRow, Namer};
pub use config::{ConfigError, MetadetectConfig, MetadetectConfigBuilder};
pub use detection::{Detections, DetectedObject, Detector, SegmentationDetector};
pub use error::MetadetectError;
pub use gmix::GMix;
pub use jacobian::Jacobian;
pub use metacal::{Metacal, ResampleMetacal, ShearLabel};
pub use metadetect::{run_metadetect, run_metadetect_with, Metadetect, MetadetectResult};
pub use moments::{weighted_moments, MomentsMeasurer, MomentsResult};
pub use observation::{Exposure, ObservationSet};
pub use psf::PsfStats;
