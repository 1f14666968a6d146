//! Top-level pipeline error.
//!
//! Per-object and per-exposure failures are reported through flags; this type
//! only carries conditions that abort a whole run.

use thiserror::Error;

use crate::coadd::CoaddError;
use crate::config::ConfigError;
use crate::detection::DetectionError;
use crate::gmix::GMixError;
use crate::metacal::MetacalError;
use crate::observation::ObservationError;

#[derive(Error, Debug)]
pub enum MetadetectError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("observation error: {0}")]
    Observation(#[from] ObservationError),
    #[error("coadd failed: {0}")]
    Coadd(#[from] CoaddError),
    #[error("metacal failed: {0}")]
    Metacal(#[from] MetacalError),
    #[error("detection failed: {0}")]
    Detection(#[from] DetectionError),
    #[error("invalid weight function: {0}")]
    WeightFunction(#[from] GMixError),
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("results requested before the measurement ran")]
    NotRun,
}
