//! PSF modelling: per-exposure mixture fits and their weighted aggregate.
//!
//! # Usage
//!
//! Fit every PSF in an observation set, then reduce the fitted shapes to one
//! [`PsfStats`] value. Individual fit failures are tolerated; only a set with
//! no usable fits yields [`PsfStats::Failed`].

pub mod aggregate;
pub mod fitter;

pub use aggregate::{aggregate_psf_stats, fit_original_psfs, PsfShape, PsfStats};
pub use fitter::{fit_all_psfs, fit_psf, PsfFitError, PsfFitMeta};
