//! Weighted average of fitted PSF shapes across an observation set.

use log::warn;
use rand::Rng;

use crate::config::PsfFitConfig;
use crate::flags::{NONFINITE, PSF_FAILURE};
use crate::observation::ObservationSet;
use crate::psf::fitter::fit_all_psfs;

/// Mean PSF shape and size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsfShape {
    pub g1: f64,
    pub g2: f64,
    pub t: f64,
}

/// Aggregated PSF statistics for one observation set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PsfStats {
    Measured(PsfShape),
    Failed { flags: u32 },
}

impl PsfStats {
    /// Catalog value written for every field of a failed aggregate.
    pub const SENTINEL: f64 = -9999.0;

    pub fn flags(&self) -> u32 {
        match self {
            PsfStats::Measured(_) => 0,
            PsfStats::Failed { flags } => *flags,
        }
    }

    pub fn g(&self) -> [f64; 2] {
        match self {
            PsfStats::Measured(shape) => [shape.g1, shape.g2],
            PsfStats::Failed { .. } => [Self::SENTINEL; 2],
        }
    }

    pub fn t(&self) -> f64 {
        match self {
            PsfStats::Measured(shape) => shape.t,
            PsfStats::Failed { .. } => Self::SENTINEL,
        }
    }
}

/// Combine the fitted PSF models of the exposures marked in `fitted`.
///
/// `fitted` is aligned with [`ObservationSet::exposures`]. Each marked exposure
/// with a fitted PSF contributes its (g1, g2, T) weighted by the maximum of the
/// exposure's weight map. Unmarked exposures are skipped even if their model
/// slot holds an older fit.
///
/// # Returns
/// * `PsfStats::Measured` - Weighted means
/// * `PsfStats::Failed { PSF_FAILURE }` - If the weight sum is not positive
/// * `PsfStats::Failed { PSF_FAILURE | NONFINITE }` - If the means are not finite
pub fn aggregate_psf_stats(obs: &ObservationSet, fitted: &[bool]) -> PsfStats {
    let mut g1sum = 0.0;
    let mut g2sum = 0.0;
    let mut tsum = 0.0;
    let mut wsum = 0.0;

    for (exposure, _) in obs.exposures().zip(fitted).filter(|(_, ok)| **ok) {
        let Some(gmix) = exposure.psf().and_then(|psf| psf.gmix()) else {
            continue;
        };
        let Ok(shape) = gmix.shape() else {
            continue;
        };

        let wt = exposure.max_weight();
        g1sum += wt * shape.g1;
        g2sum += wt * shape.g2;
        tsum += wt * shape.t;
        wsum += wt;
    }

    if !(wsum > 0.0) {
        warn!("no usable PSF fits: weight sum {wsum}");
        return PsfStats::Failed { flags: PSF_FAILURE };
    }

    let shape = PsfShape {
        g1: g1sum / wsum,
        g2: g2sum / wsum,
        t: tsum / wsum,
    };
    if !(shape.g1.is_finite() && shape.g2.is_finite() && shape.t.is_finite()) {
        warn!("aggregated PSF shape is not finite: {shape:?}");
        return PsfStats::Failed {
            flags: PSF_FAILURE | NONFINITE,
        };
    }

    PsfStats::Measured(shape)
}

/// Fit every PSF in the set, then aggregate.
///
/// Individual fit failures are logged and otherwise tolerated. Only fits that
/// succeed in this pass are aggregated.
pub fn fit_original_psfs<R: Rng + ?Sized>(
    obs: &mut ObservationSet,
    config: &PsfFitConfig,
    rng: &mut R,
) -> PsfStats {
    let fitted: Vec<bool> = fit_all_psfs(obs, config, rng)
        .iter()
        .map(Result::is_ok)
        .collect();
    let failures = fitted.iter().filter(|&&ok| !ok).count();
    if failures > 0 {
        warn!("{failures} of {} PSF fits failed", fitted.len());
    }
    aggregate_psf_stats(obs, &fitted)
}
