//! Per-object weighted-moments measurement with a fixed flag state machine.
//!
//! Each object moves through
//!
//! ```text
//! NotAttempted -> FlagsChecked -> Rejected
//!                              -> Measured { success }
//! ```
//!
//! An object whose stamp touches any bad-pixel bit in `bmask_flags` is rejected
//! with `IMAGE_FLAGS` on the model and `NO_ATTEMPT` on the PSF. An object whose
//! exposures all have a non-positive median weight cannot be coadded and gets
//! `ZERO_WEIGHTS` with `NO_ATTEMPT` on the PSF. Otherwise its bands and epochs are
//! coadded and the object and PSF are measured with the same weight function.
//! Every object yields a row; undefined values are NaN.

use log::debug;
use rand::Rng;

use crate::coadd::{coadd_observation_set, CoaddError};
use crate::config::MomentsConfig;
use crate::flags::{flag_string, IMAGE_FLAGS, NO_ATTEMPT, ZERO_WEIGHTS};
use crate::gmix::{fwhm_to_t, GMix, GMixError};
use crate::moments::weighted::{weighted_moments, MomentsResult, NPARS};
use crate::noise::median_weight_noise;
use crate::observation::ObservationSet;

/// Lifecycle of one object's measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    NotAttempted,
    FlagsChecked,
    Rejected,
    Measured { success: bool },
}

impl ObjectState {
    pub fn can_advance_to(self, next: ObjectState) -> bool {
        matches!(
            (self, next),
            (ObjectState::NotAttempted, ObjectState::FlagsChecked)
                | (ObjectState::FlagsChecked, ObjectState::Rejected)
                | (ObjectState::FlagsChecked, ObjectState::Measured { .. })
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ObjectState::Rejected | ObjectState::Measured { .. })
    }

    fn advance(self, next: ObjectState) -> ObjectState {
        debug_assert!(
            self.can_advance_to(next),
            "invalid transition {self:?} -> {next:?}"
        );
        next
    }
}

/// Measurement fields for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentsRow {
    pub state: ObjectState,
    /// Object moments flags
    pub flags: u32,
    /// PSF moments flags
    pub psf_flags: u32,
    pub psf_g: [f64; 2],
    pub psf_t: f64,
    pub s2n: f64,
    pub pars: [f64; NPARS],
    pub g: [f64; 2],
    pub g_cov: [[f64; 2]; 2],
    pub t: f64,
    pub t_err: f64,
    pub t_ratio: f64,
}

impl MomentsRow {
    fn unmeasured(state: ObjectState, flags: u32) -> Self {
        Self {
            state,
            flags,
            psf_flags: NO_ATTEMPT,
            psf_g: [f64::NAN; 2],
            psf_t: f64::NAN,
            s2n: f64::NAN,
            pars: [f64::NAN; NPARS],
            g: [f64::NAN; 2],
            g_cov: [[f64::NAN; 2]; 2],
            t: f64::NAN,
            t_err: f64::NAN,
            t_ratio: f64::NAN,
        }
    }

    fn rejected(state: ObjectState) -> Self {
        Self::unmeasured(state.advance(ObjectState::Rejected), IMAGE_FLAGS)
    }

    fn zero_weight(state: ObjectState) -> Self {
        Self::unmeasured(
            state.advance(ObjectState::Measured { success: false }),
            ZERO_WEIGHTS,
        )
    }

    fn measured(state: ObjectState, obj: &MomentsResult, psf: &MomentsResult) -> Self {
        let t_ratio = if obj.is_success() && psf.is_success() {
            obj.t / psf.t
        } else {
            f64::NAN
        };
        let success = obj.is_success() && psf.is_success();

        Self {
            state: state.advance(ObjectState::Measured { success }),
            flags: obj.flags,
            psf_flags: psf.flags,
            psf_g: psf.g,
            psf_t: psf.t,
            s2n: obj.s2n,
            pars: obj.pars,
            g: obj.g,
            g_cov: obj.g_cov,
            t: obj.t,
            t_err: obj.t_err,
            t_ratio,
        }
    }

    /// Union of object and PSF flags.
    pub fn combined_flags(&self) -> u32 {
        self.flags | self.psf_flags
    }

    pub fn is_success(&self) -> bool {
        self.combined_flags() == 0
    }
}

/// Rows for every object plus the indices of the successful ones.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentsOutput {
    pub rows: Vec<MomentsRow>,
    pub successful: Vec<usize>,
}

/// Measures weighted moments for a list of objects.
///
/// The weight function is built once: a round Gaussian with `T = fwhm_to_t(fwhm)`,
/// centered on the Jacobian origin and normalized to a unit peak.
pub struct MomentsMeasurer<R: Rng> {
    bmask_flags: i32,
    weight: GMix,
    rng: R,
}

impl<R: Rng> MomentsMeasurer<R> {
    /// # Arguments
    /// * `config` - Weight FWHM and bad-pixel reject bits
    /// * `rng` - Random source owned by this measurer, used for coadd noise
    pub fn new(config: &MomentsConfig, rng: R) -> Result<Self, GMixError> {
        let mut weight = GMix::round(0.0, 0.0, fwhm_to_t(config.weight_fwhm), 1.0)?;
        weight.normalize_peak()?;
        Ok(Self {
            bmask_flags: config.bmask_flags,
            weight,
            rng,
        })
    }

    pub fn weight(&self) -> &GMix {
        &self.weight
    }

    fn has_image_flags(&self, obs: &ObservationSet) -> bool {
        self.bmask_flags != 0
            && obs
                .exposures()
                .any(|e| e.bmask().iter().any(|&b| b & self.bmask_flags != 0))
    }

    fn has_usable_weight(obs: &ObservationSet) -> bool {
        obs.is_single() || obs.exposures().any(|e| median_weight_noise(e.weight()).is_ok())
    }

    /// Measure one object.
    ///
    /// # Returns
    /// * `Ok(MomentsRow)` - A row in a terminal state
    /// * `Err(CoaddError)` - If the object's exposures are inconsistent, such as
    ///   mismatched shapes or a missing PSF
    pub fn measure_one(&mut self, obs: &ObservationSet) -> Result<MomentsRow, CoaddError> {
        let rejected = self.has_image_flags(obs);
        let state = ObjectState::NotAttempted.advance(ObjectState::FlagsChecked);

        if rejected {
            debug!("object rejected: stamp touches bad-pixel bits {:#x}", self.bmask_flags);
            return Ok(MomentsRow::rejected(state));
        }
        if !Self::has_usable_weight(obs) {
            debug!("object not measured: no exposure has a positive median weight");
            return Ok(MomentsRow::zero_weight(state));
        }

        let coadd = coadd_observation_set(obs, &mut self.rng)?;
        let obj = weighted_moments(&coadd, &self.weight, f64::INFINITY);
        let psf = match coadd.psf() {
            Some(psf) => weighted_moments(psf, &self.weight, f64::INFINITY),
            None => MomentsResult::not_attempted(),
        };

        if !obj.is_success() {
            debug!("object moments failed: {}", flag_string(obj.flags));
        }
        if !psf.is_success() {
            debug!("psf moments failed: {}", flag_string(psf.flags));
        }

        Ok(MomentsRow::measured(state, &obj, &psf))
    }

    /// Measure every object in order.
    pub fn measure_all(&mut self, objects: &[ObservationSet]) -> Result<MomentsOutput, CoaddError> {
        let rows = objects
            .iter()
            .map(|obs| self.measure_one(obs))
            .collect::<Result<Vec<_>, _>>()?;
        let successful = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.is_success())
            .map(|(i, _)| i)
            .collect();
        Ok(MomentsOutput { rows, successful })
    }
}
