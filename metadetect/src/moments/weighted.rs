//! Weighted second moments of a single exposure.
//!
//! # Algorithm
//!
//! For every pixel with positive weight inside `maxrad` of the weight center,
//! with sky offset (v, u), value `I`, variance `1 / w` and weight-function value `W`:
//!
//! ```text
//! F     = [v, u, u² - v², 2uv, u² + v², 1]
//! pars += W · I · F
//! pcov += W² · var · F Fᵀ
//! ```
//!
//! From the sums: flux = pars[5], T = pars[4] / pars[5], e1 = pars[2] / pars[4],
//! e2 = pars[3] / pars[4], with first-order propagated uncertainties. The shear
//! estimate is the polarization itself, `g = e`.

use std::fmt;

use crate::flags::{NO_ATTEMPT, NONFINITE, NONPOS_FLUX, NONPOS_SIZE, NONPOS_VAR, ZERO_WEIGHTS};
use crate::gmix::GMix;
use crate::observation::Exposure;

/// Number of accumulated moment sums.
pub const NPARS: usize = 6;

/// Outcome of one weighted-moments measurement.
///
/// When `flags != 0` every derived quantity is NaN; the raw sums are kept when
/// they could be formed.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentsResult {
    pub flags: u32,
    pub flux: f64,
    pub flux_err: f64,
    pub s2n: f64,
    pub t: f64,
    pub t_err: f64,
    pub g: [f64; 2],
    pub g_cov: [[f64; 2]; 2],
    pub pars: [f64; NPARS],
    pub pars_cov: [[f64; NPARS]; NPARS],
    /// Always 1; the weight is fixed, not adapted
    pub numiter: usize,
}

impl MomentsResult {
    fn failed(flags: u32, pars: [f64; NPARS], pars_cov: [[f64; NPARS]; NPARS]) -> Self {
        Self {
            flags,
            flux: f64::NAN,
            flux_err: f64::NAN,
            s2n: f64::NAN,
            t: f64::NAN,
            t_err: f64::NAN,
            g: [f64::NAN; 2],
            g_cov: [[f64::NAN; 2]; 2],
            pars,
            pars_cov,
            numiter: 1,
        }
    }

    /// Placeholder for a measurement that was never made.
    pub fn not_attempted() -> Self {
        Self::failed(NO_ATTEMPT, [f64::NAN; NPARS], [[f64::NAN; NPARS]; NPARS])
    }

    pub fn is_success(&self) -> bool {
        self.flags == 0
    }
}

impl fmt::Display for MomentsResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flags={} s2n={:.2} T={:.4} g=({:.4}, {:.4})",
            crate::flags::flag_string(self.flags),
            self.s2n,
            self.t,
            self.g[0],
            self.g[1]
        )
    }
}

/// Measure weighted moments of `obs` using the weight function `weight`.
///
/// # Arguments
/// * `obs` - Exposure to measure; sky offsets come from its Jacobian
/// * `weight` - Weight function, evaluated in the same sky coordinates
/// * `maxrad` - Pixels farther than this from the weight center (arcsec) are
///   ignored; pass `f64::INFINITY` for no cut
#[allow(clippy::needless_range_loop)]
pub fn weighted_moments(obs: &Exposure, weight: &GMix, maxrad: f64) -> MomentsResult {
    let jacobian = obs.jacobian();
    let image = obs.image();
    let (vcen, ucen) = weight.centroid().unwrap_or((0.0, 0.0));
    let maxrad2 = maxrad * maxrad;

    let mut pars = [0.0; NPARS];
    let mut pcov = [[0.0; NPARS]; NPARS];
    let mut npix = 0usize;

    for ((row, col), &ivar) in obs.weight().indexed_iter() {
        if ivar <= 0.0 {
            continue;
        }
        let (v, u) = jacobian.to_sky(row as f64, col as f64);
        let vmod = v - vcen;
        let umod = u - ucen;
        let r2 = vmod * vmod + umod * umod;
        if r2 > maxrad2 {
            continue;
        }

        let w = weight.eval(v, u);
        let var = 1.0 / ivar;
        let wdata = w * image[[row, col]];
        let w2var = w * w * var;

        let f = [v, u, umod * umod - vmod * vmod, 2.0 * vmod * umod, r2, 1.0];
        for i in 0..NPARS {
            pars[i] += wdata * f[i];
            for j in 0..NPARS {
                pcov[i][j] += w2var * f[i] * f[j];
            }
        }
        npix += 1;
    }

    if npix == 0 {
        return MomentsResult::failed(ZERO_WEIGHTS, pars, pcov);
    }
    derive(pars, pcov)
}

/// Turn raw sums into flux, size and shape with propagated errors.
fn derive(pars: [f64; NPARS], pcov: [[f64; NPARS]; NPARS]) -> MomentsResult {
    let flux_var = pcov[5][5];
    if !(flux_var > 0.0) {
        return MomentsResult::failed(NONPOS_VAR, pars, pcov);
    }

    let flux = pars[5];
    if !(flux > 0.0) {
        return MomentsResult::failed(NONPOS_FLUX, pars, pcov);
    }
    let sumr2 = pars[4];
    if !(sumr2 > 0.0) {
        return MomentsResult::failed(NONPOS_SIZE, pars, pcov);
    }

    let flux_err = flux_var.sqrt();
    let s2n = flux / flux_err;
    let t = sumr2 / flux;
    let e1 = pars[2] / sumr2;
    let e2 = pars[3] / sumr2;

    let sumr2_sq = sumr2 * sumr2;
    let var_e1 = (pcov[2][2] - 2.0 * e1 * pcov[2][4] + e1 * e1 * pcov[4][4]) / sumr2_sq;
    let var_e2 = (pcov[3][3] - 2.0 * e2 * pcov[3][4] + e2 * e2 * pcov[4][4]) / sumr2_sq;
    let cov_e1e2 = (pcov[2][3] - e1 * pcov[3][4] - e2 * pcov[2][4] + e1 * e2 * pcov[4][4])
        / sumr2_sq;
    let var_t = (pcov[4][4] - 2.0 * t * pcov[4][5] + t * t * pcov[5][5]) / (flux * flux);

    let result = MomentsResult {
        flags: 0,
        flux,
        flux_err,
        s2n,
        t,
        t_err: var_t.max(0.0).sqrt(),
        g: [e1, e2],
        g_cov: [[var_e1, cov_e1e2], [cov_e1e2, var_e2]],
        pars,
        pars_cov: pcov,
        numiter: 1,
    };

    let finite = [s2n, t, result.t_err, e1, e2, var_e1, var_e2, cov_e1e2]
        .iter()
        .all(|x| x.is_finite());
    if !finite {
        return MomentsResult::failed(NONFINITE, pars, pcov);
    }

    result
}
