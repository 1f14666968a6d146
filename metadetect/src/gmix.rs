//! Gaussian mixture models in sky coordinates.
//!
//! A mixture is a list of elliptical Gaussians, each carrying a total flux `p`,
//! a center `(v, u)` and second moments `(vv, vu, uu)` in arcsec². Mixtures
//! describe fitted PSFs and the weight function used for adaptive moments.
//!
//! # Shape conventions
//!
//! For moments `vv, vu, uu` the size is `T = vv + uu` and the polarization is
//!
//! ```text
//! e1 = (uu - vv) / T,    e2 = 2 vu / T
//! ```
//!
//! Reduced shear `g` relates to `e` through the shear rapidity `eta`:
//! `|e| = tanh(eta)`, `|g| = tanh(eta / 2)`.

use std::f64::consts::PI;

use ndarray::Array2;
use thiserror::Error;

use crate::jacobian::Jacobian;

/// FWHM of a Gaussian in units of its sigma.
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// Errors raised while building or querying mixtures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GMixError {
    #[error("shape magnitude {magnitude:.6} must be below 1")]
    ShapeOutOfBounds { magnitude: f64 },
    #[error("size T={t} must be positive")]
    NonPositiveSize { t: f64 },
    #[error("gaussian covariance is singular: det={det:.6e}")]
    SingularCovariance { det: f64 },
    #[error("mixture has zero total flux")]
    ZeroFlux,
    #[error("mixture contains no gaussians")]
    Empty,
    #[error("coelliptic mixture needs matching sizes and fluxes ({n_t} vs {n_flux})")]
    LengthMismatch { n_t: usize, n_flux: usize },
}

/// Convert a Gaussian FWHM to its size `T = 2 sigma²`.
pub fn fwhm_to_t(fwhm: f64) -> f64 {
    let sigma = fwhm / FWHM_PER_SIGMA;
    2.0 * sigma * sigma
}

/// Reduced shear to polarization.
pub fn g_to_e(g1: f64, g2: f64) -> Result<(f64, f64), GMixError> {
    let g = g1.hypot(g2);
    if !g.is_finite() || g >= 1.0 {
        return Err(GMixError::ShapeOutOfBounds { magnitude: g });
    }
    if g == 0.0 {
        return Ok((0.0, 0.0));
    }
    let e = (2.0 * g.atanh()).tanh();
    Ok((e * g1 / g, e * g2 / g))
}

/// Polarization to reduced shear.
pub fn e_to_g(e1: f64, e2: f64) -> Result<(f64, f64), GMixError> {
    let e = e1.hypot(e2);
    if !e.is_finite() || e >= 1.0 {
        return Err(GMixError::ShapeOutOfBounds { magnitude: e });
    }
    if e == 0.0 {
        return Ok((0.0, 0.0));
    }
    let g = (0.5 * e.atanh()).tanh();
    Ok((g * e1 / e, g * e2 / e))
}

/// Second moments `(vv, vu, uu)` for a reduced shear and size.
pub fn shape_to_moments(g1: f64, g2: f64, t: f64) -> Result<(f64, f64, f64), GMixError> {
    if !(t > 0.0) {
        return Err(GMixError::NonPositiveSize { t });
    }
    let (e1, e2) = g_to_e(g1, g2)?;
    Ok((0.5 * t * (1.0 - e1), 0.5 * t * e2, 0.5 * t * (1.0 + e1)))
}

/// Single elliptical Gaussian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gaussian {
    p: f64,
    v: f64,
    u: f64,
    vv: f64,
    vu: f64,
    uu: f64,
    // Cached evaluation terms
    norm: f64,
    dvv: f64,
    dvu: f64,
    duu: f64,
}

impl Gaussian {
    pub fn new(p: f64, v: f64, u: f64, vv: f64, vu: f64, uu: f64) -> Result<Self, GMixError> {
        let det = vv * uu - vu * vu;
        if !(det > 0.0) || !(vv > 0.0) {
            return Err(GMixError::SingularCovariance { det });
        }
        Ok(Self {
            p,
            v,
            u,
            vv,
            vu,
            uu,
            norm: 1.0 / (2.0 * PI * det.sqrt()),
            dvv: uu / det,
            dvu: -vu / det,
            duu: vv / det,
        })
    }

    /// Total flux.
    pub fn flux(&self) -> f64 {
        self.p
    }

    pub fn center(&self) -> (f64, f64) {
        (self.v, self.u)
    }

    /// Second moments `(vv, vu, uu)`.
    pub fn moments(&self) -> (f64, f64, f64) {
        (self.vv, self.vu, self.uu)
    }

    pub fn t(&self) -> f64 {
        self.vv + self.uu
    }

    /// Surface brightness at (v, u).
    pub fn eval(&self, v: f64, u: f64) -> f64 {
        let dv = v - self.v;
        let du = u - self.u;
        let chi2 = self.dvv * dv * dv + 2.0 * self.dvu * dv * du + self.duu * du * du;
        self.p * self.norm * (-0.5 * chi2).exp()
    }
}

/// Summary shape of a mixture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixtureShape {
    pub g1: f64,
    pub g2: f64,
    pub t: f64,
}

/// A Gaussian mixture.
#[derive(Debug, Clone, PartialEq)]
pub struct GMix {
    gaussians: Vec<Gaussian>,
}

impl GMix {
    pub fn from_gaussians(gaussians: Vec<Gaussian>) -> Result<Self, GMixError> {
        if gaussians.is_empty() {
            return Err(GMixError::Empty);
        }
        Ok(Self { gaussians })
    }

    /// Single Gaussian with shape `(g1, g2)`, size `t` and total flux.
    pub fn gauss(v: f64, u: f64, g1: f64, g2: f64, t: f64, flux: f64) -> Result<Self, GMixError> {
        Self::coellip(v, u, g1, g2, &[t], &[flux])
    }

    /// Round Gaussian.
    pub fn round(v: f64, u: f64, t: f64, flux: f64) -> Result<Self, GMixError> {
        Self::gauss(v, u, 0.0, 0.0, t, flux)
    }

    /// Co-centric, co-elliptical Gaussians sharing one shape.
    pub fn coellip(
        v: f64,
        u: f64,
        g1: f64,
        g2: f64,
        ts: &[f64],
        fluxes: &[f64],
    ) -> Result<Self, GMixError> {
        if ts.len() != fluxes.len() {
            return Err(GMixError::LengthMismatch {
                n_t: ts.len(),
                n_flux: fluxes.len(),
            });
        }
        let gaussians = ts
            .iter()
            .zip(fluxes)
            .map(|(&t, &flux)| {
                let (vv, vu, uu) = shape_to_moments(g1, g2, t)?;
                Gaussian::new(flux, v, u, vv, vu, uu)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_gaussians(gaussians)
    }

    pub fn gaussians(&self) -> &[Gaussian] {
        &self.gaussians
    }

    pub fn len(&self) -> usize {
        self.gaussians.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gaussians.is_empty()
    }

    pub fn total_flux(&self) -> f64 {
        self.gaussians.iter().map(|g| g.p).sum()
    }

    /// Rescale component fluxes so they sum to `flux`.
    pub fn set_flux(&mut self, flux: f64) -> Result<(), GMixError> {
        let total = self.total_flux();
        if total == 0.0 {
            return Err(GMixError::ZeroFlux);
        }
        let factor = flux / total;
        for g in &mut self.gaussians {
            g.p *= factor;
        }
        Ok(())
    }

    /// Rescale so the mixture evaluates to 1 at the first component's center.
    pub fn normalize_peak(&mut self) -> Result<(), GMixError> {
        let (v, u) = (self.gaussians[0].v, self.gaussians[0].u);
        let peak = self.eval(v, u);
        if !(peak > 0.0) {
            return Err(GMixError::ZeroFlux);
        }
        for g in &mut self.gaussians {
            g.p /= peak;
        }
        Ok(())
    }

    pub fn eval(&self, v: f64, u: f64) -> f64 {
        self.gaussians.iter().map(|g| g.eval(v, u)).sum()
    }

    /// Flux-weighted center.
    pub fn centroid(&self) -> Result<(f64, f64), GMixError> {
        let psum = self.total_flux();
        if psum == 0.0 {
            return Err(GMixError::ZeroFlux);
        }
        let v = self.gaussians.iter().map(|g| g.p * g.v).sum::<f64>() / psum;
        let u = self.gaussians.iter().map(|g| g.p * g.u).sum::<f64>() / psum;
        Ok((v, u))
    }

    /// Flux-weighted shape and size.
    pub fn shape(&self) -> Result<MixtureShape, GMixError> {
        let psum = self.total_flux();
        if psum == 0.0 {
            return Err(GMixError::ZeroFlux);
        }

        let mut vv = 0.0;
        let mut vu = 0.0;
        let mut uu = 0.0;
        for g in &self.gaussians {
            vv += g.p * g.vv;
            vu += g.p * g.vu;
            uu += g.p * g.uu;
        }
        vv /= psum;
        vu /= psum;
        uu /= psum;

        let t = vv + uu;
        if !(t > 0.0) {
            return Err(GMixError::NonPositiveSize { t });
        }
        let (g1, g2) = e_to_g((uu - vv) / t, 2.0 * vu / t)?;
        Ok(MixtureShape { g1, g2, t })
    }

    /// Render into a pixel grid: surface brightness at pixel centers times pixel area.
    pub fn render(&self, dims: (usize, usize), jacobian: &Jacobian) -> Array2<f64> {
        let area = jacobian.area();
        Array2::from_shape_fn(dims, |(row, col)| {
            let (v, u) = jacobian.to_sky(row as f64, col as f64);
            self.eval(v, u) * area
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fwhm_to_t() {
        let t = fwhm_to_t(1.2);
        assert_relative_eq!(t, 2.0 * (1.2 / FWHM_PER_SIGMA).powi(2), epsilon = 1e-15);
    }

    #[test]
    fn test_shape_conversions_invert() {
        let (e1, e2) = g_to_e(0.2, -0.1).unwrap();
        let (g1, g2) = e_to_g(e1, e2).unwrap();
        assert_relative_eq!(g1, 0.2, epsilon = 1e-12);
        assert_relative_eq!(g2, -0.1, epsilon = 1e-12);
        // |e| exceeds |g| for nonzero shapes
        assert!(e1.hypot(e2) > 0.2_f64.hypot(0.1));
    }

    #[test]
    fn test_shape_bounds() {
        assert!(matches!(g_to_e(1.0, 0.0), Err(GMixError::ShapeOutOfBounds { .. })));
        assert!(matches!(e_to_g(0.9, 0.9), Err(GMixError::ShapeOutOfBounds { .. })));
        assert!(shape_to_moments(0.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_gauss_shape_recovered() {
        let gm = GMix::gauss(0.1, -0.2, 0.05, -0.02, 0.3, 2.0).unwrap();
        let shape = gm.shape().unwrap();
        assert_relative_eq!(shape.g1, 0.05, epsilon = 1e-12);
        assert_relative_eq!(shape.g2, -0.02, epsilon = 1e-12);
        assert_relative_eq!(shape.t, 0.3, epsilon = 1e-12);
        assert_relative_eq!(gm.total_flux(), 2.0);
        let (v, u) = gm.centroid().unwrap();
        assert_relative_eq!(v, 0.1);
        assert_relative_eq!(u, -0.2);
    }

    #[test]
    fn test_coellip_size_is_flux_weighted() {
        let gm = GMix::coellip(0.0, 0.0, 0.0, 0.0, &[0.2, 0.8], &[0.75, 0.25]).unwrap();
        let shape = gm.shape().unwrap();
        assert_relative_eq!(shape.t, 0.75 * 0.2 + 0.25 * 0.8, epsilon = 1e-12);
        assert!(GMix::coellip(0.0, 0.0, 0.0, 0.0, &[0.2], &[0.5, 0.5]).is_err());
    }

    #[test]
    fn test_normalize_peak() {
        let mut gm = GMix::round(0.0, 0.0, fwhm_to_t(1.2), 1.0).unwrap();
        gm.normalize_peak().unwrap();
        assert_relative_eq!(gm.eval(0.0, 0.0), 1.0, epsilon = 1e-12);
        assert!(gm.eval(0.5, 0.0) < 1.0);
    }

    #[test]
    fn test_render_conserves_flux() {
        let jac = Jacobian::diagonal(24.0, 24.0, 0.2).unwrap();
        let gm = GMix::gauss(0.0, 0.0, 0.1, 0.0, 0.5, 10.0).unwrap();
        let image = gm.render((49, 49), &jac);

        assert_relative_eq!(image.sum(), 10.0, epsilon = 1e-3);
        // Peak at the reference pixel
        let peak = image.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_relative_eq!(image[[24, 24]], peak);
    }

    #[test]
    fn test_singular_gaussian_rejected() {
        assert!(Gaussian::new(1.0, 0.0, 0.0, 1.0, 1.0, 1.0).is_err());
        assert!(matches!(GMix::from_gaussians(vec![]), Err(GMixError::Empty)));
    }
}
