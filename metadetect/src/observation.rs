//! Exposures and multi-band observation sets.
//!
//! An [`Exposure`] holds one image with its inverse-variance weight map,
//! bad-pixel bitmask and pixel-to-sky [`Jacobian`]. Science exposures carry
//! their PSF as a nested exposure, which in turn may carry a fitted
//! Gaussian-mixture model once the PSF fitter has run.
//!
//! An [`ObservationSet`] groups exposures by band: `bands[b][e]` is epoch `e`
//! of band `b`.

use ndarray::Array2;
use thiserror::Error;

use crate::gmix::GMix;
use crate::jacobian::Jacobian;
use crate::psf::PsfFitMeta;

/// Errors raised while assembling exposures and observation sets
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObservationError {
    #[error("{what} shape {found:?} does not match image shape {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("image has no pixels")]
    EmptyImage,
    #[error("weight map contains negative or non-finite values")]
    InvalidWeight,
    #[error("observation set contains no bands")]
    NoBands,
    #[error("band {band} contains no exposures")]
    EmptyBand { band: usize },
}

/// One image with its weight, bad-pixel mask, Jacobian and optional PSF.
#[derive(Debug, Clone)]
pub struct Exposure {
    image: Array2<f64>,
    weight: Array2<f64>,
    bmask: Array2<i32>,
    jacobian: Jacobian,
    psf: Option<Box<Exposure>>,
    gmix: Option<GMix>,
    fit_meta: Option<PsfFitMeta>,
}

fn check_shape(
    what: &'static str,
    expected: (usize, usize),
    found: (usize, usize),
) -> Result<(), ObservationError> {
    if expected != found {
        return Err(ObservationError::ShapeMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

fn check_weight(weight: &Array2<f64>) -> Result<(), ObservationError> {
    if weight.iter().any(|&w| !(w >= 0.0) || !w.is_finite()) {
        return Err(ObservationError::InvalidWeight);
    }
    Ok(())
}

impl Exposure {
    /// Create an exposure with an empty bad-pixel mask and no PSF.
    ///
    /// # Arguments
    /// * `image` - Pixel values indexed as [row, col]
    /// * `weight` - Inverse variance per pixel, zero for unusable pixels
    /// * `jacobian` - Pixel to sky mapping
    pub fn new(
        image: Array2<f64>,
        weight: Array2<f64>,
        jacobian: Jacobian,
    ) -> Result<Self, ObservationError> {
        let dim = image.dim();
        if dim.0 == 0 || dim.1 == 0 {
            return Err(ObservationError::EmptyImage);
        }
        check_shape("weight", dim, weight.dim())?;
        check_weight(&weight)?;

        Ok(Self {
            image,
            weight,
            bmask: Array2::zeros(dim),
            jacobian,
            psf: None,
            gmix: None,
            fit_meta: None,
        })
    }

    /// Attach a bad-pixel mask.
    pub fn with_bmask(mut self, bmask: Array2<i32>) -> Result<Self, ObservationError> {
        check_shape("bmask", self.dim(), bmask.dim())?;
        self.bmask = bmask;
        Ok(self)
    }

    /// Attach the PSF image for this exposure.
    pub fn with_psf(mut self, psf: Exposure) -> Self {
        self.psf = Some(Box::new(psf));
        self
    }

    pub fn dim(&self) -> (usize, usize) {
        self.image.dim()
    }

    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    pub fn weight(&self) -> &Array2<f64> {
        &self.weight
    }

    pub fn bmask(&self) -> &Array2<i32> {
        &self.bmask
    }

    pub fn jacobian(&self) -> &Jacobian {
        &self.jacobian
    }

    pub fn psf(&self) -> Option<&Exposure> {
        self.psf.as_deref()
    }

    pub fn psf_mut(&mut self) -> Option<&mut Exposure> {
        self.psf.as_deref_mut()
    }

    /// Fitted mixture model, present after a successful PSF fit.
    pub fn gmix(&self) -> Option<&GMix> {
        self.gmix.as_ref()
    }

    /// Metadata from the most recent fit attempt, successful or not.
    pub fn fit_meta(&self) -> Option<&PsfFitMeta> {
        self.fit_meta.as_ref()
    }

    /// Largest weight in the map.
    pub fn max_weight(&self) -> f64 {
        self.weight.iter().copied().fold(0.0, f64::max)
    }

    /// Mutable pixel access; the shape cannot change.
    pub fn image_mut(&mut self) -> &mut Array2<f64> {
        &mut self.image
    }

    /// Mutable bad-pixel mask access; the shape cannot change.
    pub fn bmask_mut(&mut self) -> &mut Array2<i32> {
        &mut self.bmask
    }

    /// Mutable weight access; values must stay finite and non-negative.
    pub fn weight_mut(&mut self) -> &mut Array2<f64> {
        &mut self.weight
    }

    /// Replace all pixel planes at once, dropping any fitted model.
    pub(crate) fn replace_pixels(
        &mut self,
        image: Array2<f64>,
        weight: Array2<f64>,
        bmask: Array2<i32>,
    ) -> Result<(), ObservationError> {
        let dim = image.dim();
        check_shape("weight", dim, weight.dim())?;
        check_shape("bmask", dim, bmask.dim())?;
        check_weight(&weight)?;
        self.image = image;
        self.weight = weight;
        self.bmask = bmask;
        self.clear_fit();
        Ok(())
    }

    pub(crate) fn set_fit_meta(&mut self, meta: PsfFitMeta) {
        self.fit_meta = Some(meta);
    }

    pub(crate) fn store_gmix(&mut self, gmix: GMix) -> &GMix {
        self.gmix.insert(gmix)
    }

    pub(crate) fn clear_fit(&mut self) {
        self.gmix = None;
        self.fit_meta = None;
    }
}

/// Exposures grouped by band, then epoch.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    bands: Vec<Vec<Exposure>>,
}

impl ObservationSet {
    /// # Returns
    /// * `Err(ObservationError)` - If there are no bands or a band is empty
    pub fn new(bands: Vec<Vec<Exposure>>) -> Result<Self, ObservationError> {
        if bands.is_empty() {
            return Err(ObservationError::NoBands);
        }
        if let Some(band) = bands.iter().position(Vec::is_empty) {
            return Err(ObservationError::EmptyBand { band });
        }
        Ok(Self { bands })
    }

    /// One band with one epoch.
    pub fn single(exposure: Exposure) -> Self {
        Self {
            bands: vec![vec![exposure]],
        }
    }

    pub fn nband(&self) -> usize {
        self.bands.len()
    }

    pub fn bands(&self) -> &[Vec<Exposure>] {
        &self.bands
    }

    pub fn n_exposures(&self) -> usize {
        self.bands.iter().map(Vec::len).sum()
    }

    /// True when there is exactly one band with one epoch.
    pub fn is_single(&self) -> bool {
        self.bands.len() == 1 && self.bands[0].len() == 1
    }

    pub fn first(&self) -> &Exposure {
        &self.bands[0][0]
    }

    /// All exposures in band-major order.
    pub fn exposures(&self) -> impl Iterator<Item = &Exposure> {
        self.bands.iter().flatten()
    }

    pub fn exposures_mut(&mut self) -> impl Iterator<Item = &mut Exposure> {
        self.bands.iter_mut().flatten()
    }

    /// Build a new set with the same band/epoch layout.
    pub fn try_map<E, F>(&self, mut f: F) -> Result<Self, E>
    where
        F: FnMut(&Exposure) -> Result<Exposure, E>,
    {
        let bands = self
            .bands
            .iter()
            .map(|band| band.iter().map(&mut f).collect::<Result<Vec<_>, E>>())
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Self { bands })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure(dim: (usize, usize)) -> Exposure {
        let jac = Jacobian::diagonal(0.0, 0.0, 0.2).unwrap();
        Exposure::new(Array2::zeros(dim), Array2::ones(dim), jac).unwrap()
    }

    #[test]
    fn test_weight_shape_checked() {
        let jac = Jacobian::diagonal(0.0, 0.0, 0.2).unwrap();
        let err = Exposure::new(Array2::zeros((4, 4)), Array2::ones((4, 5)), jac).unwrap_err();
        assert!(matches!(err, ObservationError::ShapeMismatch { what: "weight", .. }));
    }

    #[test]
    fn test_negative_weight_rejected() {
        let jac = Jacobian::diagonal(0.0, 0.0, 0.2).unwrap();
        let mut weight = Array2::ones((3, 3));
        weight[[1, 1]] = -1.0;
        let err = Exposure::new(Array2::zeros((3, 3)), weight, jac).unwrap_err();
        assert_eq!(err, ObservationError::InvalidWeight);
    }

    #[test]
    fn test_bmask_shape_checked() {
        let result = exposure((4, 4)).with_bmask(Array2::zeros((2, 2)));
        assert!(result.is_err());
        let ok = exposure((4, 4)).with_bmask(Array2::from_elem((4, 4), 2)).unwrap();
        assert_eq!(ok.bmask()[[0, 0]], 2);
    }

    #[test]
    fn test_psf_attached() {
        let obs = exposure((8, 8)).with_psf(exposure((5, 5)));
        assert_eq!(obs.psf().map(Exposure::dim), Some((5, 5)));
        assert!(obs.psf().unwrap().gmix().is_none());
    }

    #[test]
    fn test_set_layout() {
        let set = ObservationSet::new(vec![
            vec![exposure((4, 4)), exposure((4, 4))],
            vec![exposure((4, 4))],
        ])
        .unwrap();
        assert_eq!(set.nband(), 2);
        assert_eq!(set.n_exposures(), 3);
        assert!(!set.is_single());
        assert!(ObservationSet::single(exposure((4, 4))).is_single());
    }

    #[test]
    fn test_empty_sets_rejected() {
        assert_eq!(ObservationSet::new(vec![]).unwrap_err(), ObservationError::NoBands);
        assert_eq!(
            ObservationSet::new(vec![vec![exposure((2, 2))], vec![]]).unwrap_err(),
            ObservationError::EmptyBand { band: 1 }
        );
    }
}
