//! Object detection and per-object stamp extraction.
//!
//! The orchestrator only needs something that turns an [`ObservationSet`] into a
//! list of positions plus one cutout set per object; that is the [`Detector`]
//! trait. [`SegmentationDetector`] is the reference implementation.
//!
//! # Algorithm
//!
//! 1. Combine every exposure into a detection image, weighting each by the
//!    median of its weight map; the noise of the combination is
//!    `sqrt(1 / sum(median weights))`
//! 2. Optionally smooth with a round Gaussian of `filter_fwhm` pixels, scaling
//!    the noise by `sqrt(sum(k^2))`
//! 3. Threshold at `detect_thresh` times the noise and label 8-connected regions
//! 4. Keep regions of at least `minarea` pixels; their flux-weighted centroid is
//!    the object position
//! 5. Cut a stamp from every exposure, sized from the region's area

pub mod aabb;
pub mod centroid;
pub mod convolve;
pub mod stamps;
pub mod thresholding;

pub use aabb::AABB;
pub use stamps::{box_size, extract_stamp, NeighborMask};

use log::{debug, warn};
use ndarray::Array2;
use thiserror::Error;

use crate::config::MetadetectConfig;
use crate::noise::median_weight_noise;
use crate::observation::{ObservationError, ObservationSet};

use self::centroid::region_centroid;
use self::convolve::{convolve2d, gaussian_kernel};
use self::thresholding::{apply_threshold, connected_components, label_regions};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("exposure {index} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("failed to build stamp: {0}")]
    Stamp(#[from] ObservationError),
}

/// One detection in parent-image pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    /// Index within this detection run
    pub id: usize,
    /// Segmentation label
    pub label: usize,
    /// Column of the centroid
    pub x: f64,
    /// Row of the centroid
    pub y: f64,
    /// Summed detection-image flux over the region
    pub flux: f64,
    pub npix: usize,
    pub bbox: AABB,
    pub box_size: usize,
}

/// Detected objects and their cutouts, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct Detections {
    pub objects: Vec<DetectedObject>,
    pub mbobs_list: Vec<ObservationSet>,
}

impl Detections {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Finds objects in an observation set and cuts per-object observation sets.
pub trait Detector {
    fn detect(
        &self,
        obs: &ObservationSet,
        config: &MetadetectConfig,
    ) -> Result<Detections, DetectionError>;
}

impl<D: Detector + ?Sized> Detector for &D {
    fn detect(
        &self,
        obs: &ObservationSet,
        config: &MetadetectConfig,
    ) -> Result<Detections, DetectionError> {
        (**self).detect(obs, config)
    }
}

/// Threshold and connected-component detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentationDetector;

impl SegmentationDetector {
    /// Median-weight mean of all exposures and its per-pixel noise.
    ///
    /// Exposures whose weight map has a non-positive median do not contribute.
    /// Returns `None` when nothing contributes.
    fn detection_image(
        &self,
        obs: &ObservationSet,
    ) -> Result<Option<(Array2<f64>, f64)>, DetectionError> {
        let expected = obs.first().dim();
        let mut sum = Array2::<f64>::zeros(expected);
        let mut wsum = 0.0;

        for (index, exposure) in obs.exposures().enumerate() {
            if exposure.dim() != expected {
                return Err(DetectionError::ShapeMismatch {
                    index,
                    expected,
                    found: exposure.dim(),
                });
            }
            match median_weight_noise(exposure.weight()) {
                Ok((medweight, _)) => {
                    sum.scaled_add(medweight, exposure.image());
                    wsum += medweight;
                }
                Err(e) => debug!("exposure {} left out of detection image: {}", index, e),
            }
        }

        if !(wsum > 0.0) {
            return Ok(None);
        }
        sum.mapv_inplace(|v| v / wsum);
        Ok(Some((sum, (1.0 / wsum).sqrt())))
    }
}

impl Detector for SegmentationDetector {
    fn detect(
        &self,
        obs: &ObservationSet,
        config: &MetadetectConfig,
    ) -> Result<Detections, DetectionError> {
        let det_config = config.detection();

        let Some((mut image, mut noise)) = self.detection_image(obs)? else {
            warn!("no exposure has usable weights, skipping detection");
            return Ok(Detections::default());
        };

        if let Some(fwhm) = det_config.filter_fwhm {
            let kernel = gaussian_kernel(fwhm);
            image = convolve2d(&image.view(), &kernel.view());
            noise *= kernel.iter().map(|k| k * k).sum::<f64>().sqrt();
        }

        let threshold = det_config.detect_thresh * noise;
        let mask = apply_threshold(&image.view(), threshold);
        let (seg, count) = connected_components(&mask.view());
        let regions = label_regions(&seg.view(), count);

        let mut detections = Detections::default();
        for region in regions.iter().filter(|r| r.npix >= det_config.minarea) {
            let center = region_centroid(&image.view(), &seg.view(), region);
            let size = box_size(region.npix, config.meds());
            let neighbors = det_config.mask_neighbors.then(|| NeighborMask {
                seg: seg.view(),
                label: region.label,
            });

            let mbobs = obs.try_map(|exposure| {
                extract_stamp(exposure, center.row, center.col, size, neighbors)
            })?;

            detections.objects.push(DetectedObject {
                id: detections.objects.len(),
                label: region.label,
                x: center.col,
                y: center.row,
                flux: center.flux,
                npix: region.npix,
                bbox: region.bbox,
                box_size: size,
            });
            detections.mbobs_list.push(mbobs);
        }

        debug!(
            "detected {} objects ({} regions above {:.4}, minarea {})",
            detections.len(),
            count,
            threshold,
            det_config.minarea
        );
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::bmask;
    use crate::gmix::GMix;
    use crate::jacobian::Jacobian;
    use crate::observation::Exposure;
    use approx::assert_abs_diff_eq;

    fn scene(sources: &[(f64, f64, f64)], weight: f64) -> Exposure {
        let dim = (80, 80);
        let jac = Jacobian::diagonal(0.0, 0.0, 0.2).unwrap();
        let mut image = Array2::zeros(dim);
        for &(row, col, flux) in sources {
            let (v, u) = jac.to_sky(row, col);
            let gm = GMix::round(v, u, 0.3, flux).unwrap();
            image += &gm.render(dim, &jac);
        }
        Exposure::new(image, Array2::from_elem(dim, weight), jac).unwrap()
    }

    fn config() -> MetadetectConfig {
        MetadetectConfig::default()
    }

    #[test]
    fn test_separated_sources() {
        let exp = scene(&[(20.0, 20.0, 100.0), (55.0, 60.0, 100.0)], 100.0);
        let obs = ObservationSet::single(exp);

        let dets = SegmentationDetector.detect(&obs, &config()).unwrap();

        assert_eq!(dets.len(), 2);
        assert_eq!(dets.mbobs_list.len(), 2);
        assert_abs_diff_eq!(dets.objects[0].y, 20.0, epsilon = 0.05);
        assert_abs_diff_eq!(dets.objects[0].x, 20.0, epsilon = 0.05);
        assert_abs_diff_eq!(dets.objects[1].y, 55.0, epsilon = 0.05);
        assert_abs_diff_eq!(dets.objects[1].x, 60.0, epsilon = 0.05);
        assert_eq!(dets.objects[1].id, 1);

        let stamp = dets.mbobs_list[0].first();
        assert_eq!(stamp.dim().0, dets.objects[0].box_size);
        let (row0, col0) = stamp.jacobian().center();
        assert_abs_diff_eq!(row0, 16.0, epsilon = 0.05);
        assert_abs_diff_eq!(col0, 16.0, epsilon = 0.05);
    }

    #[test]
    fn test_blank_image() {
        let obs = ObservationSet::single(scene(&[], 100.0));
        let dets = SegmentationDetector.detect(&obs, &config()).unwrap();
        assert!(dets.is_empty());
    }

    #[test]
    fn test_zero_weight_finds_nothing() {
        let obs = ObservationSet::single(scene(&[(40.0, 40.0, 100.0)], 0.0));
        let dets = SegmentationDetector.detect(&obs, &config()).unwrap();
        assert!(dets.is_empty());
    }

    #[test]
    fn test_minarea_rejects_single_pixel() {
        let mut exp = scene(&[], 100.0);
        exp.image_mut()[[40, 40]] = 10.0;
        let obs = ObservationSet::single(exp);
        let dets = SegmentationDetector.detect(&obs, &config()).unwrap();
        assert!(dets.is_empty());
    }

    #[test]
    fn test_edge_object_gets_edge_bits() {
        let obs = ObservationSet::single(scene(&[(3.0, 40.0, 100.0)], 100.0));
        let dets = SegmentationDetector.detect(&obs, &config()).unwrap();

        assert_eq!(dets.len(), 1);
        let stamp = dets.mbobs_list[0].first();
        assert!(stamp.bmask().iter().any(|&b| b & bmask::EDGE != 0));
    }

    #[test]
    fn test_shape_mismatch() {
        let jac = Jacobian::diagonal(0.0, 0.0, 0.2).unwrap();
        let other = Exposure::new(Array2::zeros((10, 10)), Array2::ones((10, 10)), jac).unwrap();
        let obs = ObservationSet::new(vec![vec![scene(&[], 1.0)], vec![other]]).unwrap();

        let err = SegmentationDetector.detect(&obs, &config()).unwrap_err();
        assert!(matches!(err, DetectionError::ShapeMismatch { index: 1, .. }));
    }
}
