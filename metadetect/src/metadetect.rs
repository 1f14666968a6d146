//! Run detection and weighted-moments measurement on every sheared realization.
//!
//! # Algorithm
//!
//! 1. Draw three seeds from the caller's random source, in order: PSF fitting,
//!    metacal, measurement
//! 2. Fit and aggregate the original PSFs once; a failure only sets
//!    `psfrec_flags` on every row
//! 3. Make all requested sheared realizations from one metacal random stream
//! 4. For each label, independently: detect, cut stamps, measure every object
//!    with a measurer seeded from the measurement seed plus the label's fixed
//!    index, and attach `psfrec_*` and the detection position to each row
//!
//! Labels run on rayon. `n_threads = Some(1)` runs them sequentially and any
//! other explicit count uses a dedicated pool. A label's catalog only exists once
//! all of its rows are measured, and any fatal error fails the whole run.
//!
//! # Usage
//!
//! ```no_run
//! use metadetect::{run_metadetect, MetadetectConfig, ObservationSet};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! # fn obs() -> ObservationSet { unimplemented!() }
//! let config = MetadetectConfig::default();
//! let mut rng = StdRng::seed_from_u64(42);
//! let catalogs = run_metadetect(&obs(), &config, &mut rng).unwrap();
//! for (label, catalog) in &catalogs {
//!     println!("{label}: {} objects", catalog.len());
//! }
//! ```

use std::collections::BTreeMap;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;

use crate::catalog::{Catalog, CatalogRow, WMOM_MODEL};
use crate::config::MetadetectConfig;
use crate::detection::{Detector, SegmentationDetector};
use crate::error::MetadetectError;
use crate::metacal::{Metacal, ResampleMetacal, ShearLabel};
use crate::moments::MomentsMeasurer;
use crate::observation::ObservationSet;
use crate::psf::{fit_original_psfs, PsfStats};

/// Catalogs keyed by shear label.
pub type MetadetectResult = BTreeMap<ShearLabel, Catalog>;

/// Seeds drawn once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seeds {
    psf: u64,
    metacal: u64,
    measure: u64,
}

impl Seeds {
    fn draw<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let psf = rng.next_u64();
        let metacal = rng.next_u64();
        let measure = rng.next_u64();
        Self {
            psf,
            metacal,
            measure,
        }
    }
}

/// One metadetect run over a single observation set.
///
/// Construction fits the original PSFs; [`Metadetect::go`] does the
/// measurement and [`Metadetect::result`] returns the catalogs.
pub struct Metadetect<M = ResampleMetacal, D = SegmentationDetector> {
    config: MetadetectConfig,
    mbobs: ObservationSet,
    psf_stats: PsfStats,
    seeds: Seeds,
    metacal: M,
    detector: D,
    result: Option<MetadetectResult>,
}

impl Metadetect {
    /// Run with resampling metacal and segmentation detection.
    pub fn new<R: RngCore + ?Sized>(
        config: MetadetectConfig,
        mbobs: ObservationSet,
        rng: &mut R,
    ) -> Self {
        let metacal = ResampleMetacal::new(config.metacal().clone());
        Self::with_collaborators(config, mbobs, rng, metacal, SegmentationDetector)
    }
}

impl<M: Metacal, D: Detector + Sync> Metadetect<M, D> {
    /// # Arguments
    /// * `config` - Validated configuration
    /// * `mbobs` - Original observation set; its PSFs are fitted in place
    /// * `rng` - Source of the three per-run seeds
    /// * `metacal` - Produces the sheared realizations
    /// * `detector` - Finds objects in each realization
    pub fn with_collaborators<R: RngCore + ?Sized>(
        config: MetadetectConfig,
        mut mbobs: ObservationSet,
        rng: &mut R,
        metacal: M,
        detector: D,
    ) -> Self {
        let seeds = Seeds::draw(rng);
        let mut psf_rng = StdRng::seed_from_u64(seeds.psf);
        let psf_stats = fit_original_psfs(&mut mbobs, config.psf(), &mut psf_rng);
        if psf_stats.flags() != 0 {
            info!("original PSF aggregation failed, flags {:#x}", psf_stats.flags());
        }

        Self {
            config,
            mbobs,
            psf_stats,
            seeds,
            metacal,
            detector,
            result: None,
        }
    }

    pub fn config(&self) -> &MetadetectConfig {
        &self.config
    }

    /// Observation set with fitted original PSFs.
    pub fn mbobs(&self) -> &ObservationSet {
        &self.mbobs
    }

    pub fn psf_stats(&self) -> &PsfStats {
        &self.psf_stats
    }

    /// Make the sheared realizations and measure every label.
    pub fn go(&mut self) -> Result<(), MetadetectError> {
        let mut metacal_rng = StdRng::seed_from_u64(self.seeds.metacal);
        let realizations: Vec<(ShearLabel, ObservationSet)> = self
            .metacal
            .get_all_metacal(&self.mbobs, &mut metacal_rng)?
            .into_iter()
            .collect();

        let job = LabelJob {
            config: &self.config,
            psf_stats: &self.psf_stats,
            detector: &self.detector,
            measure_seed: self.seeds.measure,
        };

        let catalogs = match self.config.n_threads() {
            Some(1) => realizations
                .iter()
                .map(|(label, obs)| job.run(*label, obs))
                .collect::<Result<Vec<_>, _>>()?,
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
                pool.install(|| job.run_parallel(&realizations))?
            }
            None => job.run_parallel(&realizations)?,
        };

        self.result = Some(
            catalogs
                .into_iter()
                .map(|catalog| (catalog.label(), catalog))
                .collect(),
        );
        Ok(())
    }

    /// Catalogs from the last [`Metadetect::go`].
    pub fn result(&self) -> Result<&MetadetectResult, MetadetectError> {
        self.result.as_ref().ok_or(MetadetectError::NotRun)
    }

    pub fn into_result(self) -> Result<MetadetectResult, MetadetectError> {
        self.result.ok_or(MetadetectError::NotRun)
    }
}

/// Read-only inputs shared by every label.
struct LabelJob<'a, D> {
    config: &'a MetadetectConfig,
    psf_stats: &'a PsfStats,
    detector: &'a D,
    measure_seed: u64,
}

impl<D: Detector + Sync> LabelJob<'_, D> {
    fn run_parallel(
        &self,
        realizations: &[(ShearLabel, ObservationSet)],
    ) -> Result<Vec<Catalog>, MetadetectError> {
        realizations
            .par_iter()
            .map(|(label, obs)| self.run(*label, obs))
            .collect()
    }

    fn run(&self, label: ShearLabel, obs: &ObservationSet) -> Result<Catalog, MetadetectError> {
        let detections = self.detector.detect(obs, self.config)?;

        let rng = StdRng::seed_from_u64(self.measure_seed.wrapping_add(label.index() as u64));
        let mut measurer = MomentsMeasurer::new(&self.config.moments(), rng)?;
        let output = measurer.measure_all(&detections.mbobs_list)?;

        let rows: Vec<CatalogRow> = output
            .rows
            .into_iter()
            .zip(&detections.objects)
            .map(|(row, object)| CatalogRow::new(row, self.psf_stats, object.y, object.x))
            .collect();

        debug!(
            "{}: {} detections, {} measured without flags",
            label,
            rows.len(),
            output.successful.len()
        );
        Ok(Catalog::new(WMOM_MODEL, label, rows))
    }
}

/// Run the full pipeline with resampling metacal and segmentation detection.
///
/// # Returns
/// * `Ok(MetadetectResult)` - One catalog per configured label
/// * `Err(MetadetectError)` - If any label fails fatally
pub fn run_metadetect<R: RngCore + ?Sized>(
    obs: &ObservationSet,
    config: &MetadetectConfig,
    rng: &mut R,
) -> Result<MetadetectResult, MetadetectError> {
    let mut md = Metadetect::new(config.clone(), obs.clone(), rng);
    md.go()?;
    md.into_result()
}

/// Run the full pipeline with caller-supplied metacal and detection.
pub fn run_metadetect_with<R, M, D>(
    obs: &ObservationSet,
    config: &MetadetectConfig,
    rng: &mut R,
    metacal: &M,
    detector: &D,
) -> Result<MetadetectResult, MetadetectError>
where
    R: RngCore + ?Sized,
    M: Metacal,
    D: Detector + Sync,
{
    let mut md =
        Metadetect::with_collaborators(config.clone(), obs.clone(), rng, metacal, detector);
    md.go()?;
    md.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{DetectionError, Detections};
    use crate::flags::PSF_FAILURE;
    use crate::gmix::GMix;
    use crate::jacobian::Jacobian;
    use crate::metacal::MetacalError;
    use crate::observation::Exposure;
    use ndarray::Array2;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn observation() -> ObservationSet {
        let jac = Jacobian::diagonal(24.0, 24.0, 0.2).unwrap();
        let image = GMix::round(0.0, 0.0, 0.3, 50.0).unwrap().render((49, 49), &jac);
        let psf_jac = Jacobian::diagonal(12.0, 12.0, 0.2).unwrap();
        let mut psf_image = GMix::round(0.0, 0.0, 0.2, 1.0).unwrap().render((25, 25), &psf_jac);
        psf_image[[0, 0]] += 1e-6;
        let psf = Exposure::new(psf_image, Array2::from_elem((25, 25), 1e6), psf_jac).unwrap();
        let exp = Exposure::new(image, Array2::from_elem((49, 49), 100.0), jac)
            .unwrap()
            .with_psf(psf);
        ObservationSet::single(exp)
    }

    /// Returns the input unchanged for every configured label.
    struct Identity(Vec<ShearLabel>);

    impl Metacal for Identity {
        fn get_all_metacal(
            &self,
            obs: &ObservationSet,
            _rng: &mut dyn RngCore,
        ) -> Result<BTreeMap<ShearLabel, ObservationSet>, MetacalError> {
            Ok(self.0.iter().map(|&l| (l, obs.clone())).collect())
        }
    }

    /// Reports nothing and counts calls.
    #[derive(Default)]
    struct CountingDetector(AtomicUsize);

    impl Detector for CountingDetector {
        fn detect(
            &self,
            _obs: &ObservationSet,
            _config: &MetadetectConfig,
        ) -> Result<Detections, DetectionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Detections::default())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn detect(
            &self,
            _obs: &ObservationSet,
            _config: &MetadetectConfig,
        ) -> Result<Detections, DetectionError> {
            Err(DetectionError::ShapeMismatch {
                index: 0,
                expected: (1, 1),
                found: (2, 2),
            })
        }
    }

    #[test]
    fn test_result_before_go() {
        let mut rng = StdRng::seed_from_u64(0);
        let md = Metadetect::new(MetadetectConfig::default(), observation(), &mut rng);
        assert!(matches!(md.result(), Err(MetadetectError::NotRun)));
    }

    #[test]
    fn test_psf_fitted_at_construction() {
        let mut rng = StdRng::seed_from_u64(0);
        let md = Metadetect::new(MetadetectConfig::default(), observation(), &mut rng);
        assert_eq!(md.psf_stats().flags(), 0);
        assert!(md.mbobs().first().psf().and_then(Exposure::gmix).is_some());
    }

    #[test]
    fn test_every_label_detected_once() {
        let detector = CountingDetector::default();
        let metacal = Identity(ShearLabel::ALL.to_vec());
        let mut rng = StdRng::seed_from_u64(1);

        let result = run_metadetect_with(
            &observation(),
            &MetadetectConfig::default(),
            &mut rng,
            &metacal,
            &detector,
        )
        .unwrap();

        assert_eq!(detector.0.load(Ordering::SeqCst), 5);
        assert_eq!(result.len(), 5);
        assert!(result.values().all(Catalog::is_empty));
        for (label, catalog) in &result {
            assert_eq!(catalog.label(), *label);
        }
    }

    #[test]
    fn test_detector_error_fails_run() {
        let metacal = Identity(vec![ShearLabel::NoShear]);
        let mut rng = StdRng::seed_from_u64(1);

        let err = run_metadetect_with(
            &observation(),
            &MetadetectConfig::default(),
            &mut rng,
            &metacal,
            &FailingDetector,
        )
        .unwrap_err();
        assert!(matches!(err, MetadetectError::Detection(_)));
    }

    #[test]
    fn test_missing_psf_sets_psfrec_flags() {
        let jac = Jacobian::diagonal(24.0, 24.0, 0.2).unwrap();
        let image = GMix::round(0.0, 0.0, 0.3, 50.0).unwrap().render((49, 49), &jac);
        let exp = Exposure::new(image, Array2::from_elem((49, 49), 100.0), jac).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        let md = Metadetect::new(MetadetectConfig::default(), ObservationSet::single(exp), &mut rng);
        assert_eq!(md.psf_stats().flags(), PSF_FAILURE);
    }

    #[test]
    fn test_seed_order_is_fixed() {
        let mut a = StdRng::seed_from_u64(9);
        let mut b = StdRng::seed_from_u64(9);
        let seeds = Seeds::draw(&mut a);
        assert_eq!(seeds.psf, b.next_u64());
        assert_eq!(seeds.metacal, b.next_u64());
        assert_eq!(seeds.measure, b.next_u64());
    }
}
