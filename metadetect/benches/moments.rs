use criterion::{black_box, criterion_group, criterion_main, Criterion};
use metadetect::detection::SegmentationDetector;
use metadetect::gmix::{fwhm_to_t, GMix};
use metadetect::{weighted_moments, Detector, Exposure, Jacobian, MetadetectConfig, ObservationSet};
use ndarray::Array2;

fn make_exposure(dim: usize) -> Exposure {
    let center = (dim / 2) as f64;
    let jac = Jacobian::diagonal(center, center, 0.2).unwrap();
    let image = GMix::gauss(0.0, 0.0, 0.1, -0.05, 0.6, 100.0)
        .unwrap()
        .render((dim, dim), &jac);
    Exposure::new(image, Array2::from_elem((dim, dim), 100.0), jac).unwrap()
}

fn make_weight() -> GMix {
    let mut weight = GMix::round(0.0, 0.0, fwhm_to_t(1.2), 1.0).unwrap();
    weight.normalize_peak().unwrap();
    weight
}

fn bench_weighted_moments(c: &mut Criterion) {
    let weight = make_weight();
    let stamp_32 = make_exposure(32);
    let stamp_128 = make_exposure(128);

    let mut group = c.benchmark_group("weighted_moments");
    group.bench_function("32x32", |b| {
        b.iter(|| weighted_moments(black_box(&stamp_32), black_box(&weight), f64::INFINITY))
    });
    group.bench_function("128x128", |b| {
        b.iter(|| weighted_moments(black_box(&stamp_128), black_box(&weight), f64::INFINITY))
    });
    group.finish();
}

fn bench_detection(c: &mut Criterion) {
    let obs = ObservationSet::single(make_exposure(256));
    let config = MetadetectConfig::default();

    c.bench_function("segmentation_detect_256x256", |b| {
        b.iter(|| SegmentationDetector.detect(black_box(&obs), &config).unwrap())
    });
}

criterion_group!(benches, bench_weighted_moments, bench_detection);
criterion_main!(benches);
