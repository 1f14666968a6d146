//! Matched filtering of the detection image.

use ndarray::{Array2, ArrayView2};

use crate::gmix::FWHM_PER_SIGMA;

/// Zero-padded 2D convolution with output the same size as `image`.
///
/// The kernel is centered at `(rows / 2, cols / 2)`.
pub fn convolve2d(image: &ArrayView2<f64>, kernel: &ArrayView2<f64>) -> Array2<f64> {
    let (img_rows, img_cols) = image.dim();
    let (ker_rows, ker_cols) = kernel.dim();
    let pad_rows = (ker_rows / 2) as isize;
    let pad_cols = (ker_cols / 2) as isize;

    Array2::from_shape_fn((img_rows, img_cols), |(i, j)| {
        let mut sum = 0.0;
        for ((ki, kj), &k) in kernel.indexed_iter() {
            let row = i as isize + ki as isize - pad_rows;
            let col = j as isize + kj as isize - pad_cols;
            if row >= 0 && row < img_rows as isize && col >= 0 && col < img_cols as isize {
                sum += image[[row as usize, col as usize]] * k;
            }
        }
        sum
    })
}

/// Round Gaussian kernel normalized to unit sum.
///
/// # Arguments
/// * `fwhm` - Full width at half maximum in pixels
///
/// The kernel spans +/- 3 sigma, rounded up, and always has odd size.
pub fn gaussian_kernel(fwhm: f64) -> Array2<f64> {
    let sigma = fwhm / FWHM_PER_SIGMA;
    let half = (3.0 * sigma).ceil().max(1.0) as usize;
    let size = 2 * half + 1;
    let center = half as f64;

    let mut kernel = Array2::from_shape_fn((size, size), |(r, c)| {
        let dr = r as f64 - center;
        let dc = c as f64 - center;
        (-0.5 * (dr * dr + dc * dc) / (sigma * sigma)).exp()
    });
    let sum = kernel.sum();
    kernel.mapv_inplace(|k| k / sum);
    kernel
}
