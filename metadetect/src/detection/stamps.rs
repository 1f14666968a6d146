//! Per-object cutouts ("stamps") from every exposure.
//!
//! Each detection gets a square box sized from its isophotal area and centered
//! on the nearest pixel to its centroid. The stamp keeps the parent's pixel
//! scale; only the Jacobian center moves, so the object sits at sky offset
//! (0, 0) in the stamp.
//!
//! Pixels of the box that fall outside the parent image are filled with zero
//! image and weight and carry [`bmask::EDGE`].

use ndarray::{Array2, ArrayView2};

use crate::config::{BoxType, StampConfig};
use crate::flags::bmask;
use crate::observation::{Exposure, ObservationError};

/// Side length of the stamp for a region of `npix` pixels.
///
/// `rad = max(rad_min, rad_fac * sqrt(npix / pi))`, the box holds `2 rad + 1`
/// pixels plus `box_padding` on each side, is rounded up to an even size and is
/// finally clamped to `[min_box_size, max_box_size]`.
pub fn box_size(npix: usize, config: &StampConfig) -> usize {
    let rad = match config.box_type {
        BoxType::IsoRadius => {
            let iso = (npix as f64 / std::f64::consts::PI).sqrt();
            (config.rad_fac * iso).max(config.rad_min)
        }
    };
    let mut size = (2.0 * rad + 1.0).ceil() as usize + 2 * config.box_padding;
    if size % 2 == 1 {
        size += 1;
    }
    size.clamp(config.min_box_size, config.max_box_size)
}

/// Pixels of other detections to drop from a stamp.
#[derive(Debug, Clone, Copy)]
pub struct NeighborMask<'a> {
    /// Segmentation map in the parent frame
    pub seg: ArrayView2<'a, usize>,
    /// Label of the object the stamp belongs to
    pub label: usize,
}

/// Cut a `size` x `size` stamp from `exposure` around (`row`, `col`).
///
/// # Arguments
/// * `exposure` - Parent exposure
/// * `row`, `col` - Object position in parent pixels
/// * `size` - Stamp side length
/// * `neighbors` - When given, pixels labeled as another object get zero weight
///
/// # Returns
/// The stamp with its own Jacobian center and a copy of the parent's PSF.
pub fn extract_stamp(
    exposure: &Exposure,
    row: f64,
    col: f64,
    size: usize,
    neighbors: Option<NeighborMask<'_>>,
) -> Result<Exposure, ObservationError> {
    let (nrows, ncols) = exposure.dim();
    let half = (size / 2) as isize;
    let row_start = row.round() as isize - half;
    let col_start = col.round() as isize - half;

    let mut image = Array2::zeros((size, size));
    let mut weight = Array2::zeros((size, size));
    let mut mask = Array2::from_elem((size, size), bmask::EDGE);

    for srow in 0..size {
        let prow = row_start + srow as isize;
        if prow < 0 || prow >= nrows as isize {
            continue;
        }
        let prow = prow as usize;
        for scol in 0..size {
            let pcol = col_start + scol as isize;
            if pcol < 0 || pcol >= ncols as isize {
                continue;
            }
            let pcol = pcol as usize;

            image[[srow, scol]] = exposure.image()[[prow, pcol]];
            mask[[srow, scol]] = exposure.bmask()[[prow, pcol]];
            let masked = neighbors
                .map(|n| {
                    let label = n.seg[[prow, pcol]];
                    label != 0 && label != n.label
                })
                .unwrap_or(false);
            weight[[srow, scol]] = if masked {
                0.0
            } else {
                exposure.weight()[[prow, pcol]]
            };
        }
    }

    let jacobian = exposure
        .jacobian()
        .with_center(row - row_start as f64, col - col_start as f64);
    let stamp = Exposure::new(image, weight, jacobian)?.with_bmask(mask)?;
    Ok(match exposure.psf() {
        Some(psf) => stamp.with_psf(psf.clone()),
        None => stamp,
    })
}
