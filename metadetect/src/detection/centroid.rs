//! Positions of detected regions.

use ndarray::ArrayView2;

use super::thresholding::Region;

/// Flux-weighted center of a labeled region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionCentroid {
    pub row: f64,
    pub col: f64,
    /// Sum of detection-image values over the region
    pub flux: f64,
}

/// Compute the centroid of `region` from the detection image.
///
/// Only pixels carrying the region's label contribute. When the summed flux is
/// not positive the center of the bounding box is used instead.
pub fn region_centroid(
    image: &ArrayView2<f64>,
    labels: &ArrayView2<usize>,
    region: &Region,
) -> RegionCentroid {
    let bbox = &region.bbox;
    let mut flux = 0.0;
    let mut sum_row = 0.0;
    let mut sum_col = 0.0;

    for row in bbox.min_row..=bbox.max_row {
        for col in bbox.min_col..=bbox.max_col {
            if labels[[row, col]] != region.label {
                continue;
            }
            let value = image[[row, col]];
            flux += value;
            sum_row += value * row as f64;
            sum_col += value * col as f64;
        }
    }

    if flux > 0.0 {
        RegionCentroid {
            row: sum_row / flux,
            col: sum_col / flux,
            flux,
        }
    } else {
        RegionCentroid {
            row: (bbox.min_row + bbox.max_row) as f64 / 2.0,
            col: (bbox.min_col + bbox.max_col) as f64 / 2.0,
            flux,
        }
    }
}
