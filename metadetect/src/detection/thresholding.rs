//! Thresholding and connected-component labeling.
//!
//! # Algorithm
//!
//! Pixels at or above the threshold form a boolean mask. A two-pass scan with
//! union-find groups mask pixels into 8-connected regions; diagonal neighbors
//! join a region so that faint, undersampled sources are not split. Final labels
//! are consecutive from 1 in raster order of each region's first pixel, with 0
//! for background.

use ndarray::{Array2, ArrayView2};

use super::aabb::AABB;

/// Mask of pixels with `value >= threshold`. NaN pixels are never set.
pub fn apply_threshold(image: &ArrayView2<f64>, threshold: f64) -> Array2<bool> {
    image.mapv(|v| v >= threshold)
}

/// Find the root of `label` with path halving.
fn find_root(parents: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != parents[current] {
        parents[current] = parents[parents[current]];
        current = parents[current];
    }
    current
}

/// Merge two sets, keeping the smaller label as root.
fn union_labels(parents: &mut [usize], a: usize, b: usize) {
    let root_a = find_root(parents, a);
    let root_b = find_root(parents, b);
    if root_a < root_b {
        parents[root_b] = root_a;
    } else if root_b < root_a {
        parents[root_a] = root_b;
    }
}

/// Label 8-connected regions of `mask`.
///
/// # Returns
/// Labeled image and the number of regions.
pub fn connected_components(mask: &ArrayView2<bool>) -> (Array2<usize>, usize) {
    let (height, width) = mask.dim();
    let mut labels = Array2::<usize>::zeros((height, width));
    let mut parents = vec![0usize];

    for row in 0..height {
        for col in 0..width {
            if !mask[[row, col]] {
                continue;
            }

            // Previously visited neighbors: W, NW, N, NE
            let mut neighbors = [0usize; 4];
            if col > 0 {
                neighbors[0] = labels[[row, col - 1]];
            }
            if row > 0 {
                if col > 0 {
                    neighbors[1] = labels[[row - 1, col - 1]];
                }
                neighbors[2] = labels[[row - 1, col]];
                if col + 1 < width {
                    neighbors[3] = labels[[row - 1, col + 1]];
                }
            }

            match neighbors.iter().copied().filter(|&l| l > 0).min() {
                None => {
                    let label = parents.len();
                    parents.push(label);
                    labels[[row, col]] = label;
                }
                Some(min_label) => {
                    labels[[row, col]] = min_label;
                    for &label in neighbors.iter().filter(|&&l| l > 0 && l != min_label) {
                        union_labels(&mut parents, min_label, label);
                    }
                }
            }
        }
    }

    let mut relabel = vec![0usize; parents.len()];
    let mut count = 0;
    for label in 1..parents.len() {
        let root = find_root(&mut parents, label);
        if relabel[root] == 0 {
            count += 1;
            relabel[root] = count;
        }
        relabel[label] = relabel[root];
    }

    labels.mapv_inplace(|l| relabel[l]);
    (labels, count)
}

/// Pixel count and bounds of one labeled region.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub label: usize,
    pub npix: usize,
    pub bbox: AABB,
}

/// Summarize every region of a labeled image, ordered by label.
pub fn label_regions(labels: &ArrayView2<usize>, count: usize) -> Vec<Region> {
    let mut regions: Vec<Region> = (1..=count)
        .map(|label| Region {
            label,
            npix: 0,
            bbox: AABB::new(),
        })
        .collect();

    for ((row, col), &label) in labels.indexed_iter() {
        if label > 0 {
            let region = &mut regions[label - 1];
            region.npix += 1;
            region.bbox.expand_to_include(row, col);
        }
    }
    regions
}
