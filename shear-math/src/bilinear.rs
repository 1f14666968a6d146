//! Bilinear interpolation on regular pixel grids.
//!
//! Pixel centers sit at integer (row, col) positions. Samples between centers
//! blend the four neighbours; samples outside `[0, n - 1]` along either axis
//! are out of bounds and either rejected or replaced by a fill value.

use ndarray::{Array2, ArrayView2};
use thiserror::Error;

/// Error types for bilinear interpolation operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpolationError {
    /// Coordinate is outside the valid interpolation domain
    #[error("{axis} coordinate {value} is outside valid range [{min}, {max}]")]
    OutOfBounds {
        axis: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    /// The grid holds no pixels
    #[error("cannot interpolate on an empty {rows}x{cols} grid")]
    EmptyGrid { rows: usize, cols: usize },
}

/// Bilinear interpolator over a borrowed pixel grid.
#[derive(Debug, Clone)]
pub struct GridInterpolator<'a> {
    data: ArrayView2<'a, f64>,
}

impl<'a> GridInterpolator<'a> {
    /// Wrap a pixel grid for interpolation.
    ///
    /// # Arguments
    /// * `data` - 2D array indexed as [row, col]
    pub fn new(data: ArrayView2<'a, f64>) -> Result<Self, InterpolationError> {
        let (rows, cols) = data.dim();
        if rows == 0 || cols == 0 {
            return Err(InterpolationError::EmptyGrid { rows, cols });
        }
        Ok(Self { data })
    }

    /// Lower index and fractional weight toward the next index.
    fn find_index_and_weight(n: usize, value: f64) -> Option<(usize, usize, f64)> {
        let max = (n - 1) as f64;
        if !(0.0..=max).contains(&value) {
            return None;
        }
        if n == 1 {
            return Some((0, 0, 0.0));
        }

        let low = (value.floor() as usize).min(n - 2);
        Some((low, low + 1, value - low as f64))
    }

    /// Interpolate at a fractional pixel position.
    pub fn interpolate(&self, row: f64, col: f64) -> Result<f64, InterpolationError> {
        let (nrows, ncols) = self.data.dim();

        let (r_low, r_high, r_weight) = Self::find_index_and_weight(nrows, row).ok_or(
            InterpolationError::OutOfBounds {
                axis: "row",
                value: row,
                min: 0.0,
                max: (nrows - 1) as f64,
            },
        )?;
        let (c_low, c_high, c_weight) = Self::find_index_and_weight(ncols, col).ok_or(
            InterpolationError::OutOfBounds {
                axis: "col",
                value: col,
                min: 0.0,
                max: (ncols - 1) as f64,
            },
        )?;

        let q11 = self.data[[r_low, c_low]];
        let q12 = self.data[[r_high, c_low]];
        let q21 = self.data[[r_low, c_high]];
        let q22 = self.data[[r_high, c_high]];

        let value = q11 * (1.0 - c_weight) * (1.0 - r_weight)
            + q21 * c_weight * (1.0 - r_weight)
            + q12 * (1.0 - c_weight) * r_weight
            + q22 * c_weight * r_weight;

        Ok(value)
    }

    /// Interpolate, returning `None` for positions off the grid.
    pub fn sample(&self, row: f64, col: f64) -> Option<f64> {
        self.interpolate(row, col).ok()
    }

    /// Resample the grid through a coordinate mapping.
    ///
    /// For each output pixel `(row, col)` the closure returns the source position
    /// to sample. Off-grid samples take `fill` and are marked in the returned mask.
    pub fn resample<F>(&self, dims: (usize, usize), fill: f64, mut map: F) -> (Array2<f64>, Array2<bool>)
    where
        F: FnMut(usize, usize) -> (f64, f64),
    {
        let mut out = Array2::from_elem(dims, fill);
        let mut outside = Array2::from_elem(dims, false);

        for ((row, col), value) in out.indexed_iter_mut() {
            let (src_row, src_col) = map(row, col);
            match self.sample(src_row, src_col) {
                Some(v) => *value = v,
                None => outside[[row, col]] = true,
            }
        }

        (out, outside)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_exact_grid_points() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let interp = GridInterpolator::new(data.view()).unwrap();

        assert_relative_eq!(interp.interpolate(0.0, 0.0).unwrap(), 1.0);
        assert_relative_eq!(interp.interpolate(0.0, 1.0).unwrap(), 2.0);
        assert_relative_eq!(interp.interpolate(1.0, 0.0).unwrap(), 3.0);
        assert_relative_eq!(interp.interpolate(1.0, 1.0).unwrap(), 4.0);
    }

    #[test]
    fn test_center_is_average() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let interp = GridInterpolator::new(data.view()).unwrap();

        assert_relative_eq!(interp.interpolate(0.5, 0.5).unwrap(), 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_linear_function_is_reproduced() {
        let data = Array2::from_shape_fn((5, 7), |(r, c)| 2.0 * r as f64 - 0.5 * c as f64 + 1.0);
        let interp = GridInterpolator::new(data.view()).unwrap();

        let value = interp.interpolate(2.3, 4.7).unwrap();
        assert_relative_eq!(value, 2.0 * 2.3 - 0.5 * 4.7 + 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_out_of_bounds() {
        let data = Array2::zeros((3, 3));
        let interp = GridInterpolator::new(data.view()).unwrap();

        match interp.interpolate(-0.1, 1.0) {
            Err(InterpolationError::OutOfBounds { axis, .. }) => assert_eq!(axis, "row"),
            other => panic!("expected out of bounds, got {other:?}"),
        }
        assert!(interp.sample(1.0, 2.01).is_none());
        assert!(interp.sample(2.0, 2.0).is_some());
    }

    #[test]
    fn test_empty_grid_rejected() {
        let data = Array2::<f64>::zeros((0, 4));
        assert!(matches!(
            GridInterpolator::new(data.view()),
            Err(InterpolationError::EmptyGrid { rows: 0, cols: 4 })
        ));
    }

    #[test]
    fn test_resample_shift_marks_outside() {
        let data = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f64);
        let interp = GridInterpolator::new(data.view()).unwrap();

        // Shift by one column: the last column samples off the grid
        let (out, outside) = interp.resample((4, 4), 0.0, |r, c| (r as f64, c as f64 + 1.0));

        assert_relative_eq!(out[[2, 1]], data[[2, 2]]);
        assert!(outside[[0, 3]]);
        assert!(!outside[[0, 2]]);
        assert_eq!(out[[1, 3]], 0.0);
    }
}
