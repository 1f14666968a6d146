//! Affine map between pixel coordinates and local sky coordinates.
//!
//! Sky offsets are measured in arcseconds from the reference pixel
//! `(row0, col0)`:
//!
//! ```text
//! v = dvdrow * (row - row0) + dvdcol * (col - col0)
//! u = dudrow * (row - row0) + dudcol * (col - col0)
//! ```
//!
//! `v` runs along rows and `u` along columns, so a simple pixel scale `s`
//! is `dvdrow = dudcol = s` with zero cross terms.

use nalgebra::Matrix2;
use shear_math::matrix2::{invert_matrix, transform, SingularMatrixError};

/// Local WCS linearization for one image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jacobian {
    row0: f64,
    col0: f64,
    dvdrow: f64,
    dvdcol: f64,
    dudrow: f64,
    dudcol: f64,
    inverse: Matrix2<f64>,
}

impl Jacobian {
    /// Build a Jacobian from its center and partial derivatives.
    ///
    /// # Returns
    /// * `Err(SingularMatrixError)` - If the derivative matrix cannot be inverted
    pub fn new(
        row0: f64,
        col0: f64,
        dvdrow: f64,
        dvdcol: f64,
        dudrow: f64,
        dudcol: f64,
    ) -> Result<Self, SingularMatrixError> {
        let forward = Matrix2::new(dvdrow, dvdcol, dudrow, dudcol);
        let inverse = invert_matrix(&forward)?;
        Ok(Self {
            row0,
            col0,
            dvdrow,
            dvdcol,
            dudrow,
            dudcol,
            inverse,
        })
    }

    /// Square pixels of side `scale` arcsec with no rotation.
    pub fn diagonal(row0: f64, col0: f64, scale: f64) -> Result<Self, SingularMatrixError> {
        Self::new(row0, col0, scale, 0.0, 0.0, scale)
    }

    /// Same derivatives, new reference pixel.
    pub fn with_center(&self, row0: f64, col0: f64) -> Self {
        Self {
            row0,
            col0,
            ..*self
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.row0, self.col0)
    }

    fn matrix(&self) -> Matrix2<f64> {
        Matrix2::new(self.dvdrow, self.dvdcol, self.dudrow, self.dudcol)
    }

    pub fn det(&self) -> f64 {
        self.matrix().determinant()
    }

    /// Linear pixel scale, `sqrt(|det|)`.
    pub fn scale(&self) -> f64 {
        self.det().abs().sqrt()
    }

    /// Solid angle of one pixel in arcsec².
    pub fn area(&self) -> f64 {
        self.det().abs()
    }

    /// Pixel position to (v, u) sky offset.
    pub fn to_sky(&self, row: f64, col: f64) -> (f64, f64) {
        transform(&self.matrix(), row - self.row0, col - self.col0)
    }

    /// (v, u) sky offset to pixel position.
    pub fn to_pixel(&self, v: f64, u: f64) -> (f64, f64) {
        let (drow, dcol) = transform(&self.inverse, v, u);
        (self.row0 + drow, self.col0 + dcol)
    }
}
