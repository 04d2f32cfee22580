//! The 4×4 affine transform applied by every backend.
//!
//! The matrix is stored row-major as 16 `f32` values, exactly the layout the
//! device kernel reads. Only scale (diagonal) and translation (last column)
//! are ever populated.

use crate::cloud::Point;
use crate::error::BenchError;

/// Row-major 4×4 matrix, as uploaded to the device.
pub type Matrix16 = [f32; 16];

/// An immutable scale + translate transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformMatrix {
    m: Matrix16,
}

impl TransformMatrix {
    /// Builds the affine matrix for per-axis scale `(sx, sy, sz)` followed by
    /// translation `(tx, ty, tz)`.
    ///
    /// Zero and negative scales are accepted: a zero scale collapses that axis
    /// onto its translation value.
    ///
    /// # Example
    ///
    /// ```
    /// use affine_bench::matrix::TransformMatrix;
    ///
    /// let m = TransformMatrix::build(2.0, 2.0, 2.0, 1.0, 2.0, 3.0);
    /// assert_eq!(m.as_array()[3], 1.0);
    /// assert_eq!(m.as_array()[15], 1.0);
    /// ```
    #[must_use]
    pub const fn build(sx: f32, sy: f32, sz: f32, tx: f32, ty: f32, tz: f32) -> Self {
        let mut m = [0.0f32; 16];
        m[0] = sx;
        m[5] = sy;
        m[10] = sz;
        m[15] = 1.0;

        m[3] = tx;
        m[7] = ty;
        m[11] = tz;

        Self { m }
    }

    /// The identity transform.
    #[must_use]
    pub const fn identity() -> Self {
        Self::build(1.0, 1.0, 1.0, 0.0, 0.0, 0.0)
    }

    /// Raw row-major values.
    #[must_use]
    pub const fn as_array(&self) -> &Matrix16 {
        &self.m
    }

    /// Element at `(row, col)`.
    #[must_use]
    pub const fn get(&self, row: usize, col: usize) -> f32 {
        self.m[row * 4 + col]
    }

    /// Computes `M·p`.
    ///
    /// Each output coordinate is the 4-term sum `m0*x + m1*y + m2*z + m3*w`
    /// evaluated left to right. Every backend, the kernel included, uses this
    /// exact order so results agree bit for bit.
    #[inline]
    #[must_use]
    pub fn apply(&self, p: Point) -> Point {
        let m = &self.m;
        let Point { x, y, z, w } = p;
        Point {
            x: m[0] * x + m[1] * y + m[2] * z + m[3] * w,
            y: m[4] * x + m[5] * y + m[6] * z + m[7] * w,
            z: m[8] * x + m[9] * y + m[10] * z + m[11] * w,
            w: m[12] * x + m[13] * y + m[14] * z + m[15] * w,
        }
    }
}

impl Default for TransformMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

/// The six scalars a run is parameterized by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    /// `(tx, ty, tz)`
    pub translate: [f32; 3],
    /// `(sx, sy, sz)`
    pub scale: [f32; 3],
}

impl TransformParams {
    /// Rejects non-finite scalars.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::Input`] naming the first offending value.
    pub fn validate(&self) -> Result<(), BenchError> {
        let named = [
            ("tx", self.translate[0]),
            ("ty", self.translate[1]),
            ("tz", self.translate[2]),
            ("sx", self.scale[0]),
            ("sy", self.scale[1]),
            ("sz", self.scale[2]),
        ];
        match named.iter().find(|(_, v)| !v.is_finite()) {
            Some((name, v)) => Err(BenchError::Input(format!("{name} must be finite, got {v}"))),
            None => Ok(()),
        }
    }

    /// Builds the matrix for these parameters.
    #[must_use]
    pub const fn matrix(&self) -> TransformMatrix {
        let [tx, ty, tz] = self.translate;
        let [sx, sy, sz] = self.scale;
        TransformMatrix::build(sx, sy, sz, tx, ty, tz)
    }
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            translate: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}
