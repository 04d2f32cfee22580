//! Homogeneous point clouds.

use bytemuck::{Pod, Zeroable};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::BenchError;

/// Upper bound (exclusive) of generated coordinates.
pub const COORD_RANGE: f32 = 100.0;

/// A point in homogeneous coordinates.
///
/// Laid out as four consecutive `f32`, matching the kernel's `Point4`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Point {
    /// A point with `w = 1.0`.
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, w: 1.0 }
    }
}

/// A fixed-length buffer of points, mutated in place by backends.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    points: Vec<Point>,
}

impl PointCloud {
    /// Fills a new cloud of `n` points from `rng`.
    ///
    /// Coordinates are drawn in `x, y, z` order per point from
    /// `[0, COORD_RANGE)`; `w` is always `1.0`.
    ///
    /// # Errors
    ///
    /// [`BenchError::Allocation`] if the buffer cannot be reserved.
    pub fn generate<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Result<Self, BenchError> {
        let mut points = Vec::new();
        points
            .try_reserve_exact(n)
            .map_err(|_| BenchError::Allocation { points: n })?;

        points.extend((0..n).map(|_| {
            let x = rng.random_range(0.0..COORD_RANGE);
            let y = rng.random_range(0.0..COORD_RANGE);
            let z = rng.random_range(0.0..COORD_RANGE);
            Point::new(x, y, z)
        }));

        Ok(Self { points })
    }

    /// [`generate`](Self::generate) with a `StdRng` seeded from `seed`.
    ///
    /// # Errors
    ///
    /// [`BenchError::Allocation`] if the buffer cannot be reserved.
    pub fn generate_seeded(n: usize, seed: u64) -> Result<Self, BenchError> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::generate(n, &mut rng)
    }

    /// A copy of this cloud for another backend.
    ///
    /// # Errors
    ///
    /// [`BenchError::Allocation`] if the copy cannot be reserved.
    pub fn try_clone(&self) -> Result<Self, BenchError> {
        let mut points = Vec::new();
        points
            .try_reserve_exact(self.points.len())
            .map_err(|_| BenchError::Allocation {
                points: self.points.len(),
            })?;
        points.extend_from_slice(&self.points);
        Ok(Self { points })
    }

    /// Wraps existing points.
    #[must_use]
    pub fn from_points(points: Vec<Point>) -> Self {
        Self { points }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Mutable view of the points. The length cannot change through it.
    pub fn points_mut(&mut self) -> &mut [Point] {
        &mut self.points
    }

    /// Raw bytes, for upload to a device.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.points)
    }

    /// Raw mutable bytes, for read-back from a device.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.points)
    }

    /// The first `k` points (fewer if the cloud is shorter).
    #[must_use]
    pub fn preview(&self, k: usize) -> &[Point] {
        &self.points[..k.min(self.points.len())]
    }
}
