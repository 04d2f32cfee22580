//! Host backends
//!
//! # CPU Backends
//!
//! Two implementations of [`ComputeBackend`] that run on the host:
//!
//! - [`Sequential`] walks the cloud in index order on the calling thread and
//!   is the baseline every speedup is measured against.
//! - [`Parallel`] splits the cloud across a [`rayon`](https://docs.rs/rayon)
//!   pool. Every point reads and writes only its own slot, so no locks or
//!   atomics are involved and the result does not depend on the worker count.
//!
//! ## Features
//!
//! - Optional SSE path (`simd` feature, x86-64 only). It evaluates each
//!   output coordinate as the same left-to-right 4-term sum as the scalar
//!   path, without fused multiply-add, so both paths are bit-identical.

use rayon::prelude::*;
use std::time::Instant;

use crate::backend::{BackendKind, ComputeBackend, ExecutionReport};
use crate::cloud::{Point, PointCloud};
use crate::error::BenchError;
use crate::matrix::TransformMatrix;

/// Transforms a single point with the host kernel.
#[inline]
#[must_use]
pub fn transform_point(matrix: &TransformMatrix, p: Point) -> Point {
    #[cfg(all(feature = "simd", target_arch = "x86_64"))]
    {
        simd::apply(matrix, p)
    }

    #[cfg(not(all(feature = "simd", target_arch = "x86_64")))]
    {
        matrix.apply(p)
    }
}

#[cfg(all(feature = "simd", target_arch = "x86_64"))]
mod simd {
    use core::arch::x86_64::{_mm_add_ps, _mm_mul_ps, _mm_set1_ps, _mm_setr_ps, _mm_storeu_ps};

    use crate::cloud::Point;
    use crate::matrix::TransformMatrix;

    #[inline]
    #[allow(unused_unsafe)]
    pub(super) fn apply(matrix: &TransformMatrix, p: Point) -> Point {
        let m = matrix.as_array();
        let mut out = [0.0f32; 4];
        // SAFETY: SSE is part of the x86-64 baseline and `out` holds 4 f32.
        unsafe {
            let c0 = _mm_setr_ps(m[0], m[4], m[8], m[12]);
            let c1 = _mm_setr_ps(m[1], m[5], m[9], m[13]);
            let c2 = _mm_setr_ps(m[2], m[6], m[10], m[14]);
            let c3 = _mm_setr_ps(m[3], m[7], m[11], m[15]);

            let acc = _mm_add_ps(
                _mm_add_ps(
                    _mm_add_ps(_mm_mul_ps(c0, _mm_set1_ps(p.x)), _mm_mul_ps(c1, _mm_set1_ps(p.y))),
                    _mm_mul_ps(c2, _mm_set1_ps(p.z)),
                ),
                _mm_mul_ps(c3, _mm_set1_ps(p.w)),
            );
            _mm_storeu_ps(out.as_mut_ptr(), acc);
        }
        Point {
            x: out[0],
            y: out[1],
            z: out[2],
            w: out[3],
        }
    }
}

/// Single-threaded baseline.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequential;

impl ComputeBackend for Sequential {
    fn kind(&self) -> BackendKind {
        BackendKind::Sequential
    }

    fn apply(
        &mut self,
        cloud: &mut PointCloud,
        matrix: &TransformMatrix,
    ) -> Result<ExecutionReport, BenchError> {
        let points = cloud.points_mut();

        let start = Instant::now();
        for p in points.iter_mut() {
            *p = transform_point(matrix, *p);
        }
        let elapsed = start.elapsed();

        Ok(ExecutionReport::host(BackendKind::Sequential, elapsed))
    }
}

/// Shared-memory parallel backend.
///
/// With `workers == None` the loop runs on rayon's global pool, sized by the
/// runtime. Otherwise a dedicated pool of exactly that many threads is built
/// once and reused for every call.
pub struct Parallel {
    pool: Option<rayon::ThreadPool>,
}

impl Parallel {
    /// Creates the backend.
    ///
    /// # Errors
    ///
    /// [`BenchError::WorkerPool`] if a dedicated pool cannot be spawned.
    pub fn new(workers: Option<usize>) -> Result<Self, BenchError> {
        let pool = workers
            .map(|n| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("affine-worker-{i}"))
                    .build()
            })
            .transpose()?;
        Ok(Self { pool })
    }

    /// Number of threads the parallel region will use.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, rayon::ThreadPool::current_num_threads)
    }
}

fn transform_parallel(points: &mut [Point], matrix: &TransformMatrix) {
    points
        .par_iter_mut()
        .for_each(|p| *p = transform_point(matrix, *p));
}

impl ComputeBackend for Parallel {
    fn kind(&self) -> BackendKind {
        BackendKind::Parallel
    }

    fn apply(
        &mut self,
        cloud: &mut PointCloud,
        matrix: &TransformMatrix,
    ) -> Result<ExecutionReport, BenchError> {
        let points = cloud.points_mut();

        let start = Instant::now();
        match &self.pool {
            Some(pool) => pool.install(|| transform_parallel(points, matrix)),
            None => transform_parallel(points, matrix),
        }
        let elapsed = start.elapsed();

        tracing::debug!(workers = self.workers(), ?elapsed, "parallel region finished");
        Ok(ExecutionReport::host(BackendKind::Parallel, elapsed))
    }
}
