//! Backend construction
//!
//! Turns a [`BackendKind`] into a ready-to-run [`ComputeBackend`]. The
//! driver calls this once per backend, runs it, and drops it before building
//! the next, so at most one device session is open at a time.
//!
//! # Example
//! ```rust
//! use affine_bench::backend::BackendKind;
//! use affine_bench::bench::BenchConfig;
//! use affine_bench::ops::dispatch::create_backend;
//!
//! let config = BenchConfig { workers: Some(2), ..BenchConfig::default() };
//! let backend = create_backend(BackendKind::Parallel, &config).unwrap();
//! assert_eq!(backend.kind(), BackendKind::Parallel);
//! ```

use crate::backend::{BackendKind, ComputeBackend};
use crate::bench::BenchConfig;
use crate::error::BenchError;

use super::cpu::{Parallel, Sequential};

/// Builds the backend for `kind`.
///
/// # Errors
///
/// - [`BenchError::WorkerPool`] if the parallel pool cannot be spawned
/// - [`BenchError::Device`] if no device can be opened or the kernel does
///   not compile, including when the crate was built without `wgpu`
pub fn create_backend(
    kind: BackendKind,
    config: &BenchConfig,
) -> Result<Box<dyn ComputeBackend>, BenchError> {
    match kind {
        BackendKind::Sequential => Ok(Box::new(Sequential)),
        BackendKind::Parallel => Ok(Box::new(Parallel::new(config.workers)?)),
        BackendKind::Device => device_backend(),
    }
}

#[cfg(feature = "wgpu")]
fn device_backend() -> Result<Box<dyn ComputeBackend>, BenchError> {
    let backend = super::device::DeviceOffload::open_default()?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "wgpu"))]
fn device_backend() -> Result<Box<dyn ComputeBackend>, BenchError> {
    use crate::error::{DeviceError, DeviceState};

    Err(DeviceError::at(DeviceState::DiscoverPlatform, "built without the `wgpu` feature").into())
}
