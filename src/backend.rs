//! Backend selection and the shared execution contract.
//!
//! This module defines the available execution strategies and the trait each
//! of them implements.
//!
//! # Supported Backends
//!
//! - `Sequential`: single thread, index order (baseline).
//! - `Parallel`: shared-memory parallel loop on a `rayon` pool.
//! - `Device`: offload through `wgpu` to a GPU, or to a CPU-class adapter
//!   when no accelerator exists.
//!
//! Unlike a process-wide switch, the backend is always chosen explicitly by
//! whoever builds it, so two backends can run side by side in one process.

use core::fmt;
use core::time::Duration;

use crate::cloud::PointCloud;
use crate::error::BenchError;
use crate::matrix::TransformMatrix;

/// Enumeration of execution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
#[repr(u8)]
pub enum BackendKind {
    /// Single-threaded loop (default).
    #[default]
    Sequential = 0,
    /// Shared-memory parallel loop.
    Parallel,
    /// Device offload.
    Device,
}

impl BackendKind {
    /// All backends, in the order a full run executes them.
    pub const ALL: [Self; 3] = [Self::Sequential, Self::Parallel, Self::Device];
}

impl TryFrom<u8> for BackendKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Sequential),
            1 => Ok(Self::Parallel),
            2 => Ok(Self::Device),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Device => "device",
        })
    }
}

/// What one `apply` call measured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionReport {
    /// Which backend produced the report.
    pub backend: BackendKind,
    /// Host wall-clock time. For the device backend this covers upload,
    /// dispatch, synchronization and read-back.
    pub elapsed: Duration,
    /// Pure compute time. Equal to `elapsed` on the host; read from device
    /// timestamps on the device, `None` if the device cannot timestamp.
    pub kernel: Option<Duration>,
}

impl ExecutionReport {
    /// A report for a host backend, where compute time is the wall time.
    #[must_use]
    pub const fn host(backend: BackendKind, elapsed: Duration) -> Self {
        Self {
            backend,
            elapsed,
            kernel: Some(elapsed),
        }
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1e3
    }

    #[must_use]
    pub fn kernel_ms(&self) -> Option<f64> {
        self.kernel.map(|k| k.as_secs_f64() * 1e3)
    }

    /// Wall time not spent computing (transfers, submission).
    #[must_use]
    pub fn transfer_overhead(&self) -> Option<Duration> {
        self.kernel.map(|k| self.elapsed.saturating_sub(k))
    }
}

/// An execution strategy for the point transform.
pub trait ComputeBackend {
    /// Which strategy this is.
    fn kind(&self) -> BackendKind;

    /// Replaces every point `p` of `cloud` with `matrix · p`.
    ///
    /// The cloud is exclusively borrowed for the call and never resized.
    ///
    /// # Errors
    ///
    /// Host backends fail only when a worker pool cannot be built; the
    /// device backend fails in any of its states. On error the cloud
    /// contents are unspecified and no report is produced.
    fn apply(
        &mut self,
        cloud: &mut PointCloud,
        matrix: &TransformMatrix,
    ) -> Result<ExecutionReport, BenchError>;
}
