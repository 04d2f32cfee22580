//! The benchmark driver.
//!
//! One run builds the matrix, generates a single seeded cloud, hands every
//! backend its own copy of it and collects what each one measured. Backends
//! run one after another and never share a cloud.

use tracing::{error, info};

use crate::backend::{BackendKind, ExecutionReport};
use crate::cloud::{Point, PointCloud};
use crate::error::BenchError;
use crate::matrix::{TransformMatrix, TransformParams};
use crate::ops::dispatch::create_backend;

/// Points per run unless configured otherwise.
pub const DEFAULT_POINTS: usize = 300_000;

/// How a run is set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    /// Cloud size.
    pub points: usize,
    /// RNG seed for the cloud.
    pub seed: u64,
    /// Parallel worker count, `None` for the runtime default.
    pub workers: Option<usize>,
    /// Backends to run, in order.
    pub backends: Vec<BackendKind>,
    /// Points shown per backend.
    pub preview: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            points: DEFAULT_POINTS,
            seed: 0,
            workers: None,
            backends: BackendKind::ALL.to_vec(),
            preview: 5,
        }
    }
}

/// One backend's result.
#[derive(Debug, Clone)]
pub struct BackendOutcome {
    pub report: ExecutionReport,
    /// The transformed cloud.
    pub cloud: PointCloud,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct BenchRun {
    pub matrix: TransformMatrix,
    /// In execution order.
    pub outcomes: Vec<BackendOutcome>,
}

impl BenchRun {
    pub fn outcome(&self, kind: BackendKind) -> Option<&BackendOutcome> {
        self.outcomes.iter().find(|o| o.report.backend == kind)
    }

    pub fn report(&self, kind: BackendKind) -> Option<&ExecutionReport> {
        self.outcome(kind).map(|o| &o.report)
    }

    /// `sequential_ms / kind_ms`, if both ran and `kind` took measurable time.
    pub fn speedup(&self, kind: BackendKind) -> Option<f64> {
        let baseline = self.report(BackendKind::Sequential)?.elapsed_ms();
        let other = self.report(kind)?.elapsed_ms();
        (other > 0.0).then(|| baseline / other)
    }

    /// The first backend whose cloud differs from the first backend's, and
    /// the index of the first differing point.
    pub fn first_mismatch(&self) -> Option<(BackendKind, usize)> {
        let (first, rest) = self.outcomes.split_first()?;
        let reference = first.cloud.points();
        rest.iter().find_map(|o| {
            let points = o.cloud.points();
            if points.len() != reference.len() {
                return Some((o.report.backend, points.len().min(reference.len())));
            }
            points
                .iter()
                .zip(reference)
                .position(|(a, b)| a != b)
                .map(|i| (o.report.backend, i))
        })
    }

    /// Whether every backend produced the same cloud.
    pub fn agreement(&self) -> bool {
        self.first_mismatch().is_none()
    }

    /// The first `k` points of `kind`'s cloud.
    pub fn preview(&self, kind: BackendKind, k: usize) -> Option<&[Point]> {
        self.outcome(kind).map(|o| o.cloud.preview(k))
    }
}

/// Runs every backend in `config` against a cloud generated from its seed.
///
/// # Errors
///
/// [`BenchError::Input`] for non-finite parameters; otherwise the first
/// error any backend (or cloud allocation) reports. The run stops there.
pub fn run(config: &BenchConfig, params: &TransformParams) -> Result<BenchRun, BenchError> {
    params.validate()?;
    let matrix = params.matrix();
    let cloud = PointCloud::generate_seeded(config.points, config.seed)?;
    info!(points = cloud.len(), seed = config.seed, "generated point cloud");
    run_backends(config, &matrix, &cloud)
}

/// Runs every backend in `config` against its own copy of `cloud`.
///
/// # Errors
///
/// See [`run`].
pub fn run_backends(
    config: &BenchConfig,
    matrix: &TransformMatrix,
    cloud: &PointCloud,
) -> Result<BenchRun, BenchError> {
    let mut outcomes = Vec::with_capacity(config.backends.len());

    for &kind in &config.backends {
        let mut copy = cloud.try_clone()?;
        let mut backend = create_backend(kind, config)?;
        let report = backend.apply(&mut copy, matrix)?;
        drop(backend);

        info!(
            backend = %kind,
            elapsed_ms = report.elapsed_ms(),
            kernel_ms = ?report.kernel_ms(),
            "backend finished"
        );
        outcomes.push(BackendOutcome {
            report,
            cloud: copy,
        });
    }

    let run = BenchRun {
        matrix: *matrix,
        outcomes,
    };
    if let Some((backend, index)) = run.first_mismatch() {
        error!(%backend, index, "backend results disagree");
    }
    Ok(run)
}
