//! affine_bench: one affine transform, three ways to run it.
//!
//! Applies a 4×4 scale + translate matrix to a large point cloud on a single
//! thread, on a `rayon` pool and on a compute device through `wgpu`, and
//! reports how long each took.
//!
//! # Features
//!
//! - Results are bit-identical across backends: every output coordinate is
//!   the same fixed-order 4-term sum.
//! - Device time is split into kernel time (device timestamps) and total
//!   time (host monotonic clock, upload to read-back).
//! - The device state machine releases every handle it acquired, in reverse
//!   order, on every exit path.
//!
//! # Modules
//!
//! - [`matrix`]: the transform and its parameters.
//! - [`cloud`]: points and the seeded generator.
//! - [`backend`]: the [`ComputeBackend`](backend::ComputeBackend) contract.
//! - [`ops`]: the backends themselves.
//! - [`bench`]: the driver that runs and compares them.
//! - [`input`]: reading parameters from a text stream.
//!
//! # Example
//!
//! ```rust
//! use affine_bench::backend::BackendKind;
//! use affine_bench::bench::{self, BenchConfig};
//! use affine_bench::matrix::TransformParams;
//!
//! let config = BenchConfig {
//!     points: 1_000,
//!     seed: 7,
//!     backends: vec![BackendKind::Sequential, BackendKind::Parallel],
//!     ..BenchConfig::default()
//! };
//! let params = TransformParams { translate: [1.0, 2.0, 3.0], scale: [2.0, 2.0, 2.0] };
//! let run = bench::run(&config, &params).unwrap();
//! assert!(run.agreement());
//! ```

pub mod backend;
pub mod bench;
pub mod cloud;
pub mod error;
pub mod input;
pub mod matrix;
pub mod ops;
