//! # Backend Layer
//!
//! The three implementations of the point transform and the glue that picks
//! one at runtime.
//!
//! ## Submodules
//!
//! - [`cpu`]: sequential baseline and the rayon-backed parallel loop
//! - [`device`]: offload to a compute device, `wgpu` by default
//! - [`dispatch`]: builds a boxed backend from a [`BackendKind`](crate::backend::BackendKind)
//!
//! ## Adding a Backend
//!
//! 1. Implement [`ComputeBackend`](crate::backend::ComputeBackend) for it
//! 2. Give it a [`BackendKind`](crate::backend::BackendKind) variant
//! 3. Construct it in [`dispatch::create_backend`]
//!
//! Whatever the backend, every output coordinate is the same left-to-right
//! 4-term sum, so results can be compared bit for bit.
//!
//! ## Feature Flags
//!
//! - `simd`: SSE host path on x86-64
//! - `wgpu`: the `wgpu` device layer (on by default)

pub mod cpu;
pub mod device;
pub mod dispatch;
