//! Error types shared by every backend.
//!
//! Everything here is fatal for a benchmark run: there is no retry and no
//! degraded path. The only fallback in the crate (accelerator to
//! general-purpose device) happens inside device selection and never
//! surfaces as an error.

use core::fmt;
use thiserror::Error;

/// The states the device-offload backend walks through, in order.
///
/// Every [`DeviceError`] remembers the state it was raised in, which is what
/// the binary prints and what the release tests inject failures against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceState {
    DiscoverPlatform,
    SelectDevice,
    CreateContext,
    CreateQueue,
    CompileProgram,
    ResolveEntryPoint,
    AllocateBuffers,
    BindArguments,
    Dispatch,
    Synchronize,
    ReadTimingInfo,
    ReadBackResults,
    Release,
}

impl DeviceState {
    /// All states in acquisition order.
    pub const ALL: [Self; 13] = [
        Self::DiscoverPlatform,
        Self::SelectDevice,
        Self::CreateContext,
        Self::CreateQueue,
        Self::CompileProgram,
        Self::ResolveEntryPoint,
        Self::AllocateBuffers,
        Self::BindArguments,
        Self::Dispatch,
        Self::Synchronize,
        Self::ReadTimingInfo,
        Self::ReadBackResults,
        Self::Release,
    ];
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DiscoverPlatform => "discover platform",
            Self::SelectDevice => "select device",
            Self::CreateContext => "create context",
            Self::CreateQueue => "create queue",
            Self::CompileProgram => "compile program",
            Self::ResolveEntryPoint => "resolve entry point",
            Self::AllocateBuffers => "allocate buffers",
            Self::BindArguments => "bind arguments",
            Self::Dispatch => "dispatch",
            Self::Synchronize => "synchronize",
            Self::ReadTimingInfo => "read timing info",
            Self::ReadBackResults => "read back results",
            Self::Release => "release",
        };
        f.write_str(name)
    }
}

/// Failures of the device-offload backend.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No compute platform could be enumerated.
    #[error("no compute platform available")]
    NoPlatform,
    /// Neither an accelerator nor a general-purpose device exists.
    #[error("no accelerator or general-purpose device available on platform `{platform}`")]
    NoDevice { platform: String },
    /// The embedded kernel asset is malformed.
    #[error("kernel asset is malformed: {0}")]
    Asset(String),
    /// The kernel failed to compile. `log` is the complete compiler output.
    #[error("failed to compile kernel `{kernel}`:\n{log}")]
    Compile { kernel: String, log: String },
    /// Any other state failed.
    #[error("device failure while trying to {state}: {reason}")]
    State { state: DeviceState, reason: String },
}

impl DeviceError {
    /// Shorthand for [`DeviceError::State`].
    pub fn at(state: DeviceState, reason: impl fmt::Display) -> Self {
        Self::State {
            state,
            reason: reason.to_string(),
        }
    }

    /// The state this error was raised in.
    pub fn state(&self) -> DeviceState {
        match self {
            Self::NoPlatform => DeviceState::DiscoverPlatform,
            Self::NoDevice { .. } => DeviceState::SelectDevice,
            Self::Asset(_) | Self::Compile { .. } => DeviceState::CompileProgram,
            Self::State { state, .. } => *state,
        }
    }

    /// Whether the failure only means "this machine has no usable device".
    ///
    /// Tests use this to skip instead of fail on headless machines.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::NoPlatform | Self::NoDevice { .. })
    }
}

/// Top-level error of a benchmark run.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Malformed or missing scalar input.
    #[error("invalid input: {0}")]
    Input(String),
    /// The host could not allocate the point buffer.
    #[error("failed to allocate a buffer of {points} points")]
    Allocation { points: usize },
    /// A worker pool of the requested size could not be built.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    /// The device-offload backend failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}
