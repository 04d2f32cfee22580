//! Device offload.
//!
//! The backend drives a compute device through a fixed sequence of states:
//!
//! 1. discover platform, 2. select device, 3. create context,
//! 4. create queue (with timestamp instrumentation when available),
//! 5. compile program, 6. resolve entry point,
//! 7. allocate buffers, 8. bind arguments, 9. dispatch, 10. synchronize,
//! 11. read timing info, 12. read back results, 13. release.
//!
//! States 1-6 run once in [`DeviceOffload::open`], so the kernel is compiled
//! once per run and reused by every [`apply`](ComputeBackend::apply), which
//! runs states 7-13.
//!
//! Every acquired handle is an owned value that releases itself on drop.
//! An early return from any state therefore releases exactly what was
//! acquired before it, in reverse order, with no per-branch cleanup.
//!
//! The device itself sits behind [`DeviceApi`]. The production
//! implementation is [`WgpuApi`]; tests use a host-emulated device that
//! records every acquisition and release.

mod asset;
mod geometry;
#[cfg(test)]
mod testing;
#[cfg(feature = "wgpu")]
mod wgpu;

pub use asset::{apply_transform, KernelAsset};
pub use geometry::DispatchGeometry;
#[cfg(feature = "wgpu")]
pub use self::wgpu::WgpuApi;

use core::time::Duration;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::backend::{BackendKind, ComputeBackend, ExecutionReport};
use crate::cloud::PointCloud;
use crate::error::{BenchError, DeviceError, DeviceState};
use crate::matrix::TransformMatrix;

/// Broad device class used during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// GPUs and other accelerators.
    Accelerator,
    /// General-purpose processors exposed as compute devices.
    Processor,
}

/// Outcome of device selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelection<D> {
    /// An accelerator was found.
    Accelerator(D),
    /// No accelerator; a processor-class device on the same platform.
    Fallback(D),
}

impl<D> DeviceSelection<D> {
    /// The selected device.
    pub fn device(&self) -> &D {
        match self {
            Self::Accelerator(d) | Self::Fallback(d) => d,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

/// Host access a device buffer is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    /// Read and written by the kernel, copied back afterwards.
    ReadWrite,
    /// Only read by the kernel.
    ReadOnly,
}

/// Kernel parameters, in binding order.
pub struct KernelArgs<'a, B> {
    /// Binding 0: the point buffer.
    pub points: &'a B,
    /// Binding 1: number of valid points.
    pub count: u32,
    /// Binding 2: the 16-element matrix.
    pub matrix: &'a B,
}

/// The operations the state machine needs from a compute device.
///
/// Every associated handle type must release its resource when dropped.
pub trait DeviceApi {
    type Platform;
    type Device;
    type Context;
    type Queue;
    type Program;
    type Kernel;
    type Buffer;
    type Bindings;
    type Event;

    /// Enumerates compute platforms. Empty is an error.
    fn platforms(&self) -> Result<Vec<Self::Platform>, DeviceError>;
    fn platform_name(&self, platform: &Self::Platform) -> String;
    /// Devices of `class` on `platform`, best first.
    fn devices(&self, platform: &Self::Platform, class: DeviceClass) -> Vec<Self::Device>;
    fn device_name(&self, device: &Self::Device) -> String;

    fn create_context(&self, device: &Self::Device) -> Result<Self::Context, DeviceError>;
    /// Creates a queue, with execution timing enabled if the device supports it.
    fn create_queue(&self, context: &Self::Context) -> Result<Self::Queue, DeviceError>;
    /// Compiles `asset`. A compile error must carry the complete compiler log.
    fn compile(
        &self,
        context: &Self::Context,
        asset: &KernelAsset,
    ) -> Result<Self::Program, DeviceError>;
    fn entry_point(
        &self,
        context: &Self::Context,
        program: &Self::Program,
        entry: &str,
    ) -> Result<Self::Kernel, DeviceError>;
    /// Largest number of local groups a single dispatch may use.
    fn max_groups(&self, context: &Self::Context) -> u32;

    /// Creates a device buffer initialized with `contents`.
    fn create_buffer(
        &self,
        context: &Self::Context,
        label: &'static str,
        contents: &[u8],
        access: BufferAccess,
    ) -> Result<Self::Buffer, DeviceError>;
    fn bind(
        &self,
        context: &Self::Context,
        kernel: &Self::Kernel,
        args: KernelArgs<'_, Self::Buffer>,
    ) -> Result<Self::Bindings, DeviceError>;
    /// Enqueues the kernel and returns its timing handle.
    fn dispatch(
        &self,
        context: &Self::Context,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        bindings: &Self::Bindings,
        geometry: &DispatchGeometry,
    ) -> Result<Self::Event, DeviceError>;
    /// Blocks until the queue drains.
    fn synchronize(&self, context: &Self::Context, queue: &Self::Queue) -> Result<(), DeviceError>;
    /// Device-measured kernel duration, `None` without timing support.
    fn kernel_time(
        &self,
        context: &Self::Context,
        queue: &Self::Queue,
        event: &Self::Event,
    ) -> Result<Option<Duration>, DeviceError>;
    /// Blocking copy of `buffer` into `out`.
    fn read_back(
        &self,
        context: &Self::Context,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        out: &mut [u8],
    ) -> Result<(), DeviceError>;
}

/// Prefers an accelerator, falls back to a processor on the same platform.
///
/// # Errors
///
/// [`DeviceError::NoDevice`] when neither class is available.
pub fn select_device<A: DeviceApi>(
    api: &A,
    platform: &A::Platform,
) -> Result<DeviceSelection<A::Device>, DeviceError> {
    if let Some(device) = api.devices(platform, DeviceClass::Accelerator).into_iter().next() {
        return Ok(DeviceSelection::Accelerator(device));
    }
    warn!("no accelerator found, trying a general-purpose processor");
    api.devices(platform, DeviceClass::Processor)
        .into_iter()
        .next()
        .map(DeviceSelection::Fallback)
        .ok_or_else(|| DeviceError::NoDevice {
            platform: api.platform_name(platform),
        })
}

/// The device-offload backend.
pub struct DeviceOffload<A: DeviceApi> {
    // Fields drop in declaration order, the reverse of acquisition.
    kernel: A::Kernel,
    program: A::Program,
    queue: A::Queue,
    context: A::Context,
    device: DeviceSelection<A::Device>,
    entry: String,
    local_size: u32,
    api: A,
}

impl<A: DeviceApi> DeviceOffload<A> {
    /// Runs states 1-6: finds a device and compiles `asset` for it.
    ///
    /// # Errors
    ///
    /// Any [`DeviceError`]; everything acquired so far is released first.
    pub fn open(api: A, asset: &KernelAsset) -> Result<Self, DeviceError> {
        let start = Instant::now();

        let platforms = api.platforms()?;
        let platform = platforms.into_iter().next().ok_or(DeviceError::NoPlatform)?;
        debug!(state = %DeviceState::DiscoverPlatform, platform = %api.platform_name(&platform));

        let device = select_device(&api, &platform)?;
        debug!(
            state = %DeviceState::SelectDevice,
            device = %api.device_name(device.device()),
            fallback = device.is_fallback()
        );

        let context = api.create_context(device.device())?;
        debug!(state = %DeviceState::CreateContext);

        let queue = api.create_queue(&context)?;
        debug!(state = %DeviceState::CreateQueue);

        let program = api.compile(&context, asset)?;
        debug!(state = %DeviceState::CompileProgram, kernel = %asset.id());

        let kernel = api.entry_point(&context, &program, &asset.entry)?;
        debug!(state = %DeviceState::ResolveEntryPoint, entry = %asset.entry);

        info!(
            device = %api.device_name(device.device()),
            kernel = %asset.id(),
            setup = ?start.elapsed(),
            "device ready"
        );

        Ok(Self {
            kernel,
            program,
            queue,
            context,
            device,
            entry: asset.entry.clone(),
            local_size: asset.workgroup_size,
            api,
        })
    }

    /// The device that was selected.
    pub fn selection(&self) -> &DeviceSelection<A::Device> {
        &self.device
    }

    /// Human-readable name of the selected device.
    pub fn device_name(&self) -> String {
        self.api.device_name(self.device.device())
    }

    /// How `count` points would be dispatched on this device.
    ///
    /// # Errors
    ///
    /// See [`DispatchGeometry::new`].
    pub fn geometry(&self, count: u32) -> Result<DispatchGeometry, DeviceError> {
        DispatchGeometry::new(count, self.local_size, self.api.max_groups(&self.context))
    }

    /// Runs states 7-13 against `cloud`.
    fn run(
        &self,
        cloud: &mut PointCloud,
        matrix: &TransformMatrix,
    ) -> Result<ExecutionReport, DeviceError> {
        let count = u32::try_from(cloud.len()).map_err(|_| {
            DeviceError::at(
                DeviceState::AllocateBuffers,
                format!("{} points do not fit a 32-bit index space", cloud.len()),
            )
        })?;
        let geometry = self.geometry(count)?;
        let api = &self.api;
        let ctx = &self.context;

        if count == 0 {
            debug!("empty cloud, nothing to dispatch");
            return Ok(ExecutionReport {
                backend: BackendKind::Device,
                elapsed: Duration::ZERO,
                kernel: Some(Duration::ZERO),
            });
        }

        let start = Instant::now();

        let points = api.create_buffer(ctx, "points", cloud.as_bytes(), BufferAccess::ReadWrite)?;
        let matrix_buf = api.create_buffer(
            ctx,
            "matrix",
            bytemuck::cast_slice(matrix.as_array()),
            BufferAccess::ReadOnly,
        )?;
        debug!(state = %DeviceState::AllocateBuffers, bytes = cloud.as_bytes().len());

        let bindings = api.bind(
            ctx,
            &self.kernel,
            KernelArgs {
                points: &points,
                count,
                matrix: &matrix_buf,
            },
        )?;
        debug!(state = %DeviceState::BindArguments, entry = %self.entry);

        let event = api.dispatch(ctx, &self.queue, &self.kernel, &bindings, &geometry)?;
        debug!(state = %DeviceState::Dispatch, %geometry);

        api.synchronize(ctx, &self.queue)?;
        debug!(state = %DeviceState::Synchronize);

        let kernel = api.kernel_time(ctx, &self.queue, &event)?;
        debug!(state = %DeviceState::ReadTimingInfo, ?kernel);

        api.read_back(ctx, &self.queue, &points, cloud.as_bytes_mut())?;
        let elapsed = start.elapsed();
        debug!(state = %DeviceState::ReadBackResults);

        drop(event);
        drop(bindings);
        drop(matrix_buf);
        drop(points);
        debug!(state = %DeviceState::Release);

        if kernel.is_none() {
            warn!("device has no timestamp support, kernel time unavailable");
        }

        Ok(ExecutionReport {
            backend: BackendKind::Device,
            elapsed,
            kernel,
        })
    }
}

#[cfg(feature = "wgpu")]
impl DeviceOffload<WgpuApi> {
    /// Opens the default `wgpu` device with the embedded transform kernel.
    ///
    /// # Errors
    ///
    /// See [`DeviceOffload::open`].
    pub fn open_default() -> Result<Self, DeviceError> {
        Self::open(WgpuApi::new(), apply_transform()?)
    }
}

impl<A: DeviceApi> ComputeBackend for DeviceOffload<A> {
    fn kind(&self) -> BackendKind {
        BackendKind::Device
    }

    fn apply(
        &mut self,
        cloud: &mut PointCloud,
        matrix: &TransformMatrix,
    ) -> Result<ExecutionReport, BenchError> {
        Ok(self.run(cloud, matrix)?)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{HostApi, Resource};
    use super::*;
    use crate::ops::cpu::Sequential;

    const SESSION: [Resource; 4] = [
        Resource::Context,
        Resource::Queue,
        Resource::Program,
        Resource::Kernel,
    ];
    const RUN: [Resource; 4] = [
        Resource::Buffer("points"),
        Resource::Buffer("matrix"),
        Resource::Bindings,
        Resource::Event,
    ];

    fn asset() -> &'static KernelAsset {
        apply_transform().unwrap()
    }

    fn attempt(api: HostApi, n: usize) -> Result<(), DeviceError> {
        let mut backend = DeviceOffload::open(api, asset())?;
        let mut cloud = PointCloud::generate_seeded(n, 5).unwrap();
        backend.run(&mut cloud, &TransformMatrix::identity())?;
        Ok(())
    }

    /// Resources acquired before `state` fails.
    fn acquired_before(state: DeviceState) -> Vec<Resource> {
        let held = match state {
            DeviceState::DiscoverPlatform
            | DeviceState::SelectDevice
            | DeviceState::CreateContext => 0,
            DeviceState::CreateQueue => 1,
            DeviceState::CompileProgram => 2,
            DeviceState::ResolveEntryPoint => 3,
            DeviceState::AllocateBuffers => 4,
            DeviceState::BindArguments => 6,
            DeviceState::Dispatch => 7,
            DeviceState::Synchronize
            | DeviceState::ReadTimingInfo
            | DeviceState::ReadBackResults
            | DeviceState::Release => 8,
        };
        SESSION.iter().chain(RUN.iter()).copied().take(held).collect()
    }

    #[test]
    fn failure_in_each_state_releases_everything_acquired() {
        for state in DeviceState::ALL {
            if state == DeviceState::Release {
                continue;
            }
            let api = HostApi::new().fail_at(state);
            let ledger = api.ledger();

            let err = attempt(api, 1000).unwrap_err();
            assert_eq!(err.state(), state, "{err}");

            let ledger = ledger.borrow();
            assert_eq!(ledger.acquired(), acquired_before(state), "failing at {state}");
            ledger.assert_released_in_reverse();
        }
    }

    #[test]
    fn second_buffer_failure_releases_first() {
        let api = HostApi::new().fail_on_buffer("matrix");
        let ledger = api.ledger();

        let err = attempt(api, 10).unwrap_err();
        assert_eq!(err.state(), DeviceState::AllocateBuffers);

        let ledger = ledger.borrow();
        let mut expected = SESSION.to_vec();
        expected.push(Resource::Buffer("points"));
        assert_eq!(ledger.acquired(), expected);
        ledger.assert_released_in_reverse();
    }

    #[test]
    fn success_releases_everything_in_reverse() {
        let api = HostApi::new();
        let ledger = api.ledger();

        attempt(api, 1000).unwrap();

        let ledger = ledger.borrow();
        let expected: Vec<Resource> = SESSION.iter().chain(RUN.iter()).copied().collect();
        assert_eq!(ledger.acquired(), expected);
        ledger.assert_released_in_reverse();
    }

    #[test]
    fn run_resources_are_released_before_the_next_apply() {
        let api = HostApi::new();
        let ledger = api.ledger();
        let mut backend = DeviceOffload::open(api, asset()).unwrap();
        let m = TransformMatrix::identity();

        for _ in 0..3 {
            let mut cloud = PointCloud::generate_seeded(64, 1).unwrap();
            backend.apply(&mut cloud, &m).unwrap();
            assert_eq!(ledger.borrow().live(), SESSION.to_vec());
        }
        drop(backend);
        assert!(ledger.borrow().live().is_empty());
        ledger.borrow().assert_released_in_reverse();
    }

    #[test]
    fn compile_failure_surfaces_the_log() {
        let err = attempt(HostApi::new().fail_at(DeviceState::CompileProgram), 1).unwrap_err();
        match err {
            DeviceError::Compile { kernel, log } => {
                assert_eq!(kernel, "apply_transform");
                assert!(log.contains("injected"), "{log}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn falls_back_to_processor_class() {
        let backend = DeviceOffload::open(HostApi::new().accelerators(0), asset()).unwrap();
        assert!(backend.selection().is_fallback());

        let backend = DeviceOffload::open(HostApi::new(), asset()).unwrap();
        assert!(!backend.selection().is_fallback());
    }

    #[test]
    fn no_device_at_all() {
        let err = DeviceOffload::open(HostApi::new().accelerators(0).processors(0), asset())
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::NoDevice { .. }));
        assert!(err.is_unavailable());
    }

    #[test]
    fn matches_sequential_exactly() {
        let m = TransformMatrix::build(2.5, -1.0, 0.5, 10.0, -20.0, 30.0);
        let mut expected = PointCloud::generate_seeded(3000, 99).unwrap();
        let mut cloud = expected.clone();
        Sequential.apply(&mut expected, &m).unwrap();

        let mut backend = DeviceOffload::open(HostApi::new(), asset()).unwrap();
        let report = backend.apply(&mut cloud, &m).unwrap();
        assert_eq!(report.backend, BackendKind::Device);
        assert!(report.kernel.is_some());
        assert_eq!(cloud, expected);
    }

    #[test]
    fn padded_invocations_do_not_touch_memory() {
        let api = HostApi::new();
        let stats = api.stats();
        let mut backend = DeviceOffload::open(api, asset()).unwrap();

        let geometry = backend.geometry(300_000).unwrap();
        assert_eq!(geometry.global, 300_032);

        let m = TransformMatrix::build(2.0, 2.0, 2.0, 1.0, 2.0, 3.0);
        let mut cloud = PointCloud::generate_seeded(300_000, 3).unwrap();
        let mut expected = cloud.clone();
        Sequential.apply(&mut expected, &m).unwrap();

        backend.apply(&mut cloud, &m).unwrap();
        let stats = stats.get();
        assert_eq!(stats.invocations, 300_032);
        assert_eq!(stats.skipped, 32);
        assert_eq!(cloud, expected);
    }

    #[test]
    fn missing_timestamps_are_not_fatal() {
        let mut backend = DeviceOffload::open(HostApi::new().timestamps(false), asset()).unwrap();
        let mut cloud = PointCloud::generate_seeded(10, 0).unwrap();
        let report = backend.apply(&mut cloud, &TransformMatrix::identity()).unwrap();
        assert_eq!(report.kernel, None);
    }

    #[test]
    fn empty_cloud_skips_the_device() {
        let api = HostApi::new();
        let ledger = api.ledger();
        let mut backend = DeviceOffload::open(api, asset()).unwrap();
        let mut cloud = PointCloud::from_points(Vec::new());
        backend.apply(&mut cloud, &TransformMatrix::identity()).unwrap();
        assert_eq!(ledger.borrow().acquired(), SESSION.to_vec());
    }
}
