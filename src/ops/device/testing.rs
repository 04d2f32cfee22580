//! A host-emulated [`DeviceApi`] for tests.
//!
//! Runs the kernel on the calling thread, records every acquisition and
//! release in a shared ledger, and can be told to fail in any state.

use core::cell::{Cell, RefCell};
use core::time::Duration;
use std::rc::Rc;

use super::{BufferAccess, DeviceApi, DeviceClass, DispatchGeometry, KernelArgs, KernelAsset};
use crate::cloud::Point;
use crate::error::{DeviceError, DeviceState};
use crate::matrix::TransformMatrix;
use crate::ops::cpu::transform_point;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resource {
    Context,
    Queue,
    Program,
    Kernel,
    Buffer(&'static str),
    Bindings,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Acquire(usize, Resource),
    Release(usize, Resource),
}

#[derive(Debug, Default)]
pub(crate) struct Ledger {
    entries: Vec<Entry>,
    next_id: usize,
}

impl Ledger {
    fn acquire(&mut self, resource: Resource) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry::Acquire(id, resource));
        id
    }

    /// Every resource acquired, in order.
    pub(crate) fn acquired(&self) -> Vec<Resource> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Acquire(_, r) => Some(*r),
                Entry::Release(..) => None,
            })
            .collect()
    }

    /// Resources acquired and not yet released.
    pub(crate) fn live(&self) -> Vec<Resource> {
        let mut stack = Vec::new();
        for entry in &self.entries {
            match *entry {
                Entry::Acquire(id, r) => stack.push((id, r)),
                Entry::Release(id, _) => stack.retain(|&(live, _)| live != id),
            }
        }
        stack.into_iter().map(|(_, r)| r).collect()
    }

    /// Asserts every acquisition was released exactly once, each release
    /// undoing the most recent live acquisition.
    pub(crate) fn assert_released_in_reverse(&self) {
        let mut stack = Vec::new();
        for entry in &self.entries {
            match *entry {
                Entry::Acquire(id, r) => stack.push((id, r)),
                Entry::Release(id, r) => {
                    assert_eq!(stack.pop(), Some((id, r)), "out-of-order release of {r:?}");
                }
            }
        }
        assert!(stack.is_empty(), "leaked: {stack:?}");
    }
}

type SharedLedger = Rc<RefCell<Ledger>>;

/// Releases its resource on drop.
pub(crate) struct Handle {
    id: usize,
    resource: Resource,
    ledger: SharedLedger,
}

impl Handle {
    fn new(ledger: &SharedLedger, resource: Resource) -> Self {
        let id = ledger.borrow_mut().acquire(resource);
        Self {
            id,
            resource,
            ledger: Rc::clone(ledger),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.ledger
            .borrow_mut()
            .entries
            .push(Entry::Release(self.id, self.resource));
    }
}

pub(crate) struct HostBuffer {
    _handle: Handle,
    data: Rc<RefCell<Vec<u8>>>,
}

pub(crate) struct HostBindings {
    _handle: Handle,
    points: Rc<RefCell<Vec<u8>>>,
    count: u32,
    matrix: Rc<RefCell<Vec<u8>>>,
}

pub(crate) struct HostEvent {
    _handle: Handle,
    ticks: (u64, u64),
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DispatchStats {
    pub(crate) invocations: u64,
    pub(crate) skipped: u64,
}

pub(crate) struct HostApi {
    ledger: SharedLedger,
    stats: Rc<Cell<DispatchStats>>,
    fail_at: Option<DeviceState>,
    fail_buffer: Option<&'static str>,
    accelerators: usize,
    processors: usize,
    timestamps: bool,
    clock: Cell<u64>,
}

impl HostApi {
    pub(crate) fn new() -> Self {
        Self {
            ledger: SharedLedger::default(),
            stats: Rc::default(),
            fail_at: None,
            fail_buffer: None,
            accelerators: 1,
            processors: 1,
            timestamps: true,
            clock: Cell::new(1_000),
        }
    }

    pub(crate) fn fail_at(mut self, state: DeviceState) -> Self {
        self.fail_at = Some(state);
        self
    }

    pub(crate) fn fail_on_buffer(mut self, label: &'static str) -> Self {
        self.fail_buffer = Some(label);
        self
    }

    pub(crate) fn accelerators(mut self, n: usize) -> Self {
        self.accelerators = n;
        self
    }

    pub(crate) fn processors(mut self, n: usize) -> Self {
        self.processors = n;
        self
    }

    pub(crate) fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    pub(crate) fn ledger(&self) -> SharedLedger {
        Rc::clone(&self.ledger)
    }

    pub(crate) fn stats(&self) -> Rc<Cell<DispatchStats>> {
        Rc::clone(&self.stats)
    }

    fn check(&self, state: DeviceState) -> Result<(), DeviceError> {
        if self.fail_at == Some(state) {
            Err(DeviceError::at(state, "injected failure"))
        } else {
            Ok(())
        }
    }

    fn tick(&self, by: u64) -> u64 {
        let now = self.clock.get() + by;
        self.clock.set(now);
        now
    }
}

impl DeviceApi for HostApi {
    type Platform = &'static str;
    type Device = (String, DeviceClass);
    type Context = Handle;
    type Queue = (Handle, bool);
    type Program = Handle;
    type Kernel = Handle;
    type Buffer = HostBuffer;
    type Bindings = HostBindings;
    type Event = HostEvent;

    fn platforms(&self) -> Result<Vec<Self::Platform>, DeviceError> {
        if self.fail_at == Some(DeviceState::DiscoverPlatform) {
            return Err(DeviceError::NoPlatform);
        }
        Ok(vec!["host", "unused"])
    }

    fn platform_name(&self, platform: &Self::Platform) -> String {
        (*platform).to_string()
    }

    fn devices(&self, _platform: &Self::Platform, class: DeviceClass) -> Vec<Self::Device> {
        if self.fail_at == Some(DeviceState::SelectDevice) {
            return Vec::new();
        }
        let n = match class {
            DeviceClass::Accelerator => self.accelerators,
            DeviceClass::Processor => self.processors,
        };
        (0..n).map(|i| (format!("{class:?} {i}"), class)).collect()
    }

    fn device_name(&self, device: &Self::Device) -> String {
        device.0.clone()
    }

    fn create_context(&self, _device: &Self::Device) -> Result<Self::Context, DeviceError> {
        self.check(DeviceState::CreateContext)?;
        Ok(Handle::new(&self.ledger, Resource::Context))
    }

    fn create_queue(&self, _context: &Self::Context) -> Result<Self::Queue, DeviceError> {
        self.check(DeviceState::CreateQueue)?;
        Ok((Handle::new(&self.ledger, Resource::Queue), self.timestamps))
    }

    fn compile(
        &self,
        _context: &Self::Context,
        asset: &KernelAsset,
    ) -> Result<Self::Program, DeviceError> {
        if self.fail_at == Some(DeviceState::CompileProgram) {
            return Err(DeviceError::Compile {
                kernel: asset.name.clone(),
                log: "1:1 error: injected diagnostic".into(),
            });
        }
        Ok(Handle::new(&self.ledger, Resource::Program))
    }

    fn entry_point(
        &self,
        _context: &Self::Context,
        _program: &Self::Program,
        _entry: &str,
    ) -> Result<Self::Kernel, DeviceError> {
        self.check(DeviceState::ResolveEntryPoint)?;
        Ok(Handle::new(&self.ledger, Resource::Kernel))
    }

    fn max_groups(&self, _context: &Self::Context) -> u32 {
        65_535
    }

    fn create_buffer(
        &self,
        _context: &Self::Context,
        label: &'static str,
        contents: &[u8],
        _access: BufferAccess,
    ) -> Result<Self::Buffer, DeviceError> {
        self.check(DeviceState::AllocateBuffers)?;
        if self.fail_buffer == Some(label) {
            return Err(DeviceError::at(DeviceState::AllocateBuffers, "injected failure"));
        }
        Ok(HostBuffer {
            _handle: Handle::new(&self.ledger, Resource::Buffer(label)),
            data: Rc::new(RefCell::new(contents.to_vec())),
        })
    }

    fn bind(
        &self,
        _context: &Self::Context,
        _kernel: &Self::Kernel,
        args: KernelArgs<'_, Self::Buffer>,
    ) -> Result<Self::Bindings, DeviceError> {
        self.check(DeviceState::BindArguments)?;
        Ok(HostBindings {
            _handle: Handle::new(&self.ledger, Resource::Bindings),
            points: Rc::clone(&args.points.data),
            count: args.count,
            matrix: Rc::clone(&args.matrix.data),
        })
    }

    fn dispatch(
        &self,
        _context: &Self::Context,
        _queue: &Self::Queue,
        _kernel: &Self::Kernel,
        bindings: &Self::Bindings,
        geometry: &DispatchGeometry,
    ) -> Result<Self::Event, DeviceError> {
        self.check(DeviceState::Dispatch)?;

        let m: [f32; 16] = bytemuck::pod_read_unaligned(&bindings.matrix.borrow());
        let matrix = TransformMatrix::build(m[0], m[5], m[10], m[3], m[7], m[11]);
        assert_eq!(matrix.as_array(), &m, "host device only runs scale/translate matrices");

        let stride = core::mem::size_of::<Point>();
        let mut data = bindings.points.borrow_mut();
        let mut stats = self.stats.get();
        for i in 0..geometry.global {
            stats.invocations += 1;
            if i >= u64::from(bindings.count) {
                stats.skipped += 1;
                continue;
            }
            let slot = &mut data[i as usize * stride..(i as usize + 1) * stride];
            let p: Point = bytemuck::pod_read_unaligned(slot);
            slot.copy_from_slice(bytemuck::bytes_of(&transform_point(&matrix, p)));
        }
        self.stats.set(stats);

        let start = self.tick(10);
        let end = self.tick(geometry.global);
        Ok(HostEvent {
            _handle: Handle::new(&self.ledger, Resource::Event),
            ticks: (start, end),
        })
    }

    fn synchronize(&self, _context: &Self::Context, _queue: &Self::Queue) -> Result<(), DeviceError> {
        self.check(DeviceState::Synchronize)
    }

    fn kernel_time(
        &self,
        _context: &Self::Context,
        queue: &Self::Queue,
        event: &Self::Event,
    ) -> Result<Option<Duration>, DeviceError> {
        self.check(DeviceState::ReadTimingInfo)?;
        if !queue.1 {
            return Ok(None);
        }
        let (start, end) = event.ticks;
        Ok(Some(Duration::from_nanos(end - start)))
    }

    fn read_back(
        &self,
        _context: &Self::Context,
        _queue: &Self::Queue,
        buffer: &Self::Buffer,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        self.check(DeviceState::ReadBackResults)?;
        out.copy_from_slice(&buffer.data.borrow());
        Ok(())
    }
}
