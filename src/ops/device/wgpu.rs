//! [`DeviceApi`] over `wgpu`.
//!
//! Platforms are `wgpu` backends (Vulkan, Metal, DX12, GL), devices are the
//! adapters each backend exposes. GPUs count as accelerators; software
//! rasterizers and other CPU adapters are the general-purpose fallback.
//!
//! `wgpu` reports most failures through error scopes rather than return
//! values, so every fallible device call runs inside [`scoped`].

use core::time::Duration;
use std::sync::mpsc;
use std::sync::Arc;

use tracing::{debug, error, warn};
use wgpu::util::DeviceExt;

use super::{BufferAccess, DeviceApi, DeviceClass, DispatchGeometry, KernelArgs, KernelAsset};
use crate::error::{DeviceError, DeviceState};

/// Two `u64` ticks: start and end of the compute pass.
const TIMESTAMP_BYTES: u64 = 2 * core::mem::size_of::<u64>() as u64;

/// The `wgpu` device layer.
pub struct WgpuApi {
    instance: wgpu::Instance,
    backends: wgpu::Backends,
}

impl WgpuApi {
    /// Uses the backends named by `WGPU_BACKEND`, or all of them.
    pub fn new() -> Self {
        Self::with_backends(wgpu::Backends::from_env().unwrap_or(wgpu::Backends::all()))
    }

    pub fn with_backends(backends: wgpu::Backends) -> Self {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        Self { instance, backends }
    }
}

impl Default for WgpuApi {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapters sharing one backend.
pub struct WgpuPlatform {
    backend: wgpu::Backend,
    adapters: Vec<Arc<wgpu::Adapter>>,
}

pub struct WgpuDevice {
    adapter: Arc<wgpu::Adapter>,
    info: wgpu::AdapterInfo,
}

pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    timestamps: bool,
    limits: wgpu::Limits,
}

/// Per-queue timestamp instrumentation.
struct Timer {
    query_set: wgpu::QuerySet,
    resolve: WgpuBuffer,
    readback: WgpuBuffer,
    /// Nanoseconds per tick.
    period: f32,
}

pub struct WgpuQueue {
    timer: Option<Timer>,
}

pub struct WgpuKernel {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

/// A device buffer, destroyed as soon as it is dropped.
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

impl Drop for WgpuBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

pub struct WgpuBindings {
    group: wgpu::BindGroup,
    // Kept alive until the dispatch that reads it has been dropped.
    _params: WgpuBuffer,
}

pub struct WgpuEvent {
    _submission: wgpu::SubmissionIndex,
}

fn backend_rank(backend: wgpu::Backend) -> u8 {
    match backend {
        wgpu::Backend::Vulkan => 0,
        wgpu::Backend::Metal => 1,
        wgpu::Backend::Dx12 => 2,
        wgpu::Backend::Gl => 3,
        _ => 4,
    }
}

fn classify(device_type: wgpu::DeviceType) -> (DeviceClass, u8) {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => (DeviceClass::Accelerator, 0),
        wgpu::DeviceType::IntegratedGpu => (DeviceClass::Accelerator, 1),
        wgpu::DeviceType::VirtualGpu => (DeviceClass::Accelerator, 2),
        wgpu::DeviceType::Cpu => (DeviceClass::Processor, 0),
        wgpu::DeviceType::Other => (DeviceClass::Processor, 1),
    }
}

/// Runs `f` inside validation and out-of-memory error scopes.
fn scoped<T>(
    device: &wgpu::Device,
    state: DeviceState,
    f: impl FnOnce() -> T,
) -> Result<T, DeviceError> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let oom = pollster::block_on(device.pop_error_scope());
    match validation.or(oom) {
        Some(e) => Err(DeviceError::at(state, e)),
        None => Ok(value),
    }
}

/// Blocking map of `buffer` for reading, copied into `out`.
fn map_read(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
    state: DeviceState,
    out: &mut [u8],
) -> Result<(), DeviceError> {
    let slice = buffer.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|e| DeviceError::at(state, e))?;
    rx.recv()
        .map_err(|e| DeviceError::at(state, e))?
        .map_err(|e| DeviceError::at(state, e))?;
    {
        let view = slice.get_mapped_range();
        out.copy_from_slice(&view[..out.len()]);
    }
    buffer.unmap();
    Ok(())
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl DeviceApi for WgpuApi {
    type Platform = WgpuPlatform;
    type Device = WgpuDevice;
    type Context = WgpuContext;
    type Queue = WgpuQueue;
    type Program = wgpu::ShaderModule;
    type Kernel = WgpuKernel;
    type Buffer = WgpuBuffer;
    type Bindings = WgpuBindings;
    type Event = WgpuEvent;

    fn platforms(&self) -> Result<Vec<Self::Platform>, DeviceError> {
        let mut platforms: Vec<WgpuPlatform> = Vec::new();
        for adapter in self.instance.enumerate_adapters(self.backends) {
            let backend = adapter.get_info().backend;
            let adapter = Arc::new(adapter);
            match platforms.iter_mut().find(|p| p.backend == backend) {
                Some(platform) => platform.adapters.push(adapter),
                None => platforms.push(WgpuPlatform {
                    backend,
                    adapters: vec![adapter],
                }),
            }
        }
        if platforms.is_empty() {
            return Err(DeviceError::NoPlatform);
        }
        platforms.sort_by_key(|p| backend_rank(p.backend));
        Ok(platforms)
    }

    fn platform_name(&self, platform: &Self::Platform) -> String {
        format!("{:?}", platform.backend)
    }

    fn devices(&self, platform: &Self::Platform, class: DeviceClass) -> Vec<Self::Device> {
        let mut devices: Vec<(u8, WgpuDevice)> = platform
            .adapters
            .iter()
            .filter_map(|adapter| {
                let info = adapter.get_info();
                let (c, rank) = classify(info.device_type);
                (c == class).then(|| {
                    (
                        rank,
                        WgpuDevice {
                            adapter: Arc::clone(adapter),
                            info,
                        },
                    )
                })
            })
            .collect();
        devices.sort_by_key(|(rank, _)| *rank);
        devices.into_iter().map(|(_, d)| d).collect()
    }

    fn device_name(&self, device: &Self::Device) -> String {
        format!("{} ({:?})", device.info.name, device.info.device_type)
    }

    fn create_context(&self, device: &Self::Device) -> Result<Self::Context, DeviceError> {
        let adapter = &device.adapter;
        let timestamps = adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        let required_features = if timestamps {
            wgpu::Features::TIMESTAMP_QUERY
        } else {
            wgpu::Features::empty()
        };
        let limits = adapter.limits();

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("affine-bench"),
            required_features,
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| DeviceError::at(DeviceState::CreateContext, e))?;

        device.on_uncaptured_error(Box::new(|e: wgpu::Error| error!(error = %e, "uncaptured device error")));

        Ok(WgpuContext {
            device,
            queue,
            timestamps,
            limits,
        })
    }

    fn create_queue(&self, context: &Self::Context) -> Result<Self::Queue, DeviceError> {
        if !context.timestamps {
            return Ok(WgpuQueue { timer: None });
        }
        let device = &context.device;
        let timer = scoped(device, DeviceState::CreateQueue, || Timer {
            query_set: device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("pass timestamps"),
                ty: wgpu::QueryType::Timestamp,
                count: 2,
            }),
            resolve: WgpuBuffer {
                buffer: device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("timestamp resolve"),
                    size: TIMESTAMP_BYTES,
                    usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                }),
                size: TIMESTAMP_BYTES,
            },
            readback: WgpuBuffer {
                buffer: device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("timestamp readback"),
                    size: TIMESTAMP_BYTES,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
                size: TIMESTAMP_BYTES,
            },
            period: context.queue.get_timestamp_period(),
        })?;
        Ok(WgpuQueue { timer: Some(timer) })
    }

    fn compile(
        &self,
        context: &Self::Context,
        asset: &KernelAsset,
    ) -> Result<Self::Program, DeviceError> {
        let device = &context.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(asset.name.as_str()),
            source: wgpu::ShaderSource::Wgsl(asset.source.into()),
        });
        let scope = pollster::block_on(device.pop_error_scope());
        let info = pollster::block_on(module.get_compilation_info());

        let mut log = Vec::new();
        let mut failed = scope.is_some();
        for message in &info.messages {
            let location = message
                .location
                .as_ref()
                .map(|l| format!("{}:{}", l.line_number, l.line_position))
                .unwrap_or_else(|| "-".into());
            match message.message_type {
                wgpu::CompilationMessageType::Error => failed = true,
                wgpu::CompilationMessageType::Warning => {
                    warn!(kernel = %asset.id(), %location, "{}", message.message);
                }
                wgpu::CompilationMessageType::Info => {}
            }
            log.push(format!("{location} {:?}: {}", message.message_type, message.message));
        }
        if let Some(e) = scope {
            log.push(e.to_string());
        }

        if failed {
            return Err(DeviceError::Compile {
                kernel: asset.name.clone(),
                log: log.join("\n"),
            });
        }
        Ok(module)
    }

    fn entry_point(
        &self,
        context: &Self::Context,
        program: &Self::Program,
        entry: &str,
    ) -> Result<Self::Kernel, DeviceError> {
        let device = &context.device;
        scoped(device, DeviceState::ResolveEntryPoint, || {
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("apply_transform_bgl"),
                entries: &[
                    storage_entry(0, false),
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    storage_entry(2, true),
                ],
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("apply_transform_pipeline_layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: program,
                entry_point: Some(entry),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            WgpuKernel { layout, pipeline }
        })
    }

    fn max_groups(&self, context: &Self::Context) -> u32 {
        context.limits.max_compute_workgroups_per_dimension
    }

    fn create_buffer(
        &self,
        context: &Self::Context,
        label: &'static str,
        contents: &[u8],
        access: BufferAccess,
    ) -> Result<Self::Buffer, DeviceError> {
        let size = contents.len() as u64;
        let limit = u64::from(context.limits.max_storage_buffer_binding_size);
        if size > limit {
            return Err(DeviceError::at(
                DeviceState::AllocateBuffers,
                format!("`{label}` needs {size} bytes, device binding limit is {limit}"),
            ));
        }
        let usage = match access {
            BufferAccess::ReadWrite => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
            BufferAccess::ReadOnly => wgpu::BufferUsages::STORAGE,
        };
        let buffer = scoped(&context.device, DeviceState::AllocateBuffers, || {
            context
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents,
                    usage,
                })
        })?;
        Ok(WgpuBuffer { buffer, size })
    }

    fn bind(
        &self,
        context: &Self::Context,
        kernel: &Self::Kernel,
        args: KernelArgs<'_, Self::Buffer>,
    ) -> Result<Self::Bindings, DeviceError> {
        let device = &context.device;
        scoped(device, DeviceState::BindArguments, || {
            let params = [args.count, 0, 0, 0];
            let params = WgpuBuffer {
                buffer: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("params"),
                    contents: bytemuck::cast_slice(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                }),
                size: core::mem::size_of_val(&params) as u64,
            };
            let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("apply_transform_bind_group"),
                layout: &kernel.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: args.points.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: params.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: args.matrix.buffer.as_entire_binding(),
                    },
                ],
            });
            WgpuBindings {
                group,
                _params: params,
            }
        })
    }

    fn dispatch(
        &self,
        context: &Self::Context,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        bindings: &Self::Bindings,
        geometry: &DispatchGeometry,
    ) -> Result<Self::Event, DeviceError> {
        let device = &context.device;
        let submission = scoped(device, DeviceState::Dispatch, || {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("apply_transform"),
            });
            {
                let timestamp_writes =
                    queue
                        .timer
                        .as_ref()
                        .map(|t| wgpu::ComputePassTimestampWrites {
                            query_set: &t.query_set,
                            beginning_of_pass_write_index: Some(0),
                            end_of_pass_write_index: Some(1),
                        });
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("apply_transform"),
                    timestamp_writes,
                });
                pass.set_pipeline(&kernel.pipeline);
                pass.set_bind_group(0, &bindings.group, &[]);
                pass.dispatch_workgroups(geometry.groups, 1, 1);
            }
            if let Some(t) = &queue.timer {
                encoder.resolve_query_set(&t.query_set, 0..2, &t.resolve.buffer, 0);
                encoder.copy_buffer_to_buffer(
                    &t.resolve.buffer,
                    0,
                    &t.readback.buffer,
                    0,
                    t.resolve.size,
                );
            }
            context.queue.submit(Some(encoder.finish()))
        })?;
        Ok(WgpuEvent {
            _submission: submission,
        })
    }

    fn synchronize(&self, context: &Self::Context, _queue: &Self::Queue) -> Result<(), DeviceError> {
        let status = context
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| DeviceError::at(DeviceState::Synchronize, e))?;
        debug!(?status, "queue drained");
        Ok(())
    }

    fn kernel_time(
        &self,
        context: &Self::Context,
        queue: &Self::Queue,
        _event: &Self::Event,
    ) -> Result<Option<Duration>, DeviceError> {
        let Some(timer) = &queue.timer else {
            return Ok(None);
        };
        let mut ticks = [0u64; 2];
        map_read(
            &context.device,
            &timer.readback.buffer,
            DeviceState::ReadTimingInfo,
            bytemuck::cast_slice_mut(&mut ticks),
        )?;
        let [start, end] = ticks;
        if end < start {
            warn!(start, end, "timestamp counter went backwards");
            return Ok(None);
        }
        let nanos = (end - start) as f64 * f64::from(timer.period);
        Ok(Some(Duration::from_nanos(nanos.round() as u64)))
    }

    fn read_back(
        &self,
        context: &Self::Context,
        _queue: &Self::Queue,
        buffer: &Self::Buffer,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        if out.len() as u64 != buffer.size {
            return Err(DeviceError::at(
                DeviceState::ReadBackResults,
                format!("host buffer is {} bytes, device buffer is {}", out.len(), buffer.size),
            ));
        }
        let device = &context.device;
        let staging = scoped(device, DeviceState::ReadBackResults, || {
            let staging = WgpuBuffer {
                buffer: device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("staging"),
                    size: buffer.size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
                size: buffer.size,
            };
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read back"),
            });
            encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging.buffer, 0, buffer.size);
            context.queue.submit(Some(encoder.finish()));
            staging
        })?;
        map_read(device, &staging.buffer, DeviceState::ReadBackResults, out)
    }
}
