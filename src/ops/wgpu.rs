//! GPU-accelerated elementwise execution using WGPU.
//!
//! The [`Weaver`] owns the device, the queue and the compiled kernel registry.
//! It is created once per process on first use ([`Weaver::global`]) and shared
//! by every GPU-backed function; it lives until the process exits.
//!
//! When the weaver starts it compiles one forward and one backward compute
//! pipeline per [`ActivationKind`], from the expressions in
//! [`kernels`](super::kernels). Each call then uploads the host buffer, runs
//! the kernel over a 1-D index space equal to the buffer length, downloads the
//! result and waits for the device before returning.
//!
//! Buffers larger than the device's storage binding limit are refused before
//! anything is allocated. Everything else a call records runs inside
//! validation and out-of-memory error scopes, so device failures come back as
//! [`BackendError`] values rather than reaching the uncaptured-error handler.
//!
//! Data is `f32` on the device. With the `f64` feature values are narrowed on
//! upload and widened on download.
//!
//! The weaver is not meant to be driven from several threads at once; guard it
//! with a mutex at the call site if you need to.

use core::fmt;
use std::collections::HashMap;
use std::sync::mpsc;

use log::{debug, warn};
use wgpu::util::DeviceExt;

use super::Executor;
use super::kernels::{self, dispatch_grid};
use crate::Real;
use crate::backend::Backend;
use crate::error::BackendError;
use crate::functions::{ActivationFn, ActivationKind};

/// The compiled forward and backward kernels of one activation kind.
struct KernelPair {
    forward: wgpu::ComputePipeline,
    backward: wgpu::ComputePipeline,
}

/// Holds the WGPU device, queue and compiled activation kernels.
pub struct Weaver {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// The queue commands are submitted to.
    pub queue: wgpu::Queue,
    forward_layout: wgpu::BindGroupLayout,
    backward_layout: wgpu::BindGroupLayout,
    kernels: HashMap<ActivationKind, KernelPair>,
}

impl fmt::Debug for Weaver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.kernels.keys().map(|k| k.name()).collect();
        kinds.sort_unstable();
        f.debug_struct("Weaver").field("kernels", &kinds).finish()
    }
}

lazy_static::lazy_static! {
    static ref WEAVER: Result<Weaver, BackendError> = Weaver::new().inspect_err(|e| {
        warn!("parallel backend unavailable: {e}");
    });
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

impl Weaver {
    /// Initializes a new GPU context and compiles every activation kernel.
    ///
    /// # Errors
    ///
    /// - [`BackendError::Adapter`] / [`BackendError::Device`] if no GPU can be acquired
    /// - [`BackendError::KernelBuild`] if a kernel fails validation
    ///
    /// # Internals
    ///
    /// - Uses `pollster::block_on` to synchronously wait for async WGPU calls
    /// - Selects the default adapter with downlevel limits for broad compatibility
    pub fn new() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(|e| BackendError::Adapter(e.to_string()))?;
        debug!("weaver adapter: {:?}", adapter.get_info());

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("weaver"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| BackendError::Device(e.to_string()))?;

        let forward_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("activation_forward_bgl"),
            entries: &[storage_entry(0, false)],
        });
        let backward_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("activation_backward_bgl"),
            entries: &[storage_entry(0, true), storage_entry(1, false)],
        });

        let forward_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("activation_forward_pipeline_layout"),
                bind_group_layouts: &[&forward_layout],
                push_constant_ranges: &[],
            });
        let backward_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("activation_backward_pipeline_layout"),
                bind_group_layouts: &[&backward_layout],
                push_constant_ranges: &[],
            });

        let mut registry = HashMap::with_capacity(ActivationKind::ALL.len());
        for kind in ActivationKind::ALL {
            let forward = build_pipeline(
                &device,
                &forward_pipeline_layout,
                &kernels::forward_module(kind),
                &kernels::forward_entry(kind),
            )?;
            let backward = build_pipeline(
                &device,
                &backward_pipeline_layout,
                &kernels::backward_module(kind),
                &kernels::backward_entry(kind),
            )?;
            registry.insert(kind, KernelPair { forward, backward });
        }
        debug!("weaver compiled {} activation kernels", registry.len() * 2);

        Ok(Self {
            device,
            queue,
            forward_layout,
            backward_layout,
            kernels: registry,
        })
    }

    /// Returns the process-wide weaver, creating it on first call.
    ///
    /// A failed initialization is remembered; later calls return the same error.
    ///
    /// # Errors
    ///
    /// Returns the error of [`Weaver::new`].
    pub fn global() -> Result<&'static Weaver, BackendError> {
        match &*WEAVER {
            Ok(weaver) => Ok(weaver),
            Err(e) => Err(e.clone()),
        }
    }

    fn kernels(&self, kind: ActivationKind) -> Result<&KernelPair, BackendError> {
        self.kernels
            .get(&kind)
            .ok_or_else(|| BackendError::KernelBuild {
                kernel: kind.name().to_string(),
                message: "kernel missing from registry".to_string(),
            })
    }

    /// Largest number of `f32` values one storage binding may hold.
    pub fn max_binding_len(&self) -> usize {
        let limits = self.device.limits();
        let bytes = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
        usize::try_from(bytes / size_of::<f32>() as u64).unwrap_or(usize::MAX)
    }

    fn check_len(&self, len: usize) -> Result<(), BackendError> {
        let max = self.max_binding_len();
        if len > max {
            return Err(BackendError::Allocation(format!(
                "{len} values exceed the storage binding limit of {max}"
            )));
        }
        Ok(())
    }

    /// Runs `work` inside validation and out-of-memory error scopes.
    ///
    /// # Errors
    ///
    /// - [`BackendError::Allocation`] if the device ran out of memory
    /// - [`BackendError::Dispatch`] if any recorded call failed validation
    pub fn scoped<T>(&self, work: impl FnOnce() -> T) -> Result<T, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let out = work();

        // scopes pop innermost first
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = oom {
            return Err(BackendError::Allocation(err.to_string()));
        }
        if let Some(err) = validation {
            return Err(BackendError::Dispatch(err.to_string()));
        }
        Ok(out)
    }

    /// Copies `data` into a new device storage buffer.
    ///
    /// Writable buffers can also be copied back to the host.
    pub fn upload(&self, label: &str, data: &[Real], writable: bool) -> wgpu::Buffer {
        let host: Vec<f32> = data.iter().map(|&v| v as f32).collect();
        let usage = if writable {
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC
        } else {
            wgpu::BufferUsages::STORAGE
        };
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(&host),
                usage,
            })
    }

    /// Submits one dispatch of `pipeline` covering `len` elements.
    pub fn execute(
        &self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        len: usize,
    ) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            let (x, y) = dispatch_grid(len);
            pass.dispatch_workgroups(x, y, 1);
        }

        self.queue.submit(Some(encoder.finish()));
    }

    /// Blocks until the device has finished all submitted work.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Poll`] if waiting fails.
    pub fn finish(&self) -> Result<(), BackendError> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| BackendError::Poll(e.to_string()))
    }

    /// Reads the first `len` values of a writable buffer back to the host.
    ///
    /// # Errors
    ///
    /// Returns an allocation, dispatch, map, poll or cast error if the
    /// read-back fails.
    pub fn download(&self, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<Real>, BackendError> {
        self.check_len(len)?;
        let size = (len * size_of::<f32>()) as u64;
        let staging = self.scoped(|| {
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("weaver_staging"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("weaver_download"),
                });
            encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
            self.queue.submit(Some(encoder.finish()));
            staging
        })?;

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.finish()?;
        rx.recv()
            .map_err(|e| BackendError::Map(e.to_string()))?
            .map_err(|e| BackendError::Map(e.to_string()))?;

        let out = {
            let view = slice.get_mapped_range();
            let bytes: &[u8] = &view;
            let floats: &[f32] =
                bytemuck::try_cast_slice(bytes).map_err(|e| BackendError::Cast(e.to_string()))?;
            floats.iter().map(|&v| v as Real).collect()
        };
        staging.unmap();

        Ok(out)
    }

    /// Applies the forward kernel of `kind` to `y` in place.
    ///
    /// # Errors
    ///
    /// - [`BackendError::Allocation`] if `y` does not fit in one storage binding
    ///   or the device runs out of memory
    /// - any other backend failure of the upload, dispatch or read-back
    pub fn run_forward(&self, kind: ActivationKind, y: &mut [Real]) -> Result<(), BackendError> {
        if y.is_empty() {
            return Ok(());
        }
        self.check_len(y.len())?;
        let pair = self.kernels(kind)?;

        let gpu_y = self.scoped(|| {
            let gpu_y = self.upload("gpu_y", y, true);
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("activation_forward_bind_group"),
                layout: &self.forward_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: gpu_y.as_entire_binding(),
                }],
            });
            self.execute("activation_forward", &pair.forward, &bind_group, y.len());
            gpu_y
        })?;
        let out = self.download(&gpu_y, y.len())?;
        y.copy_from_slice(&out);
        Ok(())
    }

    /// Applies the backward kernel of `kind` to `gx` in place, reading the
    /// previous forward output from `prev_output`.
    ///
    /// # Errors
    ///
    /// Same as [`Weaver::run_forward`].
    pub fn run_backward(
        &self,
        kind: ActivationKind,
        prev_output: &[Real],
        gx: &mut [Real],
    ) -> Result<(), BackendError> {
        if gx.is_empty() {
            return Ok(());
        }
        self.check_len(prev_output.len().max(gx.len()))?;
        let pair = self.kernels(kind)?;

        let gpu_gx = self.scoped(|| {
            let gpu_y = self.upload("gpu_y", prev_output, false);
            let gpu_gx = self.upload("gpu_gx", gx, true);
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("activation_backward_bind_group"),
                layout: &self.backward_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: gpu_y.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: gpu_gx.as_entire_binding(),
                    },
                ],
            });
            self.execute("activation_backward", &pair.backward, &bind_group, gx.len());
            gpu_gx
        })?;
        let out = self.download(&gpu_gx, gx.len())?;
        gx.copy_from_slice(&out);
        Ok(())
    }
}

/// Compiles one kernel, capturing validation errors instead of panicking.
fn build_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    source: &str,
    entry: &str,
) -> Result<wgpu::ComputePipeline, BackendError> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(entry),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry),
        layout: Some(layout),
        module: &module,
        entry_point: Some(entry),
        cache: None,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    });

    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(BackendError::KernelBuild {
            kernel: entry.to_string(),
            message: err.to_string(),
        });
    }
    debug!("compiled kernel `{entry}`");

    Ok(pipeline)
}

/// Executor dispatching activations to the shared [`Weaver`].
#[derive(Debug, Clone, Copy)]
pub struct WgpuExecutor {
    weaver: &'static Weaver,
}

impl WgpuExecutor {
    /// Wraps an existing weaver.
    pub const fn new(weaver: &'static Weaver) -> Self {
        Self { weaver }
    }

    /// An executor over the process-wide weaver.
    ///
    /// # Errors
    ///
    /// Returns the initialization error of the weaver.
    pub fn global() -> Result<Self, BackendError> {
        Weaver::global().map(Self::new)
    }

    /// The weaver this executor dispatches to.
    pub const fn weaver(&self) -> &'static Weaver {
        self.weaver
    }
}

impl Executor for WgpuExecutor {
    fn backend(&self) -> Backend {
        Backend::Wgpu
    }

    fn forward(&self, f: &dyn ActivationFn, y: &mut [Real]) -> Result<(), BackendError> {
        self.weaver.run_forward(f.kind(), y)
    }

    fn backward(
        &self,
        f: &dyn ActivationFn,
        prev_output: &[Real],
        gx: &mut [Real],
    ) -> Result<(), BackendError> {
        self.weaver.run_backward(f.kind(), prev_output, gx)
    }
}
