//! GPU device adapter over WGPU + WGSL.
//!
//! Kernels are compute shaders compiled from the WGSL sources bundled in
//! `shaders/`, one entry point per kernel name. The bind layout follows the
//! kernel signature from the library:
//!
//! - every buffer argument gets the next storage binding, in signature order
//!   (`Input` read-only, `Output` read-write)
//! - all scalar arguments are packed, in order, into one read-only `array<u32>`
//!   bound last; floats travel as their bit pattern
//!
//! Tensor storage stays host-resident. A launch uploads its buffers, runs the
//! pass, and copies every `Output` back through a staging buffer before
//! returning, so the queue is always drained when `enqueue` returns.
//!
//! The context is created once, on first use, via `lazy_static`.

use std::sync::{Arc, mpsc};

use briny::prelude::{Validate, ValidationError};
use wgpu::util::DeviceExt;

use super::{ArgKind, Device, KernelArg, KernelInfo, Program, kernel_def};
use crate::backend::Target;
use crate::error::DeviceError;
use crate::tensors::Storage;

/// Workgroup size every bundled shader is compiled with.
pub const WORKGROUP_SIZE: usize = 256;

const SHADERS: &[(&str, &str)] = &[
    ("ker_copy", include_str!("shaders/copy.wgsl")),
    ("ker_data_norm_fwd", include_str!("shaders/data_norm.wgsl")),
    ("ker_permute_fwd", include_str!("shaders/permute.wgsl")),
    ("ker_power_fwd", include_str!("shaders/power.wgsl")),
    ("ker_shuffle_channel_fwd", include_str!("shaders/shuffle_channel.wgsl")),
    ("ker_soft_sign_fwd", include_str!("shaders/soft_sign.wgsl")),
];

/// Basic wrapper for GPU initialization errors.
#[derive(Debug)]
pub enum GpuError {
    /// An error in requesting the adapter.
    Adapter(wgpu::RequestAdapterError),
    /// An error in requesting the device.
    Device(wgpu::RequestDeviceError),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::Adapter(e) => write!(f, "Adapter error: {e}"),
            GpuError::Device(e) => write!(f, "Device error: {e}"),
        }
    }
}

impl std::error::Error for GpuError {}

/// The WGPU device and its queue.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device and queue.
    ///
    /// Blocks on the async WGPU calls with `pollster`.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .map_err(GpuError::Adapter)?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::Device)?;

        Ok(Self { device, queue })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Result<Arc<GpuContext>, String> = GpuContext::new()
        .map(Arc::new)
        .map_err(|e| e.to_string());
}

/// WGSL source that must define the compute entry point `entry`.
pub struct WgslSource<'a> {
    pub entry: &'a str,
    pub source: &'a str,
}

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.source;
        if src.len() > 65536 {
            return Err(ValidationError);
        }
        if !src.contains(&format!("fn {}(", self.entry)) {
            return Err(ValidationError);
        }
        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }
        Ok(())
    }
}

fn compile_error(kernel: &str, reason: impl Into<String>) -> DeviceError {
    DeviceError::Compile {
        kernel: kernel.to_string(),
        reason: reason.into(),
    }
}

/// Validates `source` and compiles it on `device`, surfacing WGSL errors.
pub fn load_shader(device: &wgpu::Device, entry: &str, source: &str) -> Result<wgpu::ShaderModule, DeviceError> {
    WgslSource { entry, source }
        .validate()
        .map_err(|_| compile_error(entry, format!("source does not define `fn {entry}` or failed validation")))?;

    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(entry),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    match pollster::block_on(device.pop_error_scope()) {
        Some(e) => Err(compile_error(entry, e.to_string())),
        None => Ok(module),
    }
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

/// A WGPU device. Only the default adapter is exposed, as device `0`.
pub struct WgpuDevice {
    id: usize,
    ctx: Arc<GpuContext>,
}

impl WgpuDevice {
    pub fn open(id: usize) -> Result<Self, DeviceError> {
        let unavailable = |reason: String| DeviceError::Unavailable {
            target: Target::Wgpu,
            id,
            reason,
        };
        if id != 0 {
            return Err(unavailable("only the default adapter (device 0) is exposed".into()));
        }
        let ctx = GPU_CONTEXT.as_ref().map_err(|e| unavailable(e.clone()))?;
        Ok(Self {
            id,
            ctx: Arc::clone(ctx),
        })
    }
}

impl Device for WgpuDevice {
    fn target(&self) -> Target {
        Target::Wgpu
    }

    fn id(&self) -> usize {
        self.id
    }

    fn build(&self, info: &KernelInfo) -> Result<Arc<dyn Program>, DeviceError> {
        let name = info.kernel_name.as_str();
        let not_found = || DeviceError::NotFound {
            file: info.kernel_file.clone(),
            kernel: name.to_string(),
        };
        let def = kernel_def(name).ok_or_else(not_found)?;
        let source = SHADERS
            .iter()
            .find(|(entry, _)| *entry == name)
            .map(|(_, src)| *src)
            .ok_or_else(not_found)?;
        let device = &self.ctx.device;
        let module = load_shader(device, name, source)?;

        let mut entries = Vec::new();
        for kind in def.signature {
            match kind {
                ArgKind::Input => entries.push(storage_entry(entries.len() as u32, true)),
                ArgKind::Output => entries.push(storage_entry(entries.len() as u32, false)),
                ArgKind::Int | ArgKind::Float => {}
            }
        }
        let has_scalars = def.signature.iter().any(|k| matches!(k, ArgKind::Int | ArgKind::Float));
        if has_scalars {
            entries.push(storage_entry(entries.len() as u32, true));
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(name),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(name),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            return Err(compile_error(name, e.to_string()));
        }
        log::debug!("built wgpu pipeline {}::{name}", info.kernel_file);

        Ok(Arc::new(WgpuProgram {
            ctx: Arc::clone(&self.ctx),
            name: name.to_string(),
            signature: def.signature,
            has_scalars,
            layout,
            pipeline,
        }))
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        self.ctx
            .device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| DeviceError::Sync(format!("{e:?}")))
    }
}

struct WgpuProgram {
    ctx: Arc<GpuContext>,
    name: String,
    signature: &'static [ArgKind],
    has_scalars: bool,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

fn storage_bytes(storage: &Storage) -> Vec<u8> {
    let mut bytes: Vec<u8> = match storage {
        Storage::F32(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
        Storage::I32(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
    };
    // zero-sized bindings are invalid
    if bytes.is_empty() {
        bytes.resize(4, 0);
    }
    bytes
}

fn read_back(storage: &mut Storage, bytes: &[u8]) {
    let words = bytes.chunks_exact(4).map(|c| {
        let mut w = [0u8; 4];
        w.copy_from_slice(c);
        w
    });
    match storage {
        Storage::F32(v) => v.iter_mut().zip(words).for_each(|(d, w)| *d = f32::from_ne_bytes(w)),
        Storage::I32(v) => v.iter_mut().zip(words).for_each(|(d, w)| *d = i32::from_ne_bytes(w)),
    }
}

impl WgpuProgram {
    fn enqueue_error(&self, reason: impl Into<String>) -> DeviceError {
        DeviceError::Enqueue {
            kernel: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn workgroups(&self, local: &[usize], global: &[usize]) -> Result<[u32; 3], DeviceError> {
        if local.iter().product::<usize>() != WORKGROUP_SIZE || local[0] != WORKGROUP_SIZE {
            return Err(self.enqueue_error(format!(
                "local size {local:?} does not match the shader workgroup size {WORKGROUP_SIZE}"
            )));
        }
        let limit = self.ctx.device.limits().max_compute_workgroups_per_dimension;
        let mut groups = [1u32; 3];
        for (i, (g, l)) in global.iter().zip(local).enumerate() {
            let n = u32::try_from(g / l)
                .ok()
                .filter(|&n| n <= limit)
                .ok_or_else(|| self.enqueue_error(format!("{} workgroups exceed the device limit {limit}", g / l)))?;
            groups[i] = n;
        }
        Ok(groups)
    }
}

impl Program for WgpuProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> &[ArgKind] {
        self.signature
    }

    fn enqueue(&self, args: &[KernelArg], local: &[usize], global: &[usize]) -> Result<(), DeviceError> {
        let groups = self.workgroups(local, global)?;
        let device = &self.ctx.device;

        let mut gpu_buffers = Vec::new();
        let mut outputs = Vec::new();
        let mut words: Vec<u32> = Vec::new();
        for (arg, kind) in args.iter().zip(self.signature) {
            match arg {
                KernelArg::Buffer(buffer) => {
                    let bytes = storage_bytes(&buffer.read());
                    let gpu = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(self.name.as_str()),
                        contents: &bytes,
                        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                    });
                    if *kind == ArgKind::Output {
                        outputs.push((gpu_buffers.len(), buffer.clone(), bytes.len() as u64));
                    }
                    gpu_buffers.push(gpu);
                }
                KernelArg::Int(v) => words.push(*v as u32),
                KernelArg::Float(v) => words.push(v.to_bits()),
            }
        }
        if self.has_scalars {
            if words.is_empty() {
                words.push(0);
            }
            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
            gpu_buffers.push(device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: &bytes,
                usage: wgpu::BufferUsages::STORAGE,
            }));
        }

        let entries: Vec<wgpu::BindGroupEntry<'_>> = gpu_buffers
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: b.as_entire_binding(),
            })
            .collect();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.name.as_str()),
            layout: &self.layout,
            entries: &entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(self.name.as_str()) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.name.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }

        let mut staging = Vec::with_capacity(outputs.len());
        for (index, buffer, size) in outputs {
            let stage = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("staging"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            encoder.copy_buffer_to_buffer(&gpu_buffers[index], 0, &stage, 0, size);
            staging.push((stage, buffer));
        }
        self.ctx.queue.submit(Some(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        for (i, (stage, _)) in staging.iter().enumerate() {
            let tx = tx.clone();
            stage
                .slice(..)
                .map_async(wgpu::MapMode::Read, move |result| drop(tx.send((i, result))));
        }
        drop(tx);
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| DeviceError::Sync(format!("{e:?}")))?;
        for (i, result) in rx.iter() {
            result.map_err(|e| self.enqueue_error(format!("failed to map output {i}: {e}")))?;
        }

        for (stage, buffer) in staging {
            {
                let data = stage.slice(..).get_mapped_range();
                read_back(&mut buffer.write(), &data);
            }
            stage.unmap();
        }
        Ok(())
    }
}
