//! Kernel handles and the launcher.
//!
//! A backend implementation describes each kernel it needs with a
//! [`KernelInfo`], turns it into a [`KernelHandle`] once with
//! [`create_kernel`], and on every dispatch only rebinds arguments and work
//! sizes before calling [`launch_kernel`]. Compiled programs are cached
//! process-wide, so helpers that ask for the same kernel on the same device
//! share one program object.
//!
//! Devices are reached through the [`Device`] and [`Program`] traits. The
//! host device (always available) runs the kernel bodies registered in the
//! kernel library; the `wgpu` device (feature `wgpu`) compiles WGSL.
//!
//! Failures at this level are logged where they happen and reported as
//! `false`/`None`; the operator layer turns them into errors.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::Target;
use crate::error::DeviceError;
use crate::tensors::{Buffer, Storage, Tensor};

pub mod host;
pub mod profiler;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use profiler::Event;

/// Default local work size, one dimension.
pub const DEFAULT_LOCAL_SIZE: usize = 256;

/// Kind of one positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Buffer the kernel only reads.
    Input,
    /// Buffer the kernel writes.
    Output,
    Int,
    Float,
}

/// A bound kernel argument.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Buffer(Buffer),
    Int(i32),
    Float(f32),
}

impl KernelArg {
    fn fits(&self, kind: ArgKind) -> bool {
        matches!(
            (self, kind),
            (Self::Buffer(_), ArgKind::Input | ArgKind::Output)
                | (Self::Int(_), ArgKind::Int)
                | (Self::Float(_), ArgKind::Float)
        )
    }
}

impl From<&Tensor> for KernelArg {
    fn from(t: &Tensor) -> Self {
        Self::Buffer(t.buffer().clone())
    }
}

impl From<&Buffer> for KernelArg {
    fn from(b: &Buffer) -> Self {
        Self::Buffer(b.clone())
    }
}

impl From<i32> for KernelArg {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for KernelArg {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

/// Converts a size into an `Int` argument. Sizes beyond `i32::MAX` saturate
/// and are caught by the kernel's own bounds checks.
pub fn int_arg(v: usize) -> KernelArg {
    KernelArg::Int(i32::try_from(v).unwrap_or(i32::MAX))
}

/// Rounds `n` up to the next multiple of `m`.
pub const fn round_up(n: usize, m: usize) -> usize {
    n.div_ceil(m) * m
}

/// Everything needed to build a kernel and its default geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    /// Program unit the entry point lives in.
    pub kernel_file: String,
    /// Entry point.
    pub kernel_name: String,
    /// Build options, part of the program cache key.
    pub comp_options: String,
    pub wk_dim: usize,
    pub l_wk: Vec<usize>,
    pub g_wk: Vec<usize>,
}

impl KernelInfo {
    pub fn new(file: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kernel_file: file.into(),
            kernel_name: name.into(),
            comp_options: String::new(),
            wk_dim: 1,
            l_wk: vec![DEFAULT_LOCAL_SIZE],
            g_wk: vec![DEFAULT_LOCAL_SIZE],
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.comp_options = options.into();
        self
    }

    /// Sets the geometry. Every global dimension is rounded up to a multiple
    /// of the matching local dimension.
    pub fn with_work(mut self, local: &[usize], global: &[usize]) -> Self {
        assert_eq!(local.len(), global.len(), "work size dimensions differ");
        self.wk_dim = local.len();
        self.l_wk = local.to_vec();
        self.g_wk = global
            .iter()
            .zip(local)
            .map(|(&g, &l)| round_up(g.max(1), l))
            .collect();
        self
    }

    /// One-dimensional geometry covering `count` items with the default local size.
    pub fn with_count(self, count: usize) -> Self {
        self.with_work(&[DEFAULT_LOCAL_SIZE], &[count])
    }
}

/// Static description of one kernel in the library: its signature and the
/// host body. Device adapters take the signature from here as well.
pub struct KernelDef {
    pub name: &'static str,
    pub signature: &'static [ArgKind],
    pub host: host::HostKernelFn,
}

impl fmt::Debug for KernelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDef")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

lazy_static::lazy_static! {
    static ref KERNEL_LIBRARY: HashMap<&'static str, &'static KernelDef> = crate::funcs::kernel_library()
        .map(|def| (def.name, def))
        .collect();
}

/// Looks up a kernel by entry-point name.
pub fn kernel_def(name: &str) -> Option<&'static KernelDef> {
    KERNEL_LIBRARY.get(name).copied()
}

/// A built kernel on one device.
pub trait Program: Send + Sync {
    fn name(&self) -> &str;

    fn signature(&self) -> &[ArgKind];

    /// Submits one launch to the device queue.
    fn enqueue(&self, args: &[KernelArg], local: &[usize], global: &[usize]) -> Result<(), DeviceError>;
}

/// A compute device with one in-order queue.
pub trait Device: Send + Sync {
    fn target(&self) -> Target;

    fn id(&self) -> usize;

    fn build(&self, info: &KernelInfo) -> Result<Arc<dyn Program>, DeviceError>;

    /// Blocks until all submitted work has completed.
    fn synchronize(&self) -> Result<(), DeviceError>;

    /// Blocking host to device copy.
    fn copy_from_host(&self, dst: &Buffer, src: Storage) -> Result<(), DeviceError> {
        self.synchronize()?;
        *dst.write() = src;
        Ok(())
    }
}

/// Opens (or reuses) the device `id` of `target`.
pub fn open_device(target: Target, id: usize) -> Result<Arc<dyn Device>, DeviceError> {
    match target {
        Target::Host => Ok(Arc::new(host::HostDevice::new(id))),
        #[cfg(feature = "wgpu")]
        Target::Wgpu => Ok(Arc::new(wgpu::WgpuDevice::open(id)?)),
        #[cfg(not(feature = "wgpu"))]
        Target::Wgpu => Err(DeviceError::Unavailable {
            target,
            id,
            reason: "built without the `wgpu` feature".into(),
        }),
    }
}

/// The in-order queue of a device.
#[derive(Clone)]
pub struct Stream {
    device: Arc<dyn Device>,
}

impl Stream {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn synchronize(&self) -> Result<(), DeviceError> {
        self.device.synchronize()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("target", &self.device.target())
            .field("device", &self.device.id())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    target: Target,
    device: usize,
    file: String,
    name: String,
    options: String,
}

lazy_static::lazy_static! {
    static ref PROGRAM_CACHE: Mutex<HashMap<ProgramKey, Arc<dyn Program>>> = Mutex::new(HashMap::new());
}

/// Number of programs built so far, across all devices.
pub fn cached_programs() -> usize {
    PROGRAM_CACHE.lock().unwrap_or_else(PoisonError::into_inner).len()
}

/// Builds (or fetches from the cache) the kernel described by `info` for
/// `device`. Logs and returns `None` if the device cannot build it.
pub fn create_kernel(device: &dyn Device, info: &KernelInfo) -> Option<KernelHandle> {
    let key = ProgramKey {
        target: device.target(),
        device: device.id(),
        file: info.kernel_file.clone(),
        name: info.kernel_name.clone(),
        options: info.comp_options.clone(),
    };
    let mut cache = PROGRAM_CACHE.lock().unwrap_or_else(PoisonError::into_inner);
    let program = match cache.get(&key) {
        Some(p) => Arc::clone(p),
        None => match device.build(info) {
            Ok(p) => {
                cache.insert(key, Arc::clone(&p));
                p
            }
            Err(e) => {
                log::error!(
                    "Failed to load program {}::{} on {} #{}: {e}",
                    info.kernel_file,
                    info.kernel_name,
                    device.target(),
                    device.id()
                );
                return None;
            }
        },
    };
    Some(KernelHandle {
        local: info.l_wk.clone(),
        global: info.g_wk.clone(),
        info: info.clone(),
        program,
        args: Vec::new(),
    })
}

/// A program bound to arguments and geometry, ready to launch.
pub struct KernelHandle {
    info: KernelInfo,
    program: Arc<dyn Program>,
    args: Vec<KernelArg>,
    local: Vec<usize>,
    global: Vec<usize>,
}

impl KernelHandle {
    pub fn name(&self) -> &str {
        &self.info.kernel_name
    }

    pub fn info(&self) -> &KernelInfo {
        &self.info
    }

    /// True when both handles were built from the same cached program.
    pub fn shares_program(&self, other: &KernelHandle) -> bool {
        Arc::ptr_eq(&self.program, &other.program)
    }

    /// Binds positional arguments, replacing any previous binding.
    ///
    /// Rejects the binding (logging why) if the count or kinds do not match
    /// the kernel signature, or if a written buffer is also bound elsewhere.
    pub fn set_kernel_args(&mut self, args: Vec<KernelArg>) -> bool {
        match check_args(self.program.signature(), &args) {
            Ok(()) => {
                self.args = args;
                true
            }
            Err(reason) => {
                log::error!("Failed to set arguments of kernel {}: {reason}", self.name());
                false
            }
        }
    }

    pub fn set_local_work_size(&mut self, local: &[usize]) -> bool {
        match check_work_size(local) {
            Ok(()) => {
                self.local = local.to_vec();
                true
            }
            Err(reason) => {
                log::error!("Invalid local work size for {}: {reason}", self.name());
                false
            }
        }
    }

    pub fn set_global_work_size(&mut self, global: &[usize]) -> bool {
        match check_work_size(global) {
            Ok(()) => {
                self.global = global.to_vec();
                true
            }
            Err(reason) => {
                log::error!("Invalid global work size for {}: {reason}", self.name());
                false
            }
        }
    }

    fn invoke(&self) -> Result<(), DeviceError> {
        if self.args.len() != self.program.signature().len() {
            return Err(DeviceError::Args {
                kernel: self.name().to_string(),
                reason: "arguments were not bound".into(),
            });
        }
        if self.local.len() != self.global.len() {
            return Err(DeviceError::Enqueue {
                kernel: self.name().to_string(),
                reason: format!("local {:?} and global {:?} differ in rank", self.local, self.global),
            });
        }
        if let Some((g, l)) = self.global.iter().zip(&self.local).find(|(g, l)| *g % *l != 0) {
            return Err(DeviceError::Enqueue {
                kernel: self.name().to_string(),
                reason: format!("global size {g} is not a multiple of local size {l}"),
            });
        }
        self.program.enqueue(&self.args, &self.local, &self.global)
    }
}

impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHandle")
            .field("kernel", &self.info.kernel_name)
            .field("local", &self.local)
            .field("global", &self.global)
            .field("bound", &self.args.len())
            .finish()
    }
}

fn check_work_size(dims: &[usize]) -> Result<(), String> {
    if dims.is_empty() || dims.len() > 3 {
        return Err(format!("{} dimensions, expected 1 to 3", dims.len()));
    }
    if dims.contains(&0) {
        return Err(format!("zero-sized dimension in {dims:?}"));
    }
    Ok(())
}

fn check_args(signature: &[ArgKind], args: &[KernelArg]) -> Result<(), String> {
    if signature.len() != args.len() {
        return Err(format!("expected {} arguments, got {}", signature.len(), args.len()));
    }
    for (i, (arg, kind)) in args.iter().zip(signature).enumerate() {
        if !arg.fits(*kind) {
            return Err(format!("argument {i} is not {kind:?}"));
        }
    }
    for (i, kind) in signature.iter().enumerate() {
        let (ArgKind::Output, KernelArg::Buffer(out)) = (kind, &args[i]) else {
            continue;
        };
        let aliased = args
            .iter()
            .enumerate()
            .any(|(j, a)| j != i && matches!(a, KernelArg::Buffer(b) if b.same(out)));
        if aliased {
            return Err(format!("output argument {i} aliases another argument"));
        }
    }
    Ok(())
}

/// Launches `kernels` in order on `stream`.
///
/// With `sync` set, waits for each kernel and logs its duration. When the
/// profiler is recording, the launch events are handed to it. Stops at the
/// first failure and returns `false`; nothing is retried.
pub fn launch_kernel(stream: &Stream, kernels: &[KernelHandle], sync: bool) -> bool {
    let record = profiler::is_recording();
    let mut events = Vec::new();
    for kernel in kernels {
        let mut event = Event::begin(kernel.name());
        if let Err(e) = kernel.invoke() {
            log::error!("Failed to launch kernel {}: {e}", kernel.name());
            return false;
        }
        if sync {
            if let Err(e) = stream.synchronize() {
                log::error!("Failed to wait for kernel {}: {e}", kernel.name());
                return false;
            }
            event.complete();
            if let Some(ms) = event.elapsed_ms() {
                log::debug!("kernel {} finished in {ms:.3} ms", kernel.name());
            }
        }
        if record {
            events.push(event);
        }
    }
    if record {
        profiler::add_events(events);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::{Layout, Tensor};

    fn host() -> Arc<dyn Device> {
        open_device(Target::Host, 0).unwrap()
    }

    #[test]
    fn geometry_rounds_up() {
        let info = KernelInfo::new("SoftSign", "ker_soft_sign_fwd").with_count(300);
        assert_eq!(info.l_wk, vec![256]);
        assert_eq!(info.g_wk, vec![512]);
        assert_eq!(round_up(512, 256), 512);
    }

    #[test]
    fn unknown_kernel_yields_none() {
        let info = KernelInfo::new("Nope", "ker_does_not_exist");
        assert!(create_kernel(&*host(), &info).is_none());
    }

    #[test]
    fn programs_are_cached() {
        let dev = host();
        let info = KernelInfo::new("SoftSign", "ker_soft_sign_fwd");
        let a = create_kernel(&*dev, &info).unwrap();
        let b = create_kernel(&*dev, &info).unwrap();
        assert!(a.shares_program(&b));
        let c = create_kernel(&*dev, &info.clone().with_options("-DVARIANT=1")).unwrap();
        assert!(!a.shares_program(&c));
    }

    #[test]
    fn argument_checks() {
        let dev = host();
        let mut k = create_kernel(&*dev, &KernelInfo::new("SoftSign", "ker_soft_sign_fwd")).unwrap();
        let x = Tensor::new([4], Layout::W);
        let y = Tensor::new([4], Layout::W);
        assert!(!k.set_kernel_args(vec![(&y).into(), (&x).into()]));
        assert!(!k.set_kernel_args(vec![(&y).into(), 4i32.into(), (&x).into()]));
        assert!(!k.set_kernel_args(vec![(&x).into(), (&x).into(), 4i32.into()]));
        assert!(k.set_kernel_args(vec![(&y).into(), (&x).into(), 4i32.into()]));
        assert!(!k.set_local_work_size(&[]));
        assert!(!k.set_global_work_size(&[0]));
    }

    #[test]
    fn launch_runs_in_order_and_reports_failure() {
        let stream = Stream::new(host());
        let x = Tensor::from_vec([3], Layout::W, vec![-1.0, 0.0, 3.0]);
        let y = Tensor::new([3], Layout::W);
        let info = KernelInfo::new("SoftSign", "ker_soft_sign_fwd").with_count(3);
        let mut k = create_kernel(&**stream.device(), &info).unwrap();
        assert!(k.set_kernel_args(vec![(&y).into(), (&x).into(), 3i32.into()]));
        assert!(launch_kernel(&stream, std::slice::from_ref(&k), true));
        assert_eq!(y.to_vec(), vec![-0.5, 0.0, 0.75]);

        let unbound = create_kernel(&**stream.device(), &info).unwrap();
        assert!(!launch_kernel(&stream, &[unbound], false));

        assert!(k.set_global_work_size(&[100]));
        assert!(!launch_kernel(&stream, &[k], false));
    }
}
