//! Backend kernel implementations.
//!
//! Every operator has a parameter struct, a pure output-shape function and
//! one or more implementations of [`KernelImpl`]. The `Saber*` implementations
//! go through the device queue: `create` builds kernel handles from the
//! current shapes, `dispatch` only binds and launches. `Vender*`
//! implementations call straight into a library routine and exist where a
//! faster fixed path is available.
//!
//! This module also owns the kernel library: the host bodies and signatures
//! of every kernel the implementations ask for.

use crate::error::{SaberError, SaberResult};
use crate::kernel::{KernelArg, KernelDef, KernelHandle, KernelInfo, create_kernel, launch_kernel};
use crate::ops::OpContext;
use crate::tensors::Tensor;

pub mod conv_pool;
pub mod cos_sim;
pub mod data_norm;
pub mod elementwise;
pub mod gemm;
pub mod mat_mul;
pub mod permute;
pub mod reshape;
pub mod resize;
pub mod sequence_pool;
pub mod shuffle_channel;

/// Implementation family an operator may run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImplKind {
    /// Generic kernels through the device queue.
    #[default]
    Saber,
    /// Vendor or library routine.
    Vender,
}

impl ImplKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "saber" => Some(Self::Saber),
            "vender" | "vendor" => Some(Self::Vender),
            _ => None,
        }
    }
}

/// One backend implementation of an operator with parameter type `P`.
pub trait KernelImpl<P>: Send {
    /// First-time setup. Defaults to [`KernelImpl::create`].
    fn init(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &P, ctx: &OpContext) -> SaberResult<()> {
        self.create(inputs, outputs, param, ctx)
    }

    /// Builds shape-dependent resources: kernel handles, work sizes, scratch.
    fn create(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &P, ctx: &OpContext) -> SaberResult<()>;

    /// Binds the live buffers and launches. Never compiles.
    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &P, ctx: &OpContext) -> SaberResult<()>;
}

/// Every kernel known to the host device.
pub(crate) fn kernel_library() -> impl Iterator<Item = &'static KernelDef> {
    [
        conv_pool::KERNELS,
        cos_sim::KERNELS,
        data_norm::KERNELS,
        elementwise::KERNELS,
        gemm::KERNELS,
        mat_mul::KERNELS,
        permute::KERNELS,
        reshape::KERNELS,
        resize::KERNELS,
        sequence_pool::KERNELS,
        shuffle_channel::KERNELS,
    ]
    .into_iter()
    .flatten()
}

pub(crate) fn build(op: &'static str, ctx: &OpContext, info: &KernelInfo) -> SaberResult<KernelHandle> {
    create_kernel(&**ctx.device(), info).ok_or_else(|| SaberError::KernelCreate {
        op,
        kernel: info.kernel_name.clone(),
    })
}

pub(crate) fn bind(op: &'static str, kernel: &mut KernelHandle, args: Vec<KernelArg>) -> SaberResult<()> {
    if kernel.set_kernel_args(args) {
        Ok(())
    } else {
        Err(SaberError::ArgBinding {
            op,
            kernel: kernel.name().to_string(),
        })
    }
}

pub(crate) fn launch(op: &'static str, ctx: &OpContext, kernels: &[KernelHandle]) -> SaberResult<()> {
    if launch_kernel(ctx.stream(), kernels, ctx.sync()) {
        Ok(())
    } else {
        Err(SaberError::Launch { op })
    }
}

/// The handle built by `create`, or an error if `dispatch` ran first.
pub(crate) fn created<'a>(op: &'static str, kernel: &'a mut Option<KernelHandle>, name: &str) -> SaberResult<&'a mut KernelHandle> {
    kernel.as_mut().ok_or_else(|| SaberError::KernelCreate {
        op,
        kernel: name.to_string(),
    })
}
