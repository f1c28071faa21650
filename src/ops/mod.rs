//! # Operators
//!
//! An [`Operator`] wraps one graph node. It owns an [`OperatorHelper`] and
//! drives it through a fixed lifecycle:
//!
//! 1. [`Operator::init_param`] reads the node's parameters into a typed,
//!    validated Param object.
//! 2. [`Operator::infer_shape`] sets output shapes, layouts and sequence
//!    offsets. It is pure: calling it twice gives the same result.
//! 3. [`Operator::init`] picks an implementation, runs any one-time weight
//!    transform and builds the kernel handles for the current shapes.
//! 4. [`Operator::forward`] binds the live buffers and launches. It never
//!    compiles anything.
//!
//! Calling a step out of order, or forwarding with shapes other than the ones
//! `init` saw, is a programming error and panics. Device failures come back as
//! [`SaberError`](crate::error::SaberError).
//!
//! ## Submodules
//!
//! - [`factory`]: registry of operators per `(precision, target)`
//! - one module per operator with its parameter parsing and implementations
//!
//! ## Example
//!
//! ```rust
//! use saber_rt::backend::{Precision, Target};
//! use saber_rt::ops::{factory, OpContext};
//! use saber_rt::params::ParamStore;
//! use saber_rt::tensors::{Layout, Tensor};
//!
//! let ctx = OpContext::new(Target::Host, 0).unwrap();
//! let mut op = factory::create("SoftSign", Precision::Fp32, Target::Host);
//! let x = [Tensor::from_vec([4], Layout::W, vec![-3.0, -1.0, 0.0, 1.0])];
//! let mut y = [Tensor::default()];
//!
//! op.init_param(&ParamStore::new("soft_sign_0"));
//! op.infer_shape(&x, &mut y);
//! op.init(&ctx, &x, &mut y).unwrap();
//! op.forward(&ctx, &x, &mut y).unwrap();
//! assert_eq!(y[0].to_vec(), vec![-0.75, -0.5, 0.0, 0.5]);
//! ```

use std::fmt;
use std::sync::Arc;

use briny::prelude::{TrustedData, Validate};

use crate::backend::{Precision, Target, default_target};
use crate::config::{GemmPolicy, RuntimeConfig};
use crate::error::{DeviceError, SaberError, SaberResult};
use crate::funcs::{ImplKind, KernelImpl};
use crate::kernel::{Device, Stream, open_device, profiler};
use crate::params::ParamStore;
use crate::tensors::{Layout, Shape, Tensor};

pub mod activation;
pub mod conv_relu_pool;
pub mod cos_sim;
pub mod data_norm;
pub mod factory;
pub mod mat_mul;
pub mod pixel_shuffle;
pub mod reshape;
pub mod resize;
pub mod sequence_pool;
pub mod sequence_pool_concat;
pub mod shuffle_channel;

/// Everything an operator needs to run on one device.
#[derive(Debug, Clone)]
pub struct OpContext {
    stream: Stream,
    impl_kind: ImplKind,
    gemm: GemmPolicy,
    sync: bool,
}

impl OpContext {
    /// Opens device `device_id` of `target`. Launches are synchronous while
    /// the profiler is recording.
    pub fn new(target: Target, device_id: usize) -> Result<Self, DeviceError> {
        let device = open_device(target, device_id)?;
        Ok(Self::from_stream(Stream::new(device)))
    }

    /// Wraps an existing stream, for devices opened outside [`open_device`].
    pub fn from_stream(stream: Stream) -> Self {
        Self {
            stream,
            impl_kind: ImplKind::Saber,
            gemm: GemmPolicy::default(),
            sync: profiler::is_recording(),
        }
    }

    /// Same as [`OpContext::new`] on the process default target.
    pub fn with_default_target(device_id: usize) -> Result<Self, DeviceError> {
        Self::new(default_target(), device_id)
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Result<Self, DeviceError> {
        Ok(Self::new(cfg.target, cfg.device_id)?
            .with_impl(cfg.impl_kind)
            .with_gemm_policy(cfg.gemm)
            .with_sync(cfg.profile))
    }

    /// Implementation family helpers should prefer.
    pub fn with_impl(mut self, kind: ImplKind) -> Self {
        self.impl_kind = kind;
        self
    }

    pub fn with_gemm_policy(mut self, gemm: GemmPolicy) -> Self {
        self.gemm = gemm;
        self
    }

    /// Wait for every kernel to finish before launching the next.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn target(&self) -> Target {
        self.stream.device().target()
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        self.stream.device()
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn impl_kind(&self) -> ImplKind {
        self.impl_kind
    }

    pub fn gemm_policy(&self) -> &GemmPolicy {
        &self.gemm
    }

    pub fn sync(&self) -> bool {
        self.sync
    }
}

/// Per-node logic behind an [`Operator`].
pub trait OperatorHelper: Send {
    /// Builds the Param object. Panics on missing or inconsistent parameters.
    fn init_param(&mut self, store: &ParamStore);

    /// Sets output shapes, layouts and offsets. Panics on shape violations.
    fn infer_shape(&self, inputs: &[Tensor], outputs: &mut [Tensor]);

    fn init(&mut self, ctx: &OpContext, inputs: &[Tensor], outputs: &mut [Tensor]) -> SaberResult<()>;

    fn dispatch(&mut self, ctx: &OpContext, inputs: &[Tensor], outputs: &mut [Tensor]) -> SaberResult<()>;
}

/// Lifecycle position of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum HelperState {
    #[default]
    Unparsed,
    ParamParsed,
    ShapeKnown,
    Initialized,
}

fn shapes_of(tensors: &[Tensor]) -> Vec<(Shape, Layout)> {
    tensors.iter().map(|t| (t.shape().clone(), t.layout())).collect()
}

/// One graph node: a helper plus the lifecycle guards around it.
pub struct Operator {
    name: &'static str,
    target: Target,
    precision: Precision,
    state: HelperState,
    helper: Box<dyn OperatorHelper>,
    init_shapes: Option<Vec<(Shape, Layout)>>,
}

impl Operator {
    pub fn new(name: &'static str, target: Target, precision: Precision, helper: Box<dyn OperatorHelper>) -> Self {
        Self {
            name,
            target,
            precision,
            state: HelperState::Unparsed,
            helper,
            init_shapes: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn state(&self) -> HelperState {
        self.state
    }

    /// Parses parameters. Re-parsing drops any earlier initialization.
    pub fn init_param(&mut self, store: &ParamStore) {
        self.helper.init_param(store);
        self.state = HelperState::ParamParsed;
        self.init_shapes = None;
    }

    /// Infers output shapes. With input shapes or layouts other than the ones
    /// the last `init` saw, the operator drops back to [`HelperState::ShapeKnown`].
    pub fn infer_shape(&mut self, inputs: &[Tensor], outputs: &mut [Tensor]) {
        assert!(
            self.state >= HelperState::ParamParsed,
            "{}: infer_shape called before init_param",
            self.name
        );
        self.helper.infer_shape(inputs, outputs);
        let unchanged = self.init_shapes.as_deref() == Some(&shapes_of(inputs)[..]);
        if !(self.state == HelperState::Initialized && unchanged) {
            self.state = HelperState::ShapeKnown;
        }
    }

    pub fn init(&mut self, ctx: &OpContext, inputs: &[Tensor], outputs: &mut [Tensor]) -> SaberResult<()> {
        assert!(
            self.state >= HelperState::ShapeKnown,
            "{}: init called before infer_shape",
            self.name
        );
        assert_eq!(
            ctx.target(),
            self.target,
            "{}: context runs on {} but the operator was created for {}",
            self.name,
            ctx.target(),
            self.target
        );
        self.helper.init(ctx, inputs, outputs)?;
        self.init_shapes = Some(shapes_of(inputs));
        self.state = HelperState::Initialized;
        Ok(())
    }

    pub fn forward(&mut self, ctx: &OpContext, inputs: &[Tensor], outputs: &mut [Tensor]) -> SaberResult<()> {
        assert_eq!(
            self.state,
            HelperState::Initialized,
            "{}: forward called before init",
            self.name
        );
        let shapes = shapes_of(inputs);
        if let Some(seen) = &self.init_shapes {
            assert!(
                *seen == shapes,
                "{}: input shapes changed since init ({:?} -> {:?}); run infer_shape and init again",
                self.name,
                seen,
                shapes
            );
        }
        self.helper.dispatch(ctx, inputs, outputs)
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("precision", &self.precision)
            .field("state", &self.state)
            .finish()
    }
}

/// Static description of an operator built from a [`KernelImpl`] family.
pub trait OpDef: Send + 'static {
    const NAME: &'static str;
    type Param: Validate + Send + 'static;

    /// Reads the Param object. Panics on missing or mistyped parameters.
    fn parse(store: &ParamStore) -> Self::Param;

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &Self::Param);

    /// Implementation of `kind` on `target`, if one exists.
    fn make_impl(kind: ImplKind, target: Target) -> Option<Box<dyn KernelImpl<Self::Param>>>;

    /// Runs before the implementation's `init`.
    fn prepare(_param: &Self::Param) {}
}

/// The [`OperatorHelper`] every operator in this crate uses.
pub struct FuncHelper<D: OpDef> {
    param: Option<D::Param>,
    imp: Option<(ImplKind, Box<dyn KernelImpl<D::Param>>)>,
}

impl<D: OpDef> Default for FuncHelper<D> {
    fn default() -> Self {
        Self { param: None, imp: None }
    }
}

impl<D: OpDef> FuncHelper<D> {
    pub fn boxed() -> Box<dyn OperatorHelper> {
        Box::new(Self::default())
    }

    pub fn param(&self) -> Option<&D::Param> {
        self.param.as_ref()
    }

    fn parsed(&self) -> &D::Param {
        match &self.param {
            Some(p) => p,
            None => panic!("{}: parameters were not parsed", D::NAME),
        }
    }

    /// Requested kind if available, else `Saber`.
    fn select(ctx: &OpContext) -> SaberResult<(ImplKind, Box<dyn KernelImpl<D::Param>>)> {
        let wanted = ctx.impl_kind();
        if let Some(imp) = D::make_impl(wanted, ctx.target()) {
            return Ok((wanted, imp));
        }
        if wanted != ImplKind::Saber {
            log::debug!(
                "{}: no {wanted:?} implementation on {}, falling back to Saber",
                D::NAME,
                ctx.target()
            );
            if let Some(imp) = D::make_impl(ImplKind::Saber, ctx.target()) {
                return Ok((ImplKind::Saber, imp));
            }
        }
        Err(SaberError::Unimplemented {
            op: D::NAME,
            target: ctx.target(),
        })
    }
}

impl<D: OpDef> OperatorHelper for FuncHelper<D> {
    fn init_param(&mut self, store: &ParamStore) {
        let param = match TrustedData::new(D::parse(store)) {
            Ok(trusted) => trusted.into_inner(),
            Err(_) => panic!("invalid parameters for {} node `{}`", D::NAME, store.node()),
        };
        self.param = Some(param);
        self.imp = None;
    }

    fn infer_shape(&self, inputs: &[Tensor], outputs: &mut [Tensor]) {
        assert!(!outputs.is_empty(), "{}: no output tensor", D::NAME);
        D::infer_shape(inputs, outputs, self.parsed());
    }

    fn init(&mut self, ctx: &OpContext, inputs: &[Tensor], outputs: &mut [Tensor]) -> SaberResult<()> {
        let param = match &self.param {
            Some(p) => p,
            None => panic!("{}: parameters were not parsed", D::NAME),
        };
        D::prepare(param);
        let (kind, mut imp) = match self.imp.take() {
            Some((kind, imp)) if kind == ctx.impl_kind() || D::make_impl(ctx.impl_kind(), ctx.target()).is_none() => {
                (kind, imp)
            }
            _ => Self::select(ctx)?,
        };
        imp.init(inputs, outputs, param, ctx)?;
        self.imp = Some((kind, imp));
        Ok(())
    }

    fn dispatch(&mut self, ctx: &OpContext, inputs: &[Tensor], outputs: &mut [Tensor]) -> SaberResult<()> {
        let param = match &self.param {
            Some(p) => p,
            None => panic!("{}: parameters were not parsed", D::NAME),
        };
        match &mut self.imp {
            Some((_, imp)) => imp.dispatch(inputs, outputs, param, ctx),
            None => panic!("{}: dispatch before init", D::NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Layout;

    fn soft_sign() -> Operator {
        factory::create("SoftSign", Precision::Fp32, Target::Host)
    }

    #[test]
    fn lifecycle_states() {
        let ctx = OpContext::new(Target::Host, 0).unwrap();
        let mut op = soft_sign();
        assert_eq!(op.state(), HelperState::Unparsed);
        op.init_param(&ParamStore::new("s"));
        assert_eq!(op.state(), HelperState::ParamParsed);

        let x = [Tensor::new([2, 3], Layout::Hw)];
        let mut y = [Tensor::default()];
        op.infer_shape(&x, &mut y);
        assert_eq!(op.state(), HelperState::ShapeKnown);
        op.init(&ctx, &x, &mut y).unwrap();
        assert_eq!(op.state(), HelperState::Initialized);

        // same shapes keep the operator initialized
        op.infer_shape(&x, &mut y);
        assert_eq!(op.state(), HelperState::Initialized);

        let bigger = [Tensor::new([4, 3], Layout::Hw)];
        op.infer_shape(&bigger, &mut y);
        assert_eq!(op.state(), HelperState::ShapeKnown);
    }

    #[test]
    fn layout_change_needs_init() {
        let ctx = OpContext::new(Target::Host, 0).unwrap();
        let mut op = soft_sign();
        op.init_param(&ParamStore::new("s"));
        let x = [Tensor::new([2, 3], Layout::Hw)];
        let mut y = [Tensor::default()];
        op.infer_shape(&x, &mut y);
        op.init(&ctx, &x, &mut y).unwrap();

        // same dims, different layout
        let relabeled = [Tensor::new([2, 3], Layout::Nc)];
        op.infer_shape(&relabeled, &mut y);
        assert_eq!(op.state(), HelperState::ShapeKnown);
        let forwarded = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            op.forward(&ctx, &relabeled, &mut y)
        }));
        assert!(forwarded.is_err());
    }

    #[test]
    #[should_panic(expected = "init called before infer_shape")]
    fn init_requires_shapes() {
        let ctx = OpContext::new(Target::Host, 0).unwrap();
        let mut op = soft_sign();
        op.init_param(&ParamStore::new("s"));
        op.init(&ctx, &[Tensor::default()], &mut [Tensor::default()]).unwrap();
    }

    #[test]
    #[should_panic(expected = "input shapes changed since init")]
    fn forward_rejects_new_shapes() {
        let ctx = OpContext::new(Target::Host, 0).unwrap();
        let mut op = soft_sign();
        op.init_param(&ParamStore::new("s"));
        let x = [Tensor::new([2, 3], Layout::Hw)];
        let mut y = [Tensor::default()];
        op.infer_shape(&x, &mut y);
        op.init(&ctx, &x, &mut y).unwrap();
        op.forward(&ctx, &[Tensor::new([3, 3], Layout::Hw)], &mut y).unwrap();
    }

    #[test]
    fn context_builders() {
        let ctx = OpContext::new(Target::Host, 1)
            .unwrap()
            .with_impl(ImplKind::Vender)
            .with_sync(true);
        assert_eq!(ctx.target(), Target::Host);
        assert_eq!(ctx.device().id(), 1);
        assert_eq!(ctx.impl_kind(), ImplKind::Vender);
        assert!(ctx.sync());
        assert_eq!(*ctx.gemm_policy(), GemmPolicy::default());
    }
}
