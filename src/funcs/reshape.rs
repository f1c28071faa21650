//! Reshape: same data, new shape and layout.
//!
//! A `0` in `dims` keeps the input dimension at that position, a single `-1`
//! is inferred from the element count. Sequence offsets are copied verbatim
//! when the batch survives the reshape and dropped otherwise.

use briny::prelude::{Validate, ValidationError};
use rayon::prelude::*;

use super::{KernelImpl, bind, build, created, launch};
use crate::error::{DeviceError, SaberResult};
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, KernelArg, KernelDef, KernelHandle, KernelInfo, int_arg};
use crate::ops::OpContext;
use crate::tensors::{Layout, Tensor};

const OP: &str = "Reshape";
const KERNEL: &str = "ker_copy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshapeParam {
    pub dims: Vec<i32>,
    pub layout: Option<Layout>,
}

impl ReshapeParam {
    /// Explicit layout, or `NCHW` for four dimensions.
    ///
    /// # Panics
    /// Panics when no layout is given and the rank is not 4.
    pub fn resolved_layout(&self) -> Layout {
        match self.layout {
            Some(layout) => layout,
            None if self.dims.len() == 4 => Layout::Nchw,
            None => panic!(
                "The layout is required when the shape is not equal to 4 (got {} dims)",
                self.dims.len()
            ),
        }
    }
}

impl Validate for ReshapeParam {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.dims.is_empty() || self.dims.iter().any(|&d| d < -1) {
            return Err(ValidationError);
        }
        if self.dims.iter().filter(|&&d| d == -1).count() > 1 {
            return Err(ValidationError);
        }
        if let Some(layout) = self.layout {
            if layout.rank() != self.dims.len() {
                return Err(ValidationError);
            }
        }
        Ok(())
    }
}

/// Resolves `0` and `-1` entries against the input shape.
///
/// # Panics
/// Panics if the element counts cannot match.
pub fn resolve_dims(input: &[usize], dims: &[i32]) -> Vec<usize> {
    let count: usize = input.iter().product();
    let mut out = Vec::with_capacity(dims.len());
    let mut infer = None;
    for (i, &d) in dims.iter().enumerate() {
        match d {
            0 => out.push(*input.get(i).unwrap_or_else(|| {
                panic!("Reshape: dim {i} copies the input but the input has {} dims", input.len())
            })),
            -1 => {
                infer = Some(i);
                out.push(1);
            }
            d => out.push(d as usize),
        }
    }
    let known: usize = out.iter().product();
    if let Some(i) = infer {
        assert!(
            known != 0 && count % known == 0,
            "Reshape: cannot infer dim {i} of {dims:?} from {count} elements"
        );
        out[i] = count / known;
    }
    assert_eq!(
        out.iter().product::<usize>(),
        count,
        "Reshape: {dims:?} does not hold {count} elements of input {input:?}"
    );
    out
}

pub fn compute_output_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &ReshapeParam) {
    assert_eq!(inputs.len(), 1, "Reshape takes exactly one input, got {}", inputs.len());
    let x = &inputs[0];
    let shape = resolve_dims(x.shape().dims(), &param.dims);
    outputs[0].set_shape(shape, param.resolved_layout());
    // Offsets index the batch, so they only survive a reshape that keeps it.
    let offsets = if outputs[0].num() == x.num() { x.seq_offset().to_vec() } else { Vec::new() };
    outputs[0].set_seq_offset(offsets);
}

#[derive(Debug, Default)]
pub struct SaberReshape {
    kernel: Option<KernelHandle>,
}

impl KernelImpl<ReshapeParam> for SaberReshape {
    fn create(&mut self, inputs: &[Tensor], _outputs: &mut [Tensor], _param: &ReshapeParam, ctx: &OpContext) -> SaberResult<()> {
        let info = KernelInfo::new("Copy", KERNEL).with_count(inputs[0].valid_size());
        self.kernel = Some(build(OP, ctx, &info)?);
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], _param: &ReshapeParam, ctx: &OpContext) -> SaberResult<()> {
        // an output already viewing the input storage needs no copy
        if outputs[0].buffer().same(inputs[0].buffer()) {
            return Ok(());
        }
        let args: Vec<KernelArg> = vec![
            (&outputs[0]).into(),
            (&inputs[0]).into(),
            int_arg(inputs[0].valid_size()),
        ];
        let kernel = created(OP, &mut self.kernel, KERNEL)?;
        bind(OP, kernel, args)?;
        launch(OP, ctx, std::slice::from_ref(kernel))
    }
}

pub(crate) static KERNELS: &[KernelDef] = &[KernelDef {
    name: KERNEL,
    signature: &[ArgKind::Output, ArgKind::Input, ArgKind::Int],
    host: copy_host,
}];

fn copy_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let count = args.size(2)?;
    let input = args.buffer(1)?.read();
    let mut output = args.buffer(0)?.write();
    let x = args.f32s(&input, count)?;
    let y = args.f32s_mut(&mut output, count)?;
    y.par_iter_mut().zip(x.par_iter()).for_each(|(d, s)| *d = *s);
    Ok(())
}
