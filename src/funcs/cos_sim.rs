//! Row-wise cosine similarity of two equally shaped inputs.

use briny::prelude::{Validate, ValidationError};
use rayon::prelude::*;

use super::{KernelImpl, bind, build, created, launch};
use crate::error::{DeviceError, SaberResult};
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, DEFAULT_LOCAL_SIZE, KernelArg, KernelDef, KernelHandle, KernelInfo, int_arg};
use crate::ops::OpContext;
use crate::tensors::{Layout, Tensor};

const OP: &str = "CosSim";
const KERNEL: &str = "ker_cos_sim_fwd";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosSimParam {
    /// Rows whose squared norms multiply to at most this produce 0.
    pub epsilon: f32,
}

impl Validate for CosSimParam {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.epsilon.is_finite() && self.epsilon >= 0.0 {
            Ok(())
        } else {
            Err(ValidationError)
        }
    }
}

/// Output is `(N, 1, 1, 1)`.
///
/// # Panics
/// Panics unless there are two inputs of equal size.
pub fn compute_output_shape(inputs: &[Tensor], outputs: &mut [Tensor], _param: &CosSimParam) {
    assert_eq!(inputs.len(), 2, "CosSim takes two inputs, got {}", inputs.len());
    assert_eq!(
        inputs[0].valid_size(),
        inputs[1].valid_size(),
        "CosSim inputs differ in size: {:?} vs {:?}",
        inputs[0].shape().dims(),
        inputs[1].shape().dims()
    );
    outputs[0].set_shape([inputs[0].num(), 1, 1, 1], Layout::Nchw);
    outputs[0].set_seq_offset(inputs[0].seq_offset().to_vec());
}

#[derive(Debug, Default)]
pub struct SaberCosSim {
    kernel: Option<KernelHandle>,
}

impl KernelImpl<CosSimParam> for SaberCosSim {
    fn create(&mut self, inputs: &[Tensor], _outputs: &mut [Tensor], _param: &CosSimParam, ctx: &OpContext) -> SaberResult<()> {
        // one work group per row
        let num = inputs[0].num();
        let info = KernelInfo::new(OP, KERNEL).with_work(&[DEFAULT_LOCAL_SIZE], &[DEFAULT_LOCAL_SIZE * num]);
        self.kernel = Some(build(OP, ctx, &info)?);
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &CosSimParam, ctx: &OpContext) -> SaberResult<()> {
        let num = inputs[0].num();
        let args: Vec<KernelArg> = vec![
            (&outputs[0]).into(),
            (&inputs[0]).into(),
            (&inputs[1]).into(),
            int_arg(num),
            int_arg(inputs[0].valid_size() / num.max(1)),
            param.epsilon.into(),
        ];
        let kernel = created(OP, &mut self.kernel, KERNEL)?;
        bind(OP, kernel, args)?;
        launch(OP, ctx, std::slice::from_ref(kernel))
    }
}

pub(crate) static KERNELS: &[KernelDef] = &[KernelDef {
    name: KERNEL,
    signature: &[
        ArgKind::Output,
        ArgKind::Input,
        ArgKind::Input,
        ArgKind::Int,
        ArgKind::Int,
        ArgKind::Float,
    ],
    host: cos_sim_host,
}];

fn cos_sim_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let num = args.size(3)?;
    let inner = args.size(4)?;
    let eps = args.float(5)?;
    if num == 0 {
        return Ok(());
    }
    let a = args.buffer(1)?.read();
    let b = args.buffer(2)?.read();
    let mut out = args.buffer(0)?.write();
    let a = args.f32s(&a, num * inner)?;
    let b = args.f32s(&b, num * inner)?;
    let out = args.f32s_mut(&mut out, num)?;

    out.par_iter_mut().enumerate().for_each(|(n, o)| {
        let (ra, rb) = (&a[n * inner..(n + 1) * inner], &b[n * inner..(n + 1) * inner]);
        let (mut aa, mut bb, mut ab) = (0.0f32, 0.0f32, 0.0f32);
        for (x, y) in ra.iter().zip(rb) {
            aa += x * x;
            bb += y * y;
            ab += x * y;
        }
        let c = aa * bb;
        *o = if c <= eps { 0.0 } else { ab / c.sqrt() };
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "CosSim inputs differ")]
    fn unequal_inputs_are_fatal() {
        let a = Tensor::new([2, 3, 1, 1], Layout::Nchw);
        let b = Tensor::new([2, 4, 1, 1], Layout::Nchw);
        compute_output_shape(&[a, b], &mut [Tensor::default()], &CosSimParam { epsilon: 0.0 });
    }

    #[test]
    fn zero_rows_give_zero_at_zero_epsilon() {
        let a = Tensor::from_vec([2, 2, 1, 1], Layout::Nchw, vec![0.0, 0.0, 1.0, 1.0]);
        let b = Tensor::from_vec([2, 2, 1, 1], Layout::Nchw, vec![0.0, 0.0, 2.0, 2.0]);
        let y = Tensor::new([2, 1, 1, 1], Layout::Nchw);
        let args = [
            KernelArg::from(&y),
            KernelArg::from(&a),
            KernelArg::from(&b),
            int_arg(2),
            int_arg(2),
            KernelArg::Float(0.0),
        ];
        cos_sim_host(&HostArgs::new(KERNEL, &args)).unwrap();
        let out = y.to_vec();
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 1.0).abs() < 1e-6);
    }
}
