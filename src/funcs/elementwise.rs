//! Element-wise activations: power and soft sign.
//!
//! Both are shape preserving and copy sequence offsets.

use briny::prelude::{Validate, ValidationError};
use rayon::prelude::*;

use super::{KernelImpl, bind, build, created, launch};
use crate::error::{DeviceError, SaberResult};
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, KernelArg, KernelDef, KernelHandle, KernelInfo, int_arg};
use crate::ops::OpContext;
use crate::tensors::Tensor;

const POWER_KERNEL: &str = "ker_power_fwd";
const SOFT_SIGN_KERNEL: &str = "ker_soft_sign_fwd";

/// `y = (shift + scale * x) ^ power`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerParam {
    pub scale: f32,
    pub shift: f32,
    pub power: f32,
}

impl Validate for PowerParam {
    fn validate(&self) -> Result<(), ValidationError> {
        if [self.scale, self.shift, self.power].iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(ValidationError)
        }
    }
}

/// Soft sign has no parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftSignParam;

impl Validate for SoftSignParam {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Output takes the input's shape, layout and offsets.
pub fn same_shape(inputs: &[Tensor], outputs: &mut [Tensor]) {
    assert_eq!(inputs.len(), 1, "elementwise operators take exactly one input, got {}", inputs.len());
    let x = &inputs[0];
    outputs[0].set_shape(x.shape().clone(), x.layout());
    outputs[0].set_seq_offset(x.seq_offset().to_vec());
}

#[derive(Debug, Default)]
pub struct SaberPower {
    kernel: Option<KernelHandle>,
}

impl KernelImpl<PowerParam> for SaberPower {
    fn create(&mut self, inputs: &[Tensor], _outputs: &mut [Tensor], _param: &PowerParam, ctx: &OpContext) -> SaberResult<()> {
        let info = KernelInfo::new("Power", POWER_KERNEL).with_count(inputs[0].valid_size());
        self.kernel = Some(build("Power", ctx, &info)?);
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &PowerParam, ctx: &OpContext) -> SaberResult<()> {
        let args: Vec<KernelArg> = vec![
            (&outputs[0]).into(),
            (&inputs[0]).into(),
            int_arg(inputs[0].valid_size()),
            param.scale.into(),
            param.shift.into(),
            param.power.into(),
        ];
        let kernel = created("Power", &mut self.kernel, POWER_KERNEL)?;
        bind("Power", kernel, args)?;
        launch("Power", ctx, std::slice::from_ref(kernel))
    }
}

#[derive(Debug, Default)]
pub struct SaberSoftSign {
    kernel: Option<KernelHandle>,
}

impl KernelImpl<SoftSignParam> for SaberSoftSign {
    fn create(&mut self, inputs: &[Tensor], _outputs: &mut [Tensor], _param: &SoftSignParam, ctx: &OpContext) -> SaberResult<()> {
        let info = KernelInfo::new("SoftSign", SOFT_SIGN_KERNEL).with_count(inputs[0].valid_size());
        self.kernel = Some(build("SoftSign", ctx, &info)?);
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], _param: &SoftSignParam, ctx: &OpContext) -> SaberResult<()> {
        let args: Vec<KernelArg> = vec![
            (&outputs[0]).into(),
            (&inputs[0]).into(),
            int_arg(inputs[0].valid_size()),
        ];
        let kernel = created("SoftSign", &mut self.kernel, SOFT_SIGN_KERNEL)?;
        bind("SoftSign", kernel, args)?;
        launch("SoftSign", ctx, std::slice::from_ref(kernel))
    }
}

pub(crate) static KERNELS: &[KernelDef] = &[
    KernelDef {
        name: POWER_KERNEL,
        signature: &[
            ArgKind::Output,
            ArgKind::Input,
            ArgKind::Int,
            ArgKind::Float,
            ArgKind::Float,
            ArgKind::Float,
        ],
        host: power_host,
    },
    KernelDef {
        name: SOFT_SIGN_KERNEL,
        signature: &[ArgKind::Output, ArgKind::Input, ArgKind::Int],
        host: soft_sign_host,
    },
];

fn power_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let count = args.size(2)?;
    let (scale, shift, power) = (args.float(3)?, args.float(4)?, args.float(5)?);
    let input = args.buffer(1)?.read();
    let mut output = args.buffer(0)?.write();
    let x = args.f32s(&input, count)?;
    let y = args.f32s_mut(&mut output, count)?;
    if power == 1.0 {
        y.par_iter_mut().zip(x.par_iter()).for_each(|(d, s)| *d = shift + scale * s);
    } else {
        y.par_iter_mut()
            .zip(x.par_iter())
            .for_each(|(d, s)| *d = (shift + scale * s).powf(power));
    }
    Ok(())
}

fn soft_sign_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let count = args.size(2)?;
    let input = args.buffer(1)?.read();
    let mut output = args.buffer(0)?.write();
    let x = args.f32s(&input, count)?;
    let y = args.f32s_mut(&mut output, count)?;
    y.par_iter_mut().zip(x.par_iter()).for_each(|(d, s)| *d = s / (1.0 + s.abs()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::{Buffer, Layout, Storage};

    #[test]
    fn power_body() {
        let x = Buffer::new(Storage::F32(vec![0.0, 1.0, 2.0]));
        let y = Buffer::zeros(crate::tensors::DataType::F32, 3);
        let args = [
            KernelArg::Buffer(y.clone()),
            KernelArg::Buffer(x),
            KernelArg::Int(3),
            KernelArg::Float(2.0),
            KernelArg::Float(1.0),
            KernelArg::Float(2.0),
        ];
        power_host(&HostArgs::new(POWER_KERNEL, &args)).unwrap();
        assert_eq!(y.read().as_f32().unwrap(), &[1.0, 9.0, 25.0]);
    }

    #[test]
    fn non_finite_power_is_invalid() {
        let p = PowerParam { scale: 1.0, shift: 0.0, power: f32::NAN };
        assert!(p.validate().is_err());
    }

    #[test]
    #[should_panic(expected = "take exactly one input, got 2")]
    fn extra_input_is_fatal() {
        let x = Tensor::new([3], Layout::W);
        same_shape(&[x.clone(), x], &mut [Tensor::default()]);
    }
}
