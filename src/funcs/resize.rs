//! Bilinear resize of NCHW tensors by fractional scales.

use briny::prelude::{Validate, ValidationError};
use rayon::prelude::*;

use super::{KernelImpl, bind, build, created, launch};
use crate::error::{DeviceError, SaberResult};
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, KernelArg, KernelDef, KernelHandle, KernelInfo, int_arg};
use crate::ops::OpContext;
use crate::tensors::{Layout, Tensor};

const OP: &str = "Resize";
const KERNEL: &str = "ker_resize_bilinear_fwd";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeParam {
    pub height_scale: f32,
    pub width_scale: f32,
}

impl Validate for ResizeParam {
    fn validate(&self) -> Result<(), ValidationError> {
        let ok = |s: f32| s.is_finite() && s > 0.0;
        if ok(self.height_scale) && ok(self.width_scale) {
            Ok(())
        } else {
            Err(ValidationError)
        }
    }
}

/// Output spatial size is `floor(dim * scale)`.
///
/// # Panics
/// Panics on non-NCHW input or an empty output.
pub fn compute_output_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &ResizeParam) {
    assert_eq!(inputs.len(), 1, "Resize takes exactly one input, got {}", inputs.len());
    let x = &inputs[0];
    assert_eq!(x.layout(), Layout::Nchw, "Resize expects NCHW input, got {}", x.layout());
    let out_h = (x.height() as f32 * param.height_scale).floor() as usize;
    let out_w = (x.width() as f32 * param.width_scale).floor() as usize;
    assert!(
        out_h > 0 && out_w > 0,
        "Resize: {}x{} scaled by ({}, {}) is empty",
        x.height(),
        x.width(),
        param.height_scale,
        param.width_scale
    );
    outputs[0].set_shape([x.num(), x.channel(), out_h, out_w], Layout::Nchw);
    outputs[0].set_seq_offset(x.seq_offset().to_vec());
}

#[derive(Debug, Default)]
pub struct SaberResize {
    kernel: Option<KernelHandle>,
}

impl KernelImpl<ResizeParam> for SaberResize {
    fn create(&mut self, _inputs: &[Tensor], outputs: &mut [Tensor], _param: &ResizeParam, ctx: &OpContext) -> SaberResult<()> {
        let out = &outputs[0];
        let info = KernelInfo::new(OP, KERNEL).with_work(&[8, 8], &[out.width(), out.height() * out.num() * out.channel()]);
        self.kernel = Some(build(OP, ctx, &info)?);
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &ResizeParam, ctx: &OpContext) -> SaberResult<()> {
        let (x, y) = (&inputs[0], &outputs[0]);
        let args: Vec<KernelArg> = vec![
            y.into(),
            x.into(),
            int_arg(x.num() * x.channel()),
            int_arg(x.height()),
            int_arg(x.width()),
            int_arg(y.height()),
            int_arg(y.width()),
            param.height_scale.into(),
            param.width_scale.into(),
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
        ArgKind::Int,
        ArgKind::Int,
        ArgKind::Int,
        ArgKind::Int,
        ArgKind::Int,
        ArgKind::Float,
        ArgKind::Float,
    ],
    host: resize_host,
}];

/// Source coordinate pair and weight of the second one.
fn sample(dst: usize, scale: f32, src_len: usize) -> (usize, usize, f32) {
    let pos = (dst as f32 / scale).min((src_len - 1) as f32);
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(src_len - 1);
    (lo, hi, pos - lo as f32)
}

fn resize_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let planes = args.size(2)?;
    let (in_h, in_w) = (args.size(3)?, args.size(4)?);
    let (out_h, out_w) = (args.size(5)?, args.size(6)?);
    let (scale_h, scale_w) = (args.float(7)?, args.float(8)?);
    if planes * out_h * out_w == 0 {
        return Ok(());
    }
    if in_h * in_w == 0 || scale_h <= 0.0 || scale_w <= 0.0 {
        return Err(args.error("empty source plane or non-positive scale"));
    }
    let input = args.buffer(1)?.read();
    let mut output = args.buffer(0)?.write();
    let x = args.f32s(&input, planes * in_h * in_w)?;
    let y = args.f32s_mut(&mut output, planes * out_h * out_w)?;

    y.par_chunks_mut(out_h * out_w)
        .zip(x.par_chunks(in_h * in_w))
        .for_each(|(dst, src)| {
            for oy in 0..out_h {
                let (y0, y1, dy) = sample(oy, scale_h, in_h);
                for ox in 0..out_w {
                    let (x0, x1, dx) = sample(ox, scale_w, in_w);
                    let top = src[y0 * in_w + x0] * (1.0 - dx) + src[y0 * in_w + x1] * dx;
                    let bottom = src[y1 * in_w + x0] * (1.0 - dx) + src[y1 * in_w + x1] * dx;
                    dst[oy * out_w + ox] = top * (1.0 - dy) + bottom * dy;
                }
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_floored() {
        let x = Tensor::new([1, 2, 3, 5], Layout::Nchw);
        let mut out = [Tensor::default()];
        compute_output_shape(&[x], &mut out, &ResizeParam { height_scale: 1.5, width_scale: 0.5 });
        assert_eq!(out[0].shape().dims(), &[1, 2, 4, 2]);
    }

    #[test]
    fn sampling_clamps_to_edge() {
        assert_eq!(sample(0, 2.0, 3), (0, 1, 0.0));
        assert_eq!(sample(1, 2.0, 3), (0, 1, 0.5));
        assert_eq!(sample(5, 2.0, 3), (2, 2, 0.0));
    }
}
