//! Pixel shuffle as a six-axis permutation.
//!
//! A `(N, C, H, W)` input with upscale factor `f` is viewed as
//! `(N, C/f², f, f, H, W)` and permuted with order `[0, 1, 4, 2, 5, 3]` into
//! `(N, C/f², H, f, W, f)`, i.e. `(N, C/f², H·f, W·f)`. The inverse flag runs
//! the opposite permutation (space to depth). Step and order tables are
//! uploaded to the device with a blocking copy when the kernel is created.

use briny::prelude::{Validate, ValidationError};
use rayon::prelude::*;

use super::{KernelImpl, bind, build, created, launch};
use crate::error::{DeviceError, SaberResult};
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, KernelArg, KernelDef, KernelHandle, KernelInfo, int_arg};
use crate::ops::OpContext;
use crate::tensors::{DataType, Layout, Storage, Tensor};

const OP: &str = "PixelShuffle";
const KERNEL: &str = "ker_permute_fwd";

/// Order taking `(n, oc, f, f, h, w)` to `(n, oc, h, f, w, f)`.
pub const SHUFFLE_ORDER: [usize; 6] = [0, 1, 4, 2, 5, 3];
/// Order taking `(n, oc, h, f, w, f)` back to `(n, oc, f, f, h, w)`.
pub const UNSHUFFLE_ORDER: [usize; 6] = [0, 1, 3, 5, 2, 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelShuffleParam {
    pub upscale_factor: usize,
    /// Run the inverse (depth to space undone).
    pub inverse: bool,
}

impl Validate for PixelShuffleParam {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.upscale_factor == 0 {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// # Panics
/// Panics unless the single input is NCHW with dimensions the factor divides.
pub fn compute_output_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &PixelShuffleParam) {
    assert_eq!(inputs.len(), 1, "PixelShuffle takes exactly one input, got {}", inputs.len());
    let x = &inputs[0];
    assert_eq!(x.layout(), Layout::Nchw, "PixelShuffle expects NCHW input, got {}", x.layout());
    let f = param.upscale_factor;
    let (n, c, h, w) = (x.num(), x.channel(), x.height(), x.width());
    let shape = if param.inverse {
        assert!(
            h % f == 0 && w % f == 0,
            "PixelShuffle inverse: {h}x{w} is not divisible by factor {f}"
        );
        [n, c * f * f, h / f, w / f]
    } else {
        assert!(
            c % (f * f) == 0,
            "PixelShuffle: channel {c} is not divisible by factor² {}",
            f * f
        );
        [n, c / (f * f), h * f, w * f]
    };
    outputs[0].set_shape(shape, Layout::Nchw);
    outputs[0].set_seq_offset(x.seq_offset().to_vec());
}

/// Source view shape and permutation order for an input of shape `(n, c, h, w)`.
pub fn permute_view(n: usize, c: usize, h: usize, w: usize, param: &PixelShuffleParam) -> ([usize; 6], [usize; 6]) {
    let f = param.upscale_factor;
    if param.inverse {
        ([n, c, h / f, f, w / f, f], UNSHUFFLE_ORDER)
    } else {
        ([n, c / (f * f), f, f, h, w], SHUFFLE_ORDER)
    }
}

/// Row-major strides of a shape.
pub fn steps(shape: &[usize]) -> Vec<usize> {
    let mut steps = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        steps[i] = steps[i + 1] * shape[i + 1];
    }
    steps
}

/// Source index feeding output index `j`.
pub fn source_index(j: usize, order: &[i32], old_steps: &[i32], new_steps: &[i32]) -> usize {
    let mut temp = j;
    let mut old = 0;
    for i in 0..order.len() {
        let step = new_steps[i] as usize;
        old += (temp / step) * old_steps[order[i] as usize] as usize;
        temp %= step;
    }
    old
}

#[derive(Debug, Default)]
pub struct SaberPixelShuffle {
    kernel: Option<KernelHandle>,
    order: Option<Tensor>,
    old_steps: Option<Tensor>,
    new_steps: Option<Tensor>,
}

fn to_i32(v: &[usize]) -> Vec<i32> {
    v.iter().map(|&x| i32::try_from(x).unwrap_or(i32::MAX)).collect()
}

impl KernelImpl<PixelShuffleParam> for SaberPixelShuffle {
    fn create(&mut self, inputs: &[Tensor], _outputs: &mut [Tensor], param: &PixelShuffleParam, ctx: &OpContext) -> SaberResult<()> {
        let x = &inputs[0];
        let (old_shape, order) = permute_view(x.num(), x.channel(), x.height(), x.width(), param);
        let new_shape: Vec<usize> = order.iter().map(|&o| old_shape[o]).collect();

        let device = ctx.device();
        let tables = [
            (&mut self.order, to_i32(&order)),
            (&mut self.old_steps, to_i32(&steps(&old_shape))),
            (&mut self.new_steps, to_i32(&steps(&new_shape))),
        ];
        for (slot, table) in tables {
            let t = Tensor::with_dtype([6], Layout::W, DataType::I32);
            device.copy_from_host(t.buffer(), Storage::I32(table))?;
            *slot = Some(t);
        }

        let info = KernelInfo::new("Permute", KERNEL).with_count(x.valid_size());
        self.kernel = Some(build(OP, ctx, &info)?);
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], _param: &PixelShuffleParam, ctx: &OpContext) -> SaberResult<()> {
        let (Some(order), Some(old_steps), Some(new_steps)) = (&self.order, &self.old_steps, &self.new_steps) else {
            return Err(DeviceError::Args {
                kernel: KERNEL.into(),
                reason: "permutation tables not uploaded".into(),
            }
            .into());
        };
        let args: Vec<KernelArg> = vec![
            (&outputs[0]).into(),
            (&inputs[0]).into(),
            int_arg(outputs[0].valid_size()),
            int_arg(6),
            order.into(),
            old_steps.into(),
            new_steps.into(),
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
        ArgKind::Input,
        ArgKind::Input,
        ArgKind::Input,
    ],
    host: permute_host,
}];

fn permute_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let count = args.size(2)?;
    let axes = args.size(3)?;
    let order = args.buffer(4)?.read();
    let old_steps = args.buffer(5)?.read();
    let new_steps = args.buffer(6)?.read();
    let input = args.buffer(1)?.read();
    let mut output = args.buffer(0)?.write();

    let order = args.i32s(&order, axes)?;
    let old_steps = args.i32s(&old_steps, axes)?;
    let new_steps = args.i32s(&new_steps, axes)?;
    if order.iter().any(|&o| o < 0 || o as usize >= axes) || new_steps.iter().any(|&s| s <= 0) {
        return Err(args.error("malformed permutation tables"));
    }
    let x = args.f32s(&input, count)?;
    let y = args.f32s_mut(&mut output, count)?;
    y.par_iter_mut().enumerate().for_each(|(j, out)| {
        *out = x[source_index(j, order, old_steps, new_steps)];
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_row_major() {
        assert_eq!(steps(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(steps(&[5]), vec![1]);
    }

    #[test]
    fn shape_forward_and_inverse() {
        let x = Tensor::new([1, 9, 2, 2], Layout::Nchw);
        let mut out = [Tensor::default()];
        let p = PixelShuffleParam { upscale_factor: 3, inverse: false };
        compute_output_shape(std::slice::from_ref(&x), &mut out, &p);
        assert_eq!(out[0].shape().dims(), &[1, 1, 6, 6]);

        let mut back = [Tensor::default()];
        let inv = PixelShuffleParam { inverse: true, ..p };
        compute_output_shape(&out, &mut back, &inv);
        assert_eq!(back[0].shape().dims(), &[1, 9, 2, 2]);
    }

    #[test]
    #[should_panic(expected = "PixelShuffle expects NCHW input")]
    fn channels_last_is_rejected() {
        let x = Tensor::new([1, 2, 2, 4], Layout::Nhwc);
        let p = PixelShuffleParam { upscale_factor: 2, inverse: false };
        compute_output_shape(&[x], &mut [Tensor::default()], &p);
    }

    #[test]
    fn source_index_matches_definition() {
        // out[n, oc, h*f + i, w*f + j] == in[n, oc*f*f + i*f + j, h, w]
        let (n, c, h, w, f) = (1usize, 8, 3, 2, 2);
        let p = PixelShuffleParam { upscale_factor: f, inverse: false };
        let (old, order) = permute_view(n, c, h, w, &p);
        let new: Vec<usize> = order.iter().map(|&o| old[o]).collect();
        let (order, os, ns) = (to_i32(&order), to_i32(&steps(&old)), to_i32(&steps(&new)));
        let (oc, oh, ow) = (c / (f * f), h * f, w * f);
        for o in 0..oc {
            for y in 0..oh {
                for x in 0..ow {
                    let j = (o * oh + y) * ow + x;
                    let ic = o * f * f + (y % f) * f + (x % f);
                    let expect = (ic * h + y / f) * w + x / f;
                    assert_eq!(source_index(j, &order, &os, &ns), expect);
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "not divisible by factor²")]
    fn indivisible_channel_is_fatal() {
        let x = Tensor::new([1, 6, 2, 2], Layout::Nchw);
        let p = PixelShuffleParam { upscale_factor: 2, inverse: false };
        compute_output_shape(&[x], &mut [Tensor::default()], &p);
    }
}
