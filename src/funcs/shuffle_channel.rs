//! Channel shuffle.
//!
//! Channels are split into `group` groups of `C / group` each. Input channel
//! `i * group_column + j` lands on output channel `j * group + i`.

use briny::prelude::{Validate, ValidationError};
use rayon::prelude::*;

use super::{KernelImpl, bind, build, created, launch};
use crate::error::{DeviceError, SaberResult};
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, KernelArg, KernelDef, KernelHandle, KernelInfo, int_arg};
use crate::ops::OpContext;
use crate::tensors::{Layout, Tensor};

const OP: &str = "ShuffleChannel";
const KERNEL: &str = "ker_shuffle_channel_fwd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleChannelParam {
    pub group: usize,
}

impl Validate for ShuffleChannelParam {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.group == 0 {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// # Panics
/// Panics unless the single input is NCHW or NC with a channel count that is a
/// multiple of `group`.
pub fn compute_output_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &ShuffleChannelParam) {
    assert_eq!(inputs.len(), 1, "ShuffleChannel takes exactly one input, got {}", inputs.len());
    let x = &inputs[0];
    assert!(
        matches!(x.layout(), Layout::Nchw | Layout::Nc),
        "ShuffleChannel expects NCHW or NC input, got {}",
        x.layout()
    );
    assert!(
        x.channel() % param.group == 0,
        "ShuffleChannel: channel {} is not divisible by group {}",
        x.channel(),
        param.group
    );
    outputs[0].set_shape(x.shape().clone(), x.layout());
    outputs[0].set_seq_offset(x.seq_offset().to_vec());
}

/// Output channel for input channel `c`.
pub fn shuffled_channel(c: usize, channel: usize, group: usize) -> usize {
    let column = channel / group;
    (c % column) * group + c / column
}

#[derive(Debug, Default)]
pub struct SaberShuffleChannel {
    kernel: Option<KernelHandle>,
}

impl KernelImpl<ShuffleChannelParam> for SaberShuffleChannel {
    fn create(&mut self, inputs: &[Tensor], _outputs: &mut [Tensor], _param: &ShuffleChannelParam, ctx: &OpContext) -> SaberResult<()> {
        let info = KernelInfo::new(OP, KERNEL).with_count(inputs[0].valid_size());
        self.kernel = Some(build(OP, ctx, &info)?);
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &ShuffleChannelParam, ctx: &OpContext) -> SaberResult<()> {
        let x = &inputs[0];
        let args: Vec<KernelArg> = vec![
            (&outputs[0]).into(),
            x.into(),
            int_arg(x.num()),
            int_arg(x.channel()),
            int_arg(x.height() * x.width()),
            int_arg(param.group),
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
    ],
    host: shuffle_channel_host,
}];

fn shuffle_channel_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let num = args.size(2)?;
    let channel = args.size(3)?;
    let spatial = args.size(4)?;
    let group = args.size(5)?;
    if group == 0 || channel % group != 0 {
        return Err(args.error(format!("group {group} does not divide channel {channel}")));
    }
    if num * channel * spatial == 0 {
        return Ok(());
    }
    let input = args.buffer(1)?.read();
    let mut output = args.buffer(0)?.write();
    let x = args.f32s(&input, num * channel * spatial)?;
    let y = args.f32s_mut(&mut output, num * channel * spatial)?;

    y.par_chunks_mut(channel * spatial)
        .zip(x.par_chunks(channel * spatial))
        .for_each(|(dst, src)| {
            for c in 0..channel {
                let oc = shuffled_channel(c, channel, group);
                dst[oc * spatial..(oc + 1) * spatial].copy_from_slice(&src[c * spatial..(c + 1) * spatial]);
            }
        });
    Ok(())
}
