//! Data normalization with running batch statistics.
//!
//! `mean = batch_sum / batch_size`, `scale = sqrt(batch_size / batch_square_sum)`
//! per channel, `y = (x - mean) * scale`.

use briny::prelude::{Validate, ValidationError};
use rayon::prelude::*;

use super::{KernelImpl, bind, build, created, launch};
use crate::error::{DeviceError, SaberResult};
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, KernelArg, KernelDef, KernelHandle, KernelInfo, int_arg};
use crate::ops::OpContext;
use crate::tensors::{Layout, Tensor};

const OP: &str = "DataNorm";
const KERNEL: &str = "ker_data_norm_fwd";

#[derive(Debug, Clone)]
pub struct DataNormParam {
    pub batch_sum: Tensor,
    pub batch_size: Tensor,
    pub batch_square_sum: Tensor,
    /// Carried from the graph. The statistics formula does not use it.
    pub epsilon: f32,
}

impl Validate for DataNormParam {
    fn validate(&self) -> Result<(), ValidationError> {
        let c = self.batch_sum.valid_size();
        if c == 0 || self.batch_size.valid_size() != c || self.batch_square_sum.valid_size() != c {
            return Err(ValidationError);
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Output is `(N, C)` with layout `NC`; sequence offsets carry over.
///
/// # Panics
/// Panics unless there is exactly one `(N, C, 1, 1)` NCHW or `(N, C)` NC
/// input whose channel count matches the statistics.
pub fn compute_output_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &DataNormParam) {
    assert_eq!(inputs.len(), 1, "DataNorm takes exactly one input, got {}", inputs.len());
    let x = &inputs[0];
    match x.layout() {
        Layout::Nchw => assert!(
            x.height() <= 1 && x.width() <= 1,
            "DataNorm expects (N, C, 1, 1) input, got {:?}",
            x.shape().dims()
        ),
        Layout::Nc => {}
        other => panic!("DataNorm does not support layout {other}"),
    }
    assert_eq!(
        x.channel(),
        param.batch_sum.valid_size(),
        "DataNorm statistics cover {} channels, input has {}",
        param.batch_sum.valid_size(),
        x.channel()
    );
    let out = &mut outputs[0];
    out.set_shape([x.num(), x.channel()], Layout::Nc);
    out.set_seq_offset(x.seq_offset().to_vec());
}

#[derive(Debug, Default)]
pub struct SaberDataNorm {
    kernel: Option<KernelHandle>,
    means: Option<Tensor>,
    scales: Option<Tensor>,
}

impl KernelImpl<DataNormParam> for SaberDataNorm {
    fn create(&mut self, inputs: &[Tensor], _outputs: &mut [Tensor], _param: &DataNormParam, ctx: &OpContext) -> SaberResult<()> {
        let x = &inputs[0];
        let channel = x.channel();
        self.means = Some(Tensor::new([channel], Layout::W));
        self.scales = Some(Tensor::new([channel], Layout::W));
        let info = KernelInfo::new(OP, KERNEL).with_count(x.valid_size());
        self.kernel = Some(build(OP, ctx, &info)?);
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &DataNormParam, ctx: &OpContext) -> SaberResult<()> {
        let x = &inputs[0];
        let (Some(means), Some(scales)) = (&self.means, &self.scales) else {
            return Err(DeviceError::Args {
                kernel: KERNEL.into(),
                reason: "scratch not allocated".into(),
            }
            .into());
        };
        let args: Vec<KernelArg> = vec![
            (&outputs[0]).into(),
            x.into(),
            int_arg(x.num()),
            int_arg(x.channel()),
            (&param.batch_size).into(),
            (&param.batch_sum).into(),
            (&param.batch_square_sum).into(),
            means.into(),
            scales.into(),
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
        ArgKind::Output,
        ArgKind::Output,
    ],
    host: data_norm_host,
}];

fn data_norm_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let num = args.size(2)?;
    let channel = args.size(3)?;
    if channel == 0 {
        return Ok(());
    }
    let input = args.buffer(1)?.read();
    let size = args.buffer(4)?.read();
    let sum = args.buffer(5)?.read();
    let square_sum = args.buffer(6)?.read();
    let mut means = args.buffer(7)?.write();
    let mut scales = args.buffer(8)?.write();
    let mut output = args.buffer(0)?.write();

    let x = args.f32s(&input, num * channel)?;
    let size = args.f32s(&size, channel)?;
    let sum = args.f32s(&sum, channel)?;
    let square_sum = args.f32s(&square_sum, channel)?;
    let means = args.f32s_mut(&mut means, channel)?;
    let scales = args.f32s_mut(&mut scales, channel)?;
    let y = args.f32s_mut(&mut output, num * channel)?;

    for c in 0..channel {
        means[c] = sum[c] / size[c];
        scales[c] = (size[c] / square_sum[c]).sqrt();
    }
    let (means, scales) = (&*means, &*scales);
    y.par_chunks_mut(channel)
        .zip(x.par_chunks(channel))
        .for_each(|(row_out, row_in)| {
            for c in 0..channel {
                row_out[c] = (row_in[c] - means[c]) * scales[c];
            }
        });
    Ok(())
}
