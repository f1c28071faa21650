//! Pooling over variable-length sequences.
//!
//! The innermost sequence-offset level splits the batch axis into `batch`
//! sequences; each is reduced to one row. The output carries identity offsets
//! `[0, 1, .., batch]`. The concat variant groups `slot_num` consecutive pooled
//! rows into one output row.

use briny::prelude::{Validate, ValidationError};
use rayon::prelude::*;

use super::{KernelImpl, bind, build, created, launch};
use crate::error::{DeviceError, SaberResult};
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, KernelArg, KernelDef, KernelHandle, KernelInfo, int_arg};
use crate::ops::OpContext;
use crate::tensors::{DataType, Layout, Storage, Tensor};

const OP: &str = "SequencePool";
const CONCAT_OP: &str = "SequencePoolConcat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequencePoolType {
    Average,
    Sum,
    /// Sum divided by the square root of the length.
    Sqrt,
    Max,
    Last,
    First,
}

impl SequencePoolType {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "AVERAGE" => Some(Self::Average),
            "SUM" => Some(Self::Sum),
            "SQRT" => Some(Self::Sqrt),
            "MAX" => Some(Self::Max),
            "LAST" => Some(Self::Last),
            "FIRST" => Some(Self::First),
            _ => None,
        }
    }

    pub const fn kernel_name(self) -> &'static str {
        match self {
            Self::Average => "seq_pool_average_kernel",
            Self::Sum => "seq_pool_sum_kernel",
            Self::Sqrt => "seq_pool_sqrt_kernel",
            Self::Max => "seq_pool_max_kernel",
            Self::Last => "seq_pool_last_kernel",
            Self::First => "seq_pool_first_kernel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePoolParam {
    pub pool_type: SequencePoolType,
}

impl Validate for SequencePoolParam {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Offsets the pooling reads: the innermost level.
///
/// # Panics
/// Panics if the input has no offsets or they do not cover the batch.
pub fn pooling_offsets(x: &Tensor) -> &[usize] {
    let offsets = x
        .seq_offset()
        .last()
        .unwrap_or_else(|| panic!("SequencePool requires sequence offsets on its input"));
    assert_eq!(
        offsets.last().copied(),
        Some(x.num()),
        "SequencePool: offsets {offsets:?} do not cover a batch of {}",
        x.num()
    );
    offsets
}

pub fn compute_output_shape(inputs: &[Tensor], outputs: &mut [Tensor], _param: &SequencePoolParam) {
    assert_eq!(inputs.len(), 1, "SequencePool takes exactly one input, got {}", inputs.len());
    let x = &inputs[0];
    assert!(
        matches!(x.layout(), Layout::Nc | Layout::Nhw | Layout::Nchw | Layout::Nhwc),
        "SequencePool: layout {} has no batch axis",
        x.layout()
    );
    let batch = pooling_offsets(x).len() - 1;
    let mut shape = x.shape().dims().to_vec();
    shape[0] = batch;
    outputs[0].set_shape(shape, x.layout());
    outputs[0].set_seq_offset(vec![(0..=batch).collect()]);
}

/// Pools each sequence, then lays `slot_num` consecutive pooled rows side by
/// side: the output is `(sequences / slot_num, slot_num · slice)` in `NC`.
///
/// # Panics
/// Panics unless the sequence count is a positive multiple of `slot_num`.
pub fn compute_concat_output_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &SequencePoolConcatParam) {
    assert_eq!(inputs.len(), 1, "SequencePoolConcat takes exactly one input, got {}", inputs.len());
    let x = &inputs[0];
    assert!(
        matches!(x.layout(), Layout::Nc | Layout::Nhw | Layout::Nchw | Layout::Nhwc),
        "SequencePoolConcat: layout {} has no batch axis",
        x.layout()
    );
    let sequences = pooling_offsets(x).len() - 1;
    assert!(
        sequences > 0 && sequences % param.slot_num == 0,
        "SequencePoolConcat: {sequences} sequences do not fill slots of {}",
        param.slot_num
    );
    let batch = sequences / param.slot_num;
    let slice = x.valid_size() / x.num().max(1);
    outputs[0].set_shape([batch, param.slot_num * slice], Layout::Nc);
    outputs[0].set_seq_offset(vec![(0..=batch).collect()]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePoolConcatParam {
    pub pool_type: SequencePoolType,
    /// Pooled sequences per output row.
    pub slot_num: usize,
}

impl Validate for SequencePoolConcatParam {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.slot_num == 0 {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Kernel handle and device offset table shared by both pooling operators.
#[derive(Debug, Default)]
struct PoolKernel {
    kernel: Option<KernelHandle>,
    offsets: Option<Tensor>,
}

impl PoolKernel {
    fn create(&mut self, op: &'static str, pool_type: SequencePoolType, x: &Tensor, sequences: usize, ctx: &OpContext) -> SaberResult<()> {
        let slice = x.valid_size() / x.num().max(1);
        self.offsets = Some(Tensor::with_dtype([sequences + 1], Layout::W, DataType::I32));
        let info = KernelInfo::new(op, pool_type.kernel_name()).with_count(sequences * slice);
        self.kernel = Some(build(op, ctx, &info)?);
        Ok(())
    }

    /// Writes one pooled row per sequence of `x` into `out`, back to back.
    fn dispatch(&mut self, op: &'static str, pool_type: SequencePoolType, x: &Tensor, out: &Tensor, ctx: &OpContext) -> SaberResult<()> {
        let Some(offsets) = &self.offsets else {
            return Err(DeviceError::Args {
                kernel: pool_type.kernel_name().into(),
                reason: "offset table not allocated".into(),
            }
            .into());
        };
        let lod: Vec<i32> = pooling_offsets(x)
            .iter()
            .map(|&o| i32::try_from(o).unwrap_or(i32::MAX))
            .collect();
        let sequences = lod.len() - 1;
        ctx.device().copy_from_host(offsets.buffer(), Storage::I32(lod))?;

        let args: Vec<KernelArg> = vec![
            out.into(),
            x.into(),
            offsets.into(),
            int_arg(sequences),
            int_arg(x.valid_size() / x.num().max(1)),
        ];
        let kernel = created(op, &mut self.kernel, pool_type.kernel_name())?;
        bind(op, kernel, args)?;
        launch(op, ctx, std::slice::from_ref(kernel))
    }
}

#[derive(Debug, Default)]
pub struct SaberSequencePool {
    pool: PoolKernel,
}

impl KernelImpl<SequencePoolParam> for SaberSequencePool {
    fn create(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &SequencePoolParam, ctx: &OpContext) -> SaberResult<()> {
        self.pool.create(OP, param.pool_type, &inputs[0], outputs[0].num(), ctx)
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &SequencePoolParam, ctx: &OpContext) -> SaberResult<()> {
        self.pool.dispatch(OP, param.pool_type, &inputs[0], &outputs[0], ctx)
    }
}

#[derive(Debug, Default)]
pub struct SaberSequencePoolConcat {
    pool: PoolKernel,
}

impl KernelImpl<SequencePoolConcatParam> for SaberSequencePoolConcat {
    fn create(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &SequencePoolConcatParam, ctx: &OpContext) -> SaberResult<()> {
        let sequences = outputs[0].num() * param.slot_num;
        self.pool.create(CONCAT_OP, param.pool_type, &inputs[0], sequences, ctx)
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &SequencePoolConcatParam, ctx: &OpContext) -> SaberResult<()> {
        self.pool.dispatch(CONCAT_OP, param.pool_type, &inputs[0], &outputs[0], ctx)
    }
}

const SIGNATURE: &[ArgKind] = &[ArgKind::Output, ArgKind::Input, ArgKind::Input, ArgKind::Int, ArgKind::Int];

pub(crate) static KERNELS: &[KernelDef] = &[
    KernelDef {
        name: "seq_pool_average_kernel",
        signature: SIGNATURE,
        host: seq_pool_host::<AVERAGE>,
    },
    KernelDef {
        name: "seq_pool_sum_kernel",
        signature: SIGNATURE,
        host: seq_pool_host::<SUM>,
    },
    KernelDef {
        name: "seq_pool_sqrt_kernel",
        signature: SIGNATURE,
        host: seq_pool_host::<SQRT>,
    },
    KernelDef {
        name: "seq_pool_max_kernel",
        signature: SIGNATURE,
        host: seq_pool_host::<MAX>,
    },
    KernelDef {
        name: "seq_pool_last_kernel",
        signature: SIGNATURE,
        host: seq_pool_host::<LAST>,
    },
    KernelDef {
        name: "seq_pool_first_kernel",
        signature: SIGNATURE,
        host: seq_pool_host::<FIRST>,
    },
];

const AVERAGE: u8 = 0;
const SUM: u8 = 1;
const SQRT: u8 = 2;
const MAX: u8 = 3;
const LAST: u8 = 4;
const FIRST: u8 = 5;

fn seq_pool_host<const MODE: u8>(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let batch = args.size(3)?;
    let slice = args.size(4)?;
    let offsets = args.buffer(2)?.read();
    let offsets = args.i32s(&offsets, batch + 1)?;
    let bounds: Vec<(usize, usize)> = offsets
        .windows(2)
        .map(|w| (w[0].max(0) as usize, w[1].max(0) as usize))
        .collect();
    if bounds.iter().any(|&(s, e)| s > e) {
        return Err(args.error("sequence offsets decrease"));
    }
    let rows = bounds.last().map_or(0, |&(_, e)| e);
    if batch * slice == 0 {
        return Ok(());
    }
    let input = args.buffer(1)?.read();
    let mut output = args.buffer(0)?.write();
    let x = args.f32s(&input, rows * slice)?;
    let y = args.f32s_mut(&mut output, batch * slice)?;

    y.par_chunks_mut(slice)
        .zip(bounds.par_iter())
        .for_each(|(dst, &(start, end))| {
            let len = end - start;
            if len == 0 {
                dst.fill(0.0);
                return;
            }
            match MODE {
                FIRST => dst.copy_from_slice(row(x, start, slice)),
                LAST => dst.copy_from_slice(row(x, end - 1, slice)),
                MAX => {
                    dst.copy_from_slice(row(x, start, slice));
                    for r in start + 1..end {
                        for (d, s) in dst.iter_mut().zip(row(x, r, slice)) {
                            *d = d.max(*s);
                        }
                    }
                }
                _ => {
                    dst.fill(0.0);
                    for r in start..end {
                        for (d, s) in dst.iter_mut().zip(row(x, r, slice)) {
                            *d += *s;
                        }
                    }
                    let div = match MODE {
                        AVERAGE => len as f32,
                        SQRT => (len as f32).sqrt(),
                        _ => 1.0,
                    };
                    if div != 1.0 {
                        dst.iter_mut().for_each(|d| *d /= div);
                    }
                }
            }
        });
    Ok(())
}

fn row(x: &[f32], r: usize, slice: usize) -> &[f32] {
    &x[r * slice..(r + 1) * slice]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_offsets_are_identity() {
        let mut x = Tensor::new([6, 2, 1, 1], Layout::Nchw);
        x.set_seq_offset(vec![vec![0, 2, 3, 6]]);
        let mut out = [Tensor::default()];
        let p = SequencePoolParam { pool_type: SequencePoolType::Sum };
        compute_output_shape(&[x], &mut out, &p);
        assert_eq!(out[0].shape().dims(), &[3, 2, 1, 1]);
        assert_eq!(out[0].seq_offset(), &[vec![0, 1, 2, 3]]);
    }

    #[test]
    #[should_panic(expected = "requires sequence offsets")]
    fn missing_offsets_are_fatal() {
        let x = Tensor::new([6, 2, 1, 1], Layout::Nchw);
        let p = SequencePoolParam { pool_type: SequencePoolType::Max };
        compute_output_shape(&[x], &mut [Tensor::default()], &p);
    }

    #[test]
    fn concat_groups_slots_into_rows() {
        let mut x = Tensor::new([6, 2], Layout::Nc);
        x.set_seq_offset(vec![vec![0, 1, 3, 3, 4, 6]]);
        let mut out = [Tensor::default()];
        let p = SequencePoolConcatParam { pool_type: SequencePoolType::Sum, slot_num: 5 };
        compute_concat_output_shape(&[x], &mut out, &p);
        assert_eq!(out[0].shape().dims(), &[1, 10]);
        assert_eq!(out[0].layout(), Layout::Nc);
        assert_eq!(out[0].seq_offset(), &[vec![0, 1]]);
    }

    #[test]
    #[should_panic(expected = "do not fill slots of 2")]
    fn concat_needs_whole_slots() {
        let mut x = Tensor::new([6, 2], Layout::Nc);
        x.set_seq_offset(vec![vec![0, 2, 4, 6]]);
        let p = SequencePoolConcatParam { pool_type: SequencePoolType::Sum, slot_num: 2 };
        compute_concat_output_shape(&[x], &mut [Tensor::default()], &p);
    }

    #[test]
    fn zero_slots_are_invalid() {
        let p = SequencePoolConcatParam { pool_type: SequencePoolType::Max, slot_num: 0 };
        assert!(p.validate().is_err());
    }

    #[test]
    fn kinds_parse() {
        assert_eq!(SequencePoolType::parse("sqrt"), Some(SequencePoolType::Sqrt));
        assert_eq!(SequencePoolType::parse("median"), None);
    }
}
