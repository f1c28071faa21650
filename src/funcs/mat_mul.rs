//! Batched matrix multiply of two NCHW tensors.
//!
//! Each `(n, c)` plane of `X` is one `H × W` matrix. `Y` either has as many
//! planes as `X` or a single plane shared by all of them. Transposed operands
//! are first copied into a workspace in row-major `M × K` / `K × N` order so
//! the GEMM itself never strides.

use briny::prelude::{Validate, ValidationError};
use rayon::prelude::*;

use super::gemm::sgemm;
use super::{KernelImpl, bind, build, launch};
use crate::error::{DeviceError, SaberError, SaberResult};
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, KernelArg, KernelDef, KernelHandle, KernelInfo, int_arg};
use crate::ops::OpContext;
use crate::tensors::{Layout, Tensor};

const OP: &str = "MatMul";
const TRANSPOSE_KERNEL: &str = "mat_transpose";
const GEMM_KERNEL: &str = "mat_mul_batched_gemm";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatMulParam {
    pub transpose_x: bool,
    pub transpose_y: bool,
    /// Multiplies the product.
    pub scale: f32,
}

impl Validate for MatMulParam {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.scale.is_finite() {
            Ok(())
        } else {
            Err(ValidationError)
        }
    }
}

/// Problem size of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dims {
    batch: usize,
    m: usize,
    n: usize,
    k: usize,
    /// `Y` has one plane per batch rather than a single shared one.
    y_batched: bool,
}

impl Dims {
    fn of(x: &Tensor, y: &Tensor, param: &MatMulParam) -> Self {
        let (xh, xw) = (x.height(), x.width());
        let (yh, yw) = (y.height(), y.width());
        let (m, k) = if param.transpose_x { (xw, xh) } else { (xh, xw) };
        let (ky, n) = if param.transpose_y { (yw, yh) } else { (yh, yw) };
        assert_eq!(k, ky, "MatMul: inner dimensions differ ({k} vs {ky})");
        let batch = x.num() * x.channel();
        let y_batch = y.num() * y.channel();
        assert!(
            y_batch == batch || y_batch == 1,
            "MatMul: Y has {y_batch} matrices, expected {batch} or 1"
        );
        Self {
            batch,
            m,
            n,
            k,
            y_batched: y_batch == batch && batch != 1,
        }
    }
}

/// Output is `(N, C, M, N')` in `NCHW`, with the offsets of `X`.
///
/// # Panics
/// Panics unless there are two NCHW inputs with matching inner dimensions and
/// `Y` has either one matrix or as many as `X`.
pub fn compute_output_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &MatMulParam) {
    assert_eq!(inputs.len(), 2, "MatMul takes two inputs, got {}", inputs.len());
    let (x, y) = (&inputs[0], &inputs[1]);
    for t in [x, y] {
        assert_eq!(t.layout(), Layout::Nchw, "MatMul expects NCHW inputs, got {}", t.layout());
    }
    let dims = Dims::of(x, y, param);
    outputs[0].set_shape([x.num(), x.channel(), dims.m, dims.n], Layout::Nchw);
    outputs[0].set_seq_offset(x.seq_offset().to_vec());
}

#[derive(Debug, Default)]
pub struct SaberMatMul {
    /// Optional transposes of X then Y, followed by the GEMM.
    kernels: Vec<KernelHandle>,
    workspace_x: Option<Tensor>,
    workspace_y: Option<Tensor>,
}

impl KernelImpl<MatMulParam> for SaberMatMul {
    fn create(&mut self, inputs: &[Tensor], _outputs: &mut [Tensor], param: &MatMulParam, ctx: &OpContext) -> SaberResult<()> {
        let d = Dims::of(&inputs[0], &inputs[1], param);
        self.kernels.clear();
        self.workspace_x = None;
        self.workspace_y = None;
        if param.transpose_x {
            let count = d.batch * d.m * d.k;
            self.workspace_x = Some(Tensor::new([count.max(1)], Layout::W));
            let info = KernelInfo::new(OP, TRANSPOSE_KERNEL).with_count(count);
            self.kernels.push(build(OP, ctx, &info)?);
        }
        if param.transpose_y {
            let count = inputs[1].valid_size();
            self.workspace_y = Some(Tensor::new([count.max(1)], Layout::W));
            let info = KernelInfo::new(OP, TRANSPOSE_KERNEL).with_count(count);
            self.kernels.push(build(OP, ctx, &info)?);
        }
        let info = KernelInfo::new(OP, GEMM_KERNEL).with_count(d.batch * d.m * d.n);
        self.kernels.push(build(OP, ctx, &info)?);
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &MatMulParam, ctx: &OpContext) -> SaberResult<()> {
        let (x, y) = (&inputs[0], &inputs[1]);
        let d = Dims::of(x, y, param);
        let y_planes = if d.y_batched { d.batch } else { 1 };

        let mut bindings: Vec<Vec<KernelArg>> = Vec::with_capacity(3);
        if let Some(ws) = &self.workspace_x {
            // stored K × M per plane
            bindings.push(vec![ws.into(), x.into(), int_arg(d.batch), int_arg(d.k), int_arg(d.m)]);
        }
        if let Some(ws) = &self.workspace_y {
            // stored N × K per plane
            bindings.push(vec![ws.into(), y.into(), int_arg(y_planes), int_arg(d.n), int_arg(d.k)]);
        }
        let a = self.workspace_x.as_ref().unwrap_or(x);
        let b = self.workspace_y.as_ref().unwrap_or(y);
        bindings.push(vec![
            (&outputs[0]).into(),
            a.into(),
            b.into(),
            int_arg(d.batch),
            int_arg(d.m),
            int_arg(d.n),
            int_arg(d.k),
            int_arg(usize::from(d.y_batched)),
            param.scale.into(),
        ]);

        if bindings.len() != self.kernels.len() {
            return Err(SaberError::KernelCreate {
                op: OP,
                kernel: GEMM_KERNEL.into(),
            });
        }
        for (kernel, args) in self.kernels.iter_mut().zip(bindings) {
            bind(OP, kernel, args)?;
        }
        launch(OP, ctx, &self.kernels)
    }
}

pub(crate) static KERNELS: &[KernelDef] = &[
    KernelDef {
        name: TRANSPOSE_KERNEL,
        // out, in, batch, rows, cols
        signature: &[ArgKind::Output, ArgKind::Input, ArgKind::Int, ArgKind::Int, ArgKind::Int],
        host: transpose_host,
    },
    KernelDef {
        name: GEMM_KERNEL,
        // c, a, b, batch, m, n, k, b_batched, alpha
        signature: &[
            ArgKind::Output,
            ArgKind::Input,
            ArgKind::Input,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Float,
        ],
        host: batched_gemm_host,
    },
];

fn transpose_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let (batch, rows, cols) = (args.size(2)?, args.size(3)?, args.size(4)?);
    let plane = rows * cols;
    if batch * plane == 0 {
        return Ok(());
    }
    let input = args.buffer(1)?.read();
    let mut output = args.buffer(0)?.write();
    let x = args.f32s(&input, batch * plane)?;
    let y = args.f32s_mut(&mut output, batch * plane)?;

    y.par_chunks_mut(plane).zip(x.par_chunks(plane)).for_each(|(dst, src)| {
        for r in 0..rows {
            for c in 0..cols {
                dst[c * rows + r] = src[r * cols + c];
            }
        }
    });
    Ok(())
}

fn batched_gemm_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let (batch, m, n, k) = (args.size(3)?, args.size(4)?, args.size(5)?, args.size(6)?);
    let b_batched = args.int(7)? != 0;
    let alpha = args.float(8)?;
    if batch * m * n == 0 {
        return Ok(());
    }
    let a = args.buffer(1)?.read();
    let b = args.buffer(2)?.read();
    let mut c = args.buffer(0)?.write();
    let a = args.f32s(&a, batch * m * k)?;
    let b = args.f32s(&b, if b_batched { batch * k * n } else { k * n })?;
    let c = args.f32s_mut(&mut c, batch * m * n)?;

    for (i, plane) in c.chunks_mut(m * n).enumerate() {
        let bi = if b_batched { &b[i * k * n..(i + 1) * k * n] } else { &b[..k * n] };
        sgemm(plane, &a[i * m * k..(i + 1) * m * k], bi, m, n, k, alpha, 0.0);
    }
    Ok(())
}
