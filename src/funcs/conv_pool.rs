//! Fused convolution, leaky ReLU and pooling.
//!
//! Weights arrive as OIHW and are relaid out once, in place, to OHWI (per
//! group `O, kh, kw, I/g`); every kernel here reads the relaid layout. The
//! relayout itself is driven by the operator helper so that it happens at most
//! once per shared weight buffer.
//!
//! Two kernel chains exist:
//!
//! - `Direct`: `conv_direct` then `bias_relu_pool`.
//! - `Gemm1x1`: `conv_transpose_nchw2cnhw`, `conv_gemm`,
//!   `conv_transpose_cnhw2nchw`, then `bias_relu_pool`.
//!
//! [`select_strategy`] picks one from the input shape and the [`GemmPolicy`].

use briny::prelude::{Validate, ValidationError};
use rayon::prelude::*;

use super::gemm::{GEMM_KERNEL, TO_CNHW_KERNEL, TO_NCHW_KERNEL, sgemm};
use super::{KernelImpl, bind, build, launch};
use crate::config::GemmPolicy;
use crate::error::{DeviceError, SaberError, SaberResult};
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, KernelArg, KernelDef, KernelHandle, KernelInfo, int_arg};
use crate::ops::OpContext;
use crate::tensors::{DataType, Layout, Tensor};

const OP: &str = "ConvReluPool";
const DIRECT_KERNEL: &str = "conv_direct";
const POOL_KERNEL: &str = "bias_relu_pool";

/// Convolution part.
#[derive(Debug, Clone)]
pub struct ConvParam {
    pub group: usize,
    pub pad: [usize; 2],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub filter_num: usize,
    pub kernel_size: [usize; 2],
    pub axis: usize,
    /// `(filter_num, C / group, kh, kw)`, relaid out to OHWI on first init.
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolMethod {
    Max,
    /// Average whose divisor counts padded positions.
    AverageIncludePadding,
}

impl PoolMethod {
    /// Graph spelling: `MAX` or `AVG`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "MAX" => Some(Self::Max),
            "AVG" => Some(Self::AverageIncludePadding),
            _ => None,
        }
    }
}

/// Pooling part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParam {
    pub method: PoolMethod,
    pub global: bool,
    pub window: [usize; 2],
    pub pad: [usize; 2],
    pub stride: [usize; 2],
    /// Floor the output size the way convolutions do instead of ceiling it.
    pub floor_as_conv: bool,
}

#[derive(Debug, Clone)]
pub struct ConvPoolParam {
    pub conv: ConvParam,
    /// Negative slope of the fused ReLU; `0` is a plain ReLU.
    pub relu_alpha: f32,
    pub pool: PoolParam,
}

impl Validate for ConvPoolParam {
    fn validate(&self) -> Result<(), ValidationError> {
        let conv = &self.conv;
        let positive = |v: [usize; 2]| v[0] > 0 && v[1] > 0;
        if conv.group == 0 || conv.filter_num == 0 || conv.filter_num % conv.group != 0 {
            return Err(ValidationError);
        }
        if !positive(conv.stride) || !positive(conv.dilation) || !positive(conv.kernel_size) {
            return Err(ValidationError);
        }
        let per_filter = conv.kernel_size[0] * conv.kernel_size[1];
        let count = conv.weight.valid_size();
        if conv.weight.dtype() != DataType::F32 || count == 0 || count % (conv.filter_num * per_filter) != 0 {
            return Err(ValidationError);
        }
        if let Some(bias) = &conv.bias {
            if bias.valid_size() != conv.filter_num || bias.dtype() != DataType::F32 {
                return Err(ValidationError);
            }
        }
        if !self.relu_alpha.is_finite() {
            return Err(ValidationError);
        }
        let pool = &self.pool;
        if !pool.global && (!positive(pool.window) || !positive(pool.stride)) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Every size a convolution launch needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub oc: usize,
    pub oh: usize,
    pub ow: usize,
    pub kh: usize,
    pub kw: usize,
    pub sh: usize,
    pub sw: usize,
    pub ph: usize,
    pub pw: usize,
    pub dh: usize,
    pub dw: usize,
    pub group: usize,
}

/// Output length of a convolution along one axis.
///
/// # Panics
/// Panics if the dilated kernel does not fit in the padded input.
pub fn conv_out_size(input: usize, kernel: usize, pad: usize, stride: usize, dilation: usize) -> usize {
    let span = dilation * (kernel - 1) + 1;
    assert!(
        input + 2 * pad >= span,
        "convolution kernel span {span} exceeds padded input {}",
        input + 2 * pad
    );
    (input + 2 * pad - span) / stride + 1
}

/// Output length of a pooling window along one axis.
///
/// # Panics
/// Panics if the window does not fit in the padded input.
pub fn pool_out_size(input: usize, window: usize, pad: usize, stride: usize, floor: bool) -> usize {
    assert!(
        input + 2 * pad >= window,
        "pooling window {window} exceeds padded input {}",
        input + 2 * pad
    );
    let span = input + 2 * pad - window;
    if floor {
        return span / stride + 1;
    }
    let mut out = span.div_ceil(stride) + 1;
    // the last window must start inside the input or its left padding
    if pad > 0 && (out - 1) * stride >= input + pad {
        out -= 1;
    }
    out
}

impl ConvGeometry {
    /// # Panics
    /// Panics if the input channels disagree with the weights.
    pub fn new(x: &Tensor, conv: &ConvParam) -> Self {
        let (n, c, h, w) = (x.num(), x.channel(), x.height(), x.width());
        let [kh, kw] = conv.kernel_size;
        let icg = conv.weight.valid_size() / (conv.filter_num * kh * kw);
        assert!(
            c % conv.group == 0 && c / conv.group == icg,
            "ConvReluPool: input has {c} channels, weights expect {} in {} groups",
            icg * conv.group,
            conv.group
        );
        Self {
            n,
            c,
            h,
            w,
            oc: conv.filter_num,
            oh: conv_out_size(h, kh, conv.pad[0], conv.stride[0], conv.dilation[0]),
            ow: conv_out_size(w, kw, conv.pad[1], conv.stride[1], conv.dilation[1]),
            kh,
            kw,
            sh: conv.stride[0],
            sw: conv.stride[1],
            ph: conv.pad[0],
            pw: conv.pad[1],
            dh: conv.dilation[0],
            dw: conv.dilation[1],
            group: conv.group,
        }
    }

    fn ints(&self) -> [usize; 16] {
        [
            self.n, self.c, self.h, self.w, self.oc, self.oh, self.ow, self.kh, self.kw, self.sh, self.sw, self.ph,
            self.pw, self.dh, self.dw, self.group,
        ]
    }

    fn from_ints(v: [usize; 16]) -> Self {
        let [n, c, h, w, oc, oh, ow, kh, kw, sh, sw, ph, pw, dh, dw, group] = v;
        Self {
            n,
            c,
            h,
            w,
            oc,
            oh,
            ow,
            kh,
            kw,
            sh,
            sw,
            ph,
            pw,
            dh,
            dw,
            group,
        }
    }
}

/// Resolved pooling window over a `h × w` plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub method: PoolMethod,
    pub window: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub out: [usize; 2],
}

impl PoolGeometry {
    pub fn new(pool: &PoolParam, h: usize, w: usize) -> Self {
        if pool.global {
            return Self {
                method: pool.method,
                window: [h, w],
                stride: [1, 1],
                pad: [0, 0],
                out: [1, 1],
            };
        }
        Self {
            method: pool.method,
            window: pool.window,
            stride: pool.stride,
            pad: pool.pad,
            out: [
                pool_out_size(h, pool.window[0], pool.pad[0], pool.stride[0], pool.floor_as_conv),
                pool_out_size(w, pool.window[1], pool.pad[1], pool.stride[1], pool.floor_as_conv),
            ],
        }
    }
}

/// Output is `(N, filters, pooled_h, pooled_w)`.
pub fn compute_output_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &ConvPoolParam) {
    assert_eq!(inputs.len(), 1, "ConvReluPool takes one input, got {}", inputs.len());
    let x = &inputs[0];
    assert_eq!(x.layout(), Layout::Nchw, "ConvReluPool expects NCHW input, got {}", x.layout());
    let g = ConvGeometry::new(x, &param.conv);
    let pool = PoolGeometry::new(&param.pool, g.oh, g.ow);
    outputs[0].set_shape([g.n, g.oc, pool.out[0], pool.out[1]], Layout::Nchw);
    outputs[0].set_seq_offset(x.seq_offset().to_vec());
}

/// Relays out OIHW weights to OHWI in place.
pub fn relayout_weights(weight: &Tensor, filter_num: usize, kernel_size: [usize; 2]) {
    let mut storage = weight.buffer().write();
    let Some(w) = storage.as_f32_mut() else {
        return;
    };
    let [kh, kw] = kernel_size;
    let per_filter = w.len() / filter_num.max(1);
    let icg = per_filter / (kh * kw).max(1);
    if per_filter == 0 {
        return;
    }
    let src = w.to_vec();
    w.par_chunks_mut(per_filter)
        .zip(src.par_chunks(per_filter))
        .for_each(|(dst, s)| {
            for ic in 0..icg {
                for ky in 0..kh {
                    for kx in 0..kw {
                        dst[(ky * kw + kx) * icg + ic] = s[(ic * kh + ky) * kw + kx];
                    }
                }
            }
        });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStrategy {
    Direct,
    /// Transpose, GEMM, transpose back.
    Gemm1x1,
}

/// Chooses between the GEMM chain and the direct kernel.
///
/// Only unpadded, undilated, ungrouped 1x1 convolutions qualify for GEMM. Of
/// those, batched stride-1 inputs no wider than `policy.max_width` take it,
/// and so do stride-2 inputs when `policy.stride_two` is set.
pub fn select_strategy(policy: &GemmPolicy, input: &Tensor, conv: &ConvParam) -> ConvStrategy {
    let pointwise = conv.kernel_size == [1, 1]
        && conv.pad == [0, 0]
        && conv.dilation == [1, 1]
        && conv.group == 1
        && conv.stride[0] == conv.stride[1];
    if !pointwise {
        return ConvStrategy::Direct;
    }
    let stride = conv.stride[0];
    let small_batched = input.num() >= policy.min_batch && input.width() <= policy.max_width && stride == 1;
    if small_batched || (policy.stride_two && stride == 2) {
        ConvStrategy::Gemm1x1
    } else {
        ConvStrategy::Direct
    }
}

fn pool_args(g: &ConvGeometry, pool: &PoolGeometry, has_bias: bool) -> Vec<KernelArg> {
    let method = match pool.method {
        PoolMethod::Max => 0,
        PoolMethod::AverageIncludePadding => 1,
    };
    vec![
        int_arg(g.n),
        int_arg(g.oc),
        int_arg(g.oh),
        int_arg(g.ow),
        int_arg(pool.out[0]),
        int_arg(pool.out[1]),
        int_arg(pool.window[0]),
        int_arg(pool.window[1]),
        int_arg(pool.stride[0]),
        int_arg(pool.stride[1]),
        int_arg(pool.pad[0]),
        int_arg(pool.pad[1]),
        KernelArg::Int(method),
        KernelArg::Int(i32::from(has_bias)),
    ]
}

/// Kernel-chain implementation.
#[derive(Debug, Default)]
pub struct SaberConvPool {
    strategy: Option<ConvStrategy>,
    geometry: Option<(ConvGeometry, PoolGeometry)>,
    kernels: Vec<KernelHandle>,
    conv_out: Option<Tensor>,
    cnhw_in: Option<Tensor>,
    cnhw_out: Option<Tensor>,
    zero_bias: Option<Tensor>,
}

impl SaberConvPool {
    pub fn strategy(&self) -> Option<ConvStrategy> {
        self.strategy
    }
}

impl KernelImpl<ConvPoolParam> for SaberConvPool {
    fn create(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &ConvPoolParam, ctx: &OpContext) -> SaberResult<()> {
        let x = &inputs[0];
        let g = ConvGeometry::new(x, &param.conv);
        let pool = PoolGeometry::new(&param.pool, g.oh, g.ow);
        let strategy = select_strategy(ctx.gemm_policy(), x, &param.conv);
        log::debug!("{OP}: {strategy:?} for input {:?}", x.shape().dims());

        let cols = g.n * g.oh * g.ow;
        self.conv_out = Some(Tensor::new([g.n, g.oc, g.oh, g.ow], Layout::Nchw));
        self.zero_bias = Some(Tensor::new([g.oc], Layout::W));
        self.kernels.clear();
        match strategy {
            ConvStrategy::Direct => {
                let info = KernelInfo::new("ConvDirect", DIRECT_KERNEL).with_count(g.n * g.oc * g.oh * g.ow);
                self.kernels.push(build(OP, ctx, &info)?);
                self.cnhw_in = None;
                self.cnhw_out = None;
            }
            ConvStrategy::Gemm1x1 => {
                self.cnhw_in = Some(Tensor::new([g.c, cols], Layout::Hw));
                self.cnhw_out = Some(Tensor::new([g.oc, cols], Layout::Hw));
                let to_cnhw = KernelInfo::new("Transpose", TO_CNHW_KERNEL).with_count(g.c * cols);
                let gemm = KernelInfo::new("Gemm", GEMM_KERNEL).with_work(&[16, 16], &[cols, g.oc]);
                let to_nchw = KernelInfo::new("Transpose", TO_NCHW_KERNEL).with_count(g.oc * cols);
                for info in [to_cnhw, gemm, to_nchw] {
                    self.kernels.push(build(OP, ctx, &info)?);
                }
            }
        }
        let info = KernelInfo::new("BiasReluPool", POOL_KERNEL).with_count(outputs[0].valid_size());
        self.kernels.push(build(OP, ctx, &info)?);
        self.strategy = Some(strategy);
        self.geometry = Some((g, pool));
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &ConvPoolParam, ctx: &OpContext) -> SaberResult<()> {
        let (Some(strategy), Some((g, pool)), Some(conv_out), Some(zero_bias)) =
            (self.strategy, self.geometry, &self.conv_out, &self.zero_bias)
        else {
            return Err(SaberError::KernelCreate {
                op: OP,
                kernel: DIRECT_KERNEL.into(),
            });
        };
        let x = &inputs[0];
        let weight = &param.conv.weight;

        let mut bindings: Vec<Vec<KernelArg>> = Vec::with_capacity(4);
        match strategy {
            ConvStrategy::Direct => {
                let mut args: Vec<KernelArg> = vec![conv_out.into(), x.into(), weight.into()];
                args.extend(g.ints().into_iter().map(int_arg));
                bindings.push(args);
            }
            ConvStrategy::Gemm1x1 => {
                let (Some(cnhw_in), Some(cnhw_out)) = (&self.cnhw_in, &self.cnhw_out) else {
                    return Err(SaberError::KernelCreate {
                        op: OP,
                        kernel: GEMM_KERNEL.into(),
                    });
                };
                let cols = g.n * g.oh * g.ow;
                bindings.push(vec![
                    cnhw_in.into(),
                    x.into(),
                    int_arg(g.n),
                    int_arg(g.c),
                    int_arg(g.h),
                    int_arg(g.w),
                    int_arg(g.oh),
                    int_arg(g.ow),
                    int_arg(g.sh),
                    int_arg(g.sw),
                ]);
                bindings.push(vec![
                    cnhw_out.into(),
                    weight.into(),
                    cnhw_in.into(),
                    int_arg(g.oc),
                    int_arg(cols),
                    int_arg(g.c),
                    1.0f32.into(),
                    0.0f32.into(),
                ]);
                bindings.push(vec![
                    conv_out.into(),
                    cnhw_out.into(),
                    int_arg(g.n),
                    int_arg(g.oc),
                    int_arg(g.oh * g.ow),
                ]);
            }
        }
        let bias = param.conv.bias.as_ref().unwrap_or(zero_bias);
        let mut args: Vec<KernelArg> = vec![(&outputs[0]).into(), conv_out.into(), bias.into()];
        args.extend(pool_args(&g, &pool, param.conv.bias.is_some()));
        args.push(param.relu_alpha.into());
        bindings.push(args);

        if bindings.len() != self.kernels.len() {
            return Err(SaberError::KernelCreate {
                op: OP,
                kernel: POOL_KERNEL.into(),
            });
        }
        for (kernel, args) in self.kernels.iter_mut().zip(bindings) {
            bind(OP, kernel, args)?;
        }
        launch(OP, ctx, &self.kernels)
    }
}

/// Host library path: im2col and a rayon GEMM, no device queue.
#[derive(Debug, Default)]
pub struct VenderConvPool {
    geometry: Option<(ConvGeometry, PoolGeometry)>,
}

impl KernelImpl<ConvPoolParam> for VenderConvPool {
    fn create(&mut self, inputs: &[Tensor], _outputs: &mut [Tensor], param: &ConvPoolParam, _ctx: &OpContext) -> SaberResult<()> {
        let g = ConvGeometry::new(&inputs[0], &param.conv);
        self.geometry = Some((g, PoolGeometry::new(&param.pool, g.oh, g.ow)));
        Ok(())
    }

    fn dispatch(&mut self, inputs: &[Tensor], outputs: &mut [Tensor], param: &ConvPoolParam, ctx: &OpContext) -> SaberResult<()> {
        let Some((g, pool)) = self.geometry else {
            return Err(SaberError::KernelCreate {
                op: OP,
                kernel: "im2col".into(),
            });
        };
        ctx.stream().synchronize()?;
        let err = |reason: &str| {
            SaberError::from(DeviceError::Args {
                kernel: "im2col".into(),
                reason: reason.into(),
            })
        };
        let input = inputs[0].buffer().read();
        let weight = param.conv.weight.buffer().read();
        let x = input.as_f32().ok_or_else(|| err("input is not f32"))?;
        let w = weight.as_f32().ok_or_else(|| err("weights are not f32"))?;

        let conv = im2col_conv(x, w, &g);
        let bias_guard = param.conv.bias.as_ref().map(|b| b.buffer().read());
        let bias = match &bias_guard {
            Some(guard) => Some(guard.as_f32().ok_or_else(|| err("bias is not f32"))?),
            None => None,
        };
        let mut out = outputs[0].buffer().write();
        let y = out.as_f32_mut().ok_or_else(|| err("output is not f32"))?;
        if y.len() < g.n * g.oc * pool.out[0] * pool.out[1] {
            return Err(err("output too small"));
        }
        bias_relu_pool(&conv, bias, y, g.oc, g.oh, g.ow, &pool, param.relu_alpha);
        Ok(())
    }
}

/// Convolution over OHWI weights by im2col and GEMM, one group at a time.
fn im2col_conv(x: &[f32], w: &[f32], g: &ConvGeometry) -> Vec<f32> {
    let icg = g.c / g.group;
    let ocg = g.oc / g.group;
    let rows = g.kh * g.kw * icg;
    let cols = g.oh * g.ow;
    let mut out = vec![0.0; g.n * g.oc * cols];
    let mut col = vec![0.0; rows * cols];
    for n in 0..g.n {
        for grp in 0..g.group {
            col.par_chunks_mut(cols).enumerate().for_each(|(r, dst)| {
                let (k, ic) = (r / icg, r % icg);
                let (ky, kx) = (k / g.kw, k % g.kw);
                let plane = &x[((n * g.c) + grp * icg + ic) * g.h * g.w..][..g.h * g.w];
                for oy in 0..g.oh {
                    for ox in 0..g.ow {
                        let iy = (oy * g.sh + ky * g.dh) as isize - g.ph as isize;
                        let ix = (ox * g.sw + kx * g.dw) as isize - g.pw as isize;
                        dst[oy * g.ow + ox] = if iy >= 0 && ix >= 0 && (iy as usize) < g.h && (ix as usize) < g.w {
                            plane[iy as usize * g.w + ix as usize]
                        } else {
                            0.0
                        };
                    }
                }
            });
            let a = &w[grp * ocg * rows..(grp + 1) * ocg * rows];
            let c = &mut out[(n * g.oc + grp * ocg) * cols..(n * g.oc + (grp + 1) * ocg) * cols];
            sgemm(c, a, &col, ocg, cols, rows, 1.0, 0.0);
        }
    }
    out
}

/// Direct convolution over OHWI weights.
fn conv_direct(x: &[f32], w: &[f32], y: &mut [f32], g: &ConvGeometry) {
    let icg = g.c / g.group;
    let ocg = g.oc / g.group;
    let plane = g.oh * g.ow;
    y.par_chunks_mut(plane).enumerate().for_each(|(no, dst)| {
        let (n, o) = (no / g.oc, no % g.oc);
        let grp = o / ocg;
        let filter = &w[o * g.kh * g.kw * icg..(o + 1) * g.kh * g.kw * icg];
        for oy in 0..g.oh {
            for ox in 0..g.ow {
                let mut acc = 0.0;
                for ky in 0..g.kh {
                    let iy = (oy * g.sh + ky * g.dh) as isize - g.ph as isize;
                    if iy < 0 || iy as usize >= g.h {
                        continue;
                    }
                    for kx in 0..g.kw {
                        let ix = (ox * g.sw + kx * g.dw) as isize - g.pw as isize;
                        if ix < 0 || ix as usize >= g.w {
                            continue;
                        }
                        let taps = &filter[(ky * g.kw + kx) * icg..(ky * g.kw + kx + 1) * icg];
                        for (ic, tap) in taps.iter().enumerate() {
                            let c = grp * icg + ic;
                            acc += tap * x[((n * g.c + c) * g.h + iy as usize) * g.w + ix as usize];
                        }
                    }
                }
                dst[oy * g.ow + ox] = acc;
            }
        }
    });
}

/// Adds bias, applies leaky ReLU and pools every `h × w` plane of `conv`.
#[allow(clippy::too_many_arguments)]
fn bias_relu_pool(conv: &[f32], bias: Option<&[f32]>, out: &mut [f32], channel: usize, h: usize, w: usize, pool: &PoolGeometry, alpha: f32) {
    let [out_h, out_w] = pool.out;
    out.par_chunks_mut(out_h * out_w)
        .zip(conv.par_chunks(h * w))
        .enumerate()
        .for_each(|(nc, (dst, src))| {
            let b = bias.map_or(0.0, |b| b[nc % channel]);
            let act = |v: f32| {
                let v = v + b;
                if v > 0.0 { v } else { alpha * v }
            };
            for py in 0..out_h {
                for px in 0..out_w {
                    let hs = (py * pool.stride[0]) as isize - pool.pad[0] as isize;
                    let ws = (px * pool.stride[1]) as isize - pool.pad[1] as isize;
                    let he = (hs + pool.window[0] as isize).min((h + pool.pad[0]) as isize);
                    let we = (ws + pool.window[1] as isize).min((w + pool.pad[1]) as isize);
                    let padded_area = ((he - hs) * (we - ws)).max(1) as f32;
                    let (hs, ws) = (hs.max(0) as usize, ws.max(0) as usize);
                    let (he, we) = (he.min(h as isize).max(0) as usize, we.min(w as isize).max(0) as usize);
                    let value = match pool.method {
                        PoolMethod::Max => {
                            let mut m = f32::NEG_INFINITY;
                            for yy in hs..he {
                                for xx in ws..we {
                                    m = m.max(act(src[yy * w + xx]));
                                }
                            }
                            if m == f32::NEG_INFINITY { 0.0 } else { m }
                        }
                        PoolMethod::AverageIncludePadding => {
                            let mut sum = 0.0;
                            for yy in hs..he {
                                for xx in ws..we {
                                    sum += act(src[yy * w + xx]);
                                }
                            }
                            sum / padded_area
                        }
                    };
                    dst[py * out_w + px] = value;
                }
            }
        });
}

pub(crate) static KERNELS: &[KernelDef] = &[
    KernelDef {
        name: DIRECT_KERNEL,
        // out, in, weight, then the sixteen geometry ints
        signature: &[
            ArgKind::Output,
            ArgKind::Input,
            ArgKind::Input,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
        ],
        host: conv_direct_host,
    },
    KernelDef {
        name: POOL_KERNEL,
        // out, conv, bias, n, c, h, w, out_h, out_w, win_h, win_w,
        // stride_h, stride_w, pad_h, pad_w, method, has_bias, alpha
        signature: &[
            ArgKind::Output,
            ArgKind::Input,
            ArgKind::Input,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Float,
        ],
        host: bias_relu_pool_host,
    },
];

fn conv_direct_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let mut ints = [0usize; 16];
    for (i, v) in ints.iter_mut().enumerate() {
        *v = args.size(3 + i)?;
    }
    let g = ConvGeometry::from_ints(ints);
    if g.group == 0 || g.c % g.group != 0 || g.oc % g.group != 0 {
        return Err(args.error("group does not divide channels"));
    }
    if g.n * g.oc * g.oh * g.ow == 0 {
        return Ok(());
    }
    let input = args.buffer(1)?.read();
    let weight = args.buffer(2)?.read();
    let mut output = args.buffer(0)?.write();
    let x = args.f32s(&input, g.n * g.c * g.h * g.w)?;
    let w = args.f32s(&weight, g.oc * g.kh * g.kw * (g.c / g.group))?;
    let y = args.f32s_mut(&mut output, g.n * g.oc * g.oh * g.ow)?;
    conv_direct(x, w, y, &g);
    Ok(())
}

fn bias_relu_pool_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let (n, c, h, w) = (args.size(3)?, args.size(4)?, args.size(5)?, args.size(6)?);
    let pool = PoolGeometry {
        out: [args.size(7)?, args.size(8)?],
        window: [args.size(9)?, args.size(10)?],
        stride: [args.size(11)?, args.size(12)?],
        pad: [args.size(13)?, args.size(14)?],
        method: match args.int(15)? {
            0 => PoolMethod::Max,
            1 => PoolMethod::AverageIncludePadding,
            m => return Err(args.error(format!("unknown pooling method {m}"))),
        },
    };
    let has_bias = args.int(16)? != 0;
    let alpha = args.float(17)?;
    if n * c * pool.out[0] * pool.out[1] == 0 {
        return Ok(());
    }
    let conv = args.buffer(1)?.read();
    let bias = args.buffer(2)?.read();
    let mut output = args.buffer(0)?.write();
    let conv = args.f32s(&conv, n * c * h * w)?;
    let bias = if has_bias { Some(args.f32s(&bias, c)?) } else { None };
    let y = args.f32s_mut(&mut output, n * c * pool.out[0] * pool.out[1])?;
    bias_relu_pool(conv, bias, y, c, h, w, &pool, alpha);
    Ok(())
}
