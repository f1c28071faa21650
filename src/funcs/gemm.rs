//! Matrix multiply and the layout transposes around it.
//!
//! A 1x1 convolution over `(N, C, H, W)` is a GEMM once the input is laid
//! out channel-major: `transpose NCHW -> CNHW`, `Y[M, N·oh·ow] = W[M, K] ·
//! X[K, N·oh·ow]` with `K = C`, `M = filters`, then `transpose CNHW -> NCHW`.
//! Strided 1x1 convolutions subsample during the first transpose.

use rayon::prelude::*;

use crate::error::DeviceError;
use crate::kernel::host::HostArgs;
use crate::kernel::{ArgKind, KernelDef};

pub const GEMM_KERNEL: &str = "conv_gemm";
pub const TO_CNHW_KERNEL: &str = "conv_transpose_nchw2cnhw";
pub const TO_NCHW_KERNEL: &str = "conv_transpose_cnhw2nchw";

pub(crate) static KERNELS: &[KernelDef] = &[
    KernelDef {
        name: GEMM_KERNEL,
        // c, a, b, m, n, k, alpha, beta
        signature: &[
            ArgKind::Output,
            ArgKind::Input,
            ArgKind::Input,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Float,
            ArgKind::Float,
        ],
        host: gemm_host,
    },
    KernelDef {
        name: TO_CNHW_KERNEL,
        // out, in, n, c, h, w, out_h, out_w, stride_h, stride_w
        signature: &[
            ArgKind::Output,
            ArgKind::Input,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
            ArgKind::Int,
        ],
        host: to_cnhw_host,
    },
    KernelDef {
        name: TO_NCHW_KERNEL,
        // out, in, n, c, spatial
        signature: &[ArgKind::Output, ArgKind::Input, ArgKind::Int, ArgKind::Int, ArgKind::Int],
        host: to_nchw_host,
    },
];

/// `C = alpha · A · B + beta · C` for row-major `A: m×k`, `B: k×n`.
pub fn sgemm(c: &mut [f32], a: &[f32], b: &[f32], m: usize, n: usize, k: usize, alpha: f32, beta: f32) {
    c[..m * n].par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        if beta == 0.0 {
            row.fill(0.0);
        } else if beta != 1.0 {
            row.iter_mut().for_each(|v| *v *= beta);
        }
        for p in 0..k {
            let aip = alpha * a[i * k + p];
            if aip == 0.0 {
                continue;
            }
            let b_row = &b[p * n..(p + 1) * n];
            for (cv, bv) in row.iter_mut().zip(b_row) {
                *cv += aip * bv;
            }
        }
    });
}

fn gemm_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let (m, n, k) = (args.size(3)?, args.size(4)?, args.size(5)?);
    let (alpha, beta) = (args.float(6)?, args.float(7)?);
    if m * n == 0 {
        return Ok(());
    }
    let a = args.buffer(1)?.read();
    let b = args.buffer(2)?.read();
    let mut c = args.buffer(0)?.write();
    let a = args.f32s(&a, m * k)?;
    let b = args.f32s(&b, k * n)?;
    let c = args.f32s_mut(&mut c, m * n)?;
    sgemm(c, a, b, m, n, k, alpha, beta);
    Ok(())
}

fn to_cnhw_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let (n, c, h, w) = (args.size(2)?, args.size(3)?, args.size(4)?, args.size(5)?);
    let (oh, ow) = (args.size(6)?, args.size(7)?);
    let (sh, sw) = (args.size(8)?, args.size(9)?);
    if n * c * oh * ow == 0 {
        return Ok(());
    }
    if (oh - 1) * sh >= h || (ow - 1) * sw >= w {
        return Err(args.error("subsampled plane exceeds the input"));
    }
    let input = args.buffer(1)?.read();
    let mut output = args.buffer(0)?.write();
    let x = args.f32s(&input, n * c * h * w)?;
    let y = args.f32s_mut(&mut output, c * n * oh * ow)?;

    // y[ci][ni][oy][ox] = x[ni][ci][oy*sh][ox*sw]
    y.par_chunks_mut(n * oh * ow).enumerate().for_each(|(ci, dst)| {
        for ni in 0..n {
            let plane = &x[(ni * c + ci) * h * w..(ni * c + ci + 1) * h * w];
            for oy in 0..oh {
                for ox in 0..ow {
                    dst[(ni * oh + oy) * ow + ox] = plane[oy * sh * w + ox * sw];
                }
            }
        }
    });
    Ok(())
}

fn to_nchw_host(args: &HostArgs<'_>) -> Result<(), DeviceError> {
    let (n, c, spatial) = (args.size(2)?, args.size(3)?, args.size(4)?);
    if n * c * spatial == 0 {
        return Ok(());
    }
    let input = args.buffer(1)?.read();
    let mut output = args.buffer(0)?.write();
    let x = args.f32s(&input, n * c * spatial)?;
    let y = args.f32s_mut(&mut output, n * c * spatial)?;

    y.par_chunks_mut(spatial).enumerate().for_each(|(nc, dst)| {
        let (ni, ci) = (nc / c, nc % c);
        let src = (ci * n + ni) * spatial;
        dst.copy_from_slice(&x[src..src + spatial]);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgemm_small() {
        // [1 2; 3 4] x [5 6; 7 8]
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [1.0; 4];
        sgemm(&mut c, &a, &b, 2, 2, 2, 1.0, 0.0);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
        sgemm(&mut c, &a, &b, 2, 2, 2, 1.0, 1.0);
        assert_eq!(c, [38.0, 44.0, 86.0, 100.0]);
    }
}
