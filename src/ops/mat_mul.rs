//! `MatMul`: batched matrix product of two NCHW tensors.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::mat_mul::{MatMulParam, SaberMatMul, compute_output_shape};
use crate::funcs::{ImplKind, KernelImpl};
use crate::params::ParamStore;
use crate::tensors::Tensor;

pub struct MatMul;

impl OpDef for MatMul {
    const NAME: &'static str = "MatMul";
    type Param = MatMulParam;

    fn parse(store: &ParamStore) -> MatMulParam {
        MatMulParam {
            transpose_x: store.get("transpose_x"),
            transpose_y: store.get("transpose_y"),
            scale: store.get_or("coeff", 1.0f32),
        }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &MatMulParam) {
        compute_output_shape(inputs, outputs, param);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<MatMulParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberMatMul>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub(crate) fn register(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: MatMul::NAME,
            doc: "MatMul operator: coeff * op(X) * op(Y) per (N, C) plane, Y may be shared",
            num_in: 2,
            num_out: 1,
            args: &["transpose_x", "transpose_y", "coeff"],
            aliases: &["mat_mul", "matmul"],
        },
        &fp32_targets(false),
        FuncHelper::<MatMul>::boxed,
    );
}
