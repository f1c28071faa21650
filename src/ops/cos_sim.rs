//! `CosSim`: cosine similarity of two inputs, row by row.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::cos_sim::{CosSimParam, SaberCosSim, compute_output_shape};
use crate::funcs::{ImplKind, KernelImpl};
use crate::params::ParamStore;
use crate::tensors::Tensor;

pub struct CosSim;

impl OpDef for CosSim {
    const NAME: &'static str = "CosSim";
    type Param = CosSimParam;

    fn parse(store: &ParamStore) -> CosSimParam {
        CosSimParam {
            epsilon: store.get("epsilon"),
        }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &CosSimParam) {
        compute_output_shape(inputs, outputs, param);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<CosSimParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberCosSim>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub(crate) fn register(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: CosSim::NAME,
            doc: "CosSim operator: per-row cosine similarity of two equally sized inputs",
            num_in: 2,
            num_out: 1,
            args: &["epsilon"],
            aliases: &["cos_sim"],
        },
        &fp32_targets(false),
        FuncHelper::<CosSim>::boxed,
    );
}
