//! `SequencePool`: one output row per sequence.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::sequence_pool::{SaberSequencePool, SequencePoolParam, SequencePoolType, compute_output_shape};
use crate::funcs::{ImplKind, KernelImpl};
use crate::params::ParamStore;
use crate::tensors::Tensor;

pub struct SequencePool;

impl OpDef for SequencePool {
    const NAME: &'static str = "SequencePool";
    type Param = SequencePoolParam;

    fn parse(store: &ParamStore) -> SequencePoolParam {
        let name: String = store.get("pooltype");
        let pool_type = SequencePoolType::parse(&name)
            .unwrap_or_else(|| panic!("SequencePool: unknown pooltype `{name}` on node `{}`", store.node()));
        SequencePoolParam { pool_type }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &SequencePoolParam) {
        compute_output_shape(inputs, outputs, param);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<SequencePoolParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberSequencePool>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub(crate) fn register(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: SequencePool::NAME,
            doc: "SequencePool operator: AVERAGE, SUM, SQRT, MAX, LAST or FIRST over each sequence",
            num_in: 1,
            num_out: 1,
            args: &["pooltype"],
            aliases: &["sequence_pool"],
        },
        &fp32_targets(false),
        FuncHelper::<SequencePool>::boxed,
    );
}
