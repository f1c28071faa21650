//! `SequencePoolConcat`: pooled sequences concatenated `slot_num` to a row.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::sequence_pool::{
    SaberSequencePoolConcat, SequencePoolConcatParam, SequencePoolType, compute_concat_output_shape,
};
use crate::funcs::{ImplKind, KernelImpl};
use crate::params::ParamStore;
use crate::tensors::Tensor;

pub struct SequencePoolConcat;

impl OpDef for SequencePoolConcat {
    const NAME: &'static str = "SequencePoolConcat";
    type Param = SequencePoolConcatParam;

    fn parse(store: &ParamStore) -> SequencePoolConcatParam {
        let name: String = store.get_or("pooltype", String::from("SUM"));
        let pool_type = SequencePoolType::parse(&name).unwrap_or_else(|| {
            panic!("SequencePoolConcat: unknown pooltype `{name}` on node `{}`", store.node())
        });
        let slot_num: i32 = store.get("slot_num");
        SequencePoolConcatParam {
            pool_type,
            slot_num: usize::try_from(slot_num).unwrap_or(0),
        }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &SequencePoolConcatParam) {
        compute_concat_output_shape(inputs, outputs, param);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<SequencePoolConcatParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberSequencePoolConcat>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub(crate) fn register(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: SequencePoolConcat::NAME,
            doc: "SequencePoolConcat operator: pools each sequence and joins slot_num pooled rows",
            num_in: 1,
            num_out: 1,
            args: &["pooltype", "slot_num"],
            aliases: &["sequence_pool_concat"],
        },
        &fp32_targets(false),
        FuncHelper::<SequencePoolConcat>::boxed,
    );
}
