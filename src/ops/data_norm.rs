//! `DataNorm`: normalization by accumulated batch statistics.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::data_norm::{DataNormParam, SaberDataNorm, compute_output_shape};
use crate::funcs::{ImplKind, KernelImpl};
use crate::params::ParamStore;
use crate::tensors::Tensor;

pub struct DataNorm;

impl OpDef for DataNorm {
    const NAME: &'static str = "DataNorm";
    type Param = DataNormParam;

    fn parse(store: &ParamStore) -> DataNormParam {
        DataNormParam {
            batch_sum: store.get("weight_1"),
            batch_size: store.get("weight_2"),
            batch_square_sum: store.get("weight_3"),
            epsilon: store.get("epsilon"),
        }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &DataNormParam) {
        compute_output_shape(inputs, outputs, param);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<DataNormParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberDataNorm>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub(crate) fn register(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: DataNorm::NAME,
            doc: "DataNorm operator: y = (x - sum / size) * sqrt(size / square_sum)",
            num_in: 1,
            num_out: 1,
            args: &["weight_1", "weight_2", "weight_3", "epsilon"],
            aliases: &["data_norm"],
        },
        &fp32_targets(true),
        FuncHelper::<DataNorm>::boxed,
    );
}
