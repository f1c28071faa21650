//! `ShuffleChannel`.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::shuffle_channel::{SaberShuffleChannel, ShuffleChannelParam, compute_output_shape};
use crate::funcs::{ImplKind, KernelImpl};
use crate::params::ParamStore;
use crate::tensors::Tensor;

pub struct ShuffleChannel;

impl OpDef for ShuffleChannel {
    const NAME: &'static str = "ShuffleChannel";
    type Param = ShuffleChannelParam;

    fn parse(store: &ParamStore) -> ShuffleChannelParam {
        let group: i32 = store.get("group");
        assert!(group > 0, "ShuffleChannel: group must be positive, got {group}");
        ShuffleChannelParam { group: group as usize }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &ShuffleChannelParam) {
        compute_output_shape(inputs, outputs, param);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<ShuffleChannelParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberShuffleChannel>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub(crate) fn register(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: ShuffleChannel::NAME,
            doc: "ShuffleChannel operator: interleaves channel groups",
            num_in: 1,
            num_out: 1,
            args: &["group"],
            aliases: &["shuffle_channel"],
        },
        &fp32_targets(true),
        FuncHelper::<ShuffleChannel>::boxed,
    );
}
