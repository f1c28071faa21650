//! `PixelShuffle` and its inverse.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::permute::{PixelShuffleParam, SaberPixelShuffle, compute_output_shape};
use crate::funcs::{ImplKind, KernelImpl};
use crate::params::ParamStore;
use crate::tensors::Tensor;

pub struct PixelShuffle;

impl OpDef for PixelShuffle {
    const NAME: &'static str = "PixelShuffle";
    type Param = PixelShuffleParam;

    fn parse(store: &ParamStore) -> PixelShuffleParam {
        let factor: i32 = store.get("upscale_factor");
        assert!(factor > 0, "PixelShuffle: upscale_factor must be positive, got {factor}");
        PixelShuffleParam {
            upscale_factor: factor as usize,
            inverse: store.get_or("inverse", false),
        }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &PixelShuffleParam) {
        compute_output_shape(inputs, outputs, param);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<PixelShuffleParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberPixelShuffle>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub(crate) fn register(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: PixelShuffle::NAME,
            doc: "PixelShuffle operator: moves channel blocks into space, or back with `inverse`",
            num_in: 1,
            num_out: 1,
            args: &["upscale_factor", "inverse"],
            aliases: &["pixel_shuffle"],
        },
        &fp32_targets(true),
        FuncHelper::<PixelShuffle>::boxed,
    );
}
