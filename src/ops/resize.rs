//! `Resize`: bilinear scaling of NCHW tensors.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::resize::{ResizeParam, SaberResize, compute_output_shape};
use crate::funcs::{ImplKind, KernelImpl};
use crate::params::ParamStore;
use crate::tensors::Tensor;

pub struct Resize;

impl OpDef for Resize {
    const NAME: &'static str = "Resize";
    type Param = ResizeParam;

    fn parse(store: &ParamStore) -> ResizeParam {
        ResizeParam {
            height_scale: store.get("height_scale"),
            width_scale: store.get("width_scale"),
        }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &ResizeParam) {
        compute_output_shape(inputs, outputs, param);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<ResizeParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberResize>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub(crate) fn register(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: Resize::NAME,
            doc: "Resize operator: bilinear resize by height and width scales",
            num_in: 1,
            num_out: 1,
            args: &["height_scale", "width_scale"],
            aliases: &["resize"],
        },
        &fp32_targets(false),
        FuncHelper::<Resize>::boxed,
    );
}
