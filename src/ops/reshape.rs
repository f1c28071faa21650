//! `Reshape`.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::reshape::{ReshapeParam, SaberReshape, compute_output_shape};
use crate::funcs::{ImplKind, KernelImpl};
use crate::params::ParamStore;
use crate::tensors::{Layout, Tensor};

pub struct Reshape;

impl OpDef for Reshape {
    const NAME: &'static str = "Reshape";
    type Param = ReshapeParam;

    fn parse(store: &ParamStore) -> ReshapeParam {
        let layout = store.has("layout").then(|| {
            let name: String = store.get("layout");
            Layout::parse(&name).unwrap_or_else(|| panic!("Reshape: unknown layout `{name}` on node `{}`", store.node()))
        });
        ReshapeParam {
            dims: store.get("dims"),
            layout,
        }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &ReshapeParam) {
        compute_output_shape(inputs, outputs, param);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<ReshapeParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberReshape>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub(crate) fn register(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: Reshape::NAME,
            doc: "Reshape operator: 0 keeps the input dim, -1 infers one dim",
            num_in: 1,
            num_out: 1,
            args: &["dims", "layout"],
            aliases: &["reshape"],
        },
        &fp32_targets(true),
        FuncHelper::<Reshape>::boxed,
    );
}
