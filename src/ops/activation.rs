//! `Power` and `SoftSign`.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::elementwise::{PowerParam, SaberPower, SaberSoftSign, SoftSignParam, same_shape};
use crate::funcs::{ImplKind, KernelImpl};
use crate::params::ParamStore;
use crate::tensors::Tensor;

pub struct Power;

impl OpDef for Power {
    const NAME: &'static str = "Power";
    type Param = PowerParam;

    fn parse(store: &ParamStore) -> PowerParam {
        PowerParam {
            scale: store.get("scale"),
            shift: store.get("shift"),
            power: store.get("power"),
        }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], _param: &PowerParam) {
        same_shape(inputs, outputs);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<PowerParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberPower>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub struct SoftSign;

impl OpDef for SoftSign {
    const NAME: &'static str = "SoftSign";
    type Param = SoftSignParam;

    fn parse(_store: &ParamStore) -> SoftSignParam {
        SoftSignParam
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], _param: &SoftSignParam) {
        same_shape(inputs, outputs);
    }

    fn make_impl(kind: ImplKind, _target: Target) -> Option<Box<dyn KernelImpl<SoftSignParam>>> {
        match kind {
            ImplKind::Saber => Some(Box::<SaberSoftSign>::default()),
            ImplKind::Vender => None,
        }
    }
}

pub(crate) fn register_power(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: Power::NAME,
            doc: "Power operator: y = (shift + scale * x) ^ power",
            num_in: 1,
            num_out: 1,
            args: &["scale", "shift", "power"],
            aliases: &["power"],
        },
        &fp32_targets(true),
        FuncHelper::<Power>::boxed,
    );
}

pub(crate) fn register_soft_sign(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: SoftSign::NAME,
            doc: "SoftSign operator: y = x / (1 + |x|)",
            num_in: 1,
            num_out: 1,
            args: &[],
            aliases: &["soft_sign", "softsign"],
        },
        &fp32_targets(true),
        FuncHelper::<SoftSign>::boxed,
    );
}
