//! `ConvReluPool`: fused convolution, leaky ReLU and pooling.
//!
//! The only operator with a weight transform. `init` relays the shared
//! weights out from OIHW to OHWI once per weight buffer, under the level-0
//! lock of [`GlobalMem`], then builds kernels for the current shapes. Later
//! inits, on this helper or any other sharing the weights, only rebuild the
//! kernels.

use super::factory::{OpSchema, Registry, fp32_targets};
use super::{FuncHelper, OpDef};
use crate::backend::Target;
use crate::funcs::conv_pool::{
    ConvParam, ConvPoolParam, PoolMethod, PoolParam, SaberConvPool, VenderConvPool, compute_output_shape, relayout_weights,
};
use crate::funcs::{ImplKind, KernelImpl};
use crate::global_mem::{GlobalMem, Level};
use crate::params::ParamStore;
use crate::tensors::Tensor;

pub struct ConvReluPool;

/// Reads a two-element `(h, w)` parameter; one element applies to both.
fn pair(store: &ParamStore, name: &str) -> [usize; 2] {
    let v: Vec<i32> = store.get(name);
    let checked = |x: i32| {
        usize::try_from(x).unwrap_or_else(|_| panic!("ConvReluPool: `{name}` of node `{}` has negative entry {x}", store.node()))
    };
    match v.as_slice() {
        [a] => [checked(*a); 2],
        [h, w] => [checked(*h), checked(*w)],
        _ => panic!("ConvReluPool: `{name}` of node `{}` needs 1 or 2 entries, got {v:?}", store.node()),
    }
}

fn count(store: &ParamStore, name: &str) -> usize {
    let v: i32 = store.get(name);
    usize::try_from(v).unwrap_or_else(|_| panic!("ConvReluPool: `{name}` of node `{}` is negative: {v}", store.node()))
}

impl OpDef for ConvReluPool {
    const NAME: &'static str = "ConvReluPool";
    type Param = ConvPoolParam;

    fn parse(store: &ParamStore) -> ConvPoolParam {
        let bias_term: bool = store.get("bias_term");
        let conv = ConvParam {
            group: count(store, "group"),
            pad: pair(store, "padding"),
            stride: pair(store, "strides"),
            dilation: pair(store, "dilation_rate"),
            filter_num: count(store, "filter_num"),
            kernel_size: pair(store, "kernel_size"),
            axis: store.get_or::<i32>("axis", 1).max(0) as usize,
            weight: store.get("weight_1"),
            bias: bias_term.then(|| store.get("weight_2")),
        };

        let method: String = store.get("pooling_0_method");
        let method =
            PoolMethod::parse(&method).unwrap_or_else(|| panic!("ConvReluPool doesn't support : {method} pooling"));
        let global = store.get("pooling_0_global_pooling");
        let pool = PoolParam {
            method,
            global,
            window: if global { [1, 1] } else { pair(store, "pooling_0_pool_size") },
            pad: if global { [0, 0] } else { pair(store, "pooling_0_padding") },
            stride: if global { [1, 1] } else { pair(store, "pooling_0_strides") },
            floor_as_conv: store.get_or("pooling_0_cmp_out_shape_floor_as_conv", false),
        };

        ConvPoolParam {
            conv,
            relu_alpha: store.get_or("relu_0_alpha", 0.0),
            pool,
        }
    }

    fn infer_shape(inputs: &[Tensor], outputs: &mut [Tensor], param: &ConvPoolParam) {
        compute_output_shape(inputs, outputs, param);
    }

    fn make_impl(kind: ImplKind, target: Target) -> Option<Box<dyn KernelImpl<ConvPoolParam>>> {
        match (kind, target) {
            (ImplKind::Saber, _) => Some(Box::<SaberConvPool>::default()),
            (ImplKind::Vender, Target::Host) => Some(Box::<VenderConvPool>::default()),
            (ImplKind::Vender, _) => None,
        }
    }

    fn prepare(param: &ConvPoolParam) {
        let conv = &param.conv;
        let flag = conv.weight.buffer().transform_flag();
        let ran = GlobalMem::global().apply_once(Level::L0, flag, || {
            relayout_weights(&conv.weight, conv.filter_num, conv.kernel_size);
        });
        if ran.is_some() {
            log::debug!("ConvReluPool: relaid out {} weights to OHWI", conv.weight.valid_size());
        }
    }
}

pub(crate) fn register(reg: &mut Registry) {
    reg.add(
        OpSchema {
            name: ConvReluPool::NAME,
            doc: "ConvReluPool operator: convolution, leaky relu and MAX/AVG pooling in one pass",
            num_in: 1,
            num_out: 1,
            args: &[
                "group",
                "bias_term",
                "padding",
                "strides",
                "dilation_rate",
                "filter_num",
                "kernel_size",
                "axis",
                "weight_1",
                "weight_2",
                "relu_0_alpha",
                "pooling_0_global_pooling",
                "pooling_0_padding",
                "pooling_0_strides",
                "pooling_0_pool_size",
                "pooling_0_method",
                "pooling_0_cmp_out_shape_floor_as_conv",
            ],
            aliases: &["convolution_relu_pooling", "ConvolutionReluPooling"],
        },
        &fp32_targets(false),
        FuncHelper::<ConvReluPool>::boxed,
    );
}
