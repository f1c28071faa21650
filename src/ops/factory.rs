//! Operator registry.
//!
//! The table is built once, on first use, from the `register` function of
//! every operator module and is read-only afterwards. Each entry carries the
//! operator's schema and one helper builder per supported
//! `(precision, target)` pair. Lookups accept the canonical name or any alias.

use std::collections::{BTreeMap, HashMap};

use super::{Operator, OperatorHelper, activation, conv_relu_pool, cos_sim, data_norm, mat_mul, pixel_shuffle, reshape};
use super::{resize, sequence_pool, sequence_pool_concat, shuffle_channel};
use crate::backend::{Precision, Target};

/// Registration metadata of one operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpSchema {
    pub name: &'static str,
    pub doc: &'static str,
    pub num_in: usize,
    pub num_out: usize,
    /// Parameter names the operator reads.
    pub args: &'static [&'static str],
    pub aliases: &'static [&'static str],
}

pub(crate) type HelperBuilder = fn() -> Box<dyn OperatorHelper>;

#[derive(Default)]
pub(crate) struct Registry {
    schemas: BTreeMap<&'static str, OpSchema>,
    names: HashMap<&'static str, &'static str>,
    builders: HashMap<(&'static str, Precision, Target), HelperBuilder>,
}

impl Registry {
    /// Registers `schema` with `builder` for every pair in `combos`.
    pub(crate) fn add(&mut self, schema: OpSchema, combos: &[(Precision, Target)], builder: HelperBuilder) {
        let name = schema.name;
        for alias in schema.aliases.iter().chain(std::iter::once(&name)) {
            if let Some(prev) = self.names.insert(*alias, name) {
                log::warn!("operator name `{alias}` moved from {prev} to {name}");
            }
        }
        for &(precision, target) in combos {
            self.builders.insert((name, precision, target), builder);
        }
        self.schemas.insert(name, schema);
    }
}

/// `Host × Fp32`, plus `Wgpu × Fp32` when the operator has a WGSL kernel and
/// the crate is built with `wgpu`.
pub(crate) fn fp32_targets(has_wgsl: bool) -> Vec<(Precision, Target)> {
    let mut combos = vec![(Precision::Fp32, Target::Host)];
    if cfg!(feature = "wgpu") && has_wgsl {
        combos.push((Precision::Fp32, Target::Wgpu));
    }
    combos
}

lazy_static::lazy_static! {
    static ref REGISTRY: Registry = {
        let mut reg = Registry::default();
        let all: [fn(&mut Registry); 12] = [
            activation::register_power,
            activation::register_soft_sign,
            conv_relu_pool::register,
            cos_sim::register,
            data_norm::register,
            mat_mul::register,
            pixel_shuffle::register,
            reshape::register,
            resize::register,
            sequence_pool::register,
            sequence_pool_concat::register,
            shuffle_channel::register,
        ];
        for register in all {
            register(&mut reg);
        }
        reg
    };
}

fn canonical(name: &str) -> Option<&'static str> {
    REGISTRY.names.get(name).copied()
}

/// Instantiates the operator `name` for `precision` on `target`.
///
/// # Panics
/// Panics if the operator is unknown or not registered for the pair.
pub fn create(name: &str, precision: Precision, target: Target) -> Operator {
    let builder = canonical(name).and_then(|op| REGISTRY.builders.get(&(op, precision, target)).map(|b| (op, b)));
    match builder {
        Some((op, build)) => {
            log::debug!("creating {op} for {precision} on {target}");
            Operator::new(op, target, precision, build())
        }
        None => panic!("unsupported target or precision! (opname: {name}, target: {target}, precision: {precision})"),
    }
}

/// Same as [`create`] with textual precision and target names.
///
/// # Panics
/// Panics on unknown names as well as on unsupported pairs.
pub fn create_from_str(name: &str, precision: &str, target: &str) -> Operator {
    let (Some(p), Some(t)) = (Precision::parse(precision), Target::parse(target)) else {
        panic!("unsupported target or precision! (opname: {name}, target: {target}, precision: {precision})");
    };
    create(name, p, t)
}

/// Schema of `name` (or of the operator it aliases).
pub fn schema(name: &str) -> Option<&'static OpSchema> {
    canonical(name).and_then(|op| REGISTRY.schemas.get(op))
}

pub fn is_supported(name: &str, precision: Precision, target: Target) -> bool {
    canonical(name).is_some_and(|op| REGISTRY.builders.contains_key(&(op, precision, target)))
}

/// Canonical names of every registered operator, sorted.
pub fn registered_ops() -> Vec<&'static str> {
    REGISTRY.schemas.keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operator_runs_on_host_fp32() {
        for op in registered_ops() {
            assert!(is_supported(op, Precision::Fp32, Target::Host), "{op}");
            assert!(!is_supported(op, Precision::Int8, Target::Host), "{op}");
        }
    }

    #[test]
    fn aliases_resolve() {
        assert_eq!(schema("reshape").map(|s| s.name), Some("Reshape"));
        assert_eq!(schema("convolution_relu_pooling").map(|s| s.name), Some("ConvReluPool"));
        assert!(schema("Nope").is_none());
    }

    #[test]
    #[should_panic(expected = "unsupported target or precision! (opname: Reshape, target: host, precision: fp16)")]
    fn unregistered_precision_is_fatal() {
        create("Reshape", Precision::Fp16, Target::Host);
    }
}
