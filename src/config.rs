//! Runtime configuration.
//!
//! Everything here has a sensible default; [`RuntimeConfig::from_env`] lets a
//! deployment override it without recompiling:
//!
//! | variable                | field                  | values                     |
//! |-------------------------|------------------------|----------------------------|
//! | `SABER_TARGET`          | `target`               | `host`, `wgpu`             |
//! | `SABER_PRECISION`       | `precision`            | `fp32`, `fp16`, `int8`     |
//! | `SABER_DEVICE`          | `device_id`            | device index               |
//! | `SABER_PROFILE`         | `profile`              | `1`, `true`, `yes`, `on`   |
//! | `SABER_IMPL`            | `impl_kind`            | `saber`, `vender`          |
//! | `SABER_GEMM_MAX_WIDTH`  | `gemm.max_width`       | width                      |
//! | `SABER_GEMM_MIN_BATCH`  | `gemm.min_batch`       | batch                      |
//!
//! Unparseable values are logged and ignored.

use crate::backend::{self, Precision, Target};
use crate::funcs::ImplKind;
use crate::kernel::profiler;

/// Thresholds for routing 1x1 convolutions through GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmPolicy {
    /// Widest stride-1 input that still takes the GEMM path.
    pub max_width: usize,
    /// Smallest batch that takes the stride-1 GEMM path.
    pub min_batch: usize,
    /// Whether stride-2 pointwise convolutions always take GEMM.
    pub stride_two: bool,
}

impl Default for GemmPolicy {
    fn default() -> Self {
        Self {
            max_width: 14,
            min_batch: 2,
            stride_two: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub target: Target,
    pub precision: Precision,
    pub device_id: usize,
    /// Record kernel launch events and synchronize after every kernel.
    pub profile: bool,
    pub impl_kind: ImplKind,
    pub gemm: GemmPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            target: Target::Host,
            precision: Precision::Fp32,
            device_id: 0,
            profile: false,
            impl_kind: ImplKind::Saber,
            gemm: GemmPolicy::default(),
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl RuntimeConfig {
    /// Defaults overridden by the `SABER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RuntimeConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let read = |key: &str, field: &mut dyn FnMut(&str) -> bool| {
            if let Some(v) = lookup(key) {
                if !field(&v) {
                    log::warn!("ignoring {key}={v:?}: not a valid value");
                }
            }
        };
        read("SABER_TARGET", &mut |v| Target::parse(v).map(|t| cfg.target = t).is_some());
        read("SABER_PRECISION", &mut |v| {
            Precision::parse(v).map(|p| cfg.precision = p).is_some()
        });
        read("SABER_DEVICE", &mut |v| v.trim().parse().map(|id| cfg.device_id = id).is_ok());
        read("SABER_PROFILE", &mut |v| parse_bool(v).map(|b| cfg.profile = b).is_some());
        read("SABER_IMPL", &mut |v| ImplKind::parse(v).map(|k| cfg.impl_kind = k).is_some());
        read("SABER_GEMM_MAX_WIDTH", &mut |v| {
            v.trim().parse().map(|w| cfg.gemm.max_width = w).is_ok()
        });
        read("SABER_GEMM_MIN_BATCH", &mut |v| {
            v.trim().parse().map(|b| cfg.gemm.min_batch = b).is_ok()
        });
        cfg
    }

    /// Installs the process-wide parts: default target and profiling.
    pub fn apply(&self) {
        backend::set_default_target(self.target);
        profiler::set_recording(self.profile);
        log::info!(
            "saber runtime: target {} #{}, {}, {:?} kernels, profiling {}",
            self.target,
            self.device_id,
            self.precision,
            self.impl_kind,
            if self.profile { "on" } else { "off" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        assert_eq!(RuntimeConfig::from_lookup(|_| None), RuntimeConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("SABER_TARGET", "gpu"),
            ("SABER_PRECISION", "fp16"),
            ("SABER_DEVICE", "2"),
            ("SABER_PROFILE", "on"),
            ("SABER_IMPL", "vender"),
            ("SABER_GEMM_MAX_WIDTH", "28"),
        ]));
        assert_eq!(cfg.target, Target::Wgpu);
        assert_eq!(cfg.precision, Precision::Fp16);
        assert_eq!(cfg.device_id, 2);
        assert!(cfg.profile);
        assert_eq!(cfg.impl_kind, ImplKind::Vender);
        assert_eq!(cfg.gemm.max_width, 28);
        assert_eq!(cfg.gemm.min_batch, 2);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[("SABER_DEVICE", "first"), ("SABER_PROFILE", "maybe")]));
        assert_eq!(cfg.device_id, 0);
        assert!(!cfg.profile);
    }
}
