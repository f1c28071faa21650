//! Target and precision selection.
//!
//! Every operator is registered for a `(precision, target)` pair. This module
//! defines both axes and keeps a process-wide default target that contexts
//! fall back to when the caller does not name one.
//!
//! # Supported Targets
//!
//! - `Host`: in-order CPU queue, always available.
//! - `Wgpu`: compute shaders through `wgpu` (feature `wgpu`).
//!
//! The default target is stored in an `AtomicU8`, so switching is cheap and
//! safe from any thread.

use core::convert::TryFrom;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Device family a kernel runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(u8)]
pub enum Target {
    /// CPU queue, kernels execute on the calling thread (rayon inside).
    #[default]
    Host = 0,
    /// GPU queue driven through `wgpu`.
    Wgpu,
}

impl Target {
    /// Lowercase name used in configuration and log lines.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Wgpu => "wgpu",
        }
    }

    /// Parses a textual target name. Accepts a few historical spellings.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "host" | "cpu" | "x86" | "arm" => Some(Self::Host),
            "wgpu" | "gpu" => Some(Self::Wgpu),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Target {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Host),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Numeric precision an operator instance computes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(u8)]
pub enum Precision {
    /// 32-bit float.
    #[default]
    Fp32 = 0,
    /// 16-bit float.
    Fp16,
    /// 8-bit integer, quantized.
    Int8,
}

impl Precision {
    /// Lowercase name used in configuration and log lines.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Int8 => "int8",
        }
    }

    /// Parses a textual precision name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "fp32" | "float" | "f32" => Some(Self::Fp32),
            "fp16" | "half" | "f16" => Some(Self::Fp16),
            "int8" | "i8" => Some(Self::Int8),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Precision {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Fp32),
            1 => Ok(Self::Fp16),
            2 => Ok(Self::Int8),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Process-wide default target. Only expected to change at setup time.
static GLOBAL_DEFAULT_TARGET: AtomicU8 = AtomicU8::new(Target::Host as u8);

/// Sets the default target used by [`crate::ops::OpContext::with_default_target`].
///
/// # Example
///
/// ```
/// use saber_rt::backend::{set_default_target, default_target, Target};
/// set_default_target(Target::Host);
/// assert_eq!(default_target(), Target::Host);
/// ```
pub fn set_default_target(target: Target) {
    GLOBAL_DEFAULT_TARGET.store(target as u8, Ordering::Release);
}

/// Returns the default target. Falls back to [`Target::Host`] if the stored
/// value is somehow invalid.
pub fn default_target() -> Target {
    Target::try_from(GLOBAL_DEFAULT_TARGET.load(Ordering::Acquire)).unwrap_or_default()
}
