//! Recoverable error types.
//!
//! Configuration and shape errors are contract violations and panic at the
//! point of detection. Everything that can go wrong on a device (building a
//! program, binding arguments, enqueueing, waiting) is reported through the
//! types below and propagated to the caller of `init`/`forward`.

use crate::backend::Target;

/// Failure reported by a device adapter or the kernel layer.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device could not be opened.
    #[error("{target} device #{id} is unavailable: {reason}")]
    Unavailable {
        target: Target,
        id: usize,
        reason: String,
    },
    /// No program with this name exists for the device.
    #[error("kernel `{kernel}` not found in program `{file}`")]
    NotFound { file: String, kernel: String },
    /// The program source was rejected.
    #[error("failed to build kernel `{kernel}`: {reason}")]
    Compile { kernel: String, reason: String },
    /// Bound arguments do not match the kernel signature.
    #[error("kernel `{kernel}` rejected its arguments: {reason}")]
    Args { kernel: String, reason: String },
    /// Work sizes or the queue refused the launch.
    #[error("failed to enqueue kernel `{kernel}`: {reason}")]
    Enqueue { kernel: String, reason: String },
    /// Waiting on the queue failed.
    #[error("queue synchronization failed: {0}")]
    Sync(String),
}

/// Failure surfaced by an operator's `init` or `forward`.
#[derive(Debug, thiserror::Error)]
pub enum SaberError {
    #[error("{op}: could not create kernel `{kernel}`")]
    KernelCreate { op: &'static str, kernel: String },
    #[error("{op}: could not bind arguments of kernel `{kernel}`")]
    ArgBinding { op: &'static str, kernel: String },
    #[error("{op}: kernel launch failed")]
    Launch { op: &'static str },
    #[error("{op}: no implementation available on {target}")]
    Unimplemented { op: &'static str, target: Target },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Result alias used throughout the operator layer.
pub type SaberResult<T> = Result<T, SaberError>;
