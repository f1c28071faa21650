//! saber_rt: operator dispatch and kernel execution for neural-network inference.
//!
//! Given graph nodes with named parameters, the crate picks a backend kernel
//! implementation per operator, initializes its parameter and device state
//! once, and then executes it repeatedly against new inputs with as little
//! per-call work as possible.
//!
//! # Features
//!
//! - A factory keyed by operator name, precision and target.
//! - A fixed operator lifecycle: parse params, infer shapes, init, forward.
//! - Kernel handles built once per shape and launched many times, with a
//!   process-wide program cache and optional launch profiling.
//! - One-time, level-scheduled weight transforms shared across operators.
//! - A host device that always works and a `wgpu` device behind a feature.
//!
//! # Modules
//!
//! - [`ops`]: operators, their helpers and the factory.
//! - [`funcs`]: backend kernel implementations and host kernel bodies.
//! - [`kernel`]: kernel handles, devices, the launcher and the profiler.
//! - [`tensors`]: shapes, layouts, shared buffers and sequence offsets.
//! - [`params`]: the per-node parameter store.
//! - [`global_mem`]: level-scheduled access to shared weights.
//! - [`backend`] / [`config`]: targets, precisions and runtime configuration.
//! - [`error`]: device and operator errors.
//!
//! # Example
//!
//! ```rust
//! use saber_rt::backend::{Precision, Target};
//! use saber_rt::ops::{factory, OpContext};
//! use saber_rt::params::ParamStore;
//! use saber_rt::tensors::{Layout, Tensor};
//!
//! let ctx = OpContext::new(Target::Host, 0).unwrap();
//! let mut op = factory::create("ShuffleChannel", Precision::Fp32, Target::Host);
//! op.init_param(&ParamStore::new("shuffle_0").with("group", 2));
//!
//! let x = [Tensor::from_vec([1, 4, 1, 1], Layout::Nchw, vec![0.0, 1.0, 2.0, 3.0])];
//! let mut y = [Tensor::default()];
//! op.infer_shape(&x, &mut y);
//! op.init(&ctx, &x, &mut y).unwrap();
//! op.forward(&ctx, &x, &mut y).unwrap();
//! assert_eq!(y[0].to_vec(), vec![0.0, 2.0, 1.0, 3.0]);
//! ```

pub mod approx;
pub mod backend;
pub mod config;
pub mod error;
pub mod funcs;
pub mod global_mem;
pub mod kernel;
pub mod ops;
pub mod params;
pub mod tensors;
