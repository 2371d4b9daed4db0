//! Trained components and their optimization loop.
//!
//! A [`Component`] bundles one [`Model`] with its optimizer, learning rate schedule,
//! batch sampler and batch counters. The agent consists of three components,
//! identified by [`ComponentKind`].
mod base;
mod config;
mod lr_scheduler;
mod model;
mod optimizer;

pub use base::{Component, ComponentCheckpoint, ComponentKind};
pub use config::{ComponentConfig, ComponentTrainingConfig};
pub use lr_scheduler::WarmupScheduler;
pub use model::{accumulate_grads, clip_grad_norm, Model, Param};
pub use optimizer::{Optimizer, OptimizerConfig};
