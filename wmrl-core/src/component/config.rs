//! Configuration of a trained component.
use super::OptimizerConfig;
use crate::dataset::SampleWeights;
use serde::{Deserialize, Serialize};

/// Training schedule and data of a component.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct ComponentTrainingConfig {
    /// Training starts at the first epoch greater than this value.
    pub start_after_epochs: usize,

    /// Optimizer steps at epoch 1.
    pub steps_first_epoch: usize,

    /// Optimizer steps at later epochs.
    pub steps_per_epoch: usize,

    /// Batches per optimizer step.
    pub grad_acc_steps: usize,

    /// Gradients are clipped to this global norm, if given.
    pub max_grad_norm: Option<f32>,

    /// The number of segments in a batch.
    pub batch_size: usize,

    /// Length of segments.
    pub seq_length: usize,

    /// Episode weights for sampling.
    pub sample_weights: Option<SampleWeights>,

    /// If `true`, segments may run past the end of episodes.
    pub can_sample_beyond_end: bool,

    /// Steps of linear learning rate warm-up.
    pub lr_warmup_steps: usize,
}

impl Default for ComponentTrainingConfig {
    fn default() -> Self {
        Self {
            start_after_epochs: 0,
            steps_first_epoch: 10,
            steps_per_epoch: 10,
            grad_acc_steps: 1,
            max_grad_norm: Some(10.0),
            batch_size: 8,
            seq_length: 4,
            sample_weights: None,
            can_sample_beyond_end: false,
            lr_warmup_steps: 0,
        }
    }
}

/// Configuration of a component: its training schedule and optimizer.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
#[serde(default)]
pub struct ComponentConfig {
    /// Training schedule and data.
    pub training: ComponentTrainingConfig,

    /// Optimizer.
    pub optimizer: OptimizerConfig,
}

impl ComponentConfig {
    /// Sets the number of epochs to wait before training.
    pub fn start_after_epochs(mut self, v: usize) -> Self {
        self.training.start_after_epochs = v;
        self
    }

    /// Sets the optimizer steps at the first and later epochs.
    pub fn steps(mut self, first_epoch: usize, per_epoch: usize) -> Self {
        self.training.steps_first_epoch = first_epoch;
        self.training.steps_per_epoch = per_epoch;
        self
    }

    /// Sets the number of batches per optimizer step.
    pub fn grad_acc_steps(mut self, v: usize) -> Self {
        self.training.grad_acc_steps = v;
        self
    }

    /// Sets the batch shape.
    pub fn batch(mut self, batch_size: usize, seq_length: usize) -> Self {
        self.training.batch_size = batch_size;
        self.training.seq_length = seq_length;
        self
    }

    /// Sets whether segments may run past the end of episodes.
    pub fn can_sample_beyond_end(mut self, v: bool) -> Self {
        self.training.can_sample_beyond_end = v;
        self
    }

    /// Sets the sampling weights.
    pub fn sample_weights(mut self, v: Option<SampleWeights>) -> Self {
        self.training.sample_weights = v;
        self
    }

    /// Sets the optimizer.
    pub fn optimizer(mut self, v: OptimizerConfig) -> Self {
        self.optimizer = v;
        self
    }
}
