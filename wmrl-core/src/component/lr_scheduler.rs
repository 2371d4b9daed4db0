//! Learning rate schedule.
use crate::{StateBlob, Stateful};
use anyhow::Result;

/// Linear warm-up to the base learning rate.
///
/// At step `s` the learning rate is `base_lr * s / warmup_steps` while
/// `s < warmup_steps`, then `base_lr`.
#[derive(Clone, Debug, PartialEq)]
pub struct WarmupScheduler {
    base_lr: f64,
    warmup_steps: usize,
    step: usize,
}

impl WarmupScheduler {
    /// Constructs a scheduler at step 0.
    pub fn new(base_lr: f64, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            step: 0,
        }
    }

    /// Learning rate in effect.
    pub fn last_lr(&self) -> f64 {
        if self.step < self.warmup_steps {
            self.base_lr * self.step as f64 / self.warmup_steps as f64
        } else {
            self.base_lr
        }
    }

    /// Advances the schedule.
    pub fn step(&mut self) {
        self.step += 1;
    }

    /// The number of times the schedule was advanced.
    pub fn num_steps(&self) -> usize {
        self.step
    }
}

impl Stateful for WarmupScheduler {
    fn state_dict(&self) -> Result<StateBlob> {
        StateBlob::encode(&self.step)
    }

    fn load_state_dict(&mut self, state: &StateBlob) -> Result<()> {
        self.step = state.decode()?;
        Ok(())
    }
}
