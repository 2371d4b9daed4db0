//! Environment.
use crate::record::Record;
use anyhow::Result;

/// Represents an environment, typically an MDP.
///
/// Observations are flat `f32` vectors and actions are discrete indices.
/// Vectorized environments are not supported.
pub trait Env {
    /// Configurations.
    type Config: Clone;

    /// Builds an environment with a given random seed.
    fn build(config: &Self::Config, seed: i64) -> Result<Self>
    where
        Self: Sized;

    /// The number of discrete actions.
    fn num_actions(&self) -> usize;

    /// Starts a new episode and returns its first observation.
    fn reset(&mut self) -> Result<Vec<f32>>;

    /// Performes an environment step.
    ///
    /// The returned [`Record`] holds environment-specific diagnostics.
    fn step(&mut self, act: u32) -> Result<(Step, Record)>;
}

/// Outcome of an environment step: `(o_t+1, r_t)` with episode flags.
#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    /// Observation after the action.
    pub obs: Vec<f32>,

    /// Reward.
    pub reward: f32,

    /// Flag denoting if episode is terminated.
    pub is_terminated: bool,

    /// Flag denoting if episode is truncated.
    pub is_truncated: bool,
}

impl Step {
    /// Constructs a [`Step`] object.
    pub fn new(obs: Vec<f32>, reward: f32, is_terminated: bool, is_truncated: bool) -> Self {
        Self {
            obs,
            reward,
            is_terminated,
            is_truncated,
        }
    }

    #[inline]
    /// Terminated or truncated.
    pub fn is_done(&self) -> bool {
        self.is_terminated || self.is_truncated
    }
}
