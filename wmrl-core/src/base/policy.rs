//! Policy.
use anyhow::Result;

/// A policy on an environment.
///
/// Policy is a mapping from an observation to a discrete action.
/// The mapping can be either of deterministic or stochastic.
pub trait Policy {
    /// Sample an action given an observation.
    fn sample(&mut self, obs: &[f32]) -> Result<u32>;
}
