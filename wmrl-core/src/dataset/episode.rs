//! Episodes.
use serde::{Deserialize, Serialize};

/// Metadata of the policy that chose an action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyInfo {
    /// Exploration rate in effect when the action was chosen.
    pub epsilon: f32,

    /// Whether the action was drawn uniformly at random.
    pub is_random: bool,
}

/// An ordered sequence of steps.
///
/// Step `t` holds the observation `o_t` seen before taking action `a_t`, the reward
/// `r_t` received for it and the flags of the transition. An episode is complete
/// once its last step is terminal or truncated.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Observations.
    pub obs: Vec<Vec<f32>>,

    /// Actions.
    pub act: Vec<u32>,

    /// Rewards.
    pub rew: Vec<f32>,

    /// Termination flags.
    pub end: Vec<bool>,

    /// Truncation flags.
    pub trunc: Vec<bool>,

    /// Policy metadata.
    pub info: Vec<PolicyInfo>,
}

impl Episode {
    /// Creates an empty episode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    pub fn push(&mut self, obs: Vec<f32>, act: u32, rew: f32, end: bool, trunc: bool, info: PolicyInfo) {
        self.obs.push(obs);
        self.act.push(act);
        self.rew.push(rew);
        self.end.push(end);
        self.trunc.push(trunc);
        self.info.push(info);
    }

    /// Appends all steps of `other`.
    pub fn extend(&mut self, other: Episode) {
        self.obs.extend(other.obs);
        self.act.extend(other.act);
        self.rew.extend(other.rew);
        self.end.extend(other.end);
        self.trunc.extend(other.trunc);
        self.info.extend(other.info);
    }

    /// The number of steps.
    pub fn len(&self) -> usize {
        self.act.len()
    }

    /// Returns `true` if there is no step.
    pub fn is_empty(&self) -> bool {
        self.act.is_empty()
    }

    /// Returns `true` if the last step ends the episode.
    pub fn is_complete(&self) -> bool {
        match (self.end.last(), self.trunc.last()) {
            (Some(end), Some(trunc)) => *end || *trunc,
            _ => false,
        }
    }

    /// Undiscounted return.
    pub fn compute_return(&self) -> f32 {
        self.rew.iter().sum()
    }

    /// Dimension of observations, if any step exists.
    pub fn obs_dim(&self) -> Option<usize> {
        self.obs.first().map(|o| o.len())
    }

    /// Drops all steps, keeping the allocations.
    pub fn clear(&mut self) {
        self.obs.clear();
        self.act.clear();
        self.rew.clear();
        self.end.clear();
        self.trunc.clear();
        self.info.clear();
    }
}

/// Sign of a reward, the key of reward histograms.
pub fn reward_sign(rew: f32) -> i8 {
    if rew > 0.0 {
        1
    } else if rew < 0.0 {
        -1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode() {
        let mut ep = Episode::new();
        assert!(!ep.is_complete());
        ep.push(vec![0.0, 1.0], 1, 0.5, false, false, PolicyInfo::default());
        ep.push(vec![1.0, 0.0], 0, -2.0, false, false, PolicyInfo::default());
        assert!(!ep.is_complete());

        let mut tail = Episode::new();
        tail.push(vec![0.0, 0.0], 1, 1.0, true, false, PolicyInfo::default());
        ep.extend(tail);

        assert_eq!(ep.len(), 3);
        assert!(ep.is_complete());
        assert_eq!(ep.compute_return(), -0.5);
        assert_eq!(ep.obs_dim(), Some(2));
    }

    #[test]
    fn test_reward_sign() {
        assert_eq!(reward_sign(3.5), 1);
        assert_eq!(reward_sign(0.0), 0);
        assert_eq!(reward_sign(-0.1), -1);
    }
}
