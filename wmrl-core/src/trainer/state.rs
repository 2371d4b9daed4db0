//! Serialized state of [`Trainer`](super::Trainer).
use crate::{component::ComponentCheckpoint, StateBlob};
use serde::{Deserialize, Serialize};

/// Position of the run in its epoch schedule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingProgress {
    /// Last completed epoch, `0` before the first one.
    pub epoch: usize,

    /// The number of epochs with training data collection, decided after the
    /// initial collection.
    pub num_epochs_collect: Option<usize>,

    /// Test episodes collected so far; offsets the episode ids of test records.
    pub num_episodes_test: usize,
}

/// Everything needed to resume a run, stored in `checkpoints/state.bin`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Epoch schedule.
    pub progress: TrainingProgress,

    /// Training batch counters, in the order of
    /// [`ComponentKind::ALL`](crate::component::ComponentKind::ALL).
    pub num_batch_train: [usize; 3],

    /// Evaluation batch counters, same order.
    pub num_batch_test: [usize; 3],

    /// Model and schedule of each component, same order.
    pub components: [ComponentCheckpoint; 3],

    /// Training dataset.
    pub train_dataset: StateBlob,

    /// Test dataset.
    pub test_dataset: StateBlob,
}

/// Model parameters of the agent, stored in `checkpoints/agent.bin` and the
/// periodic snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Parameters of the denoiser.
    pub denoiser: StateBlob,

    /// Parameters of the reward and episode-end model.
    pub rew_end_model: StateBlob,

    /// Parameters of the actor-critic.
    pub actor_critic: StateBlob,
}
