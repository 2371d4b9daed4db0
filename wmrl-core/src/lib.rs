#![warn(missing_docs)]
//! Training orchestration for agents made of a world model and an actor-critic.
//!
//! A run alternates between collecting experience with the actor-critic,
//! training the denoiser, the reward and episode-end model and the actor-critic
//! on sampled segments, and evaluating on freshly collected test episodes. See
//! [`Trainer`] for the training loop.
pub mod checkpoint;
pub mod collector;
pub mod component;
pub mod dataset;
pub mod dist;
pub mod dummy;
pub mod error;
pub mod record;

mod base;
pub use base::{Env, Policy, StateBlob, Stateful, Step};

mod trainer;
pub use trainer::{
    check_first_epoch, epochs_after_initial_collection, initial_collection_done, num_epochs, Agent, AgentState,
    CheckpointingConfig, CollectionConfig, CommonConfig, EpochPlan, EvaluationConfig, FirstEpochConfig,
    InitializationConfig, StaticDatasetConfig, TestCollectionConfig, TrainCollectionConfig, Trainer,
    TrainerConfig, TrainingConfig, TrainingProgress, TrainingState,
};
