//! Configuration of [`Trainer`](super::Trainer).
use crate::{
    component::{ComponentConfig, ComponentKind},
    error::TrainError,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

/// Settings shared by the whole run.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
#[serde(default)]
pub struct CommonConfig {
    /// Resume from the checkpoint in the root directory.
    pub resume: bool,

    /// Random seed of collection and sampling.
    pub seed: u64,
}

/// Loading of component parameters from an agent snapshot before training.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct InitializationConfig {
    /// Agent snapshot, e.g. `checkpoints/agent.bin` of another run.
    pub path_to_ckpt: Option<PathBuf>,

    /// Load the denoiser.
    pub load_denoiser: bool,

    /// Load the reward and end model.
    pub load_rew_end_model: bool,

    /// Load the actor-critic.
    pub load_actor_critic: bool,
}

impl Default for InitializationConfig {
    fn default() -> Self {
        Self {
            path_to_ckpt: None,
            load_denoiser: true,
            load_rew_end_model: true,
            load_actor_critic: true,
        }
    }
}

/// Training switches.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct TrainingConfig {
    /// Train the components.
    pub should: bool,

    /// Train the actor-critic on its own data, without world model.
    pub model_free: bool,

    /// Epochs after the collection budget is exhausted.
    pub num_final_epochs: usize,

    /// Worker threads prefetching training batches; 0 builds them inline.
    pub num_workers_data_loaders: usize,

    /// Accepted for compatibility; episodes are always held in memory.
    pub cache_in_ram: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            should: true,
            model_free: false,
            num_final_epochs: 1,
            num_workers_data_loaders: 0,
            cache_in_ram: false,
        }
    }
}

/// A pre-collected dataset replacing online collection.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
#[serde(default)]
pub struct StaticDatasetConfig {
    /// Directory holding `train/` and `test/` stores.
    pub path: Option<PathBuf>,

    /// Sample uniformly regardless of the configured sample weights.
    pub ignore_sample_weights: bool,
}

/// Budget of the initial collection.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct FirstEpochConfig {
    /// Steps of the first increment; a multiple of `steps_per_epoch`.
    pub min: usize,

    /// Initial collection stops at this many steps, if given.
    pub max: Option<usize>,

    /// Initial collection stops once the minority reward count reaches this value.
    pub threshold_rew: usize,
}

impl Default for FirstEpochConfig {
    fn default() -> Self {
        Self {
            min: 100,
            max: None,
            threshold_rew: 10,
        }
    }
}

/// Collection of training data.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct TrainCollectionConfig {
    /// Exploration rate.
    pub epsilon: f32,

    /// Steps collected per epoch.
    pub steps_per_epoch: usize,

    /// Total steps collected over the run.
    pub num_steps_total: usize,

    /// Initial collection.
    pub first_epoch: FirstEpochConfig,
}

impl Default for TrainCollectionConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.01,
            steps_per_epoch: 100,
            num_steps_total: 1000,
            first_epoch: FirstEpochConfig::default(),
        }
    }
}

/// Collection of test episodes.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct TestCollectionConfig {
    /// Exploration rate.
    pub epsilon: f32,

    /// Episodes per evaluation.
    pub num_episodes: usize,

    /// Episodes of the final evaluation.
    pub num_final_episodes: usize,
}

impl Default for TestCollectionConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.0,
            num_episodes: 4,
            num_final_episodes: 10,
        }
    }
}

/// Data collection.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
#[serde(default)]
pub struct CollectionConfig {
    /// Action used to pad segments past the end of episodes.
    pub noop_action: u32,

    /// Environment diagnostics are recorded every this many steps, if given.
    pub diagnostics_interval: Option<usize>,

    /// Training data.
    pub train: TrainCollectionConfig,

    /// Test episodes.
    pub test: TestCollectionConfig,
}

/// Evaluation cadence.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Evaluate at all.
    pub should: bool,

    /// Evaluate at epochs divisible by this value.
    pub every: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            should: true,
            every: 5,
        }
    }
}

/// Agent snapshots.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct CheckpointingConfig {
    /// Snapshot the agent at epochs divisible by this value.
    pub save_agent_every: usize,

    /// Keep only this many snapshots, if given.
    pub num_to_keep: Option<usize>,
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            save_agent_every: 5,
            num_to_keep: Some(10),
        }
    }
}

/// Configuration of [`Trainer`](super::Trainer).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct TrainerConfig {
    /// Name of the run, written to the import metadata.
    pub run_name: String,

    /// Settings shared by the whole run.
    pub common: CommonConfig,

    /// Initialization from an agent snapshot.
    pub initialization: InitializationConfig,

    /// Training switches.
    pub training: TrainingConfig,

    /// Pre-collected dataset.
    pub static_dataset: StaticDatasetConfig,

    /// Data collection.
    pub collection: CollectionConfig,

    /// Evaluation cadence.
    pub evaluation: EvaluationConfig,

    /// Agent snapshots.
    pub checkpointing: CheckpointingConfig,

    /// Denoiser.
    pub denoiser: ComponentConfig,

    /// Reward and end model.
    pub rew_end_model: ComponentConfig,

    /// Actor-critic.
    pub actor_critic: ComponentConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            run_name: "wmrl".to_string(),
            common: CommonConfig::default(),
            initialization: InitializationConfig::default(),
            training: TrainingConfig::default(),
            static_dataset: StaticDatasetConfig::default(),
            collection: CollectionConfig::default(),
            evaluation: EvaluationConfig::default(),
            checkpointing: CheckpointingConfig::default(),
            denoiser: ComponentConfig::default(),
            rew_end_model: ComponentConfig::default().can_sample_beyond_end(true),
            actor_critic: ComponentConfig::default(),
        }
    }
}

impl TrainerConfig {
    /// Configuration of a component.
    pub fn component(&self, kind: ComponentKind) -> &ComponentConfig {
        match kind {
            ComponentKind::Denoiser => &self.denoiser,
            ComponentKind::RewEndModel => &self.rew_end_model,
            ComponentKind::ActorCritic => &self.actor_critic,
        }
    }

    /// Mutable configuration of a component.
    pub fn component_mut(&mut self, kind: ComponentKind) -> &mut ComponentConfig {
        match kind {
            ComponentKind::Denoiser => &mut self.denoiser,
            ComponentKind::RewEndModel => &mut self.rew_end_model,
            ComponentKind::ActorCritic => &mut self.actor_critic,
        }
    }

    /// Returns `true` if the dataset is pre-collected.
    pub fn is_static_dataset(&self) -> bool {
        self.static_dataset.path.is_some()
    }

    /// Sets the name of the run.
    pub fn run_name(mut self, v: impl Into<String>) -> Self {
        self.run_name = v.into();
        self
    }

    /// Sets whether to resume from a checkpoint.
    pub fn resume(mut self, v: bool) -> Self {
        self.common.resume = v;
        self
    }

    /// Sets the random seed.
    pub fn seed(mut self, v: u64) -> Self {
        self.common.seed = v;
        self
    }

    /// Sets whether the agent is model-free.
    pub fn model_free(mut self, v: bool) -> Self {
        self.training.model_free = v;
        self
    }

    /// Sets the number of epochs after the collection budget is exhausted.
    pub fn num_final_epochs(mut self, v: usize) -> Self {
        self.training.num_final_epochs = v;
        self
    }

    /// Sets the number of data loader workers.
    pub fn num_workers_data_loaders(mut self, v: usize) -> Self {
        self.training.num_workers_data_loaders = v;
        self
    }

    /// Sets the directory of a pre-collected dataset.
    pub fn static_dataset(mut self, v: Option<PathBuf>) -> Self {
        self.static_dataset.path = v;
        self
    }

    /// Sets the collection budget of training data.
    pub fn train_collection(mut self, steps_per_epoch: usize, num_steps_total: usize) -> Self {
        self.collection.train.steps_per_epoch = steps_per_epoch;
        self.collection.train.num_steps_total = num_steps_total;
        self
    }

    /// Sets the budget of the initial collection.
    pub fn first_epoch(mut self, min: usize, max: Option<usize>, threshold_rew: usize) -> Self {
        self.collection.train.first_epoch = FirstEpochConfig {
            min,
            max,
            threshold_rew,
        };
        self
    }

    /// Sets the number of test episodes per evaluation and at the end.
    pub fn test_episodes(mut self, num_episodes: usize, num_final_episodes: usize) -> Self {
        self.collection.test.num_episodes = num_episodes;
        self.collection.test.num_final_episodes = num_final_episodes;
        self
    }

    /// Sets the evaluation cadence in epochs.
    pub fn eval_every(mut self, v: usize) -> Self {
        self.evaluation.every = v;
        self
    }

    /// Sets the agent snapshot cadence in epochs.
    pub fn save_agent_every(mut self, every: usize, num_to_keep: Option<usize>) -> Self {
        self.checkpointing.save_agent_every = every;
        self.checkpointing.num_to_keep = num_to_keep;
        self
    }

    /// Sets the configuration of a component.
    pub fn with_component(mut self, kind: ComponentKind, config: ComponentConfig) -> Self {
        *self.component_mut(kind) = config;
        self
    }

    /// Checks the contracts the training loop relies on.
    pub fn validate(&self) -> Result<()> {
        let violation = |msg: String| -> Result<()> { Err(TrainError::ConfigInvariantViolation(msg).into()) };
        let c = &self.collection.train;
        if c.steps_per_epoch == 0 {
            return violation("collection.train.steps_per_epoch must be positive".to_string());
        }
        if c.first_epoch.min % c.steps_per_epoch != 0 {
            return violation(format!(
                "collection.train.first_epoch.min ({}) is not a multiple of steps_per_epoch ({})",
                c.first_epoch.min, c.steps_per_epoch
            ));
        }
        if c.num_steps_total % c.steps_per_epoch != 0 {
            return violation(format!(
                "collection.train.num_steps_total ({}) is not a multiple of steps_per_epoch ({})",
                c.num_steps_total, c.steps_per_epoch
            ));
        }
        if c.first_epoch.min > c.num_steps_total {
            return violation(format!(
                "collection.train.first_epoch.min ({}) exceeds num_steps_total ({})",
                c.first_epoch.min, c.num_steps_total
            ));
        }
        if self.evaluation.every == 0 {
            return violation("evaluation.every must be positive".to_string());
        }
        if self.checkpointing.save_agent_every == 0 {
            return violation("checkpointing.save_agent_every must be positive".to_string());
        }
        for kind in ComponentKind::ALL {
            let t = &self.component(kind).training;
            if t.batch_size == 0 || t.seq_length == 0 || t.grad_acc_steps == 0 {
                return violation(format!(
                    "{}: batch_size, seq_length and grad_acc_steps must be positive",
                    kind.name()
                ));
            }
        }
        Ok(())
    }

    /// Constructs [`TrainerConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`TrainerConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SampleWeights;
    use tempdir::TempDir;

    #[test]
    fn test_serde_trainer_config() -> Result<()> {
        let config = TrainerConfig::default()
            .run_name("corridor")
            .seed(7)
            .eval_every(3)
            .with_component(
                ComponentKind::Denoiser,
                ComponentConfig::default().sample_weights(Some(SampleWeights::Recency(vec![0.1, 0.9]))),
            );

        let dir = TempDir::new("trainer_config")?;
        let path = dir.path().join("trainer.yaml");
        config.save(&path)?;
        let config_ = TrainerConfig::load(&path)?;
        assert_eq!(config, config_);
        Ok(())
    }

    #[test]
    fn test_partial_yaml_uses_defaults() -> Result<()> {
        let yaml = "
run_name: partial
collection:
  train:
    steps_per_epoch: 50
rew_end_model:
  training:
    batch_size: 3
";
        let config: TrainerConfig = serde_yaml::from_str(yaml)?;
        assert_eq!(config.run_name, "partial");
        assert_eq!(config.collection.train.steps_per_epoch, 50);
        assert_eq!(config.collection.train.num_steps_total, 1000);
        assert_eq!(config.rew_end_model.training.batch_size, 3);
        assert_eq!(config.evaluation, EvaluationConfig::default());
        Ok(())
    }

    #[test]
    fn test_divisibility_is_validated() {
        let config = TrainerConfig::default().train_collection(30, 300).first_epoch(100, None, 5);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::ConfigInvariantViolation(_))
        ));
        assert!(TrainerConfig::default().validate().is_ok());
        assert!(TrainerConfig::default().eval_every(0).validate().is_err());
    }

    #[test]
    fn test_total_budget_is_validated() {
        let violation = |config: TrainerConfig| {
            matches!(
                config.validate().unwrap_err().downcast_ref::<TrainError>(),
                Some(TrainError::ConfigInvariantViolation(_))
            )
        };
        let base = TrainerConfig::default().first_epoch(20, None, 5);
        assert!(violation(base.clone().train_collection(20, 250)));
        assert!(violation(base.clone().train_collection(20, 0)));
        assert!(base.clone().train_collection(20, 260).validate().is_ok());
        assert!(base.train_collection(20, 20).validate().is_ok());
    }
}
