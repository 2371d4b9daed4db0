//! Train an agent made of a world model and an actor-critic.
mod config;
mod schedule;
mod state;
use crate::{
    checkpoint::{
        keep_agent_copies_every, load_with_backup, save_info_for_import_script, save_with_backup, STATE_FILE,
    },
    collector::{Collector, CollectorConfig, NumToCollect},
    component::{Component, ComponentKind, Model},
    dataset::{BatchSampler, BatchSamplerConfig, EpisodeStore},
    dist::Communicator,
    error::TrainError,
    record::{Record, RecordValue::Scalar, Recorder},
    Env, Policy, StateBlob, Stateful,
};
use anyhow::{Context, Result};
pub use config::{
    CheckpointingConfig, CollectionConfig, CommonConfig, EvaluationConfig, FirstEpochConfig,
    InitializationConfig, StaticDatasetConfig, TestCollectionConfig, TrainCollectionConfig, TrainerConfig,
    TrainingConfig,
};
use log::{info, warn};
pub use schedule::{
    check_first_epoch, epochs_after_initial_collection, initial_collection_done, num_epochs, EpochPlan,
};
pub use state::{AgentState, TrainingProgress, TrainingState};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

/// Models of the agent, before training.
pub struct Agent<D, R, A> {
    /// Denoising world model.
    pub denoiser: D,

    /// Reward and episode-end model.
    pub rew_end_model: R,

    /// Actor-critic; also the policy of data collection.
    pub actor_critic: A,
}

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Runs the epochs of a training run.
///
/// # Training loop
///
/// 0. [`Trainer::build`] prepares the run directory, the datasets, the collectors
///    and the components. A fresh run saves an initial checkpoint; a resumed run
///    restores `checkpoints/state.bin`.
/// 1. Unless the run is model-free or uses a static dataset, rank 0 collects an
///    initial dataset until the rarer reward signs were seen often enough. The
///    remaining collection budget, divided by `steps_per_epoch`, is the number of
///    collection epochs. `num_final_epochs` epochs without collection follow.
/// 2. Every epoch, as planned by [`EpochPlan`]:
///     1. Rank 0 collects `steps_per_epoch` training steps.
///     2. With several ranks, the training dataset of rank 0 is broadcast.
///     3. Every rank trains the components; gradients are averaged over ranks.
///     4. Every `evaluation.every` epochs, rank 0 collects test episodes and
///        evaluates the denoiser and the reward and episode-end model.
///     5. Rank 0 writes the records of the epoch, tagged with `epoch`, and saves
///        a checkpoint. All ranks meet at a barrier.
/// 3. Rank 0 collects `num_final_episodes` test episodes and records the mean and
///    standard deviation of their returns.
///
/// # Run directory
///
/// ```mermaid
/// graph TD
///     R[root_dir] --> C[checkpoints/]
///     R --> Y[config/trainer.yaml]
///     R --> D[dataset/train, dataset/test]
///     C --> S[state.bin]
///     C --> A[agent.bin]
///     C --> V[agent_versions/]
///     C --> I[info_for_import_script.json]
/// ```
pub struct Trainer<E, D, R, A, C>
where
    E: Env,
    D: Model,
    R: Model,
    A: Model + Policy,
    C: Communicator,
{
    config: TrainerConfig,
    comm: C,
    recorder: Box<dyn Recorder>,
    path_ckpt_dir: PathBuf,
    train_dataset: EpisodeStore,
    test_dataset: EpisodeStore,
    collectors: Option<(Collector<E>, Collector<E>)>,
    denoiser: Component<D>,
    rew_end_model: Component<R>,
    actor_critic: Component<A>,
    progress: TrainingProgress,
}

fn sampler(config: &TrainerConfig, kind: ComponentKind, rank: usize, world_size: usize) -> BatchSampler {
    let c = &config.component(kind).training;
    let ignore_weights = config.is_static_dataset() && config.static_dataset.ignore_sample_weights;
    BatchSampler::new(
        BatchSamplerConfig {
            batch_size: c.batch_size,
            seq_length: c.seq_length,
            sample_weights: if ignore_weights { None } else { c.sample_weights.clone() },
            can_sample_beyond_end: c.can_sample_beyond_end,
            seed: config.common.seed.wrapping_add(kind.index() as u64 + 1),
        },
        rank,
        world_size,
    )
}

impl<E, D, R, A, C> Trainer<E, D, R, A, C>
where
    E: Env,
    D: Model,
    R: Model,
    A: Model + Policy,
    C: Communicator,
{
    /// Sets up a run in `root_dir`.
    ///
    /// `envs` are the training and test environments; they are required on rank 0
    /// unless the run trains on a static dataset, and ignored elsewhere.
    pub fn build(
        config: TrainerConfig,
        agent: Agent<D, R, A>,
        envs: Option<(E, E)>,
        recorder: Box<dyn Recorder>,
        comm: C,
        root_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        config.validate()?;
        let root_dir = root_dir.as_ref();
        let (rank, world_size) = (comm.rank(), comm.world_size());
        let is_main = comm.is_main();
        let path_ckpt_dir = root_dir.join("checkpoints");

        if is_main && !config.common.resume {
            fs::create_dir_all(root_dir)?;
            fs::create_dir(&path_ckpt_dir).with_context(|| {
                format!(
                    "{:?} already exists; set common.resume to continue the run",
                    path_ckpt_dir
                )
            })?;
            let config_dir = root_dir.join("config");
            fs::create_dir_all(&config_dir)?;
            config.save(config_dir.join("trainer.yaml"))?;
        }

        let dataset_dir = match &config.static_dataset.path {
            Some(path) => path.clone(),
            None => root_dir.join("dataset"),
        };
        let noop_action = config.collection.noop_action;
        let mut train_dataset = EpisodeStore::new(dataset_dir.join("train"), "train_dataset", noop_action);
        let mut test_dataset = EpisodeStore::new(dataset_dir.join("test"), "test_dataset", noop_action);
        if is_main {
            train_dataset.load_from_default_path()?;
            test_dataset.load_from_default_path()?;
        }

        let collectors = if is_main && !config.is_static_dataset() {
            let (train_env, test_env) = envs.ok_or(TrainError::MissingEnv)?;
            let c = &config.collection;
            let train = Collector::new(
                train_env,
                CollectorConfig {
                    epsilon: c.train.epsilon,
                    reset_every_collect: false,
                    seed: config.common.seed,
                    diagnostics_interval: c.diagnostics_interval,
                },
            );
            let test = Collector::new(
                test_env,
                CollectorConfig {
                    epsilon: c.test.epsilon,
                    reset_every_collect: true,
                    seed: config.common.seed.wrapping_add(1),
                    diagnostics_interval: c.diagnostics_interval,
                },
            );
            Some((train, test))
        } else {
            None
        };

        let Agent {
            denoiser,
            rew_end_model,
            actor_critic,
        } = agent;
        let sampler_of = |kind| Some(sampler(&config, kind, rank, world_size));
        let denoiser = Component::new(
            ComponentKind::Denoiser,
            denoiser,
            &config.denoiser,
            sampler_of(ComponentKind::Denoiser),
        )?;
        let rew_end_model = Component::new(
            ComponentKind::RewEndModel,
            rew_end_model,
            &config.rew_end_model,
            sampler_of(ComponentKind::RewEndModel),
        )?;
        let actor_critic_sampler = if config.training.model_free {
            None
        } else {
            sampler_of(ComponentKind::ActorCritic)
        };
        let actor_critic = Component::new(
            ComponentKind::ActorCritic,
            actor_critic,
            &config.actor_critic,
            actor_critic_sampler,
        )?;

        let mut trainer = Self {
            config,
            comm,
            recorder,
            path_ckpt_dir,
            train_dataset,
            test_dataset,
            collectors,
            denoiser,
            rew_end_model,
            actor_critic,
            progress: TrainingProgress::default(),
        };

        if let Some(path) = trainer.config.initialization.path_to_ckpt.clone() {
            trainer.load_agent_snapshot(&path)?;
        }
        if world_size > 1 {
            trainer.sync_agent()?;
        }

        if trainer.config.common.resume {
            trainer.load_state_checkpoint()?;
            info!("Resumed the run at epoch {}", trainer.progress.epoch);
        } else {
            trainer.save_checkpoint()?;
        }

        if is_main {
            info!(
                "Parameters: denoiser {}, rew_end_model {}, actor_critic {}",
                trainer.denoiser.model().num_parameters(),
                trainer.rew_end_model.model().num_parameters(),
                trainer.actor_critic.model().num_parameters()
            );
            info!("{}", trainer.train_dataset);
            info!("{}", trainer.test_dataset);
        }
        Ok(trainer)
    }

    /// The configuration of the run.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Last completed epoch.
    pub fn epoch(&self) -> usize {
        self.progress.epoch
    }

    /// Position of the run in its epoch schedule.
    pub fn progress(&self) -> &TrainingProgress {
        &self.progress
    }

    /// The training dataset.
    pub fn train_dataset(&self) -> &EpisodeStore {
        &self.train_dataset
    }

    /// The test dataset.
    pub fn test_dataset(&self) -> &EpisodeStore {
        &self.test_dataset
    }

    /// The denoiser component.
    pub fn denoiser(&self) -> &Component<D> {
        &self.denoiser
    }

    /// The reward and episode-end model component.
    pub fn rew_end_model(&self) -> &Component<R> {
        &self.rew_end_model
    }

    /// The actor-critic component.
    pub fn actor_critic(&self) -> &Component<A> {
        &self.actor_critic
    }

    /// Runs the remaining epochs of the run and the final evaluation.
    pub fn run(&mut self) -> Result<()> {
        let is_main = self.comm.is_main();
        let mut to_log = vec![];

        let num_epochs_collect = match self.progress.num_epochs_collect {
            Some(n) => n,
            None => {
                let n = if self.config.training.model_free || self.config.is_static_dataset() {
                    info!("Skipping the initial collection");
                    0
                } else {
                    let mine = if is_main {
                        let (n, records) = self.collect_initial_dataset()?;
                        to_log.extend(records);
                        Some(n)
                    } else {
                        None
                    };
                    self.share_initial_dataset(mine)?
                };
                self.progress.num_epochs_collect = Some(n);
                n
            }
        };
        let num_epochs = num_epochs(&self.config, num_epochs_collect);
        if is_main {
            info!(
                "{} epochs: {} with collection, {} final",
                num_epochs, num_epochs_collect, self.config.training.num_final_epochs
            );
        }

        while self.progress.epoch < num_epochs {
            let epoch = self.progress.epoch + 1;
            let start = Instant::now();
            let plan = EpochPlan::new(&self.config, epoch, num_epochs_collect, self.comm.rank());
            if is_main {
                info!("Epoch {} / {}", epoch, num_epochs);
            }

            if plan.collect_train {
                let steps = self.config.collection.train.steps_per_epoch;
                to_log.extend(self.collect_train(steps)?);
            }
            self.sync_train_dataset()?;

            for (kind, steps) in plan.train.iter() {
                to_log.extend(self.train_component(*kind, *steps)?);
            }
            if plan.collect_test {
                to_log.extend(self.collect_test(false)?);
            }
            for kind in plan.evaluate.iter() {
                to_log.extend(self.evaluate_component(*kind)?);
            }

            to_log.push(Record::from_scalar(
                "duration",
                start.elapsed().as_secs_f32() / 3600.0,
            ));
            self.progress.epoch = epoch;
            let records = std::mem::take(&mut to_log);
            if is_main {
                self.write_records(records);
            }
            self.save_checkpoint()?;
            self.comm.barrier()?;
        }

        if is_main && !self.config.is_static_dataset() {
            let records = self.collect_test(true)?;
            self.write_records(records);
        }
        self.recorder.flush();
        info!("Training finished at epoch {}", self.progress.epoch);
        Ok(())
    }

    /// Collects training data until the rarer reward signs are frequent enough.
    ///
    /// Returns the number of collection epochs left and the collection records.
    fn collect_initial_dataset(&mut self) -> Result<(usize, Vec<Record>)> {
        let c = self.config.collection.train.clone();
        check_first_epoch(&c.first_epoch, c.steps_per_epoch)?;

        let mut records = vec![];
        let mut steps = c.first_epoch.min;
        loop {
            records.extend(self.collect_train(steps)?);
            if initial_collection_done(&self.train_dataset, &c.first_epoch) {
                break;
            }
            info!(
                "Minority reward: {}/{} -> Keep collecting",
                self.train_dataset.minority_reward_count(),
                c.first_epoch.threshold_rew
            );
            steps = c.steps_per_epoch;
        }
        if self.train_dataset.minority_reward_count() < c.first_epoch.threshold_rew {
            warn!("Reached the maximum size of the initial collection");
        }
        info!("Initial collection: {}", self.train_dataset);

        let n = epochs_after_initial_collection(
            self.train_dataset.num_steps(),
            c.num_steps_total,
            c.steps_per_epoch,
        )?;
        Ok((n, records))
    }

    fn collect_train(&mut self, steps: usize) -> Result<Vec<Record>> {
        let (collector, _) = self.collectors.as_mut().ok_or(TrainError::MissingEnv)?;
        collector.collect(
            self.actor_critic.model_mut(),
            &mut self.train_dataset,
            NumToCollect::Steps(steps),
        )
    }

    /// Collects test episodes into an emptied test dataset.
    ///
    /// Episode ids in the records continue over the whole run. The final
    /// collection also records `final_return_mean` and `final_return_std`.
    fn collect_test(&mut self, is_final: bool) -> Result<Vec<Record>> {
        let c = &self.config.collection.test;
        let num_episodes = if is_final { c.num_final_episodes } else { c.num_episodes };
        self.test_dataset.clear();

        let (_, collector) = self.collectors.as_mut().ok_or(TrainError::MissingEnv)?;
        let mut records = collector.collect(
            self.actor_critic.model_mut(),
            &mut self.test_dataset,
            NumToCollect::Episodes(num_episodes),
        )?;

        let key = format!("{}/episode_id", self.test_dataset.name());
        let offset = self.progress.num_episodes_test as f32;
        let mut returns = vec![];
        for record in records.iter_mut() {
            if let Ok(id) = record.get_scalar(&key) {
                record.insert(key.clone(), Scalar(id + offset));
            }
            if let Ok(ret) = record.get_scalar("return") {
                returns.push(ret);
            }
        }
        self.progress.num_episodes_test += num_episodes;
        info!("Test collection: {} episodes, {}", num_episodes, self.test_dataset);

        if is_final && !returns.is_empty() {
            let n = returns.len() as f32;
            let mean = returns.iter().sum::<f32>() / n;
            let std = (returns.iter().map(|r| (r - mean).powi(2)).sum::<f32>() / n).sqrt();
            info!("Final return: {} +/- {}", mean, std);
            records.push(Record::from_slice(&[
                ("final_return_mean", Scalar(mean)),
                ("final_return_std", Scalar(std)),
            ]));
        }
        Ok(records)
    }

    fn train_component(&mut self, kind: ComponentKind, steps: usize) -> Result<Vec<Record>> {
        let store = Some(&self.train_dataset);
        let num_workers = self.config.training.num_workers_data_loaders;
        let num_steps = self.config.component(kind).training.grad_acc_steps * steps;
        let comm: &dyn Communicator = &self.comm;
        match kind {
            ComponentKind::Denoiser => self.denoiser.run_training_steps(store, num_steps, num_workers, comm),
            ComponentKind::RewEndModel => {
                self.rew_end_model.run_training_steps(store, num_steps, num_workers, comm)
            }
            ComponentKind::ActorCritic => self.actor_critic.run_training_steps(store, num_steps, num_workers, comm),
        }
    }

    fn evaluate_component(&mut self, kind: ComponentKind) -> Result<Vec<Record>> {
        match kind {
            ComponentKind::Denoiser => self.denoiser.run_evaluation(&self.test_dataset),
            ComponentKind::RewEndModel => self.rew_end_model.run_evaluation(&self.test_dataset),
            ComponentKind::ActorCritic => self.actor_critic.run_evaluation(&self.test_dataset),
        }
    }

    fn write_records(&mut self, records: Vec<Record>) {
        let epoch = self.progress.epoch as f32;
        for mut record in records {
            record.insert("epoch", Scalar(epoch));
            self.recorder.write(record);
        }
        self.recorder.flush();
    }

    fn share_initial_dataset(&mut self, num_epochs_collect: Option<usize>) -> Result<usize> {
        if self.comm.world_size() == 1 {
            return num_epochs_collect
                .ok_or_else(|| TrainError::SyncFailure("no initial collection on rank 0".to_string()).into());
        }
        let value = match num_epochs_collect {
            Some(n) => Some(StateBlob::encode(&(n, self.train_dataset.state_dict()?))?),
            None => None,
        };
        let (n, dataset): (usize, StateBlob) = self.comm.broadcast(value)?.decode()?;
        if !self.comm.is_main() {
            self.train_dataset.load_state_dict(&dataset)?;
        }
        Ok(n)
    }

    fn sync_train_dataset(&mut self) -> Result<()> {
        if self.comm.world_size() == 1 {
            return Ok(());
        }
        let value = if self.comm.is_main() {
            Some(self.train_dataset.state_dict()?)
        } else {
            None
        };
        let dataset = self.comm.broadcast(value)?;
        if !self.comm.is_main() {
            self.train_dataset.load_state_dict(&dataset)?;
        }
        Ok(())
    }

    /// Makes every rank start from the parameters of rank 0.
    fn sync_agent(&mut self) -> Result<()> {
        let value = if self.comm.is_main() {
            Some(StateBlob::encode(&self.agent_state()?)?)
        } else {
            None
        };
        let agent: AgentState = self.comm.broadcast(value)?.decode()?;
        if !self.comm.is_main() {
            self.load_agent_state(&agent, [true; 3])?;
        }
        Ok(())
    }

    /// Parameters of the three models.
    pub fn agent_state(&self) -> Result<AgentState> {
        Ok(AgentState {
            denoiser: self.denoiser.model().state_dict()?,
            rew_end_model: self.rew_end_model.model().state_dict()?,
            actor_critic: self.actor_critic.model().state_dict()?,
        })
    }

    fn load_agent_state(&mut self, agent: &AgentState, which: [bool; 3]) -> Result<()> {
        if which[0] {
            self.denoiser.model_mut().load_state_dict(&agent.denoiser)?;
        }
        if which[1] {
            self.rew_end_model.model_mut().load_state_dict(&agent.rew_end_model)?;
        }
        if which[2] {
            self.actor_critic.model_mut().load_state_dict(&agent.actor_critic)?;
        }
        Ok(())
    }

    fn load_agent_snapshot(&mut self, path: &Path) -> Result<()> {
        let agent: AgentState =
            load_with_backup(path).with_context(|| format!("Failed to load the agent from {:?}", path))?;
        let c = &self.config.initialization;
        let which = [c.load_denoiser, c.load_rew_end_model, c.load_actor_critic];
        for (kind, load) in ComponentKind::ALL.iter().zip(which) {
            if load {
                info!("Initializing {} from {:?}", kind.name(), path);
            }
        }
        self.load_agent_state(&agent, which)
    }

    /// Full state of the run.
    pub fn training_state(&self) -> Result<TrainingState> {
        Ok(TrainingState {
            progress: self.progress.clone(),
            num_batch_train: [
                self.denoiser.num_batch_train(),
                self.rew_end_model.num_batch_train(),
                self.actor_critic.num_batch_train(),
            ],
            num_batch_test: [
                self.denoiser.num_batch_test(),
                self.rew_end_model.num_batch_test(),
                self.actor_critic.num_batch_test(),
            ],
            components: [
                self.denoiser.checkpoint()?,
                self.rew_end_model.checkpoint()?,
                self.actor_critic.checkpoint()?,
            ],
            train_dataset: self.train_dataset.state_dict()?,
            test_dataset: self.test_dataset.state_dict()?,
        })
    }

    fn load_training_state(&mut self, state: &TrainingState) -> Result<()> {
        let [train_d, train_r, train_a] = state.num_batch_train;
        let [test_d, test_r, test_a] = state.num_batch_test;
        self.denoiser.load_checkpoint(&state.components[0])?;
        self.denoiser.set_counters(train_d, test_d);
        self.rew_end_model.load_checkpoint(&state.components[1])?;
        self.rew_end_model.set_counters(train_r, test_r);
        self.actor_critic.load_checkpoint(&state.components[2])?;
        self.actor_critic.set_counters(train_a, test_a);
        self.train_dataset.load_state_dict(&state.train_dataset)?;
        self.test_dataset.load_state_dict(&state.test_dataset)?;
        self.progress = state.progress.clone();
        Ok(())
    }

    fn load_state_checkpoint(&mut self) -> Result<()> {
        let path = self.path_ckpt_dir.join(STATE_FILE);
        let state: TrainingState =
            load_with_backup(&path).with_context(|| format!("Failed to resume from {:?}", path))?;
        self.load_training_state(&state)
    }

    /// Saves the run state, the datasets and the agent. Only rank 0 writes.
    fn save_checkpoint(&mut self) -> Result<()> {
        if !self.comm.is_main() {
            return Ok(());
        }
        save_with_backup(&self.training_state()?, self.path_ckpt_dir.join(STATE_FILE))?;
        if !self.config.is_static_dataset() {
            self.train_dataset.save_to_default_path()?;
            self.test_dataset.save_to_default_path()?;
        }
        let c = &self.config.checkpointing;
        keep_agent_copies_every(
            &self.agent_state()?,
            self.progress.epoch,
            &self.path_ckpt_dir,
            c.save_agent_every,
            c.num_to_keep,
        )?;
        save_info_for_import_script(self.progress.epoch, &self.config.run_name, &self.path_ckpt_dir)
    }
}

impl<E, D, R, A, C> Stateful for Trainer<E, D, R, A, C>
where
    E: Env,
    D: Model,
    R: Model,
    A: Model + Policy,
    C: Communicator,
{
    fn state_dict(&self) -> Result<StateBlob> {
        StateBlob::encode(&self.training_state()?)
    }

    fn load_state_dict(&mut self, state: &StateBlob) -> Result<()> {
        self.load_training_state(&state.decode()?)
    }
}
