//! Data collection.
use crate::{
    dataset::{Episode, EpisodeStore, PolicyInfo},
    record::{Record, RecordValue::Scalar},
    Env, Policy,
};
use anyhow::Result;
use log::{debug, trace};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Budget of a [`Collector::collect`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumToCollect {
    /// Exactly this many environment steps.
    Steps(usize),

    /// This many completed episodes.
    Episodes(usize),
}

/// Configuration of [`Collector`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CollectorConfig {
    /// Probability of taking a uniformly random action.
    pub epsilon: f32,

    /// Discards the open episode at the start of every call.
    pub reset_every_collect: bool,

    /// Random seed of exploration.
    pub seed: u64,

    /// Environment diagnostics are recorded every this many steps, if given.
    pub diagnostics_interval: Option<usize>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.0,
            reset_every_collect: false,
            seed: 0,
            diagnostics_interval: None,
        }
    }
}

/// Runs a policy in an environment and writes the experience to an [`EpisodeStore`].
///
/// Episodes are written as soon as they end. Steps of an episode still running
/// when a step budget is exhausted are written as an incomplete episode, which
/// later calls extend until it ends.
pub struct Collector<E: Env> {
    env: E,
    config: CollectorConfig,
    rng: StdRng,
    obs: Option<Vec<f32>>,
    open_episode: Option<usize>,
    buffer: Episode,
    episode_return: f32,
    episode_length: usize,
    num_steps_total: usize,
}

impl<E: Env> Collector<E> {
    /// Constructs a collector.
    pub fn new(env: E, config: CollectorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            env,
            config,
            rng,
            obs: None,
            open_episode: None,
            buffer: Episode::new(),
            episode_return: 0.0,
            episode_length: 0,
            num_steps_total: 0,
        }
    }

    /// The number of actions of the environment.
    pub fn num_actions(&self) -> usize {
        self.env.num_actions()
    }

    /// Total environment steps taken by this collector.
    pub fn num_steps_total(&self) -> usize {
        self.num_steps_total
    }

    fn reset_episode(&mut self) {
        self.obs = None;
        self.open_episode = None;
        self.buffer.clear();
        self.episode_return = 0.0;
        self.episode_length = 0;
    }

    fn flush(&mut self, store: &mut EpisodeStore) -> Result<usize> {
        let steps = std::mem::take(&mut self.buffer);
        match self.open_episode {
            Some(id) => {
                store.append_steps(id, steps)?;
                Ok(id)
            }
            None => Ok(store.append(steps)),
        }
    }

    fn act(&mut self, policy: &mut (impl Policy + ?Sized), obs: &[f32]) -> Result<(u32, PolicyInfo)> {
        let epsilon = self.config.epsilon;
        let is_random = epsilon > 0.0 && self.rng.gen::<f32>() < epsilon;
        let act = if is_random {
            self.rng.gen_range(0..self.env.num_actions()) as u32
        } else {
            policy.sample(obs)?
        };
        Ok((act, PolicyInfo { epsilon, is_random }))
    }

    /// Collects experience with `policy` into `store`.
    ///
    /// Returns one record per completed episode with keys `<store>/episode_id`,
    /// `return` and `length`, environment diagnostics if configured, and a final
    /// record with the size of the store. Environment errors are propagated.
    pub fn collect<P: Policy + ?Sized>(
        &mut self,
        policy: &mut P,
        store: &mut EpisodeStore,
        num_to_collect: NumToCollect,
    ) -> Result<Vec<Record>> {
        if self.config.reset_every_collect {
            self.reset_episode();
        }

        let name = store.name().to_string();
        let mut records = vec![];
        let (mut num_steps, mut num_episodes) = (0, 0);

        loop {
            let done = match num_to_collect {
                NumToCollect::Steps(n) => num_steps >= n,
                NumToCollect::Episodes(n) => num_episodes >= n,
            };
            if done {
                break;
            }

            let obs = match self.obs.take() {
                Some(obs) => obs,
                None => self.env.reset()?,
            };
            let (act, info) = self.act(policy, &obs)?;
            let (step, env_record) = self.env.step(act)?;
            trace!("act = {}, reward = {}", act, step.reward);

            self.buffer.push(obs, act, step.reward, step.is_terminated, step.is_truncated, info);
            self.episode_return += step.reward;
            self.episode_length += 1;
            self.num_steps_total += 1;
            num_steps += 1;

            if let Some(interval) = self.config.diagnostics_interval {
                if interval > 0 && self.num_steps_total % interval == 0 && !env_record.is_empty() {
                    records.push(env_record.with_prefix(&format!("{}/env/", name)));
                }
            }

            if step.is_done() {
                let episode_id = self.flush(store)?;
                records.push(Record::from_slice(&[
                    (format!("{}/episode_id", name), Scalar(episode_id as f32)),
                    ("return".to_string(), Scalar(self.episode_return)),
                    ("length".to_string(), Scalar(self.episode_length as f32)),
                ]));
                debug!(
                    "Episode {} of {}: return = {}, length = {}",
                    episode_id, name, self.episode_return, self.episode_length
                );
                num_episodes += 1;
                self.reset_episode();
            } else {
                self.obs = Some(step.obs);
            }
        }

        if !self.buffer.is_empty() {
            self.open_episode = Some(self.flush(store)?);
        }

        records.push(Record::from_slice(&[
            (format!("{}/num_steps", name), Scalar(store.num_steps() as f32)),
            (format!("{}/num_episodes", name), Scalar(store.num_episodes() as f32)),
        ]));
        Ok(records)
    }
}
