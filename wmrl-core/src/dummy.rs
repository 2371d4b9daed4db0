//! Small environment and model for tests and demos.
use crate::{
    component::{Model, Param},
    dataset::{reward_sign, Batch, Episode, PolicyInfo},
    record::{Record, RecordValue},
    Env, Policy, StateBlob, Stateful, Step,
};
use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor, Var};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// An episode with the given rewards.
///
/// The observation at step `t` is `[t, 1]` and the action is `t % 3`. The last
/// step is a termination if `complete`.
pub fn episode_from_rewards(rews: &[f32], complete: bool) -> Episode {
    let mut episode = Episode::new();
    let n = rews.len();
    for (t, rew) in rews.iter().enumerate() {
        let end = complete && t + 1 == n;
        episode.push(vec![t as f32, 1.0], (t % 3) as u32, *rew, end, false, PolicyInfo::default());
    }
    episode
}

/// Configuration of [`CorridorEnv`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CorridorConfig {
    /// The number of cells.
    pub length: usize,

    /// Episodes are truncated after this many steps.
    pub max_steps: usize,
}

impl CorridorConfig {
    /// Constructs the configuration.
    pub fn new(length: usize, max_steps: usize) -> Self {
        Self { length, max_steps }
    }
}

impl Default for CorridorConfig {
    fn default() -> Self {
        Self::new(5, 50)
    }
}

/// A one-dimensional corridor; reaching the last cell gives reward 1.
///
/// Actions are 0 (left), 1 (stay) and 2 (right). Observations are one-hot
/// encodings of the position. Episodes start in the first half of the corridor.
pub struct CorridorEnv {
    config: CorridorConfig,
    rng: StdRng,
    pos: usize,
    t: usize,
}

impl CorridorEnv {
    fn obs(&self) -> Vec<f32> {
        let mut obs = vec![0.0; self.config.length];
        obs[self.pos] = 1.0;
        obs
    }
}

impl Env for CorridorEnv {
    type Config = CorridorConfig;

    fn build(config: &Self::Config, seed: i64) -> Result<Self> {
        if config.length < 2 {
            bail!("The corridor needs at least 2 cells, got {}", config.length);
        }
        Ok(Self {
            config: config.clone(),
            rng: StdRng::seed_from_u64(seed as u64),
            pos: 0,
            t: 0,
        })
    }

    fn num_actions(&self) -> usize {
        3
    }

    fn reset(&mut self) -> Result<Vec<f32>> {
        self.pos = self.rng.gen_range(0..=self.config.length / 2);
        self.t = 0;
        Ok(self.obs())
    }

    fn step(&mut self, act: u32) -> Result<(Step, Record)> {
        let last = self.config.length - 1;
        self.pos = match act {
            0 => self.pos.saturating_sub(1),
            1 => self.pos,
            2 => (self.pos + 1).min(last),
            _ => bail!("Invalid action {}", act),
        };
        self.t += 1;

        let is_terminated = self.pos == last;
        let reward = if is_terminated { 1.0 } else { 0.0 };
        let is_truncated = !is_terminated && self.t >= self.config.max_steps;
        let record = Record::from_scalar("position", self.pos as f32);
        Ok((Step::new(self.obs(), reward, is_terminated, is_truncated), record))
    }
}

/// Predicts the reward of an action with one linear function per action.
///
/// Trained with the squared error over the real steps of a batch. Without a
/// batch, the loss is the squared norm of the parameters. As a policy it takes the
/// action with the highest predicted reward.
pub struct LinearModel {
    obs_dim: usize,
    num_actions: usize,
    weight: Var,
    bias: Var,
}

impl LinearModel {
    /// A model with all parameters zero.
    pub fn new(obs_dim: usize, num_actions: usize) -> Result<Self> {
        let device = Device::Cpu;
        Ok(Self {
            obs_dim,
            num_actions,
            weight: Var::zeros((num_actions, obs_dim), DType::F32, &device)?,
            bias: Var::zeros(num_actions, DType::F32, &device)?,
        })
    }

    /// Predicted rewards of every action, `[n, num_actions]` for `obs` of shape `[n, obs_dim]`.
    pub fn predict(&self, obs: &Tensor) -> Result<Tensor> {
        Ok(obs.matmul(&self.weight.t()?)?.broadcast_add(&self.bias)?)
    }

    fn sign_class(x: f32) -> usize {
        if x > 0.5 {
            2
        } else if x < -0.5 {
            0
        } else {
            1
        }
    }

    fn forward_batch(&self, batch: &Batch) -> Result<(Tensor, Record)> {
        let (b, l, d) = batch.obs.dim();
        if d != self.obs_dim {
            bail!("Expected observations of size {}, got {}", self.obs_dim, d);
        }
        let n = b * l;
        if let Some(act) = batch
            .act
            .iter()
            .zip(batch.mask_padding.iter())
            .find_map(|(a, m)| (*m && *a as usize >= self.num_actions).then_some(*a))
        {
            bail!("Action {} out of range", act);
        }

        let device = Device::Cpu;
        let rew: Vec<f32> = batch.rew.iter().copied().collect();
        let mask: Vec<f32> = batch.mask_padding.iter().map(|m| if *m { 1.0 } else { 0.0 }).collect();
        let num_real = batch.mask_padding.iter().filter(|m| **m).count();
        let obs = Tensor::from_vec(batch.obs.iter().copied().collect::<Vec<f32>>(), (n, d), &device)?;
        let act = Tensor::from_vec(batch.act.iter().copied().collect::<Vec<u32>>(), (n, 1), &device)?;

        let pred = self.predict(&obs)?.gather(&act, 1)?.squeeze(1)?;
        let err = pred
            .sub(&Tensor::from_slice(&rew, n, &device)?)?
            .mul(&Tensor::from_slice(&mask, n, &device)?)?;
        let loss = err.sqr()?.sum_all()?.affine(1.0 / num_real.max(1) as f64, 0.0)?;

        let mut confusion = vec![0.0; 9];
        for ((p, r), m) in pred.to_vec1::<f32>()?.iter().zip(rew.iter()).zip(mask.iter()) {
            if *m > 0.0 {
                let true_class = (reward_sign(*r) + 1) as usize;
                confusion[true_class * 3 + Self::sign_class(*p)] += 1.0;
            }
        }
        let mut record = Record::empty();
        record.insert("confusion_matrix/rew", RecordValue::Array2(confusion, [3, 3]));
        Ok((loss, record))
    }
}

impl Stateful for LinearModel {
    fn state_dict(&self) -> Result<StateBlob> {
        let weight = self.weight.flatten_all()?.to_vec1::<f32>()?;
        let bias = self.bias.to_vec1::<f32>()?;
        StateBlob::encode(&(weight, bias))
    }

    fn load_state_dict(&mut self, state: &StateBlob) -> Result<()> {
        let (weight, bias): (Vec<f32>, Vec<f32>) = state.decode()?;
        if weight.len() != self.weight.elem_count() || bias.len() != self.bias.elem_count() {
            bail!("Parameter shapes do not match the model");
        }
        let device = Device::Cpu;
        self.weight
            .set(&Tensor::from_vec(weight, (self.num_actions, self.obs_dim), &device)?)?;
        self.bias.set(&Tensor::from_vec(bias, self.num_actions, &device)?)?;
        Ok(())
    }
}

impl Model for LinearModel {
    fn train(&mut self) {}

    fn eval(&mut self) {}

    fn forward(&mut self, batch: Option<&Batch>) -> Result<(Tensor, Record)> {
        match batch {
            Some(batch) => self.forward_batch(batch),
            None => {
                let loss = self.weight.sqr()?.sum_all()?.add(&self.bias.sqr()?.sum_all()?)?;
                Ok((loss, Record::empty()))
            }
        }
    }

    fn parameters(&self) -> Vec<Param> {
        vec![Param::decayed(self.weight.clone()), Param::no_decay(self.bias.clone())]
    }
}

impl Policy for LinearModel {
    fn sample(&mut self, obs: &[f32]) -> Result<u32> {
        let obs = Tensor::from_slice(obs, (1, obs.len()), &Device::Cpu)?;
        Ok(self.predict(&obs)?.squeeze(0)?.argmax(0)?.to_scalar::<u32>()?)
    }
}
