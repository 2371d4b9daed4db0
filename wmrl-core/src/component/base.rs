//! A model with its optimization state.
use super::{
    accumulate_grads, clip_grad_norm,
    model::{flatten_grads, unflatten_grads},
    ComponentConfig, Model, Optimizer, Param, WarmupScheduler,
};
use crate::{
    dataset::{Batch, BatchSampler, DataLoader, DatasetTraverser, EpisodeStore},
    dist::Communicator,
    record::{process_confusion_matrices, Record, RecordValue::Scalar},
    StateBlob, Stateful,
};
use anyhow::{bail, Result};
use candle_core::backprop::GradStore;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// The three components of the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Denoising world model.
    Denoiser,

    /// Reward and episode-end model.
    RewEndModel,

    /// Actor-critic.
    ActorCritic,
}

impl ComponentKind {
    /// All components in training order.
    pub const ALL: [ComponentKind; 3] = [Self::Denoiser, Self::RewEndModel, Self::ActorCritic];

    /// Name used in configuration and metric keys.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Denoiser => "denoiser",
            Self::RewEndModel => "rew_end_model",
            Self::ActorCritic => "actor_critic",
        }
    }

    /// Position in [`ComponentKind::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Self::Denoiser => 0,
            Self::RewEndModel => 1,
            Self::ActorCritic => 2,
        }
    }
}

/// Averages gradients over ranks so that every rank applies the same update.
fn average_gradients(params: &[Param], grads: &mut GradStore, comm: &dyn Communicator) -> Result<()> {
    let mut flat = flatten_grads(params, grads)?;
    comm.all_reduce_mean(&mut flat)?;
    unflatten_grads(params, grads, &flat)
}

/// Serialized state of a [`Component`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentCheckpoint {
    /// Model parameters.
    pub model: StateBlob,

    /// Learning rate schedule state.
    pub lr_sched: StateBlob,
}

/// A model with its optimizer, learning rate schedule, training data and counters.
///
/// The batch counters only grow. The training counter also serves as the position
/// of the sampler, so a resumed component continues the sampling sequence.
pub struct Component<M: Model> {
    kind: ComponentKind,
    model: M,
    params: Vec<Param>,
    optimizer: Optimizer,
    lr_sched: WarmupScheduler,
    sampler: Option<BatchSampler>,
    test_batch_size: usize,
    test_seq_length: usize,
    grad_acc_steps: usize,
    max_grad_norm: Option<f32>,
    num_batch_train: usize,
    num_batch_test: usize,
}

impl<M: Model> Component<M> {
    /// Constructs a component and the optimizer over the parameters of `model`.
    ///
    /// `sampler` is `None` for a model generating its own data.
    pub fn new(
        kind: ComponentKind,
        model: M,
        config: &ComponentConfig,
        sampler: Option<BatchSampler>,
    ) -> Result<Self> {
        let c = &config.training;
        let params = model.parameters();
        let optimizer = config.optimizer.build(&params)?;
        Ok(Self {
            kind,
            model,
            params,
            optimizer,
            lr_sched: WarmupScheduler::new(config.optimizer.lr(), c.lr_warmup_steps),
            sampler,
            test_batch_size: c.batch_size,
            test_seq_length: c.seq_length,
            grad_acc_steps: c.grad_acc_steps.max(1),
            max_grad_norm: c.max_grad_norm,
            num_batch_train: 0,
            num_batch_test: 0,
        })
    }

    /// Which component this is.
    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// The model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The model, mutably.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// The optimizer.
    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    /// The learning rate schedule.
    pub fn lr_sched(&self) -> &WarmupScheduler {
        &self.lr_sched
    }

    /// Training batches consumed so far.
    pub fn num_batch_train(&self) -> usize {
        self.num_batch_train
    }

    /// Evaluation batches consumed so far.
    pub fn num_batch_test(&self) -> usize {
        self.num_batch_test
    }

    /// Restores the batch counters.
    pub fn set_counters(&mut self, num_batch_train: usize, num_batch_test: usize) {
        self.num_batch_train = num_batch_train;
        self.num_batch_test = num_batch_test;
    }

    /// Runs `num_steps` forward and backward passes.
    ///
    /// Gradients accumulate over `grad_acc_steps` passes. Then they are averaged
    /// over the ranks of `comm` and clipped if configured, the optimizer is applied,
    /// gradients are reset and the learning rate schedule advances. Batches come from
    /// `store` through the sampler; a component without a sampler runs on no batch.
    /// Gradients of an incomplete accumulation window at the end are discarded.
    ///
    /// Returns one record per pass with keys prefixed by `<name>/train/`.
    pub fn run_training_steps(
        &mut self,
        store: Option<&EpisodeStore>,
        num_steps: usize,
        num_workers: usize,
        comm: &dyn Communicator,
    ) -> Result<Vec<Record>> {
        let Self {
            kind,
            model,
            params,
            optimizer,
            lr_sched,
            sampler,
            grad_acc_steps,
            max_grad_norm,
            num_batch_train,
            ..
        } = self;
        let params: &[Param] = params;
        let name = kind.name();
        let grad_acc_steps = *grad_acc_steps;
        let first_batch = *num_batch_train;
        info!("Training {} for {} steps", name, num_steps);

        model.train();
        let mut records = Vec::with_capacity(num_steps);
        let mut grads: Option<GradStore> = None;
        let mut train_step = |i: usize, batch: Option<&Batch>| -> Result<()> {
            let (loss, mut record) = model.forward(batch)?;
            accumulate_grads(&mut grads, loss.backward()?, params)?;
            record.insert("loss", Scalar(loss.to_scalar::<f32>()?));
            record.insert(format!("num_batch_train_{}", name), Scalar(*num_batch_train as f32));
            *num_batch_train += 1;

            if (i + 1) % grad_acc_steps == 0 {
                if let Some(mut acc) = grads.take() {
                    if comm.world_size() > 1 {
                        average_gradients(params, &mut acc, comm)?;
                    }
                    if let Some(max_grad_norm) = max_grad_norm {
                        let norm = clip_grad_norm(params, &mut acc, *max_grad_norm)?;
                        record.insert("grad_norm_before_clip", Scalar(norm));
                    }
                    optimizer.step(&acc, lr_sched.last_lr())?;
                }
                record.insert("lr", Scalar(lr_sched.last_lr() as f32));
                lr_sched.step();
            }
            records.push(record);
            Ok(())
        };

        match (sampler.as_ref(), store) {
            (Some(sampler), Some(store)) => {
                DataLoader::new(store, sampler, num_workers).for_each(first_batch, num_steps, |i, batch| {
                    train_step(i - first_batch, Some(&batch))
                })?;
            }
            (Some(_), None) => bail!("{} needs a dataset to train on", name),
            (None, _) => {
                for i in 0..num_steps {
                    train_step(i, None)?;
                }
            }
        }

        if num_steps % grad_acc_steps != 0 {
            debug!("Discarding gradients of {} incomplete accumulation step(s)", num_steps % grad_acc_steps);
        }

        process_confusion_matrices(&mut records);
        let prefix = format!("{}/train/", name);
        Ok(records.into_iter().map(|r| r.with_prefix(&prefix)).collect())
    }

    /// Evaluates the model once over every episode of `store`, without gradients.
    ///
    /// Returns one record per batch with keys prefixed by `<name>/test/`, followed
    /// by the classification report if the model reports confusion matrices.
    pub fn run_evaluation(&mut self, store: &EpisodeStore) -> Result<Vec<Record>> {
        let name = self.kind.name();
        info!("Evaluating {}", name);
        self.model.eval();

        let mut records = vec![];
        for batch in DatasetTraverser::new(store, self.test_batch_size, self.test_seq_length) {
            let (loss, mut record) = self.model.forward(Some(&batch?))?;
            record.insert("loss", Scalar(loss.to_scalar::<f32>()?));
            record.insert(format!("num_batch_test_{}", name), Scalar(self.num_batch_test as f32));
            self.num_batch_test += 1;
            records.push(record);
        }
        debug!("Evaluated {} on {} batches", name, records.len());

        process_confusion_matrices(&mut records);
        let prefix = format!("{}/test/", name);
        Ok(records.into_iter().map(|r| r.with_prefix(&prefix)).collect())
    }

    /// Exports model and schedule states.
    pub fn checkpoint(&self) -> Result<ComponentCheckpoint> {
        Ok(ComponentCheckpoint {
            model: self.model.state_dict()?,
            lr_sched: self.lr_sched.state_dict()?,
        })
    }

    /// Restores model and schedule states.
    ///
    /// The model must load parameters into its existing variables, which the
    /// optimizer holds.
    pub fn load_checkpoint(&mut self, ckpt: &ComponentCheckpoint) -> Result<()> {
        self.model.load_state_dict(&ckpt.model)?;
        self.lr_sched.load_state_dict(&ckpt.lr_sched)
    }
}
