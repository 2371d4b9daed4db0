//! Trainable models.
use crate::{dataset::Batch, record::Record, Stateful};
use anyhow::Result;
use candle_core::{backprop::GradStore, Tensor, Var};

/// A trainable variable of a model.
#[derive(Clone, Debug)]
pub struct Param {
    /// The variable.
    pub var: Var,

    /// Whether weight decay applies to this variable.
    pub weight_decay: bool,
}

impl Param {
    /// A parameter subject to weight decay.
    pub fn decayed(var: Var) -> Self {
        Self { var, weight_decay: true }
    }

    /// A parameter exempt from weight decay.
    pub fn no_decay(var: Var) -> Self {
        Self { var, weight_decay: false }
    }
}

/// A model trained by a [`Component`](super::Component).
///
/// The architecture is opaque to the training loop. `forward` returns a scalar loss
/// tensor whose graph reaches the variables of [`Model::parameters`]; the caller runs
/// the backward pass and the optimizer.
pub trait Model: Stateful {
    /// Switches to training mode.
    fn train(&mut self);

    /// Switches to evaluation mode.
    fn eval(&mut self);

    /// Computes the loss and metrics.
    ///
    /// `batch` is `None` for models that generate their own data.
    fn forward(&mut self, batch: Option<&Batch>) -> Result<(Tensor, Record)>;

    /// Trainable variables. The set and order must not change over the lifetime of
    /// the model.
    fn parameters(&self) -> Vec<Param>;

    /// The number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.var.elem_count()).sum()
    }
}

/// Adds the gradients of `params` in `grads` to the accumulated gradients `acc`.
pub fn accumulate_grads(acc: &mut Option<GradStore>, grads: GradStore, params: &[Param]) -> Result<()> {
    match acc {
        None => *acc = Some(grads),
        Some(store) => {
            for p in params {
                if let Some(g) = grads.get(&p.var) {
                    let sum = match store.remove(&p.var) {
                        Some(prev) => prev.add(g)?,
                        None => g.clone(),
                    };
                    store.insert(&p.var, sum);
                }
            }
        }
    }
    Ok(())
}

/// Flattens the gradients of `params` into one vector; missing gradients count as zeros.
pub(crate) fn flatten_grads(params: &[Param], grads: &GradStore) -> Result<Vec<f32>> {
    let mut flat = Vec::with_capacity(params.iter().map(|p| p.var.elem_count()).sum());
    for p in params {
        match grads.get(&p.var) {
            Some(g) => flat.extend(g.flatten_all()?.to_vec1::<f32>()?),
            None => flat.extend(std::iter::repeat(0.0).take(p.var.elem_count())),
        }
    }
    Ok(flat)
}

/// Replaces the gradients of `params` with consecutive slices of `flat`.
pub(crate) fn unflatten_grads(params: &[Param], grads: &mut GradStore, flat: &[f32]) -> Result<()> {
    let mut offset = 0;
    for p in params {
        let n = p.var.elem_count();
        let g = Tensor::from_vec(flat[offset..offset + n].to_vec(), p.var.shape().clone(), p.var.device())?;
        grads.insert(&p.var, g);
        offset += n;
    }
    Ok(())
}

/// Rescales gradients so that their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &[Param], grads: &mut GradStore, max_norm: f32) -> Result<f32> {
    let mut sum_sq = 0f32;
    for p in params {
        if let Some(g) = grads.get(&p.var) {
            sum_sq += g.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let norm = sum_sq.sqrt();
    if norm > max_norm {
        let scale = (max_norm / (norm + 1e-6)) as f64;
        for p in params {
            if let Some(g) = grads.remove(&p.var) {
                grads.insert(&p.var, g.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}
