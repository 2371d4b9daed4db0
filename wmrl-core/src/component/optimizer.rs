//! Optimizers.
use super::Param;
use anyhow::Result;
use candle_core::{backprop::GradStore, Var};
use candle_nn::{AdamW, Optimizer as _, ParamsAdamW};
use candle_optimisers::adam::{Adam, ParamsAdam};
use serde::{Deserialize, Serialize};

/// Configuration of optimizer for training a model.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum OptimizerConfig {
    /// AdamW optimizer.
    AdamW {
        /// Learning rate.
        lr: f64,
        /// Decay of the first moment.
        #[serde(default = "default_beta1")]
        beta1: f64,
        /// Decay of the second moment.
        #[serde(default = "default_beta2")]
        beta2: f64,
        /// Term added to the denominator.
        #[serde(default = "default_eps")]
        eps: f64,
        /// Decoupled weight decay, applied to parameters flagged for it.
        #[serde(default = "default_weight_decay")]
        weight_decay: f64,
    },

    /// Adam optimizer.
    Adam {
        /// Learning rate.
        lr: f64,
    },
}

fn default_beta1() -> f64 {
    ParamsAdamW::default().beta1
}

fn default_beta2() -> f64 {
    ParamsAdamW::default().beta2
}

fn default_eps() -> f64 {
    ParamsAdamW::default().eps
}

fn default_weight_decay() -> f64 {
    ParamsAdamW::default().weight_decay
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        let params = ParamsAdamW::default();
        Self::AdamW {
            lr: params.lr,
            beta1: params.beta1,
            beta2: params.beta2,
            eps: params.eps,
            weight_decay: params.weight_decay,
        }
    }
}

impl OptimizerConfig {
    /// Base learning rate.
    pub fn lr(&self) -> f64 {
        match self {
            Self::AdamW { lr, .. } | Self::Adam { lr } => *lr,
        }
    }

    /// Override learning rate.
    pub fn learning_rate(self, lr: f64) -> Self {
        match self {
            Self::AdamW {
                beta1,
                beta2,
                eps,
                weight_decay,
                ..
            } => Self::AdamW {
                lr,
                beta1,
                beta2,
                eps,
                weight_decay,
            },
            Self::Adam { .. } => Self::Adam { lr },
        }
    }

    /// Constructs the optimizer over `params`.
    pub fn build(&self, params: &[Param]) -> Result<Optimizer> {
        let opt = match *self {
            Self::AdamW {
                lr,
                beta1,
                beta2,
                eps,
                weight_decay,
            } => {
                let (decay, no_decay): (Vec<&Param>, Vec<&Param>) = params.iter().partition(|p| p.weight_decay);
                let adamw = |params: Vec<&Param>, weight_decay: f64| {
                    let vars: Vec<Var> = params.into_iter().map(|p| p.var.clone()).collect();
                    AdamW::new(
                        vars,
                        ParamsAdamW {
                            lr,
                            beta1,
                            beta2,
                            eps,
                            weight_decay,
                        },
                    )
                };
                Inner::AdamW {
                    decay: adamw(decay, weight_decay)?,
                    no_decay: adamw(no_decay, 0.0)?,
                }
            }
            Self::Adam { lr } => {
                let vars = params.iter().map(|p| p.var.clone()).collect();
                let params = ParamsAdam {
                    lr,
                    ..ParamsAdam::default()
                };
                Inner::Adam(Adam::new(vars, params)?)
            }
        };
        Ok(Optimizer { inner: opt, num_steps: 0 })
    }
}

enum Inner {
    AdamW { decay: AdamW, no_decay: AdamW },
    Adam(Adam),
}

/// Optimizers.
///
/// This is a thin wrapper of [`candle_nn::AdamW`] and [`candle_optimisers::adam::Adam`].
/// The learning rate is passed on every step so that a schedule owned by the caller
/// controls it. Moment estimates live in the wrapped optimizer and are not exported.
pub struct Optimizer {
    inner: Inner,
    num_steps: usize,
}

impl Optimizer {
    /// Applies one update from `grads` with learning rate `lr`.
    pub fn step(&mut self, grads: &GradStore, lr: f64) -> Result<()> {
        match &mut self.inner {
            Inner::AdamW { decay, no_decay } => {
                decay.set_learning_rate(lr);
                no_decay.set_learning_rate(lr);
                decay.step(grads)?;
                no_decay.step(grads)?;
            }
            Inner::Adam(opt) => {
                opt.set_learning_rate(lr);
                opt.step(grads)?;
            }
        }
        self.num_steps += 1;
        Ok(())
    }

    /// The number of updates applied so far.
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn grads(params: &[Param], coefs: &[&[f32]]) -> Result<GradStore> {
        let mut loss = Tensor::new(0f32, &Device::Cpu)?;
        for (p, c) in params.iter().zip(coefs) {
            let term = p.var.mul(&Tensor::new(*c, &Device::Cpu)?)?.sum_all()?;
            loss = loss.add(&term)?;
        }
        Ok(loss.backward()?)
    }

    fn values(p: &Param) -> Result<Vec<f32>> {
        Ok(p.var.to_vec1::<f32>()?)
    }

    #[test]
    fn test_first_step_moves_by_lr() -> Result<()> {
        let params = vec![Param::decayed(Var::new(&[1f32, -1.0], &Device::Cpu)?)];
        let config = OptimizerConfig::AdamW {
            lr: 1.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let mut opt = config.build(&params)?;
        opt.step(&grads(&params, &[&[0.5, -2.0]])?, 0.1)?;
        let v = values(&params[0])?;
        assert!((v[0] - 0.9).abs() < 1e-5);
        assert!((v[1] + 0.9).abs() < 1e-5);
        assert_eq!(opt.num_steps(), 1);
        Ok(())
    }

    #[test]
    fn test_weight_decay_only_when_flagged() -> Result<()> {
        let params = vec![
            Param::decayed(Var::new(&[2f32], &Device::Cpu)?),
            Param::no_decay(Var::new(&[2f32], &Device::Cpu)?),
        ];
        let config = OptimizerConfig::AdamW {
            lr: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.5,
        };
        let mut opt = config.build(&params)?;
        opt.step(&grads(&params, &[&[0.0], &[0.0]])?, 0.1)?;
        assert!((values(&params[0])?[0] - 1.9).abs() < 1e-6);
        assert_eq!(values(&params[1])?[0], 2.0);
        Ok(())
    }

    #[test]
    fn test_adam_and_learning_rate() -> Result<()> {
        let params = vec![Param::no_decay(Var::new(&[1f32], &Device::Cpu)?)];
        let config = OptimizerConfig::Adam { lr: 0.5 }.learning_rate(0.1);
        assert_eq!(config.lr(), 0.1);

        let mut opt = config.build(&params)?;
        opt.step(&grads(&params, &[&[1.0]])?, 0.0)?;
        assert_eq!(values(&params[0])?[0], 1.0);
        opt.step(&grads(&params, &[&[1.0]])?, 0.1)?;
        assert!(values(&params[0])?[0] < 1.0);
        assert_eq!(opt.num_steps(), 2);
        Ok(())
    }

    #[test]
    fn test_yaml() -> Result<()> {
        let config: OptimizerConfig = serde_yaml::from_str("AdamW:\n  lr: 0.01\n")?;
        assert_eq!(config, OptimizerConfig::default().learning_rate(0.01));
        let config: OptimizerConfig = serde_yaml::from_str("Adam:\n  lr: 0.0003\n")?;
        assert_eq!(config, OptimizerConfig::Adam { lr: 3e-4 });
        Ok(())
    }
}
