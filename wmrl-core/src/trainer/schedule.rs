//! What happens in an epoch.
use super::{config::FirstEpochConfig, TrainerConfig};
use crate::{component::ComponentKind, dataset::EpisodeStore, error::TrainError};
use anyhow::Result;

/// Steps of one epoch on one rank.
///
/// Within an epoch the steps run in field order: training data collection,
/// training of the listed components, test collection, evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochPlan {
    /// The epoch, starting at 1.
    pub epoch: usize,

    /// Collects `steps_per_epoch` training steps.
    pub collect_train: bool,

    /// Components to train, with the number of optimizer steps.
    pub train: Vec<(ComponentKind, usize)>,

    /// Collects test episodes.
    pub collect_test: bool,

    /// Components to evaluate on the test dataset.
    pub evaluate: Vec<ComponentKind>,
}

impl EpochPlan {
    /// Plans `epoch` of a run collecting training data for `num_epochs_collect` epochs.
    pub fn new(config: &TrainerConfig, epoch: usize, num_epochs_collect: usize, rank: usize) -> Self {
        let is_main = rank == 0;
        let model_free = config.training.model_free;
        let is_static = config.is_static_dataset();

        let train = if config.training.should {
            let kinds: &[ComponentKind] = if model_free {
                &[ComponentKind::ActorCritic]
            } else {
                &ComponentKind::ALL
            };
            kinds
                .iter()
                .filter_map(|kind| {
                    let c = &config.component(*kind).training;
                    if epoch <= c.start_after_epochs {
                        return None;
                    }
                    let steps = if epoch == 1 { c.steps_first_epoch } else { c.steps_per_epoch };
                    Some((*kind, steps))
                })
                .collect()
        } else {
            vec![]
        };

        let should_test = is_main && config.evaluation.should && epoch % config.evaluation.every == 0;
        let evaluate = if should_test && !model_free {
            [ComponentKind::Denoiser, ComponentKind::RewEndModel]
                .into_iter()
                .filter(|kind| epoch > config.component(*kind).training.start_after_epochs)
                .collect()
        } else {
            vec![]
        };

        Self {
            epoch,
            collect_train: is_main && !model_free && !is_static && epoch <= num_epochs_collect,
            train,
            collect_test: should_test && !is_static,
            evaluate,
        }
    }
}

/// Total number of epochs of a run.
pub fn num_epochs(config: &TrainerConfig, num_epochs_collect: usize) -> usize {
    num_epochs_collect + config.training.num_final_epochs
}

/// Returns `true` when the initial collection may stop.
///
/// It stops once the rarer reward signs were seen `threshold_rew` times, or
/// when the dataset reached the optional maximum size.
pub fn initial_collection_done(store: &EpisodeStore, first_epoch: &FirstEpochConfig) -> bool {
    if store.minority_reward_count() >= first_epoch.threshold_rew {
        return true;
    }
    matches!(first_epoch.max, Some(max) if store.num_steps() >= max)
}

/// The number of collection epochs left after an initial collection of `num_steps`.
pub fn epochs_after_initial_collection(
    num_steps: usize,
    num_steps_total: usize,
    steps_per_epoch: usize,
) -> Result<usize> {
    let remaining = num_steps_total.checked_sub(num_steps).ok_or_else(|| {
        TrainError::ConfigInvariantViolation(format!(
            "initial collection gathered {} steps, more than the total of {}",
            num_steps, num_steps_total
        ))
    })?;
    if steps_per_epoch == 0 || remaining % steps_per_epoch != 0 {
        return Err(TrainError::ConfigInvariantViolation(format!(
            "remaining steps ({}) are not a multiple of steps_per_epoch ({})",
            remaining, steps_per_epoch
        ))
        .into());
    }
    Ok(remaining / steps_per_epoch)
}

/// Checks that the initial collection can proceed in whole epochs.
pub fn check_first_epoch(first_epoch: &FirstEpochConfig, steps_per_epoch: usize) -> Result<()> {
    if steps_per_epoch == 0 || first_epoch.min % steps_per_epoch != 0 {
        return Err(TrainError::ConfigInvariantViolation(format!(
            "first_epoch.min ({}) is not a multiple of steps_per_epoch ({})",
            first_epoch.min, steps_per_epoch
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{component::ComponentConfig, dummy::episode_from_rewards};

    fn epochs_with<F: Fn(&EpochPlan) -> bool>(config: &TrainerConfig, n: usize, f: F) -> Vec<usize> {
        (1..=n)
            .map(|epoch| EpochPlan::new(config, epoch, n, 0))
            .filter(|p| f(p))
            .map(|p| p.epoch)
            .collect()
    }

    #[test]
    fn test_evaluation_every_five_epochs() {
        let config = TrainerConfig::default().eval_every(5);
        assert_eq!(epochs_with(&config, 12, |p| p.collect_test), vec![5, 10]);
        assert_eq!(epochs_with(&config, 12, |p| !p.evaluate.is_empty()), vec![5, 10]);
        let plan = EpochPlan::new(&config, 5, 12, 0);
        assert_eq!(plan.evaluate, vec![ComponentKind::Denoiser, ComponentKind::RewEndModel]);
    }

    #[test]
    fn test_training_steps_and_delays() {
        let config = TrainerConfig::default().with_component(
            ComponentKind::ActorCritic,
            ComponentConfig::default().start_after_epochs(2).steps(7, 3),
        );
        let first = EpochPlan::new(&config, 1, 4, 0);
        assert_eq!(
            first.train,
            vec![(ComponentKind::Denoiser, 10), (ComponentKind::RewEndModel, 10)]
        );
        let third = EpochPlan::new(&config, 3, 4, 0);
        assert_eq!(third.train[2], (ComponentKind::ActorCritic, 3));
    }

    #[test]
    fn test_collection_stops_after_collect_epochs() {
        let config = TrainerConfig::default();
        assert!(EpochPlan::new(&config, 3, 3, 0).collect_train);
        assert!(!EpochPlan::new(&config, 4, 3, 0).collect_train);
        assert!(!EpochPlan::new(&config, 1, 3, 1).collect_train);
    }

    #[test]
    fn test_other_ranks_only_train() {
        let config = TrainerConfig::default().eval_every(1);
        let plan = EpochPlan::new(&config, 1, 3, 2);
        assert!(!plan.collect_train && !plan.collect_test);
        assert!(plan.evaluate.is_empty());
        assert_eq!(plan.train.len(), 3);
    }

    #[test]
    fn test_model_free_and_static() {
        let config = TrainerConfig::default().model_free(true).eval_every(1);
        let plan = EpochPlan::new(&config, 1, 0, 0);
        assert_eq!(plan.train, vec![(ComponentKind::ActorCritic, 10)]);
        assert!(!plan.collect_train);
        assert!(plan.collect_test);
        assert!(plan.evaluate.is_empty());

        let config = TrainerConfig::default()
            .static_dataset(Some("dataset".into()))
            .eval_every(1);
        let plan = EpochPlan::new(&config, 1, 0, 0);
        assert!(!plan.collect_train && !plan.collect_test);
        assert_eq!(plan.evaluate.len(), 2);
        assert_eq!(num_epochs(&config, 0), 1);
    }

    fn store_with_rewards(num_zero: usize, num_one: usize) -> EpisodeStore {
        let rews: Vec<f32> = std::iter::repeat(0.0)
            .take(num_zero)
            .chain(std::iter::repeat(1.0).take(num_one))
            .collect();
        let mut store = EpisodeStore::new("unused", "train_dataset", 0);
        store.append(episode_from_rewards(&rews, true));
        store
    }

    #[test]
    fn test_minority_reward_threshold() {
        let first_epoch = FirstEpochConfig {
            min: 100,
            max: None,
            threshold_rew: 10,
        };
        assert!(!initial_collection_done(&store_with_rewards(100, 5), &first_epoch));
        assert!(initial_collection_done(&store_with_rewards(120, 12), &first_epoch));

        let capped = FirstEpochConfig {
            max: Some(105),
            ..first_epoch
        };
        assert!(initial_collection_done(&store_with_rewards(100, 5), &capped));
    }

    #[test]
    fn test_divisibility() {
        assert_eq!(epochs_after_initial_collection(200, 1000, 100).unwrap(), 8);
        let err = epochs_after_initial_collection(250, 1000, 100).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::ConfigInvariantViolation(_))
        ));
        assert!(epochs_after_initial_collection(1100, 1000, 100).is_err());

        let first_epoch = FirstEpochConfig {
            min: 150,
            ..FirstEpochConfig::default()
        };
        assert!(check_first_epoch(&first_epoch, 100).is_err());
        assert!(check_first_epoch(&FirstEpochConfig::default(), 100).is_ok());
    }
}
