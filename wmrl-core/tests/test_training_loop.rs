use anyhow::Result;
use std::{collections::BTreeSet, fs, path::Path, thread};
use tempdir::TempDir;
use test_log::test;
use wmrl_core::{
    checkpoint::{load_with_backup, ImportInfo, AGENT_FILE, AGENT_VERSIONS_DIR, IMPORT_INFO_FILE, STATE_FILE},
    component::{ComponentConfig, ComponentKind},
    dist::{Communicator, SingleProcess, ThreadGroup},
    dummy::{CorridorConfig, CorridorEnv, LinearModel},
    error::TrainError,
    record::{BufferedRecorder, NullRecorder, Record},
    Agent, AgentState, Env, Stateful, Trainer, TrainerConfig, TrainingState,
};

type CorridorTrainer<C> = Trainer<CorridorEnv, LinearModel, LinearModel, LinearModel, C>;

const CORRIDOR_LENGTH: usize = 5;
const STEPS_PER_EPOCH: usize = 20;

fn config(num_steps_total: usize, num_final_epochs: usize) -> TrainerConfig {
    let component = ComponentConfig::default()
        .steps(2, 2)
        .batch(2, 2)
        .can_sample_beyond_end(true);
    let mut config = TrainerConfig::default()
        .run_name("corridor")
        .seed(0)
        .train_collection(STEPS_PER_EPOCH, num_steps_total)
        .first_epoch(STEPS_PER_EPOCH, Some(STEPS_PER_EPOCH), 1000)
        .test_episodes(2, 3)
        .num_final_epochs(num_final_epochs)
        .eval_every(5)
        .save_agent_every(5, Some(10));
    for kind in ComponentKind::ALL {
        config = config.with_component(kind, component.clone());
    }
    config
}

fn agent() -> Result<Agent<LinearModel, LinearModel, LinearModel>> {
    Ok(Agent {
        denoiser: LinearModel::new(CORRIDOR_LENGTH, 3)?,
        rew_end_model: LinearModel::new(CORRIDOR_LENGTH, 3)?,
        actor_critic: LinearModel::new(CORRIDOR_LENGTH, 3)?,
    })
}

fn envs() -> Result<Option<(CorridorEnv, CorridorEnv)>> {
    let config = CorridorConfig::new(CORRIDOR_LENGTH, 20);
    Ok(Some((CorridorEnv::build(&config, 0)?, CorridorEnv::build(&config, 1)?)))
}

fn build(
    config: TrainerConfig,
    recorder: &BufferedRecorder,
    root: &Path,
) -> Result<CorridorTrainer<SingleProcess>> {
    Trainer::build(config, agent()?, envs()?, Box::new(recorder.clone()), SingleProcess, root)
}

fn epochs_of(records: &[Record], key: &str) -> Vec<usize> {
    let epochs: BTreeSet<usize> = records
        .iter()
        .filter(|r| r.contains_key(key))
        .map(|r| r.get_scalar("epoch").unwrap() as usize)
        .collect();
    epochs.into_iter().collect()
}

#[test]
fn test_full_run() -> Result<()> {
    let dir = TempDir::new("training_loop")?;
    let root = dir.path().join("run");
    let recorder = BufferedRecorder::new();
    // 20 initial steps, 11 collection epochs and 1 final epoch
    let mut trainer = build(config(12 * STEPS_PER_EPOCH, 1), &recorder, &root)?;
    trainer.run()?;

    assert_eq!(trainer.epoch(), 12);
    assert_eq!(trainer.progress().num_epochs_collect, Some(11));
    assert_eq!(trainer.train_dataset().num_steps(), 12 * STEPS_PER_EPOCH);
    for kind in ComponentKind::ALL {
        let steps = match kind {
            ComponentKind::Denoiser => trainer.denoiser().num_batch_train(),
            ComponentKind::RewEndModel => trainer.rew_end_model().num_batch_train(),
            ComponentKind::ActorCritic => trainer.actor_critic().num_batch_train(),
        };
        assert_eq!(steps, 24, "{}", kind.name());
    }

    let records = recorder.records();
    assert!(records.iter().all(|r| r.contains_key("epoch")));
    assert_eq!(epochs_of(&records, "duration"), (1..=12).collect::<Vec<_>>());
    assert_eq!(epochs_of(&records, "test_dataset/episode_id"), vec![5, 10, 12]);

    // test episode ids continue over the run: 2 + 2 + 3 episodes
    let mut ids: Vec<usize> = records
        .iter()
        .filter_map(|r| r.get_scalar("test_dataset/episode_id").ok())
        .map(|id| id as usize)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..7).collect::<Vec<_>>());

    let finals: Vec<&Record> = records.iter().filter(|r| r.contains_key("final_return_mean")).collect();
    assert_eq!(finals.len(), 1);
    assert!(finals[0].get_scalar("final_return_std")? >= 0.0);

    let ckpt = root.join("checkpoints");
    assert!(root.join("config").join("trainer.yaml").exists());
    assert!(root.join("dataset").join("train").exists());
    let state: TrainingState = load_with_backup(ckpt.join(STATE_FILE))?;
    assert_eq!(state.progress.epoch, 12);
    let _: AgentState = load_with_backup(ckpt.join(AGENT_FILE))?;
    let mut versions: Vec<String> = fs::read_dir(ckpt.join(AGENT_VERSIONS_DIR))?
        .map(|e| Ok(e?.file_name().to_string_lossy().to_string()))
        .collect::<Result<_>>()?;
    versions.sort();
    // the initial checkpoint counts as epoch 0
    assert_eq!(
        versions,
        vec!["agent_epoch_00000.bin", "agent_epoch_00005.bin", "agent_epoch_00010.bin"]
    );
    let info: ImportInfo = serde_json::from_reader(fs::File::open(ckpt.join(IMPORT_INFO_FILE))?)?;
    assert_eq!(info.epoch, 12);
    assert_eq!(info.run_name, "corridor");
    Ok(())
}

#[test]
fn test_resume_continues_the_run() -> Result<()> {
    let dir = TempDir::new("training_loop")?;
    let root = dir.path().join("run");
    let recorder = BufferedRecorder::new();
    let mut trainer = build(config(3 * STEPS_PER_EPOCH, 1), &recorder, &root)?;
    trainer.run()?;
    assert_eq!(trainer.epoch(), 3);
    let saved: TrainingState = load_with_backup(root.join("checkpoints").join(STATE_FILE))?;

    // a second fresh run in the same directory is refused
    assert!(build(config(3 * STEPS_PER_EPOCH, 1), &recorder, &root).is_err());

    let recorder = BufferedRecorder::new();
    let mut resumed = build(config(3 * STEPS_PER_EPOCH, 3).resume(true), &recorder, &root)?;
    assert_eq!(resumed.epoch(), 3);
    assert_eq!(resumed.training_state()?, saved);

    resumed.run()?;
    assert_eq!(resumed.epoch(), 5);
    assert_eq!(epochs_of(&recorder.records(), "duration"), vec![4, 5]);
    // final epochs do not collect
    assert_eq!(resumed.train_dataset().num_steps(), 3 * STEPS_PER_EPOCH);
    assert_eq!(resumed.denoiser().num_batch_train(), 10);
    Ok(())
}

#[test]
fn test_state_round_trip() -> Result<()> {
    let dir = TempDir::new("training_loop")?;
    let recorder = BufferedRecorder::new();
    let mut trainer = build(config(2 * STEPS_PER_EPOCH, 1), &recorder, &dir.path().join("a"))?;
    trainer.run()?;

    let mut other = build(config(2 * STEPS_PER_EPOCH, 1), &recorder, &dir.path().join("b"))?;
    other.load_state_dict(&trainer.state_dict()?)?;
    assert_eq!(other.state_dict()?, trainer.state_dict()?);
    assert_eq!(other.epoch(), trainer.epoch());
    Ok(())
}

#[test]
fn test_missing_env_and_bad_config() -> Result<()> {
    let dir = TempDir::new("training_loop")?;
    let err = CorridorTrainer::build(
        config(2 * STEPS_PER_EPOCH, 1),
        agent()?,
        None,
        Box::new(NullRecorder {}),
        SingleProcess,
        dir.path().join("a"),
    )
    .err()
    .unwrap();
    assert!(matches!(err.downcast_ref::<TrainError>(), Some(TrainError::MissingEnv)));

    let bad = config(2 * STEPS_PER_EPOCH, 1).first_epoch(30, None, 1);
    let err = build(bad, &BufferedRecorder::new(), &dir.path().join("b")).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::ConfigInvariantViolation(_))
    ));
    assert!(!dir.path().join("b").exists());

    // the total budget does not split into epochs
    let bad = config(2 * STEPS_PER_EPOCH + STEPS_PER_EPOCH / 2, 1);
    let err = build(bad, &BufferedRecorder::new(), &dir.path().join("c")).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::ConfigInvariantViolation(_))
    ));
    assert!(!dir.path().join("c").exists());
    Ok(())
}

#[test]
fn test_initial_collection_beyond_total() -> Result<()> {
    let dir = TempDir::new("training_loop")?;
    // the initial collection keeps going past the total budget until its maximum
    let config = config(STEPS_PER_EPOCH, 1).first_epoch(STEPS_PER_EPOCH, Some(2 * STEPS_PER_EPOCH), 1000);
    let mut trainer = build(config, &BufferedRecorder::new(), dir.path())?;
    let err = trainer.run().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::ConfigInvariantViolation(_))
    ));
    Ok(())
}

#[test]
fn test_static_dataset() -> Result<()> {
    let dir = TempDir::new("training_loop")?;
    let first = dir.path().join("first");
    let mut trainer = build(
        config(2 * STEPS_PER_EPOCH, 1).eval_every(1),
        &BufferedRecorder::new(),
        &first,
    )?;
    trainer.run()?;
    let num_steps = trainer.train_dataset().num_steps();

    let recorder = BufferedRecorder::new();
    let config = config(2 * STEPS_PER_EPOCH, 2)
        .eval_every(1)
        .static_dataset(Some(first.join("dataset")));
    let mut trainer = CorridorTrainer::build(
        config,
        agent()?,
        None,
        Box::new(recorder.clone()),
        SingleProcess,
        dir.path().join("second"),
    )?;
    trainer.run()?;

    assert_eq!(trainer.epoch(), 2);
    assert_eq!(trainer.train_dataset().num_steps(), num_steps);
    let records = recorder.records();
    assert_eq!(epochs_of(&records, "rew_end_model/test/loss"), vec![1, 2]);
    assert!(epochs_of(&records, "test_dataset/episode_id").is_empty());
    assert!(!records.iter().any(|r| r.contains_key("final_return_mean")));
    Ok(())
}

#[test]
fn test_model_free_trains_only_actor_critic() -> Result<()> {
    let dir = TempDir::new("training_loop")?;
    let recorder = BufferedRecorder::new();
    let config = config(2 * STEPS_PER_EPOCH, 2).model_free(true).eval_every(1);
    let mut trainer = build(config, &recorder, dir.path())?;
    trainer.run()?;

    assert_eq!(trainer.epoch(), 2);
    assert_eq!(trainer.train_dataset().num_steps(), 0);
    assert_eq!(trainer.denoiser().num_batch_train(), 0);
    assert_eq!(trainer.actor_critic().num_batch_train(), 4);
    assert_eq!(epochs_of(&recorder.records(), "test_dataset/episode_id"), vec![1, 2]);
    Ok(())
}

#[test]
fn test_two_ranks_stay_in_sync() -> Result<()> {
    let dir = TempDir::new("training_loop")?;
    let root = dir.path().join("run");
    let recorder = BufferedRecorder::new();

    let results: Vec<Result<(AgentState, usize, usize)>> = thread::scope(|s| {
        let handles: Vec<_> = ThreadGroup::new(2)
            .into_iter()
            .map(|comm| {
                let recorder = recorder.clone();
                let root = root.clone();
                s.spawn(move || -> Result<(AgentState, usize, usize)> {
                    let envs = if comm.is_main() { envs()? } else { None };
                    let mut trainer: CorridorTrainer<ThreadGroup> = Trainer::build(
                        config(3 * STEPS_PER_EPOCH, 1),
                        agent()?,
                        envs,
                        Box::new(recorder),
                        comm,
                        root,
                    )?;
                    trainer.run()?;
                    Ok((
                        trainer.agent_state()?,
                        trainer.train_dataset().num_steps(),
                        trainer.denoiser().num_batch_train(),
                    ))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut results = results.into_iter().collect::<Result<Vec<_>>>()?;
    let (agent1, steps1, batches1) = results.pop().unwrap();
    let (agent0, steps0, batches0) = results.pop().unwrap();
    assert_eq!(agent0, agent1);
    assert_eq!(steps0, 3 * STEPS_PER_EPOCH);
    assert_eq!(steps0, steps1);
    assert_eq!(batches0, batches1);

    // only rank 0 writes records
    assert_eq!(epochs_of(&recorder.records(), "duration"), vec![1, 2, 3]);
    assert_eq!(recorder.records().iter().filter(|r| r.contains_key("duration")).count(), 3);
    Ok(())
}
