//! Trains an agent in the corridor environment.
use anyhow::{anyhow, Result};
use clap::Parser;
use log::info;
use std::{path::PathBuf, thread};
use wmrl_core::{
    dist::{Communicator, SingleProcess, ThreadGroup},
    dummy::{CorridorConfig, CorridorEnv, LinearModel},
    record::{recorder_or_null, JsonlRecorder, NullRecorder, Recorder},
    Agent, Env, Trainer, TrainerConfig,
};
use wmrl_tensorboard::TensorboardRecorder;

/// Train an agent with a world model in a corridor environment
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Trainer configuration in YAML; defaults are used if not given
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of the run
    #[arg(short, long, default_value = "runs/corridor")]
    root_dir: PathBuf,

    /// Resume the run in the root directory
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Number of ranks, each running in its own thread
    #[arg(short, long, default_value_t = 1)]
    world_size: usize,

    /// Write metrics for Tensorboard instead of JSON lines
    #[arg(short, long, default_value_t = false)]
    tensorboard: bool,

    /// Number of cells of the corridor
    #[arg(long, default_value_t = 5)]
    corridor_length: usize,

    /// Steps before an episode is truncated
    #[arg(long, default_value_t = 50)]
    max_steps: usize,
}

fn create_recorder(args: &Args) -> Box<dyn Recorder> {
    match args.tensorboard {
        true => recorder_or_null(TensorboardRecorder::new(args.root_dir.join("tensorboard"))),
        false => recorder_or_null(JsonlRecorder::create(args.root_dir.join("metrics.jsonl"))),
    }
}

fn train<C: Communicator>(args: &Args, config: TrainerConfig, comm: C) -> Result<()> {
    let is_main = comm.is_main();
    let envs = match is_main {
        true => {
            let env_config = CorridorConfig::new(args.corridor_length, args.max_steps);
            let seed = config.common.seed as i64;
            Some((
                CorridorEnv::build(&env_config, seed)?,
                CorridorEnv::build(&env_config, seed + 1)?,
            ))
        }
        false => None,
    };
    let recorder: Box<dyn Recorder> = match is_main {
        true => create_recorder(args),
        false => Box::new(NullRecorder {}),
    };
    let agent = Agent {
        denoiser: LinearModel::new(args.corridor_length, 3)?,
        rew_end_model: LinearModel::new(args.corridor_length, 3)?,
        actor_critic: LinearModel::new(args.corridor_length, 3)?,
    };

    let mut trainer: Trainer<CorridorEnv, _, _, _, C> =
        Trainer::build(config, agent, envs, recorder, comm, &args.root_dir)?;
    trainer.run()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrainerConfig::load(path)?,
        None => TrainerConfig::default(),
    };
    if args.resume {
        config = config.resume(true);
    }
    info!("Run directory: {:?}", args.root_dir);

    if args.world_size <= 1 {
        return train(&args, config, SingleProcess);
    }

    let args = &args;
    let results: Vec<Result<()>> = thread::scope(|s| {
        let handles: Vec<_> = ThreadGroup::new(args.world_size)
            .into_iter()
            .map(|comm| {
                let config = config.clone();
                s.spawn(move || train(args, config, comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("A training thread panicked"))))
            .collect()
    });
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn args(root_dir: PathBuf, world_size: usize) -> Args {
        Args {
            config: None,
            root_dir,
            resume: false,
            world_size,
            tensorboard: false,
            corridor_length: 5,
            max_steps: 20,
        }
    }

    fn small_config() -> TrainerConfig {
        TrainerConfig::default()
            .train_collection(20, 60)
            .first_epoch(20, Some(20), 1)
            .test_episodes(1, 2)
            .eval_every(2)
    }

    #[test]
    fn test_train_corridor() -> Result<()> {
        let dir = TempDir::new("wmrl")?;
        let args = args(dir.path().join("run"), 1);
        train(&args, small_config(), SingleProcess)?;
        assert!(args.root_dir.join("metrics.jsonl").exists());
        assert!(args.root_dir.join("checkpoints").join("state.bin").exists());
        Ok(())
    }

    #[test]
    fn test_unusable_tensorboard_dir_disables_metrics() -> Result<()> {
        let dir = TempDir::new("wmrl")?;
        let file = dir.path().join("file");
        std::fs::write(&file, b"")?;
        let mut args = args(file.join("run"), 1);
        args.tensorboard = true;

        let mut recorder = create_recorder(&args);
        recorder.write(wmrl_core::record::Record::from_scalar("loss", 1.0));
        recorder.flush();
        Ok(())
    }

    #[test]
    fn test_config_file() -> Result<()> {
        let config = TrainerConfig::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config/corridor.yaml"))?;
        config.validate()?;
        assert_eq!(config.run_name, "corridor");
        Ok(())
    }
}
