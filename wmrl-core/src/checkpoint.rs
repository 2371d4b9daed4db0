//! Files of the checkpoint directory.
//!
//! ```text
//! checkpoints/
//! ├── state.bin                    full training state
//! ├── agent.bin                    latest agent parameters
//! ├── agent_versions/
//! │   └── agent_epoch_00005.bin    periodic agent snapshots
//! └── info_for_import_script.json  run name and last epoch
//! ```
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

/// File name of the training state.
pub const STATE_FILE: &str = "state.bin";

/// File name of the latest agent parameters.
pub const AGENT_FILE: &str = "agent.bin";

/// Directory of periodic agent snapshots.
pub const AGENT_VERSIONS_DIR: &str = "agent_versions";

/// File name of the metadata read by import scripts.
pub const IMPORT_INFO_FILE: &str = "info_for_import_script.json";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn write_bincode<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Writes `value` to `path` so that a crash leaves at least one readable copy.
///
/// The value is written to `<path>.tmp`; the current file is moved to `<path>.bk`,
/// the temporary file takes its place and the backup is removed.
pub fn save_with_backup<T: Serialize + ?Sized>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let tmp = with_suffix(path, ".tmp");
    let bk = with_suffix(path, ".bk");

    write_bincode(value, &tmp).with_context(|| format!("Failed to write {:?}", tmp))?;
    if path.exists() {
        fs::rename(path, &bk)?;
    }
    fs::rename(&tmp, path)?;
    if bk.exists() {
        fs::remove_file(&bk)?;
    }
    debug!("Saved {:?}", path);
    Ok(())
}

/// Reads a value saved by [`save_with_backup`], falling back to the backup.
pub fn load_with_backup<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let read = |p: &Path| -> Result<T> {
        let file = BufReader::new(File::open(p)?);
        Ok(bincode::deserialize_from(file)?)
    };
    match read(path) {
        Ok(value) => Ok(value),
        Err(e) => {
            let bk = with_suffix(path, ".bk");
            warn!("Failed to read {:?} ({}), trying {:?}", path, e, bk);
            read(&bk).with_context(|| format!("Failed to read {:?} and its backup", path))
        }
    }
}

/// Saves the agent to `agent.bin`, and to `agent_versions/` every `every` epochs.
///
/// When `num_to_keep` is given, only the newest `num_to_keep` snapshots are kept.
pub fn keep_agent_copies_every<T: Serialize + ?Sized>(
    agent: &T,
    epoch: usize,
    dir: impl AsRef<Path>,
    every: usize,
    num_to_keep: Option<usize>,
) -> Result<()> {
    let dir = dir.as_ref();
    save_with_backup(agent, dir.join(AGENT_FILE))?;
    if every == 0 || epoch % every != 0 {
        return Ok(());
    }

    let versions = dir.join(AGENT_VERSIONS_DIR);
    fs::create_dir_all(&versions)?;
    write_bincode(agent, &versions.join(format!("agent_epoch_{:05}.bin", epoch)))?;

    if let Some(num_to_keep) = num_to_keep {
        let mut snapshots: Vec<PathBuf> = fs::read_dir(&versions)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("agent_epoch_") && n.ends_with(".bin"))
                    .unwrap_or(false)
            })
            .collect();
        snapshots.sort();
        let num_to_remove = snapshots.len().saturating_sub(num_to_keep);
        for p in snapshots.iter().take(num_to_remove) {
            debug!("Removing {:?}", p);
            fs::remove_file(p)?;
        }
    }
    Ok(())
}

/// Metadata read by scripts importing a trained agent.
#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct ImportInfo {
    /// Name of the run.
    pub run_name: String,

    /// Last checkpointed epoch.
    pub epoch: usize,
}

/// Writes [`ImportInfo`] as JSON.
pub fn save_info_for_import_script(epoch: usize, run_name: &str, dir: impl AsRef<Path>) -> Result<()> {
    let info = ImportInfo {
        run_name: run_name.to_string(),
        epoch,
    };
    let file = File::create(dir.as_ref().join(IMPORT_INFO_FILE))?;
    serde_json::to_writer_pretty(file, &info)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_save_with_backup() -> Result<()> {
        let dir = TempDir::new("checkpoint")?;
        let path = dir.path().join(STATE_FILE);
        save_with_backup(&vec![1u32, 2, 3], &path)?;
        save_with_backup(&vec![4u32], &path)?;
        assert_eq!(load_with_backup::<Vec<u32>>(&path)?, vec![4]);
        assert!(!with_suffix(&path, ".bk").exists());
        assert!(!with_suffix(&path, ".tmp").exists());
        Ok(())
    }

    #[test]
    fn test_load_falls_back_to_backup() -> Result<()> {
        let dir = TempDir::new("checkpoint")?;
        let path = dir.path().join(STATE_FILE);
        save_with_backup(&7u64, &path)?;
        // crash between the two renames
        fs::rename(&path, with_suffix(&path, ".bk"))?;
        assert_eq!(load_with_backup::<u64>(&path)?, 7);
        assert!(load_with_backup::<u64>(dir.path().join("missing.bin")).is_err());
        Ok(())
    }

    #[test]
    fn test_keep_agent_copies() -> Result<()> {
        let dir = TempDir::new("checkpoint")?;
        for epoch in 1..=10 {
            keep_agent_copies_every(&(epoch as u32), epoch, dir.path(), 2, Some(3))?;
        }
        let mut names: Vec<String> = fs::read_dir(dir.path().join(AGENT_VERSIONS_DIR))?
            .map(|e| Ok(e?.file_name().to_string_lossy().to_string()))
            .collect::<Result<_>>()?;
        names.sort();
        assert_eq!(
            names,
            vec!["agent_epoch_00006.bin", "agent_epoch_00008.bin", "agent_epoch_00010.bin"]
        );
        assert_eq!(load_with_backup::<u32>(dir.path().join(AGENT_FILE))?, 10);
        Ok(())
    }

    #[test]
    fn test_import_info() -> Result<()> {
        let dir = TempDir::new("checkpoint")?;
        save_info_for_import_script(12, "corridor", dir.path())?;
        let info: ImportInfo =
            serde_json::from_reader(File::open(dir.path().join(IMPORT_INFO_FILE))?)?;
        assert_eq!(
            info,
            ImportInfo {
                run_name: "corridor".to_string(),
                epoch: 12
            }
        );
        Ok(())
    }
}
