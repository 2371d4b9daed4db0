//! Episode store.
use super::{
    episode::{reward_sign, Episode, PolicyInfo},
    Segment, SegmentId,
};
use crate::{error::TrainError, StateBlob, Stateful};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

const INFO_FILE: &str = "info.bin";
const EPISODES_DIR: &str = "episodes";

/// Keys of the reward histogram, in the order of [`EpisodeStore::counts_rew`].
pub const REWARD_SIGNS: [i8; 3] = [-1, 0, 1];

#[derive(Serialize, Deserialize)]
struct StoreInfo {
    num_episodes: usize,
    num_steps: usize,
    counter_rew: BTreeMap<i8, usize>,
}

#[derive(Serialize, Deserialize)]
struct StoreState {
    episodes: Vec<Episode>,
    num_steps: usize,
    counter_rew: BTreeMap<i8, usize>,
}

/// Append-only container of episodes.
///
/// Episode ids are consecutive integers starting at 0 in insertion order.
/// The store keeps the total number of steps and a histogram of reward signs; both
/// always equal their recomputation from the stored episodes.
///
/// The store is persisted under its directory as `info.bin` plus one
/// `episodes/<id>.bin` file per episode, all `bincode`-encoded. Only episodes
/// modified since the last save are rewritten.
pub struct EpisodeStore {
    name: String,
    directory: PathBuf,
    episodes: Vec<Episode>,
    num_steps: usize,
    counter_rew: BTreeMap<i8, usize>,
    noop_action: u32,
    dirty: BTreeSet<usize>,
    rewrite_all: bool,
}

impl EpisodeStore {
    /// Creates an empty store persisted under `directory`.
    pub fn new(directory: impl AsRef<Path>, name: impl Into<String>, noop_action: u32) -> Self {
        Self {
            name: name.into(),
            directory: directory.as_ref().to_path_buf(),
            episodes: vec![],
            num_steps: 0,
            counter_rew: BTreeMap::new(),
            noop_action,
            dirty: BTreeSet::new(),
            rewrite_all: false,
        }
    }

    /// Name of the store, used as a prefix of metric keys.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory where the store is persisted.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The number of steps over all episodes.
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// The number of episodes.
    pub fn num_episodes(&self) -> usize {
        self.episodes.len()
    }

    /// Reward-sign histogram.
    pub fn counter_rew(&self) -> &BTreeMap<i8, usize> {
        &self.counter_rew
    }

    /// Counts of negative, zero and positive rewards, in this order.
    pub fn counts_rew(&self) -> [usize; 3] {
        REWARD_SIGNS.map(|s| self.counter_rew.get(&s).copied().unwrap_or(0))
    }

    /// Sum of all reward counts but the largest one.
    ///
    /// Measures how much signal the minority reward classes carry.
    pub fn minority_reward_count(&self) -> usize {
        let mut counts = self.counts_rew();
        counts.sort_unstable();
        counts[..counts.len() - 1].iter().sum()
    }

    /// Lengths of the episodes, indexed by episode id.
    pub fn lengths(&self) -> Vec<usize> {
        self.episodes.iter().map(|e| e.len()).collect()
    }

    /// Returns the episode with the given id.
    pub fn episode(&self, episode_id: usize) -> Result<&Episode> {
        self.episodes
            .get(episode_id)
            .ok_or_else(|| TrainError::UnknownEpisode(episode_id).into())
    }

    /// Adds an episode and returns its id.
    ///
    /// The episode may be incomplete; it is then extended with
    /// [`EpisodeStore::append_steps`].
    pub fn append(&mut self, episode: Episode) -> usize {
        let episode_id = self.episodes.len();
        self.count(&episode);
        self.episodes.push(episode);
        self.dirty.insert(episode_id);
        episode_id
    }

    /// Appends steps to an episode that has not ended yet.
    pub fn append_steps(&mut self, episode_id: usize, steps: Episode) -> Result<()> {
        let episode = self
            .episodes
            .get(episode_id)
            .ok_or(TrainError::UnknownEpisode(episode_id))?;
        if episode.is_complete() {
            return Err(TrainError::EpisodeComplete(episode_id).into());
        }
        self.count(&steps);
        self.episodes[episode_id].extend(steps);
        self.dirty.insert(episode_id);
        Ok(())
    }

    fn count(&mut self, episode: &Episode) {
        self.num_steps += episode.len();
        for r in episode.rew.iter() {
            *self.counter_rew.entry(reward_sign(*r)).or_insert(0) += 1;
        }
    }

    fn recount(&mut self) {
        self.num_steps = 0;
        self.counter_rew.clear();
        let episodes = std::mem::take(&mut self.episodes);
        episodes.iter().for_each(|e| self.count(e));
        self.episodes = episodes;
    }

    /// Removes every episode. Ids restart at 0.
    pub fn clear(&mut self) {
        self.episodes.clear();
        self.num_steps = 0;
        self.counter_rew.clear();
        self.dirty.clear();
        self.rewrite_all = true;
    }

    /// Extracts `length` steps of an episode starting at `start`.
    ///
    /// When the window runs past the end of the episode and `allow_past_end` is set,
    /// the tail is padded; otherwise [`TrainError::OutOfRange`] is returned. A window
    /// must contain at least one real step.
    pub fn sample_segment(
        &self,
        episode_id: usize,
        start: usize,
        length: usize,
        allow_past_end: bool,
    ) -> Result<Segment> {
        let episode = self.episode(episode_id)?;
        let stop = start + length;
        let n = episode.len();
        if start >= n || (stop > n && !allow_past_end) {
            return Err(TrainError::OutOfRange {
                episode_id,
                start,
                stop,
                length: n,
            }
            .into());
        }

        let real_stop = stop.min(n);
        let num_pad = stop - real_stop;
        let obs_dim = episode.obs_dim().unwrap_or(0);
        let range = start..real_stop;

        Ok(Segment {
            obs: padded(&episode.obs[range.clone()], vec![0.0; obs_dim], num_pad),
            act: padded(&episode.act[range.clone()], self.noop_action, num_pad),
            rew: padded(&episode.rew[range.clone()], 0.0, num_pad),
            end: padded(&episode.end[range.clone()], false, num_pad),
            trunc: padded(&episode.trunc[range.clone()], false, num_pad),
            info: padded(&episode.info[range.clone()], PolicyInfo::default(), num_pad),
            mask_padding: padded(&vec![true; range.len()], false, num_pad),
            id: SegmentId::new(episode_id, start, stop),
        })
    }

    /// Fetches the segment at a location produced by a sampler.
    pub fn segment(&self, id: &SegmentId, allow_past_end: bool) -> Result<Segment> {
        self.sample_segment(id.episode_id, id.start, id.len(), allow_past_end)
    }

    /// Saves modified episodes and the store info under the store directory.
    pub fn save_to_default_path(&mut self) -> Result<()> {
        let episodes_dir = self.directory.join(EPISODES_DIR);
        if self.rewrite_all && episodes_dir.exists() {
            fs::remove_dir_all(&episodes_dir)?;
        }
        fs::create_dir_all(&episodes_dir)?;

        let ids: Vec<usize> = if self.rewrite_all {
            (0..self.episodes.len()).collect()
        } else {
            self.dirty.iter().copied().collect()
        };
        for id in ids.iter() {
            let path = episodes_dir.join(format!("{}.bin", id));
            let file = BufWriter::new(File::create(&path)?);
            bincode::serialize_into(file, &self.episodes[*id])
                .with_context(|| format!("Failed to save episode to {:?}", path))?;
        }

        let info = StoreInfo {
            num_episodes: self.episodes.len(),
            num_steps: self.num_steps,
            counter_rew: self.counter_rew.clone(),
        };
        let file = BufWriter::new(File::create(self.directory.join(INFO_FILE))?);
        bincode::serialize_into(file, &info)?;

        debug!("Saved {} episode(s) of {}", ids.len(), self.name);
        self.dirty.clear();
        self.rewrite_all = false;
        Ok(())
    }

    /// Loads the store from its directory; leaves it empty if nothing was saved.
    pub fn load_from_default_path(&mut self) -> Result<()> {
        let path_info = self.directory.join(INFO_FILE);
        if !path_info.exists() {
            debug!("No saved dataset in {:?}", self.directory);
            return Ok(());
        }

        let info: StoreInfo = bincode::deserialize_from(BufReader::new(File::open(&path_info)?))
            .with_context(|| format!("Failed to read {:?}", path_info))?;
        let episodes_dir = self.directory.join(EPISODES_DIR);
        let mut episodes = Vec::with_capacity(info.num_episodes);
        for id in 0..info.num_episodes {
            let path = episodes_dir.join(format!("{}.bin", id));
            let file = BufReader::new(File::open(&path)?);
            let episode: Episode = bincode::deserialize_from(file)
                .with_context(|| format!("Failed to read episode from {:?}", path))?;
            episodes.push(episode);
        }

        self.episodes = episodes;
        self.recount();
        if self.num_steps != info.num_steps || self.counter_rew != info.counter_rew {
            warn!(
                "Counters of {} saved in {:?} do not match its episodes, recomputed",
                self.name, path_info
            );
        }
        self.dirty.clear();
        self.rewrite_all = false;
        info!("Loaded {}", self);
        Ok(())
    }
}

fn padded<T: Clone>(real: &[T], pad: T, num_pad: usize) -> Vec<T> {
    let mut v = real.to_vec();
    v.extend(std::iter::repeat(pad).take(num_pad));
    v
}

impl Stateful for EpisodeStore {
    fn state_dict(&self) -> Result<StateBlob> {
        StateBlob::encode(&StoreState {
            episodes: self.episodes.clone(),
            num_steps: self.num_steps,
            counter_rew: self.counter_rew.clone(),
        })
    }

    fn load_state_dict(&mut self, state: &StateBlob) -> Result<()> {
        let state: StoreState = state.decode()?;
        self.episodes = state.episodes;
        self.num_steps = state.num_steps;
        self.counter_rew = state.counter_rew;
        self.dirty.clear();
        self.rewrite_all = true;
        Ok(())
    }
}

impl fmt::Display for EpisodeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} episodes, {} steps, reward counts {:?}",
            self.name,
            self.num_episodes(),
            self.num_steps,
            self.counter_rew
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::episode_from_rewards as episode;
    use tempdir::TempDir;

    fn recomputed(store: &EpisodeStore) -> (usize, BTreeMap<i8, usize>) {
        let mut counter = BTreeMap::new();
        let mut steps = 0;
        for id in 0..store.num_episodes() {
            let ep = store.episode(id).unwrap();
            steps += ep.len();
            for r in ep.rew.iter() {
                *counter.entry(reward_sign(*r)).or_insert(0) += 1;
            }
        }
        (steps, counter)
    }

    #[test]
    fn test_counters_match_recomputation() -> Result<()> {
        let mut store = EpisodeStore::new("unused", "train_dataset", 0);
        let id0 = store.append(episode(&[0.0, 1.0, 0.0], true));
        let id1 = store.append(episode(&[-1.0, 0.0], false));
        store.append_steps(id1, episode(&[0.0, 0.0, 2.0], true))?;
        store.append(episode(&[0.0; 7], true));

        assert_eq!((id0, id1), (0, 1));
        assert_eq!(store.lengths(), vec![3, 5, 7]);
        let (steps, counter) = recomputed(&store);
        assert_eq!(store.num_steps(), steps);
        assert_eq!(store.counter_rew(), &counter);
        assert_eq!(store.counts_rew(), [1, 12, 2]);
        assert_eq!(store.minority_reward_count(), 3);
        Ok(())
    }

    #[test]
    fn test_append_steps_errors() {
        let mut store = EpisodeStore::new("unused", "train_dataset", 0);
        store.append(episode(&[0.0, 1.0], true));
        let err = store.append_steps(0, episode(&[0.0], false)).unwrap_err();
        assert_eq!(err.downcast_ref::<TrainError>(), Some(&TrainError::EpisodeComplete(0)));
        let err = store.append_steps(5, episode(&[0.0], false)).unwrap_err();
        assert_eq!(err.downcast_ref::<TrainError>(), Some(&TrainError::UnknownEpisode(5)));
        assert_eq!(store.num_steps(), 2);
    }

    #[test]
    fn test_sample_segment() -> Result<()> {
        let mut store = EpisodeStore::new("unused", "train_dataset", 2);
        let mut ep = episode(&[0.0, 1.0, 0.0, -1.0], true);
        ep.info[2] = PolicyInfo {
            epsilon: 0.25,
            is_random: true,
        };
        store.append(ep);

        let seg = store.sample_segment(0, 1, 3, false)?;
        assert_eq!(seg.rew, vec![1.0, 0.0, -1.0]);
        assert_eq!(seg.info[1].epsilon, 0.25);
        assert!(seg.info[1].is_random);
        assert_eq!(seg.info[0], PolicyInfo::default());
        assert_eq!(seg.mask_padding, vec![true; 3]);

        let err = store.sample_segment(0, 2, 3, false).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrainError>(),
            Some(&TrainError::OutOfRange {
                episode_id: 0,
                start: 2,
                stop: 5,
                length: 4
            })
        );

        let seg = store.sample_segment(0, 2, 4, true)?;
        assert_eq!(seg.len(), 4);
        assert_eq!(seg.num_real_steps(), 2);
        assert_eq!(seg.act[2..], [2, 2]);
        assert_eq!(seg.rew[2..], [0.0, 0.0]);
        assert_eq!(seg.obs[3], vec![0.0, 0.0]);
        assert_eq!(seg.mask_padding, vec![true, true, false, false]);
        assert!(seg.info[1].is_random);
        assert_eq!(seg.info[2..], [PolicyInfo::default(); 2]);

        assert!(store.sample_segment(0, 4, 2, true).is_err());
        Ok(())
    }

    #[test]
    fn test_state_dict_round_trip() -> Result<()> {
        let mut store = EpisodeStore::new("unused", "train_dataset", 0);
        store.append(episode(&[0.0, 1.0, 0.0], true));
        store.append(episode(&[-1.0, 0.0], false));

        let mut other = EpisodeStore::new("unused", "train_dataset", 0);
        other.load_state_dict(&store.state_dict()?)?;
        assert_eq!(other.num_steps(), store.num_steps());
        assert_eq!(other.counter_rew(), store.counter_rew());
        for id in 0..store.num_episodes() {
            assert_eq!(other.episode(id)?, store.episode(id)?);
        }
        assert_eq!(other.state_dict()?, store.state_dict()?);
        Ok(())
    }

    #[test]
    fn test_save_load_and_clear() -> Result<()> {
        let dir = TempDir::new("episode_store")?;
        let mut store = EpisodeStore::new(dir.path(), "test_dataset", 0);
        store.append(episode(&[0.0, 1.0, 0.0], true));
        store.append(episode(&[1.0, 1.0], true));
        store.save_to_default_path()?;

        let mut loaded = EpisodeStore::new(dir.path(), "test_dataset", 0);
        loaded.load_from_default_path()?;
        assert_eq!(loaded.num_episodes(), 2);
        assert_eq!(loaded.counts_rew(), [0, 2, 3]);

        store.clear();
        assert_eq!(store.num_steps(), 0);
        assert_eq!(store.append(episode(&[-1.0], true)), 0);
        store.save_to_default_path()?;

        let mut loaded = EpisodeStore::new(dir.path(), "test_dataset", 0);
        loaded.load_from_default_path()?;
        assert_eq!(loaded.num_episodes(), 1);
        assert_eq!(loaded.counts_rew(), [1, 0, 0]);
        assert!(!dir.path().join("episodes").join("1.bin").exists());
        Ok(())
    }

    #[test]
    fn test_load_missing_directory_is_empty() -> Result<()> {
        let dir = TempDir::new("episode_store")?;
        let mut store = EpisodeStore::new(dir.path().join("nothing"), "train_dataset", 0);
        store.load_from_default_path()?;
        assert_eq!(store.num_episodes(), 0);
        Ok(())
    }
}
