//! Batch sampler.
use super::{EpisodeStore, SegmentId};
use crate::error::TrainError;
use anyhow::Result;
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    Rng, SeedableRng,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative sampling weights of episodes.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SampleWeights {
    /// Weight per episode id. Episodes absent from the map weigh 1.0.
    PerEpisode(BTreeMap<usize, f64>),

    /// Bucket weights over chronologically ordered episodes.
    ///
    /// The episodes are split into `len()` consecutive buckets, the last one absorbing
    /// the remainder; each episode weighs `bucket_weight / bucket_size`. With fewer
    /// episodes than buckets, sampling is uniform.
    Recency(Vec<f64>),
}

impl SampleWeights {
    /// Per-episode weights for `num_episodes` episodes, or `None` for uniform sampling.
    pub fn episode_weights(&self, num_episodes: usize) -> Option<Vec<f64>> {
        match self {
            Self::PerEpisode(map) => Some(
                (0..num_episodes)
                    .map(|i| map.get(&i).copied().unwrap_or(1.0))
                    .collect(),
            ),
            Self::Recency(buckets) => {
                let k = buckets.len();
                if k == 0 || num_episodes < k {
                    return None;
                }
                let size = num_episodes / k;
                let weights = (0..num_episodes)
                    .map(|i| {
                        let b = (i / size).min(k - 1);
                        let bucket_size = if b == k - 1 { num_episodes - size * (k - 1) } else { size };
                        buckets[b] / bucket_size as f64
                    })
                    .collect();
                Some(weights)
            }
        }
    }
}

/// Configuration of [`BatchSampler`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct BatchSamplerConfig {
    /// The number of segments in a batch.
    pub batch_size: usize,

    /// Length of segments.
    pub seq_length: usize,

    /// Episode weights. `None` samples uniformly over valid start positions.
    pub sample_weights: Option<SampleWeights>,

    /// If `true`, a segment may run past the end of its episode and is padded.
    pub can_sample_beyond_end: bool,

    /// Random seed shared by all ranks.
    pub seed: u64,
}

/// Produces segment locations from an [`EpisodeStore`].
///
/// Batches are addressed by a local index. Rank `r` of `W` ranks maps local index
/// `i` to global index `i * W + r`, and the random stream of a batch depends only
/// on the seed and its global index. Sampling is thus reproducible, restartable at
/// any position and disjoint across ranks.
///
/// An episode is drawn with probability proportional to
/// `weight * max(1, len - seq_length + 1)` when weights are given, else proportional
/// to its number of valid start positions. The start is then uniform over
/// `[0, len - seq_length]`, or over `[0, len - 1]` when sampling beyond the end.
#[derive(Clone, Debug)]
pub struct BatchSampler {
    config: BatchSamplerConfig,
    rank: usize,
    world_size: usize,
}

impl BatchSampler {
    /// Constructs a sampler for one rank.
    pub fn new(config: BatchSamplerConfig, rank: usize, world_size: usize) -> Self {
        Self {
            config,
            rank,
            world_size: world_size.max(1),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &BatchSamplerConfig {
        &self.config
    }

    /// Global batch index of a local one.
    pub fn global_index(&self, local_index: usize) -> usize {
        local_index * self.world_size + self.rank
    }

    fn rng(&self, global_index: usize) -> StdRng {
        let mixed = self
            .config
            .seed
            .wrapping_add((global_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        StdRng::seed_from_u64(mixed)
    }

    fn is_eligible(&self, len: usize) -> bool {
        if self.config.can_sample_beyond_end {
            len >= 1
        } else {
            len >= self.config.seq_length
        }
    }

    fn num_starts(&self, len: usize) -> usize {
        if self.config.can_sample_beyond_end {
            len
        } else {
            len + 1 - self.config.seq_length
        }
    }

    fn episode_distribution(&self, lengths: &[usize], store_name: &str) -> Result<WeightedIndex<f64>> {
        let empty = || TrainError::EmptyDataset {
            dataset: store_name.to_string(),
            min_length: self.config.seq_length,
        };
        let episode_weights = self
            .config
            .sample_weights
            .as_ref()
            .and_then(|w| w.episode_weights(lengths.len()));

        let weights: Vec<f64> = lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                if !self.is_eligible(len) {
                    return 0.0;
                }
                match &episode_weights {
                    Some(w) => w[i] * (len + 1).saturating_sub(self.config.seq_length).max(1) as f64,
                    None => self.num_starts(len) as f64,
                }
            })
            .collect();

        if !weights.iter().any(|w| *w > 0.0) {
            return Err(empty().into());
        }
        WeightedIndex::new(&weights).map_err(|_| empty().into())
    }

    /// Samples the segment locations of the batch with the given local index.
    pub fn sample(&self, store: &EpisodeStore, local_index: usize) -> Result<Vec<SegmentId>> {
        let lengths = store.lengths();
        let dist = self.episode_distribution(&lengths, store.name())?;
        let mut rng = self.rng(self.global_index(local_index));

        Ok((0..self.config.batch_size)
            .map(|_| {
                let episode_id = dist.sample(&mut rng);
                let start = rng.gen_range(0..self.num_starts(lengths[episode_id]));
                SegmentId::new(episode_id, start, start + self.config.seq_length)
            })
            .collect())
    }

    /// Batches of segment locations from local index `start` onwards.
    ///
    /// The sequence is unbounded; consumers take as many batches as they need.
    pub fn iter<'a>(
        &'a self,
        store: &'a EpisodeStore,
        start: usize,
    ) -> impl Iterator<Item = Result<Vec<SegmentId>>> + 'a {
        (start..).map(move |i| self.sample(store, i))
    }
}
