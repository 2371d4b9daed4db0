//! Data loader with optional prefetching.
use super::{Batch, BatchSampler, EpisodeStore};
use anyhow::{anyhow, Result};
use crossbeam_channel::bounded;
use log::trace;
use std::{collections::BTreeMap, thread};

/// Builds batches from a sampler and hands them to a consumer in index order.
///
/// With `num_workers == 0` batches are built on the calling thread. Otherwise
/// `num_workers` scoped threads build batches ahead of consumption and send them
/// through a bounded channel; the consumer reorders them so that it sees exactly
/// the sequence produced by the sequential path.
pub struct DataLoader<'a> {
    store: &'a EpisodeStore,
    sampler: &'a BatchSampler,
    num_workers: usize,
}

impl<'a> DataLoader<'a> {
    /// Constructs a loader.
    pub fn new(store: &'a EpisodeStore, sampler: &'a BatchSampler, num_workers: usize) -> Self {
        Self {
            store,
            sampler,
            num_workers,
        }
    }

    /// Builds the batch with the given local index.
    pub fn batch(&self, local_index: usize) -> Result<Batch> {
        let beyond_end = self.sampler.config().can_sample_beyond_end;
        let segments = self
            .sampler
            .sample(self.store, local_index)?
            .iter()
            .map(|id| self.store.segment(id, beyond_end))
            .collect::<Result<Vec<_>>>()?;
        Batch::collate(&segments)
    }

    /// Calls `f(index, batch)` for the local indices `start..start + num_batches`.
    ///
    /// Stops at the first error, either from building a batch or from `f`.
    pub fn for_each<F>(&self, start: usize, num_batches: usize, mut f: F) -> Result<()>
    where
        F: FnMut(usize, Batch) -> Result<()>,
    {
        let stop = start + num_batches;
        if self.num_workers == 0 {
            for i in start..stop {
                f(i, self.batch(i)?)?;
            }
            return Ok(());
        }

        let num_workers = self.num_workers;
        thread::scope(|s| {
            let (tx, rx) = bounded::<(usize, Result<Batch>)>(2 * num_workers);
            for w in 0..num_workers {
                let tx = tx.clone();
                s.spawn(move || {
                    for i in (start + w..stop).step_by(num_workers) {
                        if tx.send((i, self.batch(i))).is_err() {
                            trace!("Data loader worker {} stopped early", w);
                            break;
                        }
                    }
                });
            }
            drop(tx);

            let mut pending = BTreeMap::new();
            let mut next = start;
            for (i, batch) in rx.iter() {
                pending.insert(i, batch);
                while let Some(batch) = pending.remove(&next) {
                    f(next, batch?)?;
                    next += 1;
                }
            }
            if next != stop {
                return Err(anyhow!("Data loader workers exited after {} of {} batches", next - start, num_batches));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::BatchSamplerConfig, dummy::episode_from_rewards};

    fn store() -> EpisodeStore {
        let mut store = EpisodeStore::new("unused", "train_dataset", 0);
        for len in [9, 14, 6, 30] {
            let rews: Vec<f32> = (0..len).map(|t| (t % 5) as f32 - 2.0).collect();
            store.append(episode_from_rewards(&rews, true));
        }
        store
    }

    fn sampler() -> BatchSampler {
        let config = BatchSamplerConfig {
            batch_size: 8,
            seq_length: 4,
            sample_weights: None,
            can_sample_beyond_end: false,
            seed: 7,
        };
        BatchSampler::new(config, 0, 1)
    }

    #[test]
    fn test_prefetch_matches_sequential() -> Result<()> {
        let store = store();
        let sampler = sampler();

        let mut sequential = vec![];
        DataLoader::new(&store, &sampler, 0).for_each(5, 20, |i, b| {
            sequential.push((i, b));
            Ok(())
        })?;

        let mut prefetched = vec![];
        DataLoader::new(&store, &sampler, 3).for_each(5, 20, |i, b| {
            prefetched.push((i, b));
            Ok(())
        })?;

        assert_eq!(sequential.len(), 20);
        assert_eq!(sequential, prefetched);
        assert_eq!(sequential[0].0, 5);
        Ok(())
    }

    #[test]
    fn test_consumer_error_stops_workers() {
        let store = store();
        let sampler = sampler();
        let mut seen = 0;
        let result = DataLoader::new(&store, &sampler, 2).for_each(0, 100, |i, _| {
            seen += 1;
            if i == 3 {
                Err(anyhow!("stop"))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert_eq!(seen, 4);
    }
}
