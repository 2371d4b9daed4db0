//! Single pass over a store, used for evaluation.
use super::{Batch, EpisodeStore, SegmentId};
use anyhow::Result;

/// Iterates once over every episode of a store in consecutive windows.
///
/// Episode `e` of length `n` yields the windows `[i * L, (i + 1) * L)` for
/// `i < ceil(n / L)`, the last one padded. A window with fewer than 2 real steps
/// is dropped. Windows are grouped `batch_size` at a time; the last batch may be
/// smaller. A new traverser must be created for every pass.
pub struct DatasetTraverser<'a> {
    store: &'a EpisodeStore,
    batch_size: usize,
    chunks: std::vec::IntoIter<SegmentId>,
}

impl<'a> DatasetTraverser<'a> {
    /// Constructs a traverser.
    pub fn new(store: &'a EpisodeStore, batch_size: usize, seq_length: usize) -> Self {
        let seq_length = seq_length.max(1);
        let chunks: Vec<SegmentId> = store
            .lengths()
            .into_iter()
            .enumerate()
            .flat_map(|(episode_id, n)| {
                (0..n.div_ceil(seq_length)).filter_map(move |i| {
                    let start = i * seq_length;
                    (n - start >= 2).then(|| SegmentId::new(episode_id, start, start + seq_length))
                })
            })
            .collect();

        Self {
            store,
            batch_size: batch_size.max(1),
            chunks: chunks.into_iter(),
        }
    }

    /// The number of remaining windows.
    pub fn num_remaining_segments(&self) -> usize {
        self.chunks.len()
    }
}

impl Iterator for DatasetTraverser<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let ids: Vec<SegmentId> = self.chunks.by_ref().take(self.batch_size).collect();
        if ids.is_empty() {
            return None;
        }
        let segments: Result<Vec<_>> = ids.iter().map(|id| self.store.segment(id, true)).collect();
        Some(segments.and_then(|s| Batch::collate(&s)))
    }
}
