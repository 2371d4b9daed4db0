//! Segments, fixed-length windows over one episode.
use super::PolicyInfo;
use serde::{Deserialize, Serialize};

/// Location of a segment: episode and half-open step range `[start, stop)`.
///
/// `stop` may exceed the episode length when sampling beyond the end is allowed;
/// the tail is then padded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId {
    /// Episode id in the store.
    pub episode_id: usize,

    /// First step.
    pub start: usize,

    /// One past the last step.
    pub stop: usize,
}

impl SegmentId {
    /// Constructs a segment id.
    pub fn new(episode_id: usize, start: usize, stop: usize) -> Self {
        Self {
            episode_id,
            start,
            stop,
        }
    }

    /// Length of the window.
    pub fn len(&self) -> usize {
        self.stop.saturating_sub(self.start)
    }

    /// Returns `true` if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A contiguous slice of an episode, padded to the requested length.
///
/// Padded steps hold a zero observation, the no-op action, zero reward, cleared
/// flags, default policy metadata and `mask_padding == false`.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    /// Observations.
    pub obs: Vec<Vec<f32>>,

    /// Actions.
    pub act: Vec<u32>,

    /// Rewards.
    pub rew: Vec<f32>,

    /// Termination flags.
    pub end: Vec<bool>,

    /// Truncation flags.
    pub trunc: Vec<bool>,

    /// Policy metadata.
    pub info: Vec<PolicyInfo>,

    /// `true` for real steps, `false` for padding.
    pub mask_padding: Vec<bool>,

    /// Where the segment was taken from.
    pub id: SegmentId,
}

impl Segment {
    /// Length of the segment, padding included.
    pub fn len(&self) -> usize {
        self.act.len()
    }

    /// Returns `true` if the segment has no step.
    pub fn is_empty(&self) -> bool {
        self.act.is_empty()
    }

    /// The number of real (non-padded) steps.
    pub fn num_real_steps(&self) -> usize {
        self.mask_padding.iter().filter(|m| **m).count()
    }
}
