//! Experience dataset: episodes, their store, and the batch pipeline over it.
//!
//! * [`EpisodeStore`] holds episodes and their reward histogram.
//! * [`BatchSampler`] draws fixed-length [`SegmentId`]s from a store.
//! * [`DataLoader`] turns sampled ids into [`Batch`]es, optionally on worker threads.
//! * [`DatasetTraverser`] walks a store once, for evaluation.
mod batch;
mod episode;
mod loader;
mod sampler;
mod segment;
mod store;
mod traverser;

pub use batch::Batch;
pub use episode::{reward_sign, Episode, PolicyInfo};
pub use loader::DataLoader;
pub use sampler::{BatchSampler, BatchSamplerConfig, SampleWeights};
pub use segment::{Segment, SegmentId};
pub use store::{EpisodeStore, REWARD_SIGNS};
pub use traverser::DatasetTraverser;
