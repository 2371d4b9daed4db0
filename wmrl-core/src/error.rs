//! Errors in the library.
use thiserror::Error;

/// Errors raised by the training loop and its collaborators.
///
/// Functions in this crate return [`anyhow::Result`]; these variants can be
/// recovered with `err.downcast_ref::<TrainError>()`.
#[derive(Debug, Error, PartialEq)]
pub enum TrainError {
    /// A configuration value breaks a contract of the training loop.
    #[error("configuration invariant violated: {0}")]
    ConfigInvariantViolation(String),

    /// A segment window exceeds the bounds of its episode.
    #[error("segment [{start}, {stop}) is out of range for episode {episode_id} of length {length}")]
    OutOfRange {
        /// Episode the segment was taken from.
        episode_id: usize,
        /// First step of the window.
        start: usize,
        /// One past the last step of the window.
        stop: usize,
        /// Length of the episode.
        length: usize,
    },

    /// No episode is long enough to sample from.
    #[error("no episode in {dataset} can provide a segment of length {min_length}")]
    EmptyDataset {
        /// Name of the episode store.
        dataset: String,
        /// Required segment length.
        min_length: usize,
    },

    /// The episode id is not in the store.
    #[error("episode {0} does not exist")]
    UnknownEpisode(usize),

    /// Steps were appended to an episode that already ended.
    #[error("episode {0} is already complete")]
    EpisodeComplete(usize),

    /// Ranks disagree on broadcast contents or a peer went away.
    #[error("rank synchronization failed: {0}")]
    SyncFailure(String),

    /// Collection was requested on a rank without environments.
    #[error("environments are required on rank 0 unless the dataset is static")]
    MissingEnv,

    /// Record key error.
    #[error("Record key error: {0}")]
    RecordKeyError(String),

    /// Record value type error.
    #[error("Record value type error, expected {0}")]
    RecordValueTypeError(String),
}
