//! Types and traits for recording training metrics.
//!
//! Every phase of the training loop produces a list of [`Record`]s, flat key-value
//! maps of scalars, arrays and strings. The orchestrator tags each record with the
//! current epoch and hands it to a [`Recorder`], the external telemetry sink.
//!
//! # Core Components
//!
//! * [`Record`] - A flexible container for storing key-value pairs of various data types
//! * [`RecordValue`] - An enum representing different types of values that can be stored
//! * [`Recorder`] - A trait defining the interface for writing records
//! * [`BufferedRecorder`] - A recorder that keeps records in memory
//! * [`NullRecorder`] - A recorder that discards all records
//! * [`JsonlRecorder`] - A recorder that appends one JSON object per line to a file
//!
//! # Basic Usage
//!
//! ```rust
//! use wmrl_core::record::{Record, RecordValue};
//!
//! let mut record = Record::empty();
//! record.insert("train_dataset/episode_id", RecordValue::Scalar(3.0));
//! record.insert("return", RecordValue::Scalar(-1.0));
//! record.insert("length", RecordValue::Scalar(12.0));
//! assert_eq!(record.get_scalar("length").unwrap(), 12.0);
//! ```
//!
//! # Classification metrics
//!
//! Models may report `confusion_matrix/<name>` values as [`RecordValue::Array2`].
//! [`process_confusion_matrices`] removes them from a list of records and appends
//! per-class precision, recall and F1 scores computed from their sum.
mod base;
mod buffered_recorder;
mod classification;
mod jsonl_recorder;
mod null_recorder;
mod recorder;

pub use base::{Record, RecordValue};
pub use buffered_recorder::BufferedRecorder;
pub use classification::process_confusion_matrices;
pub use jsonl_recorder::JsonlRecorder;
pub use null_recorder::NullRecorder;
pub use recorder::{recorder_or_null, Recorder};
