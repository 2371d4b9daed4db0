use super::{Record, Recorder};

/// A recorder that ignores any record.
///
/// This is the fallback sink when telemetry is disabled or failed to start.
#[derive(Debug, Default)]
pub struct NullRecorder {}

impl Recorder for NullRecorder {
    /// Discard the given record.
    fn write(&mut self, _record: Record) {}
}
