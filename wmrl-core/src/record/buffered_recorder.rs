use super::{Record, Recorder};
use std::sync::{Arc, Mutex};

/// Buffered recorder.
///
/// Keeps every record in memory. Clones share the same buffer, so a test can
/// hand one clone to the trainer and inspect the records through another.
#[derive(Clone, Default)]
pub struct BufferedRecorder {
    buf: Arc<Mutex<Vec<Record>>>,
}

impl BufferedRecorder {
    /// Construct the recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the records written so far.
    pub fn records(&self) -> Vec<Record> {
        match self.buf.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The number of records written so far.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    /// Returns `true` if no record has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Recorder for BufferedRecorder {
    /// Write a [`Record`] to the buffer.
    fn write(&mut self, record: Record) {
        match self.buf.lock() {
            Ok(mut buf) => buf.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
