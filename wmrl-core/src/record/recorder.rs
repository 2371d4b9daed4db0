use super::{NullRecorder, Record};
use anyhow::Result;
use log::warn;

/// Writes records to an output destination with [`Recorder::write`].
///
/// Implementations must not abort training on transport failures; they log a
/// warning and drop the record instead.
pub trait Recorder {
    /// Write a record to the [`Recorder`].
    fn write(&mut self, record: Record);

    /// Flushes buffered output, if any.
    fn flush(&mut self) {}
}

impl<R: Recorder + ?Sized> Recorder for Box<R> {
    fn write(&mut self, record: Record) {
        (**self).write(record)
    }

    fn flush(&mut self) {
        (**self).flush()
    }
}

/// Returns the recorder, or a [`NullRecorder`] if it could not be created.
///
/// Training then proceeds without telemetry.
pub fn recorder_or_null<R: Recorder + 'static>(recorder: Result<R>) -> Box<dyn Recorder> {
    match recorder {
        Ok(recorder) => Box::new(recorder),
        Err(e) => {
            warn!("Failed to initialize the recorder, metrics are disabled: {:#}", e);
            Box::new(NullRecorder {})
        }
    }
}
