//! Tensorboard recorder for training runs.
use anyhow::{Context, Result};
use log::warn;
use std::{fs, panic, path::Path};
use tensorboard_rs::summary_writer::SummaryWriter;
use wmrl_core::record::{Record, RecordValue, Recorder};

/// Write records to TFRecord.
///
/// The step of a record is read from its `epoch` entry; records without one are
/// written at the step of the previous record.
pub struct TensorboardRecorder {
    writer: SummaryWriter,
    step_key: String,
    step: usize,
}

impl TensorboardRecorder {
    /// Construct a [`TensorboardRecorder`].
    ///
    /// TFRecord will be stored in `logdir`, which is created if needed. Fails if the
    /// directory cannot be created or written to.
    pub fn new<P: AsRef<Path>>(logdir: P) -> Result<Self> {
        let logdir = logdir.as_ref();
        fs::create_dir_all(logdir).with_context(|| format!("Failed to create {:?}", logdir))?;
        let check = logdir.join(".write_check");
        fs::write(&check, b"").with_context(|| format!("{:?} is not writable", logdir))?;
        fs::remove_file(&check)?;

        // The writer panics instead of returning errors.
        let writer = panic::catch_unwind(|| SummaryWriter::new(logdir))
            .map_err(|_| anyhow::anyhow!("Failed to open a summary writer in {:?}", logdir))?;
        Ok(Self {
            writer,
            step_key: "epoch".to_string(),
            step: 0,
        })
    }

    /// Reads the step from the given key instead of `epoch`.
    pub fn step_key(mut self, key: impl Into<String>) -> Self {
        self.step_key = key.into();
        self
    }
}

fn to_image(data: &[f32], shape: &[usize; 2]) -> (Vec<u8>, [usize; 3]) {
    let min = data.iter().fold(f32::MAX, |m, v| v.min(m));
    let max = data.iter().fold(-f32::MAX, |m, v| v.max(m));
    let scale = if max > min { max - min } else { 1.0 };
    let channel: Vec<u8> = data.iter().map(|&e| ((e - min) / scale * 255f32) as u8).collect();
    let mut rgb = Vec::with_capacity(channel.len() * 3);
    for _ in 0..3 {
        rgb.extend(channel.iter());
    }
    (rgb, [3, shape[0], shape[1]])
}

impl Recorder for TensorboardRecorder {
    /// Write a given [Record] into a TFRecord.
    ///
    /// This method handles [RecordValue::Scalar] and [RecordValue::Array2], the
    /// latter as a grayscale image. Arrays whose data does not match their shape are
    /// skipped.
    fn write(&mut self, record: Record) {
        match record.get(&self.step_key) {
            Some(RecordValue::Scalar(v)) => self.step = *v as usize,
            Some(_) => warn!("{} is not a scalar, keeping step {}", self.step_key, self.step),
            None => {}
        }

        for (k, v) in record.iter() {
            if *k == self.step_key {
                continue;
            }
            match v {
                RecordValue::Scalar(v) => self.writer.add_scalar(k, *v, self.step),
                RecordValue::Array2(data, shape) if data.len() == shape[0] * shape[1] && !data.is_empty() => {
                    let (image, dim) = to_image(data, shape);
                    self.writer.add_image(k, image.as_slice(), &dim, self.step)
                }
                _ => {}
            }
        }
    }

    fn flush(&mut self) {
        self.writer.flush();
    }
}
