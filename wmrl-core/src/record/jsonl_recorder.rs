use super::{Record, RecordValue, Recorder};
use anyhow::Result;
use log::warn;
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
};

/// Appends every record as one JSON object per line.
///
/// Keys are written in sorted order. Arrays are written as
/// `{"shape": [...], "data": [...]}`, timestamps as RFC 3339 strings.
pub struct JsonlRecorder {
    writer: BufWriter<File>,
}

impl JsonlRecorder {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn to_json(record: &Record) -> Value {
        let map: BTreeMap<&str, Value> = record
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    RecordValue::Scalar(v) => json!(v),
                    RecordValue::Array2(v, s) => json!({"shape": s, "data": v}),
                };
                (k.as_str(), v)
            })
            .collect();
        json!(map)
    }

    fn try_write(&mut self, record: &Record) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &Self::to_json(record))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl Recorder for JsonlRecorder {
    fn write(&mut self, record: Record) {
        if let Err(e) = self.try_write(&record) {
            warn!("Failed to write a record: {:#}", e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush records: {}", e);
        }
    }
}

impl Drop for JsonlRecorder {
    fn drop(&mut self) {
        Recorder::flush(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_jsonl_lines() -> Result<()> {
        let dir = TempDir::new("jsonl_recorder")?;
        let path = dir.path().join("logs").join("metrics.jsonl");
        {
            let mut recorder = JsonlRecorder::create(&path)?;
            recorder.write(Record::from_slice(&[
                ("epoch", RecordValue::Scalar(1.0)),
                ("loss", RecordValue::Scalar(0.5)),
            ]));
            recorder.write(Record::from_slice(&[(
                "cm",
                RecordValue::Array2(vec![1., 0., 0., 1.], [2, 2]),
            )]));
        }

        let text = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0])?;
        assert_eq!(first["epoch"], json!(1.0));
        assert_eq!(first["loss"], json!(0.5));
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(second["cm"]["shape"], json!([2, 2]));
        Ok(())
    }
}
