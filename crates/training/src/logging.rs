use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use log::{info, warn};
use prost::Message;

use crate::{TrainingConfig, TrainingError};

/// Run artifacts: the append-only text log plus optional TensorBoard scalars.
pub struct Logger {
    run_log: RunLog,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(config: &TrainingConfig) -> Result<Self, TrainingError> {
        let run_log = RunLog::open(config.run_log_path())?;
        let tensorboard = if config.runtime.tensorboard {
            Some(TensorBoardWriter::create(&config.model_dir, 16)?)
        } else {
            None
        };
        Ok(Self {
            run_log,
            tensorboard,
        })
    }

    pub fn run_log_path(&self) -> &Path {
        self.run_log.path()
    }

    pub fn log_config(&mut self, config: &TrainingConfig) -> Result<(), TrainingError> {
        let dump = serde_json::to_string(config)?;
        self.run_log.line(&dump)
    }

    pub fn log_epoch(&mut self, epoch: usize) -> Result<(), TrainingError> {
        self.run_log.line(&format!("new epoch {epoch}"))
    }

    pub fn log_train(
        &mut self,
        step: u64,
        losses: &BTreeMap<String, f64>,
    ) -> Result<(), TrainingError> {
        self.run_log
            .line(&format!("{step} {}", format_metrics(losses)))?;
        self.scalars("train", step, losses);
        Ok(())
    }

    pub fn log_sample(&mut self, label: &str, text: &str) -> Result<(), TrainingError> {
        self.run_log.line(&format!("{label}: {text}"))
    }

    pub fn log_validation(
        &mut self,
        step: u64,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<(), TrainingError> {
        self.run_log
            .line(&format!("valid {step} {}", format_metrics(metrics)))?;
        self.scalars("valid", step, metrics);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TrainingError> {
        if let Some(writer) = self.tensorboard.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn scalars(&mut self, prefix: &str, step: u64, values: &BTreeMap<String, f64>) {
        let Some(writer) = self.tensorboard.as_mut() else {
            return;
        };
        for (name, value) in values {
            if let Err(err) = writer.write_scalar(&format!("{prefix}/{name}"), step as i64, *value)
            {
                warn!("dropping tensorboard scalar {prefix}/{name}: {err}");
            }
        }
    }
}

/// Append-only text log; every line is also emitted through `log`.
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrainingError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&mut self, text: &str) -> Result<(), TrainingError> {
        info!("{text}");
        writeln!(self.file, "{text}")?;
        self.file.flush()?;
        Ok(())
    }
}

pub fn format_metrics(values: &BTreeMap<String, f64>) -> String {
    let body: Vec<String> = values
        .iter()
        .map(|(name, value)| format!("{name}: {value:.6}"))
        .collect();
    format!("{{{}}}", body.join(", "))
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        self.write_event(&Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(summary),
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(&masked_crc32(&len_bytes).to_le_bytes())?;
        self.writer.write_all(&data)?;
        self.writer.write_all(&masked_crc32(&data).to_le_bytes())?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush()?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_log_appends_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/log1.txt");
        RunLog::open(&path).unwrap().line("new epoch 0").unwrap();
        RunLog::open(&path).unwrap().line("new epoch 1").unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "new epoch 0\nnew epoch 1\n"
        );
    }

    #[test]
    fn metrics_format_is_sorted() {
        let values = BTreeMap::from([("loss".to_string(), 2.0), ("cider".to_string(), 0.5)]);
        assert_eq!(format_metrics(&values), "{cider: 0.500000, loss: 2.000000}");
    }

    #[test]
    fn tensorboard_records_are_framed() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = TensorBoardWriter::create(dir.path(), 1).unwrap();
        writer.write_scalar("valid/cider", 3, 1.5).unwrap();
        drop(writer);

        let entry = fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let bytes = fs::read(entry.path()).unwrap();

        let mut offset = 0;
        let mut records = 0;
        while offset < bytes.len() {
            let len_bytes: [u8; 8] = bytes[offset..offset + 8].try_into().unwrap();
            let len = u64::from_le_bytes(len_bytes) as usize;
            let len_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(&len_bytes));
            let data = &bytes[offset + 12..offset + 12 + len];
            let data_crc = u32::from_le_bytes(
                bytes[offset + 12 + len..offset + 16 + len].try_into().unwrap(),
            );
            assert_eq!(data_crc, masked_crc32(data));
            Event::decode(data).unwrap();
            offset += 16 + len;
            records += 1;
        }
        assert_eq!(records, 2);
    }
}
