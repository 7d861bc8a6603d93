use crate::error::{Result, TrackerError};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const RECORD_FILE: &str = "exp_record.log";
pub const MESSAGE_FILE: &str = "message.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Info => "INFO",
            Level::Warn => "WARNING",
            Level::Error => "ERROR",
        })
    }
}

/// Append-only log bound to one run's record file.
///
/// One instance is opened per run and handed to each stage that needs to
/// leave a trace in the run slot. The dispatched script receives the same
/// path through `LOG_FILE` and may keep appending to it.
#[derive(Debug)]
pub struct RunLogger {
    path: PathBuf,
    file: File,
}

impl RunLogger {
    pub fn open(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(RECORD_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrackerError::io(format!("failed to open {}", path.display()), e))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, level: Level, message: &str) -> Result<()> {
        let line = format!(
            "{} {}: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            level,
            message
        );
        self.file
            .write_all(line.as_bytes())
            .map_err(|e| TrackerError::io(format!("failed to write {}", self.path.display()), e))
    }

    pub fn info(&mut self, message: &str) -> Result<()> {
        self.log(Level::Info, message)
    }

    pub fn warn(&mut self, message: &str) -> Result<()> {
        self.log(Level::Warn, message)
    }

    pub fn error(&mut self, message: &str) -> Result<()> {
        self.log(Level::Error, message)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| TrackerError::io(format!("failed to sync {}", self.path.display()), e))
    }
}

/// Invocation parameters as they are written into the record file.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub file: String,
    pub message: String,
    pub log_dir: String,
    pub gpus: u32,
    pub mem_per_unit_gb: u32,
    pub mode: String,
    pub passthrough: Vec<String>,
    pub created_at: String,
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .map_err(|e| TrackerError::io("failed to serialize run record", e.into()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn write_run_record(logger: &mut RunLogger, record: &RunRecord) -> Result<()> {
    logger.info("LOGGING CONFIGURATION")?;
    logger.info(&to_pretty_json(record)?)
}

/// Writes `message.txt`, always terminated by exactly one newline.
pub fn write_message(run_dir: &Path, message: &str) -> Result<PathBuf> {
    let path = run_dir.join(MESSAGE_FILE);
    let mut body = message.trim_end_matches(['\r', '\n']).to_string();
    body.push('\n');
    fs::write(&path, body)
        .map_err(|e| TrackerError::io(format!("failed to write {}", path.display()), e))?;
    Ok(path)
}
