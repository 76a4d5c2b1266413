//! Append-only error log: one JSON line per row or link level failure.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;

use crate::pipeline::events::FailureEvent;

#[derive(Debug, Error)]
pub enum ErrorLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("error log lock poisoned")]
    Poisoned,
}

pub trait ErrorSink: Send + Sync {
    fn record(&self, event: &FailureEvent) -> Result<(), ErrorLogError>;
    fn flush(&self) -> Result<(), ErrorLogError>;
}

#[derive(Serialize)]
struct FailureRecord<'a> {
    timestamp: String,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<&'a str>,
    message: String,
}

pub struct JsonlErrorLog {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlErrorLog {
    pub fn open(path: &Path) -> Result<Self, ErrorLogError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl ErrorSink for JsonlErrorLog {
    fn record(&self, event: &FailureEvent) -> Result<(), ErrorLogError> {
        let record = FailureRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind: event.kind(),
            link: event.link(),
            entry: event.entry(),
            message: event.to_string(),
        };
        let mut guard = self.writer.lock().map_err(|_| ErrorLogError::Poisoned)?;
        serde_json::to_writer(&mut *guard, &record)?;
        guard.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), ErrorLogError> {
        let mut guard = self.writer.lock().map_err(|_| ErrorLogError::Poisoned)?;
        guard.flush()?;
        Ok(())
    }
}

/// Keeps failures in memory; used when no log file is wanted.
#[derive(Default)]
pub struct MemoryErrorLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl ErrorSink for MemoryErrorLog {
    fn record(&self, event: &FailureEvent) -> Result<(), ErrorLogError> {
        let mut guard = self.lines.lock().map_err(|_| ErrorLogError::Poisoned)?;
        guard.push(format!("{}: {}", event.kind(), event));
        Ok(())
    }

    fn flush(&self) -> Result<(), ErrorLogError> {
        Ok(())
    }
}
