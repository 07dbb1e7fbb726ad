//! Log capture for attributing simulator log lines to devices.
//!
//! This module provides a custom logger that intercepts log messages from
//! this crate, extracts the device ID from the `[N]` prefix in the log
//! message, and stores them in a global buffer. The runner drains the buffer
//! at the end of a run and attaches per-device warning and error tallies to
//! the report.
//!
//! The device log format is: `[device_id] message content`
//! For example: `[49] preamble collision: signature 3 access slot 5`

use chrono::{DateTime, Utc};
use log::{Level, Log, Metadata, Record};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use super::stats::LogTally;

/// Maximum number of log entries to buffer before they're consumed.
const LOG_BUFFER_CAPACITY: usize = 10000;

/// Only records from modules of this crate are captured.
const CAPTURED_CRATE: &str = "cdma_phy_simulator";

/// A captured log entry with extracted device ID.
#[derive(Debug, Clone)]
pub struct CapturedLogEntry {
    pub device_id: u32,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub level: Level,
}

/// Global buffer for captured log entries.
static CAPTURED_LOGS: Mutex<Option<VecDeque<CapturedLogEntry>>> = Mutex::new(None);

/// Initialize the log capture buffer.
pub fn init_log_capture() {
    if let Ok(mut guard) = CAPTURED_LOGS.lock() {
        *guard = Some(VecDeque::with_capacity(LOG_BUFFER_CAPACITY));
    }
}

/// Drain all captured log entries from the buffer.
pub fn drain_captured_logs() -> Vec<CapturedLogEntry> {
    match CAPTURED_LOGS.lock() {
        Ok(mut guard) => guard.as_mut().map(|buffer| buffer.drain(..).collect()).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// Count warnings and errors per device.
pub fn tally(entries: &[CapturedLogEntry]) -> BTreeMap<u32, LogTally> {
    let mut tallies: BTreeMap<u32, LogTally> = BTreeMap::new();
    for entry in entries {
        let tally = tallies.entry(entry.device_id).or_default();
        match entry.level {
            Level::Error => tally.errors += 1,
            Level::Warn => tally.warnings += 1,
            _ => {}
        }
    }
    tallies
}

/// Push a captured log entry to the buffer.
fn push_log_entry(entry: CapturedLogEntry) {
    let Ok(mut guard) = CAPTURED_LOGS.lock() else {
        return;
    };
    if let Some(buffer) = guard.as_mut() {
        if buffer.len() >= LOG_BUFFER_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }
}

/// Extract the device ID from a log message with format `[N] ...`.
/// Returns (device_id, remaining_message) if successful.
fn extract_device_id(message: &str) -> Option<(u32, &str)> {
    let trimmed = message.trim_start();
    if !trimmed.starts_with('[') {
        return None;
    }

    let end_bracket = trimmed.find(']')?;
    let device_id: u32 = trimmed[1..end_bracket].parse().ok()?;

    let rest = trimmed[end_bracket + 1..].trim_start();
    Some((device_id, rest))
}

/// A tee logger that forwards to env_logger and captures device-prefixed lines of this crate.
pub struct TeeLogger {
    inner: env_logger::Logger,
}

impl TeeLogger {
    pub fn new(inner: env_logger::Logger) -> Self {
        Self { inner }
    }

    /// Get the maximum log level filter from the inner logger.
    pub fn filter(&self) -> log::LevelFilter {
        self.inner.filter()
    }
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.inner.log(record);

        if !self.inner.matches(record) {
            return;
        }
        if record.module_path().is_some_and(|module| module.starts_with(CAPTURED_CRATE)) {
            let message = format!("{}", record.args());
            if let Some((device_id, content)) = extract_device_id(&message) {
                push_log_entry(CapturedLogEntry {
                    device_id,
                    timestamp: Utc::now(),
                    content: content.to_string(),
                    level: record.level(),
                });
            }
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}
