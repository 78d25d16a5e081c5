//! Structured lifecycle log.
//!
//! Every noteworthy allocator, pointer or pool event becomes a [`LogRecord`].
//! Records at or above the configured threshold (see [`crate::config`]) are
//! kept in a bounded in-memory ring and, when enabled, written to stderr as
//! one JSON object per line.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config;

/// Maximum number of records retained in memory.
pub const RING_CAPACITY: usize = 1024;

/// Severity level for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// One structured event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Monotonic sequence number, unique per process.
    pub seq: u64,
    pub level: LogLevel,
    /// Emitting component (`hooks`, `aligned`, `rc`, `pool`, ...).
    pub subsystem: &'static str,
    /// Event kind (`alloc_failed`, `realloc_reuse`, ...).
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub align: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl LogRecord {
    /// Create a record with required fields only. The sequence number is
    /// assigned by [`emit`].
    #[must_use]
    pub fn new(level: LogLevel, subsystem: &'static str, event: &'static str) -> Self {
        Self {
            seq: 0,
            level,
            subsystem,
            event,
            ptr: None,
            size: None,
            align: None,
            outcome: "ok",
            details: String::new(),
        }
    }

    #[must_use]
    pub fn with_ptr<T>(mut self, ptr: *const T) -> Self {
        self.ptr = Some(ptr as usize);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_align(mut self, align: usize) -> Self {
        self.align = Some(align);
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: &'static str) -> Self {
        self.outcome = outcome;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Serialize as a single JSON line (no trailing newline).
    #[must_use]
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"seq\":{},\"event\":\"{}\",\"outcome\":\"serialize_failed\"}}",
                self.seq, self.event
            )
        })
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);
static RING: Mutex<VecDeque<LogRecord>> = parking_lot::const_mutex(VecDeque::new());

/// Whether a record at `level` would be retained.
#[inline]
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    config::log_level().is_some_and(|threshold| level >= threshold)
}

/// Retain `record` if its level passes the threshold.
///
/// Returns the assigned sequence number, or `None` when filtered out.
pub fn emit(mut record: LogRecord) -> Option<u64> {
    if !enabled(record.level) {
        return None;
    }
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    record.seq = seq;
    if config::log_to_stderr() {
        let line = record.to_json_line();
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{line}");
    }
    let mut ring = RING.lock();
    if ring.len() == RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(record);
    Some(seq)
}

/// Snapshot of the retained records, oldest first.
#[must_use]
pub fn recent_records() -> Vec<LogRecord> {
    RING.lock().iter().cloned().collect()
}

/// Remove and return every retained record, oldest first.
pub fn drain_records() -> Vec<LogRecord> {
    RING.lock().drain(..).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
    }

    #[test]
    fn record_serializes_without_empty_optionals() {
        let record = LogRecord::new(LogLevel::Warn, "aligned", "alloc_failed")
            .with_size(128)
            .with_align(64)
            .with_outcome("null");
        let value: serde_json::Value =
            serde_json::from_str(&record.to_json_line()).expect("valid json");
        assert_eq!(value["level"], "warn");
        assert_eq!(value["subsystem"], "aligned");
        assert_eq!(value["event"], "alloc_failed");
        assert_eq!(value["size"], 128);
        assert_eq!(value["align"], 64);
        assert_eq!(value["outcome"], "null");
        assert!(value.get("ptr").is_none());
        assert!(value.get("details").is_none());
    }

    #[test]
    fn fatal_records_pass_the_default_threshold() {
        // Fatal is the highest level, so it is kept unless logging is off.
        let seq = emit(
            LogRecord::new(LogLevel::Fatal, "test", "log_unit_probe").with_details("probe"),
        );
        if config::log_level().is_some() {
            let seq = seq.expect("retained");
            assert!(
                recent_records()
                    .iter()
                    .any(|r| r.seq == seq && r.event == "log_unit_probe")
            );
        }
    }
}
