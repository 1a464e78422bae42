//! Bounded in-memory activity logs: recently resolved codes and recent
//! handler errors. Observational only.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::RelayError;

pub const DEFAULT_RECENT_CODES: usize = 20;
pub const DEFAULT_ERROR_LOG: usize = 50;

/// Most-recent-first list of successfully resolved codes.
pub struct RecentCodes {
    cap: usize,
    codes: Mutex<VecDeque<String>>,
}

impl RecentCodes {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            codes: Mutex::new(VecDeque::with_capacity(cap)),
        }
    }

    /// Record `code` at the front, trimming the tail to the cap.
    pub fn push(&self, code: &str) {
        let mut codes = self.codes.lock();
        codes.push_front(code.to_string());
        codes.truncate(self.cap);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.codes.lock().iter().cloned().collect()
    }
}

/// A single failure caught at a handler boundary.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub context: String,
    pub kind: &'static str,
    pub message: String,
}

/// Most-recent-first bounded error log.
pub struct ErrorLog {
    cap: usize,
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorLog {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            records: Mutex::new(VecDeque::with_capacity(cap)),
        }
    }

    pub fn record(&self, context: impl Into<String>, err: &RelayError) {
        let record = ErrorRecord {
            at: Utc::now(),
            context: context.into(),
            kind: err.kind(),
            message: err.to_string(),
        };
        let mut records = self.records.lock();
        records.push_front(record);
        records.truncate(self.cap);
    }

    /// Up to `limit` most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        self.records.lock().iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG)
    }
}
