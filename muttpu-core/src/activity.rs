//! Bounded activity log, newest entry first.

use std::collections::VecDeque;

use crate::types::{LogEntry, LogLevel};

/// Maximum number of entries kept.
pub const MAX_LOG_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: VecDeque<LogEntry>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message and return the stored entry.
    pub fn append(&mut self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry::new(level, message);
        match level {
            LogLevel::Warning => log::warn!(target: "muttpu::activity", "{}", entry.message),
            LogLevel::Error => log::error!(target: "muttpu::activity", "{}", entry.message),
            LogLevel::Info | LogLevel::Success => {
                log::debug!(target: "muttpu::activity", "{}", entry.message)
            }
        }
        self.entries.push_front(entry.clone());
        self.entries.truncate(MAX_LOG_ENTRIES);
        entry
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, newest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Entries of one level and/or containing `query` (case-insensitive).
    pub fn filter(&self, level: Option<LogLevel>, query: Option<&str>) -> Vec<LogEntry> {
        let query = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        self.entries
            .iter()
            .filter(|e| level.is_none_or(|l| e.level == l))
            .filter(|e| {
                query
                    .as_deref()
                    .is_none_or(|q| e.message.to_lowercase().contains(q))
            })
            .cloned()
            .collect()
    }
}
