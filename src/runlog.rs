//! Bounded in-memory run log.
//!
//! Every automation run appends timestamped progress messages here; the
//! `/logs` endpoint returns the buffer verbatim. Capped so a long-lived
//! server process never grows without bound.

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;

/// Maximum number of retained entries; oldest are evicted first.
const MAX_ENTRIES: usize = 1000;

/// Bounded, timestamped log buffer shared between the web server and the
/// automation driver.
pub struct RunLog {
    entries: Mutex<VecDeque<String>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(128)),
        }
    }

    /// Append a message, prefixed with the current UTC timestamp.
    /// Also mirrors the message to the tracing output.
    pub fn push(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!("[run] {}", message);

        let entry = format!("{} - {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"), message);
        let mut entries = self.entries.lock();
        if entries.len() >= MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Drop all entries (called at the start of each run).
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Copy of the buffer in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_preserves_insertion_order() {
        let log = RunLog::new();
        log.push("first");
        log.push("second");
        log.push("third");

        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].ends_with("- first"));
        assert!(entries[1].ends_with("- second"));
        assert!(entries[2].ends_with("- third"));
    }

    #[test]
    fn test_entries_are_timestamped() {
        let log = RunLog::new();
        log.push("hello");

        let entries = log.snapshot();
        // "2026-08-27T12:00:00.000Z - hello"
        let (stamp, rest) = entries[0].split_once(" - ").expect("separator present");
        assert_eq!(rest, "hello");
        assert!(stamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn test_cap_evicts_oldest_first() {
        let log = RunLog::new();
        for i in 0..(MAX_ENTRIES + 50) {
            log.push(format!("entry {}", i));
        }

        let entries = log.snapshot();
        assert_eq!(entries.len(), MAX_ENTRIES);
        // Entries 0..49 were evicted; the buffer starts at entry 50.
        assert!(entries[0].ends_with("- entry 50"));
        assert!(entries.last().unwrap().ends_with(&format!("- entry {}", MAX_ENTRIES + 49)));
    }

    #[test]
    fn test_clear_empties_buffer() {
        let log = RunLog::new();
        log.push("a");
        log.push("b");
        assert_eq!(log.len(), 2);

        log.clear();
        assert!(log.is_empty());
        assert!(log.snapshot().is_empty());
    }
}
