//! Line codec for table files.
//!
//! Every entry is one line of the form `<key>:<json>\n`. A deletion is written
//! as `<key>:undefined\n`. Replaying the lines in order and letting the last
//! entry per key win reproduces the current snapshot.

use crate::error::Result;
use crate::types::{Snapshot, TOMBSTONE};
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// A decoded line: the key and its new value (`None` = deleted).
pub type LogEntry = (String, Option<Value>);

/// Converts entries to lines of text and back.
///
/// Implementors provide the per-line codec; the fold that turns a whole log
/// into a snapshot is shared, so replay and compaction agree by construction.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Encode a single entry, including the trailing newline.
    fn encode_entry(&self, key: &str, value: Option<&Value>) -> Result<String>;

    /// Parse one line (without its newline). Returns `None` for lines that
    /// should be skipped.
    fn parse_line(&self, line: &str) -> Option<LogEntry>;

    /// Encode every key of `data`, in key order.
    fn encode_all(&self, data: &Snapshot) -> Result<String> {
        let mut out = String::new();
        for (key, value) in data {
            out.push_str(&self.encode_entry(key, Some(value))?);
        }
        Ok(out)
    }

    /// Replay a whole log into a snapshot. Malformed lines are dropped.
    fn decode(&self, raw: &str) -> Snapshot {
        let mut snapshot = Snapshot::new();
        let mut skipped = 0usize;

        for line in raw.split('\n').filter(|l| !l.is_empty()) {
            match self.parse_line(line) {
                Some(entry) => apply_entry(&mut snapshot, entry),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            debug!(skipped, "Dropped malformed log lines during replay");
        }
        snapshot
    }
}

/// Fold one entry into a snapshot: deletions remove the key, anything else
/// (including `null`) overwrites it.
pub fn apply_entry(snapshot: &mut Snapshot, (key, value): LogEntry) {
    match value {
        Some(value) => {
            snapshot.insert(key, value);
        }
        None => {
            snapshot.remove(&key);
        }
    }
}

/// The default `<key>:<json>` codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLineSerializer;

impl Serializer for JsonLineSerializer {
    fn encode_entry(&self, key: &str, value: Option<&Value>) -> Result<String> {
        let encoded = match value {
            Some(value) => serde_json::to_string(value)?,
            None => TOMBSTONE.to_string(),
        };
        Ok(format!("{}:{}\n", key, encoded))
    }

    fn parse_line(&self, line: &str) -> Option<LogEntry> {
        let (key, raw) = line.split_once(':')?;
        if key.is_empty() || raw.is_empty() {
            return None;
        }

        if raw == TOMBSTONE {
            return Some((key.to_string(), None));
        }

        serde_json::from_str::<Value>(raw)
            .ok()
            .map(|value| (key.to_string(), Some(value)))
    }
}
