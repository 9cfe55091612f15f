//! Core types for the record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Literal written in place of a JSON value when a key is deleted.
pub const TOMBSTONE: &str = "undefined";

/// Every day at midnight (seconds-first cron form).
pub const DEFAULT_COMPACTION_SCHEDULE: &str = "0 0 0 * * *";

/// Current value of every live key, folded from the log.
pub type Snapshot = BTreeMap<String, Value>;

/// Ordered set of writes applied as one log append.
///
/// `None` marks a deletion; `Some(Value::Null)` stores a literal `null`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    entries: Vec<(String, Option<Value>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`.
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.push((key.into(), Some(value)));
        self
    }

    /// Delete `key`.
    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.entries.push((key.into(), None));
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: Option<Value>) {
        self.entries.push((key.into(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }
}

impl From<Snapshot> for WriteBatch {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            entries: snapshot.into_iter().map(|(k, v)| (k, Some(v))).collect(),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, Option<Value>)> for WriteBatch {
    fn from_iter<I: IntoIterator<Item = (K, Option<Value>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Outcome of rewriting one log file to its minimal form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanupReport {
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// Lines in the rewritten file.
    pub live_keys: usize,
}

impl CleanupReport {
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Value published by a compactor each time a run starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionRun {
    pub started_at: DateTime<Utc>,
    /// Stores registered when the run started.
    pub databases: usize,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub uuid::Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        SubscriptionId(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
