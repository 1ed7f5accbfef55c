//! Persistence port for chat messages.
//!
//! The store is append-only and keyed by the upstream event id: inserting a
//! message whose `eid` already exists is a no-op reported as
//! [`InsertOutcome::Duplicate`], never an error.

pub mod sqlite;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

pub use sqlite::SqliteStore;

/// A cleaned, resolved chat line ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    pub eid: i64,
    pub bid: i64,
    pub channel: String,
    pub sender: String,
    /// Body after control-code stripping.
    pub body: String,
    pub timestamp: DateTime<Utc>,
    /// `YYYY-MM-DD` of `timestamp` (UTC), used for day-bucketed queries.
    pub date: String,
}

impl PersistedMessage {
    /// Build a record, deriving `date` from `timestamp`.
    pub fn new(
        eid: i64,
        bid: i64,
        channel: impl Into<String>,
        sender: impl Into<String>,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            eid,
            bid,
            channel: channel.into(),
            sender: sender.into(),
            body: body.into(),
            date: date_key(timestamp),
            timestamp,
        }
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same `eid` already exists; nothing was written.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored timestamp '{0}'")]
    InvalidTimestamp(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable, de-duplicating message store.
///
/// Implementations must be safe for concurrent callers.
pub trait MessageStore: Send + Sync {
    fn insert(&self, message: &PersistedMessage) -> StorageResult<InsertOutcome>;

    /// All messages whose `date` equals `date` (`YYYY-MM-DD`), oldest first.
    fn query_by_date(&self, date: &str) -> StorageResult<Vec<PersistedMessage>>;

    /// Messages with `start <= timestamp < end`, oldest first.
    fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<PersistedMessage>>;

    fn count(&self) -> StorageResult<u64>;
}

/// Calendar-day key for a timestamp.
pub fn date_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

/// Fixed-width RFC 3339 rendering; sorts lexicographically in time order.
pub(crate) fn timestamp_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
