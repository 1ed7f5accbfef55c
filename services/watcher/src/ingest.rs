//! Shared admission path for live and backfilled messages:
//! filter, de-duplicate, clean, resolve time, persist.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use cw_protocol::BufferMessage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cleaner::clean_message;
use crate::dedup::EidCache;
use crate::storage::{InsertOutcome, MessageStore, PersistedMessage, StorageError};

/// Channel allow/deny gate.
///
/// A channel is admitted when it is not denied and either the allow-list is
/// empty or it contains the channel. Deny wins over allow.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl ChannelFilter {
    pub fn new<A, D>(allow: A, deny: D) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            allow: allow.into_iter().map(Into::into).collect(),
            deny: deny.into_iter().map(Into::into).collect(),
        }
    }

    pub fn admits(&self, channel: &str) -> bool {
        if self.deny.contains(channel) {
            return false;
        }
        self.allow.is_empty() || self.allow.contains(channel)
    }
}

/// 9999-12-31T23:59:59.999999Z. Later instants render with a five-digit
/// year and break the fixed-width ordering of stored timestamps.
const MAX_SERVER_TIME_US: i64 = 253_402_300_799_999_999;

/// Server time in microseconds, or `received_at` when the server sent zero
/// (normal for just-arrived live lines) or a value past year 9999.
pub fn resolve_timestamp(server_time_us: i64, received_at: DateTime<Utc>) -> DateTime<Utc> {
    if server_time_us <= 0 || server_time_us > MAX_SERVER_TIME_US {
        return received_at;
    }
    Utc.timestamp_micros(server_time_us)
        .single()
        .unwrap_or(received_at)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    /// Seen before, either by the in-memory cache or the store.
    Duplicate,
    /// Rejected by the channel filter.
    Filtered,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to store eid {eid}: {source}")]
    Store {
        eid: i64,
        #[source]
        source: StorageError,
    },
}

pub struct Ingestor {
    filter: ChannelFilter,
    seen: Arc<EidCache>,
    store: Arc<dyn MessageStore>,
    last_seen_eid: AtomicI64,
}

impl Ingestor {
    pub fn new(filter: ChannelFilter, seen: Arc<EidCache>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            filter,
            seen,
            store,
            last_seen_eid: AtomicI64::new(0),
        }
    }

    /// Run one message through the pipeline.
    ///
    /// Store failures un-mark the eid in the cache so a later redelivery is
    /// attempted again.
    pub fn ingest(
        &self,
        msg: &BufferMessage,
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        self.observe_eid(msg.eid);

        if !self.filter.admits(&msg.channel) {
            debug!(eid = msg.eid, chan = %msg.channel, "filtered");
            return Ok(IngestOutcome::Filtered);
        }
        if !self.seen.check_and_mark(msg.eid) {
            debug!(eid = msg.eid, "duplicate (cache)");
            return Ok(IngestOutcome::Duplicate);
        }

        let body = clean_message(&msg.body);
        let record = PersistedMessage::new(
            msg.eid,
            msg.bid,
            msg.channel.as_str(),
            msg.sender.as_str(),
            body,
            resolve_timestamp(msg.server_time, received_at),
        );

        match self.store.insert(&record) {
            Ok(InsertOutcome::Inserted) => {
                info!(eid = record.eid, "{} <{}> {}", record.channel, record.sender, record.body);
                Ok(IngestOutcome::Stored)
            }
            Ok(InsertOutcome::Duplicate) => {
                debug!(eid = record.eid, "duplicate (store)");
                Ok(IngestOutcome::Duplicate)
            }
            Err(source) => {
                self.seen.forget(record.eid);
                warn!(eid = record.eid, error = %source, "insert failed");
                Err(IngestError::Store {
                    eid: record.eid,
                    source,
                })
            }
        }
    }

    /// Raise `last_seen_eid` to `eid` if larger.
    pub fn observe_eid(&self, eid: i64) {
        self.last_seen_eid.fetch_max(eid, Ordering::SeqCst);
    }

    pub fn last_seen_eid(&self) -> i64 {
        self.last_seen_eid.load(Ordering::SeqCst)
    }
}
