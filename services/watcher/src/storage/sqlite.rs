//! SQLite-backed [`MessageStore`].
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000.
//!
//! Uniqueness on `eid` is enforced by the schema; inserts use
//! `INSERT OR IGNORE` so replays from backfill or reconnect overlap are
//! silently absorbed.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use super::{
    InsertOutcome, MessageStore, PersistedMessage, StorageError, StorageResult, timestamp_key,
};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const SELECT_COLUMNS: &str = "SELECT eid, bid, channel, sender, message, timestamp, date FROM messages";

type RawRow = (i64, i64, String, String, String, String, String);

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA wal_autocheckpoint=1000;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn integrity_check(&self) -> StorageResult<()> {
        let r: String = self
            .lock()
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if r != "ok" {
            return Err(StorageError::IntegrityCheckFailed(r));
        }
        Ok(())
    }

    /// Remove every message of one calendar day. Returns rows deleted.
    pub fn delete_by_date(&self, date: &str) -> StorageResult<usize> {
        Ok(self
            .lock()
            .execute("DELETE FROM messages WHERE date = ?1", params![date])?)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn query(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> StorageResult<Vec<PersistedMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
            ))
        })?;
        let raw: Vec<RawRow> = rows.collect::<Result<_, _>>()?;
        raw.into_iter().map(from_row).collect()
    }
}

impl MessageStore for SqliteStore {
    fn insert(&self, m: &PersistedMessage) -> StorageResult<InsertOutcome> {
        let changed = self.lock().execute(
            "INSERT OR IGNORE INTO messages (eid, bid, channel, sender, message, timestamp, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                m.eid,
                m.bid,
                m.channel,
                m.sender,
                m.body,
                timestamp_key(m.timestamp),
                m.date,
            ],
        )?;
        Ok(if changed == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    fn query_by_date(&self, date: &str) -> StorageResult<Vec<PersistedMessage>> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE date = ?1 ORDER BY timestamp, eid"),
            params![date],
        )
    }

    fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<PersistedMessage>> {
        self.query(
            &format!(
                "{SELECT_COLUMNS} WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp, eid"
            ),
            params![timestamp_key(start), timestamp_key(end)],
        )
    }

    fn count(&self) -> StorageResult<u64> {
        let n: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

fn from_row(row: RawRow) -> StorageResult<PersistedMessage> {
    let (eid, bid, channel, sender, body, ts, date) = row;
    let timestamp = DateTime::parse_from_rfc3339(&ts)
        .map_err(|_| StorageError::InvalidTimestamp(ts.clone()))?
        .with_timezone(&Utc);
    Ok(PersistedMessage {
        eid,
        bid,
        channel,
        sender,
        body,
        timestamp,
        date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    #[test]
    fn insert_is_idempotent_on_eid() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = PersistedMessage::new(7, 1, "#a", "alice", "hello", at(10, 0));
        let conflicting = PersistedMessage::new(7, 2, "#b", "bob", "different", at(11, 0));

        assert_eq!(store.insert(&first).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&conflicting).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.count().unwrap(), 1);

        let rows = store.query_by_date("2026-03-14").unwrap();
        assert_eq!(rows, vec![first]);
    }

    #[test]
    fn query_by_date_only_returns_that_day() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(&PersistedMessage::new(1, 0, "#a", "x", "today", at(23, 59)))
            .unwrap();
        let tomorrow = Utc.with_ymd_and_hms(2026, 3, 15, 0, 1, 0).unwrap();
        store
            .insert(&PersistedMessage::new(2, 0, "#a", "x", "tomorrow", tomorrow))
            .unwrap();

        let rows = store.query_by_date("2026-03-14").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body, "today");
        assert!(store.query_by_date("2026-03-16").unwrap().is_empty());
    }

    #[test]
    fn time_range_is_half_open_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        // Inserted out of order, as backfill may deliver them.
        for (eid, h) in [(3, 12), (1, 9), (2, 10)] {
            store
                .insert(&PersistedMessage::new(eid, 0, "#a", "x", "m", at(h, 0)))
                .unwrap();
        }
        let rows = store.query_by_time_range(at(9, 0), at(12, 0)).unwrap();
        let eids: Vec<i64> = rows.iter().map(|m| m.eid).collect();
        assert_eq!(eids, vec![1, 2]);
    }

    #[test]
    fn timestamps_round_trip_with_microseconds() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ts = Utc.timestamp_micros(1_752_956_700_123_456).unwrap();
        store
            .insert(&PersistedMessage::new(5, 0, "#a", "x", "m", ts))
            .unwrap();
        let rows = store.query_by_date(&crate::storage::date_key(ts)).unwrap();
        assert_eq!(rows[0].timestamp, ts);
    }

    #[test]
    fn delete_by_date_removes_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(&PersistedMessage::new(1, 0, "#a", "x", "m", at(1, 0)))
            .unwrap();
        assert_eq!(store.delete_by_date("2026-03-14").unwrap(), 1);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn open_creates_file_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("watcher.sqlite3");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.integrity_check().unwrap();
            store
                .insert(&PersistedMessage::new(9, 0, "#a", "x", "kept", at(8, 0)))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }
}
