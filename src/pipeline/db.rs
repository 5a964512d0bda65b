//! Deduplication / persistence store
//!
//! SQLite implementation with rusqlite. One `events` table keyed by
//! `(topic, event_id)`; the primary key is the durable enforcement of
//! "at most one row per key".
//!
//! Check-and-insert is a single `INSERT ... ON CONFLICT DO NOTHING`, so two
//! concurrent attempts for the same key can never produce two rows or
//! overwrite the first one. The pipeline runs one consumer today, but the
//! store does not rely on that.

use super::error::StoreError;
use super::types::{DedupKey, Event, InsertOutcome, StoredEvent};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Durable record of processed events and arbiter of uniqueness.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert `event` unless its key already exists, atomically.
    ///
    /// On `Inserted` the row carries a freshly assigned `received_at`.
    /// `AlreadyExists` leaves the store untouched: first-seen wins.
    async fn try_insert(&self, event: &Event) -> Result<InsertOutcome, StoreError>;

    /// All stored events, optionally for one topic, ordered by `received_at`
    /// ascending. A read failure is an error, never an empty list.
    async fn query_all(&self, topic: Option<&str>) -> Result<Vec<StoredEvent>, StoreError>;

    /// Number of stored events
    async fn count_all(&self) -> Result<u64, StoreError>;
}

/// Schema, applied idempotently on every open
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    topic TEXT NOT NULL,
    event_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    source TEXT NOT NULL,
    payload TEXT NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (topic, event_id)
);
CREATE INDEX IF NOT EXISTS idx_events_received_at ON events(received_at);
CREATE INDEX IF NOT EXISTS idx_events_topic_received_at ON events(topic, received_at);
"#;

const SELECT_EVENT_COLUMNS: &str =
    "SELECT topic, event_id, timestamp, source, payload, received_at FROM events";

/// Writer side: connection plus the last `received_at` handed out, so the
/// next one is never earlier even if the wall clock steps back.
struct WriterState {
    conn: Connection,
    last_received_at: Option<DateTime<Utc>>,
}

/// SQLite-backed [`EventStore`].
///
/// Holds a writer connection for `try_insert` and a separate read-only
/// connection for queries; under WAL the two do not block each other.
#[derive(Clone)]
pub struct SqliteEventStore {
    path: PathBuf,
    writer: Arc<Mutex<WriterState>>,
    reader: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open (or create) the store at `db_path`.
    ///
    /// Creates the parent directory, applies PRAGMAs and the schema, and
    /// reloads the latest `received_at` so ordering continues across restarts.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = db_path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(&path)?;
        apply_optimized_pragmas(&conn)?;
        run_schema_migrations(&mut conn)?;

        let last_received_at = latest_received_at(&conn)?;

        let reader = Connection::open(&path)?;
        apply_optimized_pragmas(&reader)?;
        reader.execute_batch("PRAGMA query_only = ON")?;

        let store = Self {
            path,
            writer: Arc::new(Mutex::new(WriterState {
                conn,
                last_received_at,
            })),
            reader: Arc::new(Mutex::new(reader)),
        };

        let existing = store.count_blocking()?;
        log::info!(
            "✅ Event store initialized at {} ({} events already persisted)",
            store.path.display(),
            existing
        );

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn insert_blocking(
        writer: &Mutex<WriterState>,
        event: &Event,
    ) -> Result<InsertOutcome, StoreError> {
        let payload = serde_json::to_string(&event.payload)?;
        let mut state = writer.lock().map_err(|_| StoreError::Poisoned)?;

        let now = Utc::now().trunc_subsecs(6);
        let received_at = match state.last_received_at {
            Some(last) if last > now => last,
            _ => now,
        };

        let changed = state.conn.execute(
            "INSERT INTO events (topic, event_id, timestamp, source, payload, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(topic, event_id) DO NOTHING",
            params![
                event.topic,
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.source,
                payload,
                format_received_at(&received_at),
            ],
        )?;

        if changed == 0 {
            return Ok(InsertOutcome::AlreadyExists);
        }

        state.last_received_at = Some(received_at);
        Ok(InsertOutcome::Inserted)
    }

    fn query_blocking(
        reader: &Mutex<Connection>,
        topic: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let conn = reader.lock().map_err(|_| StoreError::Poisoned)?;

        let rows: Vec<RawRow> = match topic {
            Some(topic) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "{} WHERE topic = ?1 ORDER BY received_at ASC, rowid ASC",
                    SELECT_EVENT_COLUMNS
                ))?;
                let rows = stmt.query_map([topic], RawRow::from_row)?;
                rows.collect::<Result<_, _>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "{} ORDER BY received_at ASC, rowid ASC",
                    SELECT_EVENT_COLUMNS
                ))?;
                let rows = stmt.query_map([], RawRow::from_row)?;
                rows.collect::<Result<_, _>>()?
            }
        };

        rows.into_iter().map(RawRow::decode).collect()
    }

    fn count_blocking(&self) -> Result<u64, StoreError> {
        let conn = self.reader.lock().map_err(|_| StoreError::Poisoned)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn try_insert(&self, event: &Event) -> Result<InsertOutcome, StoreError> {
        let writer = self.writer.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || Self::insert_blocking(&writer, &event)).await?
    }

    async fn query_all(&self, topic: Option<&str>) -> Result<Vec<StoredEvent>, StoreError> {
        let reader = self.reader.clone();
        let topic = topic.map(str::to_string);
        tokio::task::spawn_blocking(move || Self::query_blocking(&reader, topic.as_deref()))
            .await?
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.count_blocking()).await?
    }
}

/// Apply the schema. All statements use IF NOT EXISTS, so this is safe on
/// every start.
pub fn run_schema_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA)?;
    tx.commit()?;
    log::debug!("Schema migrations applied");
    Ok(())
}

fn latest_received_at(conn: &Connection) -> Result<Option<DateTime<Utc>>, StoreError> {
    let latest: Option<String> = conn
        .query_row("SELECT MAX(received_at) FROM events", [], |row| row.get(0))
        .optional()?
        .flatten();

    match latest {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| StoreError::CorruptRow {
                key: DedupKey::new("<latest>", "<received_at>"),
                reason: format!("unparsable received_at '{}': {}", raw, e),
            }),
    }
}

/// Fixed-width UTC text (microseconds, `Z`), so string order is time order.
fn format_received_at(received_at: &DateTime<Utc>) -> String {
    received_at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A row as SQLite returns it, before decoding text columns
struct RawRow {
    topic: String,
    event_id: String,
    timestamp: String,
    source: String,
    payload: String,
    received_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            topic: row.get(0)?,
            event_id: row.get(1)?,
            timestamp: row.get(2)?,
            source: row.get(3)?,
            payload: row.get(4)?,
            received_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<StoredEvent, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptRow {
            key: DedupKey::new(&self.topic, &self.event_id),
            reason,
        };

        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| corrupt(format!("timestamp '{}': {}", self.timestamp, e)))?;
        let received_at = DateTime::parse_from_rfc3339(&self.received_at)
            .map_err(|e| corrupt(format!("received_at '{}': {}", self.received_at, e)))?
            .with_timezone(&Utc);
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("payload: {}", e)))?;

        Ok(StoredEvent {
            event: Event {
                topic: self.topic,
                event_id: self.event_id,
                timestamp,
                source: self.source,
                payload,
            },
            received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn make_test_event(topic: &str, event_id: &str) -> Event {
        Event {
            topic: topic.to_string(),
            event_id: event_id.to_string(),
            timestamp: DateTime::parse_from_rfc3339("2025-10-21T14:00:00+02:00").unwrap(),
            source: "test-source".to_string(),
            payload: json!({"key": "value", "nested": {"list": [1, 2, 3]}}),
        }
    }

    #[tokio::test]
    async fn test_insert_then_duplicate() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("test.db")).unwrap();
        let event = make_test_event("test.event", "dup-001");

        assert_eq!(store.try_insert(&event).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.try_insert(&event).await.unwrap(), InsertOutcome::AlreadyExists);
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_first_seen_wins() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("test.db")).unwrap();

        let first = make_test_event("test.event", "conflict-001");
        let mut second = first.clone();
        second.payload = json!({"key": "other"});
        second.source = "replayer".to_string();

        store.try_insert(&first).await.unwrap();
        assert_eq!(store.try_insert(&second).await.unwrap(), InsertOutcome::AlreadyExists);

        let events = store.query_all(None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, first);
    }

    #[tokio::test]
    async fn test_same_event_id_different_topics() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("test.db")).unwrap();

        let a = make_test_event("topic-a", "shared-1");
        let b = make_test_event("topic-b", "shared-1");

        assert_eq!(store.try_insert(&a).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.try_insert(&b).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.count_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_query_filter_and_order() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("test.db")).unwrap();

        for (topic, id) in [("a", "1"), ("b", "2"), ("a", "3"), ("a", "4")] {
            store.try_insert(&make_test_event(topic, id)).await.unwrap();
        }

        let only_a = store.query_all(Some("a")).await.unwrap();
        let ids: Vec<_> = only_a.iter().map(|e| e.event.event_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3", "4"]);

        let all = store.query_all(None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.event.event_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        assert!(all.windows(2).all(|w| w[0].received_at <= w[1].received_at));

        assert!(store.query_all(Some("missing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_and_timestamp_round_trip_verbatim() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("test.db")).unwrap();
        let event = make_test_event("verbatim", "v-1");

        store.try_insert(&event).await.unwrap();

        let stored = store.query_all(Some("verbatim")).await.unwrap().remove(0);
        assert_eq!(stored.event.payload, event.payload);
        assert_eq!(stored.event.timestamp, event.timestamp);
        assert_eq!(stored.event.timestamp.offset().local_minus_utc(), 2 * 3600);
    }

    #[tokio::test]
    async fn test_payload_keeps_key_order_and_number_precision() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("test.db")).unwrap();

        let raw = r#"{"zeta":1,"alpha":123456789012345678901234567890,"amount":0.10000000000000000555}"#;
        let mut event = make_test_event("precision", "p-1");
        event.payload = serde_json::from_str(raw).unwrap();

        store.try_insert(&event).await.unwrap();

        let stored = store.query_all(Some("precision")).await.unwrap().remove(0);
        assert_eq!(serde_json::to_string(&stored.event.payload).unwrap(), raw);
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("dedup.db");

        let first_received_at = {
            let store = SqliteEventStore::open(&db_path).unwrap();
            store.try_insert(&make_test_event("persist", "p-1")).await.unwrap();
            store.query_all(None).await.unwrap()[0].received_at
        };

        let store = SqliteEventStore::open(&db_path).unwrap();
        assert_eq!(store.count_all().await.unwrap(), 1);
        assert_eq!(
            store.try_insert(&make_test_event("persist", "p-1")).await.unwrap(),
            InsertOutcome::AlreadyExists
        );

        store.try_insert(&make_test_event("persist", "p-2")).await.unwrap();
        let events = store.query_all(None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].received_at >= first_received_at);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_same_key_store_one_row() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("test.db")).unwrap();
        let event = make_test_event("race", "r-1");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let event = event.clone();
                tokio::spawn(async move { store.try_insert(&event).await.unwrap() })
            })
            .collect();

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_primary_key_rejects_raw_duplicate() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = SqliteEventStore::open(&db_path).unwrap();
        store.try_insert(&make_test_event("pk", "pk-1")).await.unwrap();

        // Bypass the conflict clause: the table itself must refuse
        let conn = Connection::open(&db_path).unwrap();
        let result = conn.execute(
            "INSERT INTO events (topic, event_id, timestamp, source, payload, received_at)
             VALUES ('pk', 'pk-1', 'x', 'x', '{}', 'x')",
            [],
        );
        let err = StoreError::from(result.unwrap_err());
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn test_corrupt_payload_fails_loudly() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = SqliteEventStore::open(&db_path).unwrap();
        store.try_insert(&make_test_event("bad", "b-1")).await.unwrap();

        let conn = Connection::open(&db_path).unwrap();
        conn.execute("UPDATE events SET payload = 'not json' WHERE event_id = 'b-1'", [])
            .unwrap();

        let err = store.query_all(None).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { .. }));
    }

    #[test]
    fn test_received_at_format_sorts_lexically() {
        let earlier = DateTime::parse_from_rfc3339("2025-01-01T00:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2025-01-01T00:00:01Z")
            .unwrap()
            .with_timezone(&Utc);

        let a = format_received_at(&earlier);
        let b = format_received_at(&later);
        assert_eq!(a, "2025-01-01T00:00:00.500000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }
}
