//! SQLite-backed event store
//!
//! Durable single-node persistence for event-sourced agents. Events land in
//! an `agent_events` table keyed by `(agent_id, version)`; snapshots live in
//! their own `agent_snapshots` table holding one latest row per agent. The
//! optimistic version check and the batch insert run inside one transaction,
//! so a lost race surfaces as a conflict and persists nothing.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};

use crate::domain_types::{AgentId, EventId};

use super::{EventRange, EventStore, EventStoreError, Snapshot, StateEvent, stamp_versions};

/// Pure SQL text for the event store schema and queries
mod sql {
    pub(super) fn create_events_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS agent_events (
            agent_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            event_id TEXT NOT NULL,
            timestamp_millis INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            event_data BLOB NOT NULL,
            metadata TEXT NOT NULL,
            correlation_id TEXT,
            PRIMARY KEY (agent_id, version)
        )"
    }

    pub(super) fn create_snapshots_table() -> &'static str {
        "CREATE TABLE IF NOT EXISTS agent_snapshots (
            agent_id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            state_type TEXT NOT NULL,
            state_data BLOB NOT NULL,
            timestamp_millis INTEGER NOT NULL,
            metadata TEXT NOT NULL
        )"
    }

    pub(super) fn select_latest_version() -> &'static str {
        "SELECT COALESCE(MAX(version), 0) AS version FROM agent_events WHERE agent_id = ?"
    }

    pub(super) fn insert_event() -> &'static str {
        "INSERT INTO agent_events
            (agent_id, version, event_id, timestamp_millis, event_type, event_data, metadata, correlation_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
    }

    pub(super) fn select_events() -> &'static str {
        "SELECT version, event_id, timestamp_millis, event_type, event_data, metadata, correlation_id
         FROM agent_events
         WHERE agent_id = ? AND version >= ? AND version <= ?
         ORDER BY version ASC
         LIMIT ?"
    }

    pub(super) fn upsert_snapshot() -> &'static str {
        "INSERT OR REPLACE INTO agent_snapshots
            (agent_id, version, state_type, state_data, timestamp_millis, metadata)
         VALUES (?, ?, ?, ?, ?, ?)"
    }

    pub(super) fn select_snapshot() -> &'static str {
        "SELECT version, state_type, state_data, timestamp_millis, metadata
         FROM agent_snapshots
         WHERE agent_id = ?"
    }
}

fn backend_error(source: sqlx::Error) -> EventStoreError {
    EventStoreError::Backend {
        source: Box::new(source),
    }
}

fn metadata_to_json(metadata: &BTreeMap<String, String>) -> Result<String, EventStoreError> {
    serde_json::to_string(metadata).map_err(|e| EventStoreError::Backend {
        source: Box::new(e),
    })
}

fn metadata_from_json(
    agent_id: AgentId,
    json: &str,
) -> Result<BTreeMap<String, String>, EventStoreError> {
    serde_json::from_str(json).map_err(|e| EventStoreError::Corrupt {
        agent_id,
        reason: format!("metadata column is not a JSON map: {e}"),
    })
}

fn version_to_i64(agent_id: AgentId, version: u64) -> Result<i64, EventStoreError> {
    i64::try_from(version).map_err(|_| EventStoreError::InvalidAppend {
        agent_id,
        reason: format!("version {version} exceeds the storable range"),
    })
}

fn row_to_event(agent_id: AgentId, row: &sqlx::sqlite::SqliteRow) -> Result<StateEvent, EventStoreError> {
    let version: i64 = row.try_get("version").map_err(backend_error)?;
    let event_id: String = row.try_get("event_id").map_err(backend_error)?;
    let timestamp_millis: i64 = row.try_get("timestamp_millis").map_err(backend_error)?;
    let event_type: String = row.try_get("event_type").map_err(backend_error)?;
    let event_data: Vec<u8> = row.try_get("event_data").map_err(backend_error)?;
    let metadata: String = row.try_get("metadata").map_err(backend_error)?;
    let correlation_id: Option<String> = row.try_get("correlation_id").map_err(backend_error)?;

    let event_id = EventId::parse(&event_id).map_err(|_| EventStoreError::Corrupt {
        agent_id,
        reason: format!("event_id column holds invalid id: {event_id}"),
    })?;
    let correlation_id = match correlation_id {
        None => None,
        Some(text) => Some(EventId::parse(&text).map_err(|_| EventStoreError::Corrupt {
            agent_id,
            reason: format!("correlation_id column holds invalid id: {text}"),
        })?),
    };

    Ok(StateEvent {
        event_id,
        agent_id,
        version: version.unsigned_abs(),
        timestamp_millis,
        event_type,
        event_data: Bytes::from(event_data),
        metadata: metadata_from_json(agent_id, &metadata)?,
        correlation_id,
    })
}

/// Event store persisting to a SQLite database.
pub struct SqliteEventStore {
    pool: Pool<Sqlite>,
}

impl SqliteEventStore {
    /// Opens (or creates) a file-backed store.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the database cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EventStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("synchronous", "NORMAL");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(backend_error)?;
        Self::with_pool(pool).await
    }

    /// Opens an in-memory store; useful for tests.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the database cannot be opened or the
    /// schema cannot be created.
    pub async fn in_memory() -> Result<Self, EventStoreError> {
        // A single connection keeps every caller on the same in-memory
        // database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(backend_error)?;
        Self::with_pool(pool).await
    }

    /// Wraps an existing pool, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the schema cannot be created.
    pub async fn with_pool(pool: Pool<Sqlite>) -> Result<Self, EventStoreError> {
        sqlx::query(sql::create_events_table())
            .execute(&pool)
            .await
            .map_err(backend_error)?;
        sqlx::query(sql::create_snapshots_table())
            .execute(&pool)
            .await
            .map_err(backend_error)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append_events(
        &self,
        agent_id: AgentId,
        mut events: Vec<StateEvent>,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        if events.is_empty() {
            return self.latest_version(agent_id).await;
        }

        let mut tx = self.pool.begin().await.map_err(backend_error)?;

        let row = sqlx::query(sql::select_latest_version())
            .bind(agent_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(backend_error)?;
        let current: i64 = row.try_get("version").map_err(backend_error)?;
        let current = current.unsigned_abs();

        if current != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                agent_id,
                expected: expected_version,
                actual: current,
            });
        }

        let new_version = stamp_versions(agent_id, &mut events, expected_version)?;

        for event in &events {
            sqlx::query(sql::insert_event())
                .bind(agent_id.to_string())
                .bind(version_to_i64(agent_id, event.version)?)
                .bind(event.event_id.to_string())
                .bind(event.timestamp_millis)
                .bind(event.event_type.as_str())
                .bind(event.event_data.as_ref())
                .bind(metadata_to_json(&event.metadata)?)
                .bind(event.correlation_id.map(|id| id.to_string()))
                .execute(&mut *tx)
                .await
                .map_err(backend_error)?;
        }

        tx.commit().await.map_err(backend_error)?;
        Ok(new_version)
    }

    async fn events(
        &self,
        agent_id: AgentId,
        range: EventRange,
    ) -> Result<Vec<StateEvent>, EventStoreError> {
        let from = version_to_i64(agent_id, range.from_version)?;
        let to = match range.to_version {
            Some(to) => version_to_i64(agent_id, to)?,
            None => i64::MAX,
        };
        let limit = range
            .max_count
            .and_then(|count| i64::try_from(count).ok())
            .unwrap_or(i64::MAX);

        let rows = sqlx::query(sql::select_events())
            .bind(agent_id.to_string())
            .bind(from)
            .bind(to)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_error)?;

        rows.iter().map(|row| row_to_event(agent_id, row)).collect()
    }

    async fn latest_version(&self, agent_id: AgentId) -> Result<u64, EventStoreError> {
        let row = sqlx::query(sql::select_latest_version())
            .bind(agent_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(backend_error)?;
        let version: i64 = row.try_get("version").map_err(backend_error)?;
        Ok(version.unsigned_abs())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        sqlx::query(sql::upsert_snapshot())
            .bind(snapshot.agent_id.to_string())
            .bind(version_to_i64(snapshot.agent_id, snapshot.version)?)
            .bind(snapshot.state_type.as_str())
            .bind(snapshot.state_data.as_ref())
            .bind(snapshot.timestamp_millis)
            .bind(metadata_to_json(&snapshot.metadata)?)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        agent_id: AgentId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let row = sqlx::query(sql::select_snapshot())
            .bind(agent_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let version: i64 = row.try_get("version").map_err(backend_error)?;
        let state_type: String = row.try_get("state_type").map_err(backend_error)?;
        let state_data: Vec<u8> = row.try_get("state_data").map_err(backend_error)?;
        let timestamp_millis: i64 = row.try_get("timestamp_millis").map_err(backend_error)?;
        let metadata: String = row.try_get("metadata").map_err(backend_error)?;

        Ok(Some(Snapshot {
            agent_id,
            version: version.unsigned_abs(),
            state_type,
            state_data: Bytes::from(state_data),
            timestamp_millis,
            metadata: metadata_from_json(agent_id, &metadata)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(agent_id: AgentId, event_type: &str) -> StateEvent {
        let mut metadata = BTreeMap::new();
        metadata.insert("origin".to_string(), "test".to_string());
        StateEvent {
            event_id: EventId::generate(),
            agent_id,
            version: 0,
            timestamp_millis: 99,
            event_type: event_type.to_string(),
            event_data: Bytes::from_static(br#"{"amount":1}"#),
            metadata,
            correlation_id: Some(EventId::generate()),
        }
    }

    #[tokio::test]
    async fn append_and_read_round_trip() {
        let store = SqliteEventStore::in_memory().await.expect("open");
        let agent_id = AgentId::generate();

        let version = store
            .append_events(agent_id, vec![event(agent_id, "A"), event(agent_id, "B")], 0)
            .await
            .expect("append");
        assert_eq!(version, 2);

        let events = store
            .events(agent_id, EventRange::all())
            .await
            .expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].version, 1);
        assert_eq!(events[0].event_type, "A");
        assert_eq!(events[1].version, 2);
        assert_eq!(events[1].metadata.get("origin").map(String::as_str), Some("test"));
    }

    #[tokio::test]
    async fn stale_append_conflicts_and_persists_nothing() {
        let store = SqliteEventStore::in_memory().await.expect("open");
        let agent_id = AgentId::generate();

        store
            .append_events(agent_id, vec![event(agent_id, "A")], 0)
            .await
            .expect("append");

        let result = store
            .append_events(agent_id, vec![event(agent_id, "B")], 0)
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { actual: 1, .. })
        ));
        assert_eq!(store.latest_version(agent_id).await.expect("version"), 1);
    }

    #[tokio::test]
    async fn snapshot_upsert_keeps_latest_row() {
        let store = SqliteEventStore::in_memory().await.expect("open");
        let agent_id = AgentId::generate();

        for version in [10u64, 20] {
            store
                .save_snapshot(Snapshot {
                    agent_id,
                    version,
                    state_type: "Counter".to_string(),
                    state_data: Bytes::from_static(br#"{"count":1}"#),
                    timestamp_millis: 3,
                    metadata: BTreeMap::new(),
                })
                .await
                .expect("save");
        }

        let snapshot = store
            .latest_snapshot(agent_id)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(snapshot.version, 20);
        assert_eq!(snapshot.state_type, "Counter");
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.db");
        let agent_id = AgentId::generate();

        {
            let store = SqliteEventStore::open(&path).await.expect("open");
            store
                .append_events(agent_id, vec![event(agent_id, "A")], 0)
                .await
                .expect("append");
        }

        let store = SqliteEventStore::open(&path).await.expect("reopen");
        assert_eq!(store.latest_version(agent_id).await.expect("version"), 1);
    }
}
