//! Event store port: append-only per-agent event logs with snapshots
//!
//! The port has strict contracts: batch appends are atomic and guarded by an
//! optimistic version check, reads are ascending version ranges, and the
//! store keeps only the latest snapshot per agent. Three implementations are
//! provided: in-memory, per-agent storage cells behind a serialization actor,
//! and SQLite.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::domain_types::{AgentId, EventId};

mod in_memory;
mod single_key;
mod sqlite;

pub use in_memory::InMemoryEventStore;
pub use single_key::{CellStorage, CellStorageError, MemoryCellStorage, SingleKeyEventStore};
pub use sqlite::SqliteEventStore;

/// A persisted state transition of an event-sourced agent.
///
/// Versions are assigned at append time; an event staged for append carries a
/// provisional version that the store overwrites with the authoritative one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEvent {
    /// Globally unique event id.
    pub event_id: EventId,
    /// Agent whose log this event belongs to.
    pub agent_id: AgentId,
    /// Position in the agent's log; contiguous from 1.
    pub version: u64,
    /// Milliseconds since the Unix epoch at raise time.
    pub timestamp_millis: i64,
    /// Stable schema identifier.
    pub event_type: String,
    /// Serialized payload.
    pub event_data: Bytes,
    /// Free-form metadata carried with the event.
    pub metadata: BTreeMap<String, String>,
    /// Correlation id linking the event to the envelope that caused it.
    pub correlation_id: Option<EventId>,
}

/// Latest-state snapshot of an event-sourced agent at a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Agent the snapshot belongs to.
    pub agent_id: AgentId,
    /// Version the state was taken at.
    pub version: u64,
    /// Stable name of the state schema.
    pub state_type: String,
    /// Serialized state.
    pub state_data: Bytes,
    /// Milliseconds since the Unix epoch at snapshot time.
    pub timestamp_millis: i64,
    /// Free-form metadata carried with the snapshot.
    pub metadata: BTreeMap<String, String>,
}

/// Inclusive version range for event reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRange {
    /// First version to return (inclusive).
    pub from_version: u64,
    /// Last version to return (inclusive); `None` means no upper bound.
    pub to_version: Option<u64>,
    /// Maximum number of events to return.
    pub max_count: Option<usize>,
}

impl EventRange {
    /// The whole log, starting at version 1.
    #[must_use]
    pub fn all() -> Self {
        Self::from(1)
    }

    /// Everything from `from_version` (inclusive) onward.
    #[must_use]
    pub fn from(from_version: u64) -> Self {
        Self {
            from_version,
            to_version: None,
            max_count: None,
        }
    }

    /// Caps the range at `to_version` (inclusive).
    #[must_use]
    pub fn to(mut self, to_version: u64) -> Self {
        self.to_version = Some(to_version);
        self
    }

    /// Caps the number of returned events.
    #[must_use]
    pub fn limit(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    /// Whether `version` falls inside this range.
    #[must_use]
    pub fn contains(&self, version: u64) -> bool {
        version >= self.from_version && self.to_version.is_none_or(|to| version <= to)
    }
}

impl Default for EventRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Errors raised by event store operations.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The optimistic version check failed; nothing was persisted.
    #[error(
        "concurrency conflict for agent {agent_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// Agent whose log was appended to.
        agent_id: AgentId,
        /// Version the caller expected.
        expected: u64,
        /// Version the store actually holds.
        actual: u64,
    },

    /// The batch itself was malformed (wrong agent id, empty event type).
    #[error("invalid append for agent {agent_id}: {reason}")]
    InvalidAppend {
        /// Agent whose log was appended to.
        agent_id: AgentId,
        /// What was wrong with the batch.
        reason: String,
    },

    /// A stored record could not be decoded.
    #[error("corrupt record for agent {agent_id}: {reason}")]
    Corrupt {
        /// Agent whose record was unreadable.
        agent_id: AgentId,
        /// What was wrong with the record.
        reason: String,
    },

    /// The storage backend failed.
    #[error("storage backend failure: {source}")]
    Backend {
        /// Underlying backend error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Append-only, per-agent event store with latest-snapshot storage.
///
/// Implementations must be safe for concurrent callers across different
/// agent ids; serializing appends for a single agent is the implementation's
/// responsibility.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch atomically.
    ///
    /// The store assigns contiguous versions `expected_version + 1 ..=
    /// expected_version + batch.len()` and returns the final one. If the
    /// persisted version differs from `expected_version` nothing is written.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::ConcurrencyConflict`] when the expected version is
    /// stale; [`EventStoreError::InvalidAppend`] for malformed batches;
    /// backend errors otherwise.
    async fn append_events(
        &self,
        agent_id: AgentId,
        events: Vec<StateEvent>,
        expected_version: u64,
    ) -> Result<u64, EventStoreError>;

    /// Reads events in ascending version order within `range`.
    ///
    /// # Errors
    ///
    /// Backend or corruption errors.
    async fn events(
        &self,
        agent_id: AgentId,
        range: EventRange,
    ) -> Result<Vec<StateEvent>, EventStoreError>;

    /// Latest persisted version for the agent; `0` when the log is empty.
    ///
    /// # Errors
    ///
    /// Backend errors.
    async fn latest_version(&self, agent_id: AgentId) -> Result<u64, EventStoreError>;

    /// Stores a snapshot, replacing any prior one for the agent.
    ///
    /// # Errors
    ///
    /// Backend errors.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError>;

    /// Latest snapshot for the agent, if any.
    ///
    /// # Errors
    ///
    /// Backend or corruption errors.
    async fn latest_snapshot(&self, agent_id: AgentId) -> Result<Option<Snapshot>, EventStoreError>;
}

/// Validates a batch and stamps authoritative versions onto it.
///
/// Shared by all store implementations so the append contract stays uniform.
pub(crate) fn stamp_versions(
    agent_id: AgentId,
    events: &mut [StateEvent],
    expected_version: u64,
) -> Result<u64, EventStoreError> {
    let mut version = expected_version;
    for event in events.iter_mut() {
        if event.agent_id != agent_id {
            return Err(EventStoreError::InvalidAppend {
                agent_id,
                reason: format!("batch contains event for foreign agent {}", event.agent_id),
            });
        }
        if event.event_type.is_empty() {
            return Err(EventStoreError::InvalidAppend {
                agent_id,
                reason: "event type must not be empty".to_string(),
            });
        }
        version += 1;
        event.version = version;
    }
    Ok(version)
}
