//! In-memory event store
//!
//! Intended for tests and local development. Each agent log sits behind its
//! own mutex, so appends for one agent serialize while different agents
//! proceed independently.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::domain_types::AgentId;

use super::{EventRange, EventStore, EventStoreError, Snapshot, StateEvent, stamp_versions};

#[derive(Debug, Default)]
struct AgentLog {
    events: Vec<StateEvent>,
    snapshot: Option<Snapshot>,
}

impl AgentLog {
    fn current_version(&self) -> u64 {
        self.events.last().map_or(0, |event| event.version)
    }
}

/// Ordered per-agent event logs held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    logs: DashMap<AgentId, Arc<Mutex<AgentLog>>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, agent_id: AgentId) -> Arc<Mutex<AgentLog>> {
        Arc::clone(
            &self
                .logs
                .entry(agent_id)
                .or_insert_with(|| Arc::new(Mutex::new(AgentLog::default()))),
        )
    }

    fn locked<T>(
        &self,
        agent_id: AgentId,
        f: impl FnOnce(&mut AgentLog) -> T,
    ) -> Result<T, EventStoreError> {
        let log = self.log(agent_id);
        let mut guard = log.lock().map_err(|_| EventStoreError::Backend {
            source: "event log mutex poisoned".into(),
        })?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_events(
        &self,
        agent_id: AgentId,
        mut events: Vec<StateEvent>,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        self.locked(agent_id, |log| {
            let current = log.current_version();
            if current != expected_version {
                return Err(EventStoreError::ConcurrencyConflict {
                    agent_id,
                    expected: expected_version,
                    actual: current,
                });
            }
            let new_version = stamp_versions(agent_id, &mut events, expected_version)?;
            log.events.append(&mut events);
            Ok(new_version)
        })?
    }

    async fn events(
        &self,
        agent_id: AgentId,
        range: EventRange,
    ) -> Result<Vec<StateEvent>, EventStoreError> {
        self.locked(agent_id, |log| {
            let selected = log
                .events
                .iter()
                .filter(|event| range.contains(event.version))
                .take(range.max_count.unwrap_or(usize::MAX))
                .cloned()
                .collect();
            selected
        })
    }

    async fn latest_version(&self, agent_id: AgentId) -> Result<u64, EventStoreError> {
        self.locked(agent_id, |log| log.current_version())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        self.locked(snapshot.agent_id, |log| {
            log.snapshot = Some(snapshot);
        })
    }

    async fn latest_snapshot(
        &self,
        agent_id: AgentId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        self.locked(agent_id, |log| log.snapshot.clone())
    }
}
