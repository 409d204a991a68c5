//! Event store over per-agent storage cells
//!
//! Every agent owns two cells in the backing store: `events/{agent}` holding
//! the framed event log and `snapshots/{agent}` holding the latest snapshot.
//! All operations for one agent serialize through a dedicated actor task, so
//! the optimistic version check is trivially correct without backend-side
//! transactions. Keeping events and snapshots in separate cells also keeps a
//! growing log from dragging the snapshot past backend document-size limits.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::domain_types::AgentId;
use crate::wire;

use super::{EventRange, EventStore, EventStoreError, Snapshot, StateEvent, stamp_versions};

const ACTOR_QUEUE_DEPTH: usize = 32;

/// Errors raised by a cell storage backend.
#[derive(Debug, Error)]
pub enum CellStorageError {
    /// Reading a cell failed.
    #[error("cell read failed for key {key}: {reason}")]
    Read {
        /// Cell key.
        key: String,
        /// Backend-reported reason.
        reason: String,
    },

    /// Writing a cell failed.
    #[error("cell write failed for key {key}: {reason}")]
    Write {
        /// Cell key.
        key: String,
        /// Backend-reported reason.
        reason: String,
    },
}

/// Key-value storage holding one opaque value per cell.
#[async_trait]
pub trait CellStorage: Send + Sync + 'static {
    /// Reads the value of a cell; `None` when the cell does not exist.
    ///
    /// # Errors
    ///
    /// Backend-specific read failures.
    async fn read(&self, key: &str) -> Result<Option<Bytes>, CellStorageError>;

    /// Writes a cell, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Backend-specific write failures.
    async fn write(&self, key: &str, value: Bytes) -> Result<(), CellStorageError>;
}

/// In-memory cell storage for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryCellStorage {
    cells: DashMap<String, Bytes>,
}

impl MemoryCellStorage {
    /// Creates an empty cell storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CellStorage for MemoryCellStorage {
    async fn read(&self, key: &str) -> Result<Option<Bytes>, CellStorageError> {
        Ok(self.cells.get(key).map(|cell| cell.value().clone()))
    }

    async fn write(&self, key: &str, value: Bytes) -> Result<(), CellStorageError> {
        self.cells.insert(key.to_string(), value);
        Ok(())
    }
}

enum CellCommand {
    Append {
        events: Vec<StateEvent>,
        expected_version: u64,
        reply: oneshot::Sender<Result<u64, EventStoreError>>,
    },
    Events {
        range: EventRange,
        reply: oneshot::Sender<Result<Vec<StateEvent>, EventStoreError>>,
    },
    LatestVersion {
        reply: oneshot::Sender<Result<u64, EventStoreError>>,
    },
    SaveSnapshot {
        snapshot: Snapshot,
        reply: oneshot::Sender<Result<(), EventStoreError>>,
    },
    LatestSnapshot {
        reply: oneshot::Sender<Result<Option<Snapshot>, EventStoreError>>,
    },
}

fn events_key(agent_id: AgentId) -> String {
    format!("events/{agent_id}")
}

fn snapshots_key(agent_id: AgentId) -> String {
    format!("snapshots/{agent_id}")
}

fn backend_error(source: CellStorageError) -> EventStoreError {
    EventStoreError::Backend {
        source: Box::new(source),
    }
}

struct CellActor {
    agent_id: AgentId,
    storage: Arc<dyn CellStorage>,
}

impl CellActor {
    async fn run(self, mut commands: mpsc::Receiver<CellCommand>) {
        debug!(agent_id = %self.agent_id, "storage cell actor started");
        while let Some(command) = commands.recv().await {
            match command {
                CellCommand::Append {
                    events,
                    expected_version,
                    reply,
                } => {
                    let _ = reply.send(self.append(events, expected_version).await);
                }
                CellCommand::Events { range, reply } => {
                    let result = self.load_events().await.map(|events| {
                        events
                            .into_iter()
                            .filter(|event| range.contains(event.version))
                            .take(range.max_count.unwrap_or(usize::MAX))
                            .collect()
                    });
                    let _ = reply.send(result);
                }
                CellCommand::LatestVersion { reply } => {
                    let result = self
                        .load_events()
                        .await
                        .map(|events| events.last().map_or(0, |event| event.version));
                    let _ = reply.send(result);
                }
                CellCommand::SaveSnapshot { snapshot, reply } => {
                    let _ = reply.send(self.save_snapshot(snapshot).await);
                }
                CellCommand::LatestSnapshot { reply } => {
                    let _ = reply.send(self.load_snapshot().await);
                }
            }
        }
        debug!(agent_id = %self.agent_id, "storage cell actor stopped");
    }

    async fn load_events(&self) -> Result<Vec<StateEvent>, EventStoreError> {
        let cell = self
            .storage
            .read(&events_key(self.agent_id))
            .await
            .map_err(backend_error)?;
        match cell {
            None => Ok(Vec::new()),
            Some(bytes) => wire::decode_event_log(&bytes).map_err(|e| EventStoreError::Corrupt {
                agent_id: self.agent_id,
                reason: e.to_string(),
            }),
        }
    }

    async fn append(
        &self,
        mut events: Vec<StateEvent>,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        let mut log = self.load_events().await?;
        let current = log.last().map_or(0, |event| event.version);
        if current != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                agent_id: self.agent_id,
                expected: expected_version,
                actual: current,
            });
        }
        let new_version = stamp_versions(self.agent_id, &mut events, expected_version)?;
        log.append(&mut events);

        self.storage
            .write(&events_key(self.agent_id), wire::encode_event_log(&log))
            .await
            .map_err(backend_error)?;
        Ok(new_version)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        self.storage
            .write(
                &snapshots_key(self.agent_id),
                wire::encode_snapshot(&snapshot),
            )
            .await
            .map_err(backend_error)
    }

    async fn load_snapshot(&self) -> Result<Option<Snapshot>, EventStoreError> {
        let cell = self
            .storage
            .read(&snapshots_key(self.agent_id))
            .await
            .map_err(backend_error)?;
        match cell {
            None => Ok(None),
            Some(bytes) => wire::decode_snapshot(&bytes)
                .map(Some)
                .map_err(|e| EventStoreError::Corrupt {
                    agent_id: self.agent_id,
                    reason: e.to_string(),
                }),
        }
    }
}

/// Event store coordinating per-agent storage cells through serialization
/// actors.
pub struct SingleKeyEventStore {
    storage: Arc<dyn CellStorage>,
    actors: DashMap<AgentId, mpsc::Sender<CellCommand>>,
}

impl SingleKeyEventStore {
    /// Creates a store over the given cell storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn CellStorage>) -> Self {
        Self {
            storage,
            actors: DashMap::new(),
        }
    }

    fn actor(&self, agent_id: AgentId) -> mpsc::Sender<CellCommand> {
        if let Some(sender) = self.actors.get(&agent_id) {
            if !sender.value().is_closed() {
                return sender.value().clone();
            }
        }

        let (tx, rx) = mpsc::channel(ACTOR_QUEUE_DEPTH);
        let actor = CellActor {
            agent_id,
            storage: Arc::clone(&self.storage),
        };
        tokio::spawn(actor.run(rx));
        self.actors.insert(agent_id, tx.clone());
        tx
    }

    async fn command<T>(
        &self,
        agent_id: AgentId,
        make: impl FnOnce(oneshot::Sender<Result<T, EventStoreError>>) -> CellCommand,
    ) -> Result<T, EventStoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.actor(agent_id)
            .send(make(reply_tx))
            .await
            .map_err(|_| EventStoreError::Backend {
                source: "storage cell actor is gone".into(),
            })?;
        reply_rx.await.map_err(|_| EventStoreError::Backend {
            source: "storage cell actor dropped the reply".into(),
        })?
    }
}

#[async_trait]
impl EventStore for SingleKeyEventStore {
    async fn append_events(
        &self,
        agent_id: AgentId,
        events: Vec<StateEvent>,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        self.command(agent_id, |reply| CellCommand::Append {
            events,
            expected_version,
            reply,
        })
        .await
    }

    async fn events(
        &self,
        agent_id: AgentId,
        range: EventRange,
    ) -> Result<Vec<StateEvent>, EventStoreError> {
        self.command(agent_id, |reply| CellCommand::Events { range, reply })
            .await
    }

    async fn latest_version(&self, agent_id: AgentId) -> Result<u64, EventStoreError> {
        self.command(agent_id, |reply| CellCommand::LatestVersion { reply })
            .await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        self.command(snapshot.agent_id, |reply| CellCommand::SaveSnapshot {
            snapshot,
            reply,
        })
        .await
    }

    async fn latest_snapshot(
        &self,
        agent_id: AgentId,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        self.command(agent_id, |reply| CellCommand::LatestSnapshot { reply })
            .await
    }
}
