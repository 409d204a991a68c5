//! Agent lifecycle: activation, deactivation, and hierarchy mutation
//!
//! The [`LifecycleManager`] owns the map from agent id to resident stream.
//! Activation is idempotent and coalesces concurrent callers through a
//! per-id lock; deactivation closes the stream to new enqueues, waits for
//! the in-flight dispatch, runs the deactivation hook, and tears down.
//!
//! Hierarchy sets follow a single-writer discipline: only the manager
//! mutates them, the router reads snapshots during fan-out.

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentContext, AgentCore, DispatchOutcome};
use crate::config::RuntimeConfig;
use crate::domain_types::AgentId;
use crate::envelope::EventEnvelope;
use crate::handlers::HandlerRegistry;
use crate::router::Router;
use crate::stream::{EnqueueError, PerAgentStream, ShutdownSignal, StreamConsumer};
use crate::time_provider::SharedTimeProvider;

/// Where an agent is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Entry exists, activation hook still running.
    Created,
    /// Receiving and dispatching envelopes.
    Active,
    /// Stream closed, draining or finishing the in-flight dispatch.
    Deactivating,
    /// Torn down; the id can be activated again.
    Deactivated,
}

/// Parent/child links of one agent.
#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    /// The parent, if any.
    pub parent: Option<AgentId>,
    /// Unordered child set.
    pub children: HashSet<AgentId>,
}

/// One resident agent: its stream, hierarchy, and lifecycle state.
pub(crate) struct AgentEntry {
    id: AgentId,
    stream: PerAgentStream,
    hierarchy: RwLock<Hierarchy>,
    state: RwLock<LifecycleState>,
    shutdown: ShutdownSignal,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AgentEntry {
    fn new(id: AgentId, stream: PerAgentStream, shutdown: ShutdownSignal) -> Self {
        Self {
            id,
            stream,
            hierarchy: RwLock::new(Hierarchy::default()),
            state: RwLock::new(LifecycleState::Created),
            shutdown,
            consumer: Mutex::new(None),
        }
    }

    pub(crate) fn try_enqueue(&self, envelope: EventEnvelope) -> Result<(), EnqueueError> {
        self.stream.try_enqueue(envelope)
    }

    pub(crate) fn hierarchy_snapshot(&self) -> Hierarchy {
        self.hierarchy
            .read()
            .map_or_else(|_| Hierarchy::default(), |guard| guard.clone())
    }

    fn with_hierarchy_mut<T>(&self, mutate: impl FnOnce(&mut Hierarchy) -> T) -> Option<T> {
        self.hierarchy.write().ok().map(|mut guard| mutate(&mut guard))
    }

    pub(crate) fn lifecycle_state(&self) -> LifecycleState {
        self.state
            .read()
            .map_or(LifecycleState::Deactivated, |guard| *guard)
    }

    fn set_state(&self, state: LifecycleState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = state;
        }
    }

    fn store_consumer(&self, handle: JoinHandle<()>) {
        if let Ok(mut guard) = self.consumer.lock() {
            *guard = Some(handle);
        }
    }

    fn take_consumer(&self) -> Option<JoinHandle<()>> {
        self.consumer.lock().ok().and_then(|mut guard| guard.take())
    }
}

/// Map from agent id to resident entry, owned by the lifecycle manager and
/// read by the router. Not a process-wide singleton: every runtime has its
/// own.
pub(crate) struct StreamRegistry {
    entries: DashMap<AgentId, Arc<AgentEntry>>,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub(crate) fn entry(&self, id: AgentId) -> Option<Arc<AgentEntry>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn insert(&self, entry: Arc<AgentEntry>) {
        self.entries.insert(entry.id, entry);
    }

    fn remove(&self, id: AgentId) {
        self.entries.remove(&id);
    }

    pub(crate) fn resident_ids(&self) -> Vec<AgentId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }
}

/// Errors raised by activation.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// The agent id is the nil UUID.
    #[error("agent id must not be nil")]
    NilAgentId,

    /// The user factory failed to build the agent value.
    #[error("agent factory failed for {agent_id}: {source}")]
    Factory {
        /// Agent being activated.
        agent_id: AgentId,
        /// Factory error.
        #[source]
        source: anyhow::Error,
    },

    /// The activation hook (replay, typically) failed.
    #[error("activation hook failed for {agent_id}: {source}")]
    ActivateHook {
        /// Agent being activated.
        agent_id: AgentId,
        /// Hook error.
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised by hierarchy mutation.
#[derive(Debug, Error)]
pub enum HierarchyError {
    /// An id was the nil UUID.
    #[error("agent id must not be nil")]
    NilAgentId,

    /// An agent cannot parent itself.
    #[error("agent {agent_id} cannot be its own child")]
    SelfChild {
        /// The offending agent.
        agent_id: AgentId,
    },

    /// The parent has no resident entry here.
    #[error("agent {agent_id} is not resident on this node")]
    NotResident {
        /// The missing agent.
        agent_id: AgentId,
    },
}

/// Errors raised by deactivation.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The agent has no resident entry here.
    #[error("agent {agent_id} is not resident on this node")]
    NotResident {
        /// The missing agent.
        agent_id: AgentId,
    },
}

/// Lightweight reference to a resident agent.
#[derive(Clone)]
pub struct AgentHandle {
    id: AgentId,
    registry: Arc<StreamRegistry>,
}

impl AgentHandle {
    /// The agent's id.
    #[must_use]
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Current lifecycle state; `None` once the entry is gone.
    #[must_use]
    pub fn lifecycle_state(&self) -> Option<LifecycleState> {
        self.registry
            .entry(self.id)
            .map(|entry| entry.lifecycle_state())
    }

    /// Whether the agent is currently active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lifecycle_state() == Some(LifecycleState::Active)
    }
}

/// Tracks resident agents and drives their lifecycles.
pub struct LifecycleManager {
    registry: Arc<StreamRegistry>,
    router: Arc<Router>,
    config: RuntimeConfig,
    time: SharedTimeProvider,
    activation_locks: DashMap<AgentId, Arc<tokio::sync::Mutex<()>>>,
    handler_registries: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl LifecycleManager {
    pub(crate) fn new(
        registry: Arc<StreamRegistry>,
        router: Arc<Router>,
        config: RuntimeConfig,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            registry,
            router,
            config,
            time,
            activation_locks: DashMap::new(),
            handler_registries: DashMap::new(),
        }
    }

    fn handle(&self, id: AgentId) -> AgentHandle {
        AgentHandle {
            id,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Handler registry for `A`, built once per type and cached by type
    /// identity.
    fn handler_registry_for<A: Agent>(&self) -> Arc<HandlerRegistry<A>> {
        if let Some(cached) = self.handler_registries.get(&TypeId::of::<A>()) {
            if let Ok(registry) = Arc::downcast::<HandlerRegistry<A>>(Arc::clone(cached.value())) {
                return registry;
            }
        }
        let mut registry = HandlerRegistry::new();
        A::register_handlers(&mut registry);
        let registry = Arc::new(registry);
        self.handler_registries.insert(
            TypeId::of::<A>(),
            Arc::clone(&registry) as Arc<dyn Any + Send + Sync>,
        );
        registry
    }

    /// Returns the resident agent or activates it via `factory`.
    ///
    /// Idempotent: concurrent callers for the same id coalesce into one
    /// activation and every caller gets a handle to the same agent. The
    /// activation hook runs before the agent starts dispatching, so
    /// event-sourced agents are fully replayed before their first envelope.
    ///
    /// # Errors
    ///
    /// [`ActivationError`] when the id is nil or the factory or activation
    /// hook fails.
    pub async fn get_or_activate<A, F, Fut>(
        &self,
        id: AgentId,
        factory: F,
    ) -> Result<AgentHandle, ActivationError>
    where
        A: Agent,
        F: FnOnce(AgentId) -> Fut + Send,
        Fut: std::future::Future<Output = anyhow::Result<A>> + Send,
    {
        if id.as_uuid().is_nil() {
            return Err(ActivationError::NilAgentId);
        }
        if self.registry.entry(id).is_some() {
            return Ok(self.handle(id));
        }

        let lock = {
            let cell = self
                .activation_locks
                .entry(id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
            Arc::clone(cell.value())
        };
        let _guard = lock.lock().await;

        // A racing caller may have finished the activation while this one
        // waited on the lock.
        if self.registry.entry(id).is_some() {
            return Ok(self.handle(id));
        }

        let agent = factory(id)
            .await
            .map_err(|source| ActivationError::Factory {
                agent_id: id,
                source,
            })?;

        let handler_registry = self.handler_registry_for::<A>();
        let (stream, consumer) = PerAgentStream::channel(id, self.config.stream_capacity);
        let shutdown = consumer.shutdown_signal();
        let ctx = AgentContext::new(
            id,
            Arc::clone(&self.router),
            shutdown.clone(),
            Arc::clone(&self.time),
        );
        let mut core = AgentCore::new(
            agent,
            handler_registry,
            ctx,
            self.config.dedup_cache_capacity,
        );

        let entry = Arc::new(AgentEntry::new(id, stream, shutdown));
        self.registry.insert(Arc::clone(&entry));

        if let Err(source) = core.activate().await {
            self.registry.remove(id);
            self.activation_locks.remove(&id);
            return Err(ActivationError::ActivateHook {
                agent_id: id,
                source,
            });
        }

        entry.set_state(LifecycleState::Active);
        let consumer_handle = tokio::spawn(drive(core, consumer, Arc::clone(&self.router)));
        entry.store_consumer(consumer_handle);
        self.activation_locks.remove(&id);

        info!(agent_id = %id, "agent activated");
        Ok(self.handle(id))
    }

    /// Deactivates a resident agent: rejects further enqueues, waits for the
    /// in-flight dispatch, runs the deactivation hook, removes the entry.
    ///
    /// Queued envelopes are drained first when the runtime is configured to
    /// drain on deactivation; otherwise the tail is discarded.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::NotResident`] when the id has no entry here.
    pub async fn deactivate(&self, id: AgentId) -> Result<(), LifecycleError> {
        let Some(entry) = self.registry.entry(id) else {
            return Err(LifecycleError::NotResident { agent_id: id });
        };

        entry.set_state(LifecycleState::Deactivating);
        entry.stream.close();
        if !self.config.drain_on_deactivate {
            entry.shutdown.trigger();
        }

        if let Some(consumer) = entry.take_consumer() {
            if let Err(join_error) = consumer.await {
                warn!(agent_id = %id, %join_error, "agent consumer ended abnormally");
            }
        }

        entry.set_state(LifecycleState::Deactivated);
        self.registry.remove(id);
        info!(agent_id = %id, "agent deactivated");
        Ok(())
    }

    /// Links `child` under `parent`, re-parenting the child if needed.
    ///
    /// The parent must be resident; the child may live elsewhere (its id is
    /// recorded either way, and its own entry is updated when present).
    ///
    /// # Errors
    ///
    /// [`HierarchyError`] on nil ids, self-parenting, or a non-resident
    /// parent.
    pub fn add_child(&self, parent: AgentId, child: AgentId) -> Result<(), HierarchyError> {
        if parent.as_uuid().is_nil() || child.as_uuid().is_nil() {
            return Err(HierarchyError::NilAgentId);
        }
        if parent == child {
            return Err(HierarchyError::SelfChild { agent_id: parent });
        }
        let Some(parent_entry) = self.registry.entry(parent) else {
            return Err(HierarchyError::NotResident { agent_id: parent });
        };

        parent_entry.with_hierarchy_mut(|hierarchy| {
            hierarchy.children.insert(child);
        });

        if let Some(child_entry) = self.registry.entry(child) {
            let previous = child_entry
                .with_hierarchy_mut(|hierarchy| hierarchy.parent.replace(parent))
                .flatten();
            if let Some(previous) = previous {
                if previous != parent {
                    if let Some(previous_entry) = self.registry.entry(previous) {
                        previous_entry.with_hierarchy_mut(|hierarchy| {
                            hierarchy.children.remove(&child);
                        });
                    }
                }
            }
        }

        debug!(parent = %parent, child = %child, "hierarchy link added");
        Ok(())
    }

    /// Unlinks `child` from `parent`.
    ///
    /// # Errors
    ///
    /// [`HierarchyError::NotResident`] when the parent has no entry here.
    pub fn remove_child(&self, parent: AgentId, child: AgentId) -> Result<(), HierarchyError> {
        let Some(parent_entry) = self.registry.entry(parent) else {
            return Err(HierarchyError::NotResident { agent_id: parent });
        };

        parent_entry.with_hierarchy_mut(|hierarchy| {
            hierarchy.children.remove(&child);
        });
        if let Some(child_entry) = self.registry.entry(child) {
            child_entry.with_hierarchy_mut(|hierarchy| {
                if hierarchy.parent == Some(parent) {
                    hierarchy.parent = None;
                }
            });
        }

        debug!(parent = %parent, child = %child, "hierarchy link removed");
        Ok(())
    }

    /// Sets (or clears) a resident child's parent link directly. This is
    /// how a child learns about a parent resident on another node, where
    /// [`LifecycleManager::add_child`] cannot run locally.
    ///
    /// # Errors
    ///
    /// [`HierarchyError`] on nil ids, self-parenting, or a non-resident
    /// child.
    pub fn set_parent(
        &self,
        child: AgentId,
        parent: Option<AgentId>,
    ) -> Result<(), HierarchyError> {
        if child.as_uuid().is_nil() {
            return Err(HierarchyError::NilAgentId);
        }
        if let Some(parent) = parent {
            if parent.as_uuid().is_nil() {
                return Err(HierarchyError::NilAgentId);
            }
            if parent == child {
                return Err(HierarchyError::SelfChild { agent_id: child });
            }
        }
        let Some(child_entry) = self.registry.entry(child) else {
            return Err(HierarchyError::NotResident { agent_id: child });
        };

        let previous = child_entry
            .with_hierarchy_mut(|hierarchy| std::mem::replace(&mut hierarchy.parent, parent))
            .flatten();
        if let Some(previous) = previous {
            if Some(previous) != parent {
                if let Some(previous_entry) = self.registry.entry(previous) {
                    previous_entry.with_hierarchy_mut(|hierarchy| {
                        hierarchy.children.remove(&child);
                    });
                }
            }
        }
        if let Some(parent) = parent {
            if let Some(parent_entry) = self.registry.entry(parent) {
                parent_entry.with_hierarchy_mut(|hierarchy| {
                    hierarchy.children.insert(child);
                });
            }
        }

        debug!(child = %child, parent = ?parent, "parent link updated");
        Ok(())
    }

    /// Hierarchy snapshot for a resident agent.
    #[must_use]
    pub fn hierarchy(&self, id: AgentId) -> Option<Hierarchy> {
        self.registry.entry(id).map(|entry| entry.hierarchy_snapshot())
    }

    /// Lifecycle state of a resident agent.
    #[must_use]
    pub fn lifecycle_state(&self, id: AgentId) -> Option<LifecycleState> {
        self.registry.entry(id).map(|entry| entry.lifecycle_state())
    }

    /// Whether the agent has a resident entry.
    #[must_use]
    pub fn is_resident(&self, id: AgentId) -> bool {
        self.registry.entry(id).is_some()
    }

    /// Ids of every resident agent.
    #[must_use]
    pub fn resident_agents(&self) -> Vec<AgentId> {
        self.registry.resident_ids()
    }
}

/// Consumer loop: one envelope at a time, dispatch then propagate, yielding
/// to the scheduler between envelopes. Dispatch failures never kill the
/// loop; they surface as exception events from within the dispatch itself.
async fn drive<A: Agent>(
    mut core: AgentCore<A>,
    mut consumer: StreamConsumer,
    router: Arc<Router>,
) {
    let agent_id = core.id();
    debug!(%agent_id, "agent consumer started");

    while let Some(envelope) = consumer.next().await {
        match core.dispatch(&envelope).await {
            DispatchOutcome::Duplicate => {}
            DispatchOutcome::Dispatched => router.propagate(agent_id, &envelope).await,
        }
        tokio::task::yield_now().await;
    }

    core.deactivate().await;
    debug!(%agent_id, "agent consumer stopped");
}
