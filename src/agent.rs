//! Agent core: state ownership, handler dispatch, and fault isolation
//!
//! An [`AgentCore`] wraps one user agent value and drives its handlers from
//! the stream consumer task. Everything here runs single-threaded per agent;
//! the core never shares the agent value across tasks.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain_types::{AgentId, DedupCacheCapacity, EventId};
use crate::envelope::{Direction, EventEnvelope, Payload, PublishOptions};
use crate::handlers::{HandlerFailure, HandlerRegistry};
use crate::router::{PublishError, Router};
use crate::stream::ShutdownSignal;
use crate::time_provider::SharedTimeProvider;

/// A stateful, single-threaded logical entity addressed by a stable id.
///
/// Concrete agents compose the capabilities they need: a plain agent is just
/// a struct with handlers; an event-sourced agent embeds a
/// [`Journal`](crate::journal::Journal) and replays it in `on_activate`.
#[async_trait]
pub trait Agent: Send + 'static {
    /// Registers this type's handlers. Called once when the type's registry
    /// is first built.
    fn register_handlers(registry: &mut HandlerRegistry<Self>)
    where
        Self: Sized;

    /// Runs before the agent starts receiving envelopes. Event-sourced
    /// agents rebuild their state here.
    async fn on_activate(&mut self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the last dispatch, before the agent is torn down.
    async fn on_deactivate(&mut self, _ctx: &AgentContext) {}
}

/// Capabilities handed to handlers and lifecycle hooks.
#[derive(Clone)]
pub struct AgentContext {
    agent_id: AgentId,
    router: Arc<Router>,
    shutdown: ShutdownSignal,
    time: SharedTimeProvider,
}

impl AgentContext {
    pub(crate) fn new(
        agent_id: AgentId,
        router: Arc<Router>,
        shutdown: ShutdownSignal,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            agent_id,
            router,
            shutdown,
            time,
        }
    }

    /// Context wired to an empty routing table; unit-test support.
    #[cfg(test)]
    pub(crate) fn detached(agent_id: AgentId) -> Self {
        use crate::domain_types::MaxHops;
        use crate::lifecycle::StreamRegistry;
        use crate::time_provider::system_time_provider;
        use crate::transport::NullTransport;

        let time = system_time_provider();
        let router = Arc::new(Router::new(
            Arc::new(StreamRegistry::new()),
            Arc::new(NullTransport),
            MaxHops::default(),
            Arc::clone(&time),
        ));
        Self::new(agent_id, router, ShutdownSignal::new(), time)
    }

    /// Id of the agent this context belongs to.
    #[must_use]
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Cancellation signal for this agent; handlers may observe it.
    #[must_use]
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Current time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn now_millis(&self) -> i64 {
        self.time.now_millis()
    }

    /// Publishes a typed payload from this agent.
    ///
    /// The envelope is first dispatched to this agent's own stream, then
    /// propagated by the router according to `direction`.
    ///
    /// # Errors
    ///
    /// [`PublishError`] for invalid arguments; delivery faults are absorbed.
    pub async fn publish<P: Payload>(
        &self,
        payload: &P,
        direction: Direction,
    ) -> Result<EventId, PublishError> {
        self.publish_with(payload, direction, PublishOptions::default())
            .await
    }

    /// Publishes a typed payload with explicit options.
    ///
    /// # Errors
    ///
    /// [`PublishError`] for invalid arguments; delivery faults are absorbed.
    pub async fn publish_with<P: Payload>(
        &self,
        payload: &P,
        direction: Direction,
        options: PublishOptions,
    ) -> Result<EventId, PublishError> {
        self.router
            .publish_payload(self.agent_id, payload, direction, options)
            .await
    }
}

/// Payload published UP when a handler throws: summarises the failing
/// handler, the envelope it was handling, and the error chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHandlerExceptionEvent {
    /// Agent whose handler failed.
    pub agent_id: AgentId,
    /// Envelope being dispatched when the failure happened.
    pub envelope_id: EventId,
    /// Registered name of the failing handler.
    pub handler_name: String,
    /// Top-level error message.
    pub message: String,
    /// Full error chain, outermost first.
    pub error_chain: Vec<String>,
}

impl Payload for EventHandlerExceptionEvent {
    const TYPE_NAME: &'static str = "EventHandlerExceptionEvent";
}

impl EventHandlerExceptionEvent {
    fn from_failure(agent_id: AgentId, envelope: &EventEnvelope, failure: &HandlerFailure) -> Self {
        Self {
            agent_id,
            envelope_id: envelope.id(),
            handler_name: failure.handler_name.clone(),
            message: failure.error.to_string(),
            error_chain: failure.error.chain().map(ToString::to_string).collect(),
        }
    }
}

/// Bounded set of envelope ids already dispatched, with oldest-out eviction.
#[derive(Debug)]
pub(crate) struct DedupCache {
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl DedupCache {
    pub(crate) fn new(capacity: DedupCacheCapacity) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.as_usize(),
        }
    }

    /// Records an id; returns `false` when it was already present.
    pub(crate) fn insert(&mut self, id: EventId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Outcome of offering an envelope to an agent core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// Handlers ran; the router may propagate further.
    Dispatched,
    /// The envelope id was already dispatched here; nothing ran.
    Duplicate,
}

/// Holds one agent value and runs its handlers.
pub(crate) struct AgentCore<A: Agent> {
    id: AgentId,
    agent: A,
    registry: Arc<HandlerRegistry<A>>,
    processed: DedupCache,
    ctx: AgentContext,
}

impl<A: Agent> AgentCore<A> {
    pub(crate) fn new(
        agent: A,
        registry: Arc<HandlerRegistry<A>>,
        ctx: AgentContext,
        dedup_capacity: DedupCacheCapacity,
    ) -> Self {
        Self {
            id: ctx.agent_id(),
            agent,
            registry,
            processed: DedupCache::new(dedup_capacity),
            ctx,
        }
    }

    pub(crate) fn id(&self) -> AgentId {
        self.id
    }

    pub(crate) async fn activate(&mut self) -> anyhow::Result<()> {
        let ctx = self.ctx.clone();
        self.agent.on_activate(&ctx).await
    }

    pub(crate) async fn deactivate(&mut self) {
        let ctx = self.ctx.clone();
        self.agent.on_deactivate(&ctx).await;
    }

    /// Dispatches one envelope: dedup check, handler run, exception
    /// publication. Returns whether the router should propagate.
    pub(crate) async fn dispatch(&mut self, envelope: &EventEnvelope) -> DispatchOutcome {
        if !self.processed.insert(envelope.id()) {
            debug!(
                agent_id = %self.id,
                envelope_id = %envelope.id(),
                "duplicate envelope ignored"
            );
            return DispatchOutcome::Duplicate;
        }

        let failures = self
            .registry
            .dispatch(&mut self.agent, &self.ctx, envelope)
            .await;

        for failure in failures {
            warn!(
                agent_id = %self.id,
                envelope_id = %envelope.id(),
                handler = failure.handler_name,
                error = %failure.error,
                "handler failed; publishing exception event"
            );
            let event = EventHandlerExceptionEvent::from_failure(self.id, envelope, &failure);
            let options = PublishOptions {
                correlation_id: Some(envelope.id()),
                ..PublishOptions::default()
            };
            if let Err(error) = self
                .ctx
                .publish_with(&event, Direction::Up, options)
                .await
            {
                warn!(
                    agent_id = %self.id,
                    %error,
                    "failed to publish handler exception event"
                );
            }
        }

        DispatchOutcome::Dispatched
    }
}
