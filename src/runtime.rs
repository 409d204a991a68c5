//! Composition root wiring registry, router, transport, and lifecycle
//!
//! A hosting process creates one [`AgentRuntime`] per node, activates agents
//! through its lifecycle manager, and maps its shutdown signal to
//! [`AgentRuntime::shutdown`]. The core itself has no process surface.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::domain_types::{AgentId, EventId};
use crate::envelope::{Direction, EventEnvelope, Payload, PublishOptions};
use crate::lifecycle::{LifecycleManager, StreamRegistry};
use crate::router::{DeliveryError, PublishError, Router};
use crate::time_provider::{SharedTimeProvider, system_time_provider};
use crate::transport::{NullTransport, RemoteTransport};

/// One node's agent runtime.
pub struct AgentRuntime {
    lifecycle: Arc<LifecycleManager>,
    router: Arc<Router>,
}

impl AgentRuntime {
    /// Creates a runtime with no remote transport; every agent is local.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_transport(config, Arc::new(NullTransport))
    }

    /// Creates a runtime whose router reaches non-resident agents through
    /// `transport`. The transport's inbound side is wired to inject
    /// delivered envelopes into resident streams.
    #[must_use]
    pub fn with_transport(config: RuntimeConfig, transport: Arc<dyn RemoteTransport>) -> Self {
        Self::with_parts(config, transport, system_time_provider())
    }

    /// Fully explicit construction; tests pin the clock through this.
    #[must_use]
    pub fn with_parts(
        config: RuntimeConfig,
        transport: Arc<dyn RemoteTransport>,
        time: SharedTimeProvider,
    ) -> Self {
        let registry = Arc::new(StreamRegistry::new());
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            config.default_max_hops,
            Arc::clone(&time),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&registry),
            Arc::clone(&router),
            config,
            time,
        ));

        // Inbound envelopes from the transport land on resident streams.
        {
            let inbound_registry = Arc::clone(&registry);
            transport.register_local_delivery(Arc::new(move |target, envelope| {
                match inbound_registry.entry(target) {
                    None => warn!(
                        target = %target,
                        "inbound envelope for non-resident agent dropped"
                    ),
                    Some(entry) => {
                        if let Err(rejection) = entry.try_enqueue(envelope) {
                            warn!(target = %target, %rejection, "inbound envelope dropped");
                        }
                    }
                }
            }));
        }

        info!("agent runtime created");
        Self { lifecycle, router }
    }

    /// Lifecycle manager: activation, deactivation, hierarchy.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Publishes a typed payload on behalf of a resident agent.
    ///
    /// # Errors
    ///
    /// [`PublishError`] on invalid arguments.
    pub async fn publish<P: Payload>(
        &self,
        publisher: AgentId,
        payload: &P,
        direction: Direction,
    ) -> Result<EventId, PublishError> {
        self.router
            .publish_payload(publisher, payload, direction, PublishOptions::default())
            .await
    }

    /// Publishes with explicit options (hop budget, correlation id).
    ///
    /// # Errors
    ///
    /// [`PublishError`] on invalid arguments.
    pub async fn publish_with<P: Payload>(
        &self,
        publisher: AgentId,
        payload: &P,
        direction: Direction,
        options: PublishOptions,
    ) -> Result<EventId, PublishError> {
        self.router
            .publish_payload(publisher, payload, direction, options)
            .await
    }

    /// Injects an already-built envelope into a resident agent's stream,
    /// exactly as an inbound transport delivery would.
    ///
    /// # Errors
    ///
    /// [`DeliveryError`] when the target is unknown or its stream rejects.
    pub fn inject_envelope(
        &self,
        target: AgentId,
        envelope: EventEnvelope,
    ) -> Result<(), DeliveryError> {
        self.router.deliver(target, envelope)
    }

    /// Deactivates every resident agent. Hosts call this on shutdown.
    pub async fn shutdown(&self) {
        for agent_id in self.lifecycle.resident_agents() {
            if let Err(error) = self.lifecycle.deactivate(agent_id).await {
                warn!(agent_id = %agent_id, %error, "deactivation during shutdown failed");
            }
        }
        info!("agent runtime shut down");
    }
}
