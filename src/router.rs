//! Event routing and propagation
//!
//! The router builds envelopes, enforces the propagation rules, and fans
//! copies out across the hierarchy. It holds agent *ids* only: streams and
//! hierarchy sets are looked up in the shared [`StreamRegistry`] at each
//! step, so no reference cycles form between agents, streams, and router.
//!
//! Delivery is best-effort under backpressure: a full stream drops the copy
//! for that recipient and the remaining recipients are still attempted.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::domain_types::{AgentId, EventId, MaxHops};
use crate::envelope::{Direction, EventEnvelope, Payload, PublishOptions, TypedPayload};
use crate::lifecycle::{Hierarchy, StreamRegistry};
use crate::time_provider::SharedTimeProvider;
use crate::transport::RemoteTransport;
use crate::wire;

/// Errors a publish call raises synchronously. Hop limits, cycles,
/// backpressure, and transport faults are absorbed and logged instead.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The publisher id is the nil UUID.
    #[error("publisher id must not be nil")]
    NilPublisher,

    /// The publisher has no resident stream on this node.
    #[error("publisher {agent_id} is not resident on this node")]
    PublisherNotResident {
        /// The offending id.
        agent_id: AgentId,
    },

    /// The payload carries an empty type url.
    #[error("payload type url must not be empty")]
    EmptyTypeUrl,

    /// The typed payload failed to serialize.
    #[error("payload failed to encode: {source}")]
    PayloadEncoding {
        /// Serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Which side a non-origin BOTH envelope arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrivalSide {
    Parent,
    Child,
}

/// Envelope construction and directional fan-out over the agent hierarchy.
pub struct Router {
    registry: Arc<StreamRegistry>,
    transport: Arc<dyn RemoteTransport>,
    default_max_hops: MaxHops,
    time: SharedTimeProvider,
}

impl Router {
    pub(crate) fn new(
        registry: Arc<StreamRegistry>,
        transport: Arc<dyn RemoteTransport>,
        default_max_hops: MaxHops,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            registry,
            transport,
            default_max_hops,
            time,
        }
    }

    /// Encodes and publishes a typed payload. See [`Router::publish`].
    ///
    /// # Errors
    ///
    /// [`PublishError`] on invalid arguments or encoding failure.
    pub async fn publish_payload<P: Payload>(
        &self,
        publisher: AgentId,
        payload: &P,
        direction: Direction,
        options: PublishOptions,
    ) -> Result<EventId, PublishError> {
        let payload = TypedPayload::encode(payload)?;
        self.publish(publisher, payload, direction, options).await
    }

    /// Builds a fresh envelope and enqueues it onto the publisher's own
    /// stream. Handlers of the publisher run first; propagation toward
    /// parent and children happens after that dispatch completes.
    ///
    /// # Errors
    ///
    /// [`PublishError`] on invalid arguments. A full or closed publisher
    /// stream is absorbed: the envelope is dropped and logged.
    pub async fn publish(
        &self,
        publisher: AgentId,
        payload: TypedPayload,
        direction: Direction,
        options: PublishOptions,
    ) -> Result<EventId, PublishError> {
        if publisher.as_uuid().is_nil() {
            return Err(PublishError::NilPublisher);
        }
        if payload.type_url().is_empty() {
            return Err(PublishError::EmptyTypeUrl);
        }

        let mut options = options;
        options.max_hop_count = Some(
            options
                .max_hop_count
                .unwrap_or(self.default_max_hops.as_u32()),
        );
        let envelope = EventEnvelope::new(
            publisher,
            payload,
            direction,
            options,
            self.time.now_millis(),
        );
        let envelope_id = envelope.id();

        let Some(entry) = self.registry.entry(publisher) else {
            return Err(PublishError::PublisherNotResident {
                agent_id: publisher,
            });
        };
        if let Err(rejection) = entry.try_enqueue(envelope) {
            warn!(
                publisher = %publisher,
                envelope_id = %envelope_id,
                %rejection,
                "publish dropped at the origin stream"
            );
        }

        Ok(envelope_id)
    }

    /// Injects an externally received envelope into a resident agent's
    /// stream. Transports use this for inbound deliveries.
    ///
    /// # Errors
    ///
    /// [`DeliveryError`] when the target is unknown here or its stream
    /// rejected the envelope.
    pub fn deliver(&self, target: AgentId, envelope: EventEnvelope) -> Result<(), DeliveryError> {
        let Some(entry) = self.registry.entry(target) else {
            return Err(DeliveryError::NotResident { agent_id: target });
        };
        entry
            .try_enqueue(envelope)
            .map_err(|rejection| DeliveryError::Rejected {
                agent_id: target,
                reason: rejection.to_string(),
            })
    }

    /// Applies the delivery procedure for an envelope that was just
    /// dispatched at `at`: hop check, directional fan-out, anti-cycle rule.
    pub(crate) async fn propagate(&self, at: AgentId, envelope: &EventEnvelope) {
        if envelope.hop_exhausted() {
            debug!(
                at = %at,
                envelope_id = %envelope.id(),
                hops = envelope.current_hop_count(),
                limit = envelope.effective_hop_limit(),
                "hop limit reached; envelope dropped"
            );
            return;
        }

        let Some(entry) = self.registry.entry(at) else {
            return;
        };
        let hierarchy = entry.hierarchy_snapshot();

        match envelope.direction() {
            Direction::Up => {
                self.forward_up(at, &hierarchy, envelope, Direction::Up).await;
            }
            Direction::Down => {
                self.forward_down(at, &hierarchy, envelope).await;
            }
            Direction::Both => {
                if envelope.publisher_id() == at {
                    // Only the origin radiates in both directions; the UP
                    // copy keeps BOTH so the parent can tell it apart.
                    self.forward_up(at, &hierarchy, envelope, Direction::Both)
                        .await;
                    self.forward_down(at, &hierarchy, envelope).await;
                } else {
                    match arrival_side(&hierarchy, envelope) {
                        Some(ArrivalSide::Parent) => {
                            self.forward_down(at, &hierarchy, envelope).await;
                        }
                        Some(ArrivalSide::Child) => {
                            self.forward_up(at, &hierarchy, envelope, Direction::Up)
                                .await;
                        }
                        None => {
                            warn!(
                                at = %at,
                                envelope_id = %envelope.id(),
                                "cannot determine arrival side of relayed BOTH envelope; dropping"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn forward_up(
        &self,
        at: AgentId,
        hierarchy: &Hierarchy,
        envelope: &EventEnvelope,
        direction: Direction,
    ) {
        let Some(parent) = hierarchy.parent else {
            return;
        };
        if envelope.has_visited(parent) {
            warn!(
                at = %at,
                parent = %parent,
                envelope_id = %envelope.id(),
                "cycle detected on upward path; copy dropped"
            );
            return;
        }
        self.forward(at, parent, envelope.forwarded(direction, at, parent))
            .await;
    }

    async fn forward_down(&self, at: AgentId, hierarchy: &Hierarchy, envelope: &EventEnvelope) {
        for &child in &hierarchy.children {
            if child == at {
                error!(
                    at = %at,
                    "agent lists itself as a child; skipping self-delivery"
                );
                continue;
            }
            if envelope.has_visited(child) {
                debug!(
                    at = %at,
                    child = %child,
                    envelope_id = %envelope.id(),
                    "child already visited; copy skipped"
                );
                continue;
            }
            self.forward(at, child, envelope.forwarded(Direction::Down, at, child))
                .await;
        }
    }

    /// Hands a forwarded copy to its recipient: a resident stream when the
    /// agent lives here, the remote transport otherwise.
    async fn forward(&self, from: AgentId, to: AgentId, envelope: EventEnvelope) {
        if let Some(entry) = self.registry.entry(to) {
            if let Err(rejection) = entry.try_enqueue(envelope) {
                warn!(
                    from = %from,
                    to = %to,
                    %rejection,
                    "forwarded copy dropped"
                );
            }
            return;
        }

        let bytes = wire::encode_envelope(&envelope);
        if let Err(failure) = self.transport.send_envelope(to, bytes).await {
            warn!(
                from = %from,
                to = %to,
                %failure,
                "remote send failed; copy dropped"
            );
        }
    }
}

/// Errors raised when injecting an envelope into a resident stream.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The target agent has no stream on this node.
    #[error("agent {agent_id} is not resident on this node")]
    NotResident {
        /// The unknown agent.
        agent_id: AgentId,
    },

    /// The target stream refused the envelope.
    #[error("stream for agent {agent_id} rejected the envelope: {reason}")]
    Rejected {
        /// The target agent.
        agent_id: AgentId,
        /// Stream-level rejection reason.
        reason: String,
    },
}

/// Infers which side a relayed BOTH envelope came from: a visited parent
/// means it came down; a visited child means it came up.
fn arrival_side(hierarchy: &Hierarchy, envelope: &EventEnvelope) -> Option<ArrivalSide> {
    if let Some(parent) = hierarchy.parent {
        if envelope.has_visited(parent) {
            return Some(ArrivalSide::Parent);
        }
    }
    if hierarchy
        .children
        .iter()
        .any(|&child| envelope.has_visited(child))
    {
        return Some(ArrivalSide::Child);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn hierarchy(parent: Option<AgentId>, children: &[AgentId]) -> Hierarchy {
        Hierarchy {
            parent,
            children: children.iter().copied().collect::<HashSet<_>>(),
        }
    }

    fn relayed_both(visited: &[AgentId]) -> EventEnvelope {
        let payload = TypedPayload::new("canopy.agents/Tick", bytes::Bytes::from_static(b"{}"));
        let origin = visited[0];
        let mut envelope = EventEnvelope::new(
            origin,
            payload,
            Direction::Both,
            PublishOptions::default(),
            0,
        );
        for &hop in &visited[1..] {
            envelope = envelope.forwarded(Direction::Both, origin, hop);
        }
        envelope
    }

    #[test]
    fn visited_parent_means_arrival_from_parent() {
        let parent = AgentId::generate();
        let child = AgentId::generate();
        let hierarchy = hierarchy(Some(parent), &[child]);
        let envelope = relayed_both(&[AgentId::generate(), parent]);

        assert_eq!(arrival_side(&hierarchy, &envelope), Some(ArrivalSide::Parent));
    }

    #[test]
    fn visited_child_means_arrival_from_child() {
        let parent = AgentId::generate();
        let child = AgentId::generate();
        let hierarchy = hierarchy(Some(parent), &[child]);
        let envelope = relayed_both(&[child]);

        assert_eq!(arrival_side(&hierarchy, &envelope), Some(ArrivalSide::Child));
    }

    #[test]
    fn unrelated_visited_set_is_indeterminate() {
        let hierarchy = hierarchy(Some(AgentId::generate()), &[AgentId::generate()]);
        let envelope = relayed_both(&[AgentId::generate()]);

        assert_eq!(arrival_side(&hierarchy, &envelope), None);
    }

    #[test]
    fn a_visited_parent_wins_over_a_visited_child() {
        let parent = AgentId::generate();
        let child = AgentId::generate();
        let hierarchy = hierarchy(Some(parent), &[child]);
        let envelope = relayed_both(&[child, parent]);

        assert_eq!(arrival_side(&hierarchy, &envelope), Some(ArrivalSide::Parent));
    }
}
