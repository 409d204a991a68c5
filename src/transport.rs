//! Remote transport port
//!
//! The router hands a copy to the transport whenever the recipient has no
//! resident stream. What "remote" means (another process, a cluster peer, a
//! test harness) is entirely the transport's business; the core only speaks
//! envelope bytes in the canonical wire format.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::domain_types::AgentId;
use crate::envelope::EventEnvelope;
use crate::wire::{self, WireError};

/// Callback receiving inbound envelopes that must be injected into a local
/// per-agent stream.
pub type InboundDelivery = Arc<dyn Fn(AgentId, EventEnvelope) + Send + Sync>;

/// Errors raised by remote sends.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No route exists to the target agent.
    #[error("no route to agent {agent_id}")]
    NoRoute {
        /// The unreachable agent.
        agent_id: AgentId,
    },

    /// No inbound delivery callback has been registered yet.
    #[error("transport has no local delivery registered")]
    NotWired,

    /// The envelope bytes failed to decode on the receiving side.
    #[error("envelope decode failed: {source}")]
    Codec {
        /// Wire decode error.
        #[from]
        source: WireError,
    },

    /// The underlying channel failed.
    #[error("send to agent {agent_id} failed: {reason}")]
    SendFailed {
        /// The target agent.
        agent_id: AgentId,
        /// Transport-reported reason.
        reason: String,
    },
}

/// Port for delivering envelopes to non-resident agents.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Sends encoded envelope bytes toward the target agent.
    ///
    /// # Errors
    ///
    /// [`TransportError`] on routing or channel failure. The router logs and
    /// drops; it never retries.
    async fn send_envelope(&self, target: AgentId, envelope: Bytes) -> Result<(), TransportError>;

    /// Registers the callback that injects inbound envelopes into local
    /// streams. Later registrations replace earlier ones.
    fn register_local_delivery(&self, callback: InboundDelivery);
}

/// Transport for single-process runtimes: every send fails with no-route.
#[derive(Debug, Default)]
pub struct NullTransport;

#[async_trait]
impl RemoteTransport for NullTransport {
    async fn send_envelope(&self, target: AgentId, _envelope: Bytes) -> Result<(), TransportError> {
        Err(TransportError::NoRoute { agent_id: target })
    }

    fn register_local_delivery(&self, _callback: InboundDelivery) {}
}

/// Transport that decodes outbound envelopes and hands them straight back to
/// the registered local delivery. Exercises the full encode/decode path
/// without a network; useful for tests and single-process clusters.
#[derive(Default)]
pub struct LoopbackTransport {
    delivery: RwLock<Option<InboundDelivery>>,
}

impl LoopbackTransport {
    /// Creates an unwired loopback transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RemoteTransport for LoopbackTransport {
    async fn send_envelope(&self, target: AgentId, envelope: Bytes) -> Result<(), TransportError> {
        let callback = {
            let guard = self.delivery.read().map_err(|_| TransportError::NotWired)?;
            guard.clone()
        };
        let Some(callback) = callback else {
            return Err(TransportError::NotWired);
        };

        let decoded = wire::decode_envelope(&envelope)?;
        debug!(target = %target, envelope_id = %decoded.id(), "loopback delivery");
        callback(target, decoded);
        Ok(())
    }

    fn register_local_delivery(&self, callback: InboundDelivery) {
        if let Ok(mut guard) = self.delivery.write() {
            *guard = Some(callback);
        }
    }
}
