//! Event envelope: the propagation metadata wrapper around a typed payload
//!
//! An envelope carries one published payload through the agent hierarchy.
//! Identity is immutable; forwarding produces a copy with an incremented hop
//! count and an extended visited set. All mutation is functional.

use std::collections::HashSet;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain_types::{AgentId, EventId};

/// Hard ceiling on hop budgets; envelopes never travel further than this.
pub const HOP_CEILING: u32 = 100;

/// Hop budget substituted for absent or out-of-range caller overrides.
pub const DEFAULT_MAX_HOPS: u32 = 50;

/// Prefix of the type urls minted for payloads registered with this crate.
pub const TYPE_URL_PREFIX: &str = "canopy.agents";

/// Direction an envelope travels through the hierarchy.
///
/// `Both` is only meaningful at the origin: any forwarder splits it into
/// single-direction copies away from the arrival side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Toward the parent.
    Up,
    /// Toward the children.
    Down,
    /// Toward parent and children; origin only.
    Both,
}

impl Direction {
    /// Wire discriminant of this direction.
    #[must_use]
    pub fn as_wire(self) -> u8 {
        match self {
            Self::Up => 0,
            Self::Down => 1,
            Self::Both => 2,
        }
    }

    /// Decodes a wire discriminant; `None` for unknown values.
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Up),
            1 => Some(Self::Down),
            2 => Some(Self::Both),
            _ => None,
        }
    }
}

/// A message payload an agent can publish and handle.
///
/// `TYPE_NAME` is the stable schema identifier; it must never change once
/// events carrying it have been persisted or put on the wire.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type name, used as the final segment of the type url.
    const TYPE_NAME: &'static str;

    /// Full type url for this payload type.
    #[must_use]
    fn type_url() -> String {
        format!("{TYPE_URL_PREFIX}/{}", Self::TYPE_NAME)
    }
}

/// Binary payload value tagged with a type url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedPayload {
    type_url: String,
    value: Bytes,
}

impl TypedPayload {
    /// Wraps already-encoded bytes under the given type url.
    #[must_use]
    pub fn new(type_url: impl Into<String>, value: Bytes) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }

    /// Encodes a typed payload value.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn encode<P: Payload>(payload: &P) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_vec(payload)?;
        Ok(Self {
            type_url: P::type_url(),
            value: Bytes::from(value),
        })
    }

    /// Decodes the value as `P`; the caller is responsible for checking the
    /// type name first.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not deserialize as `P`.
    pub fn decode<P: Payload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_slice(&self.value)
    }

    /// Full type url.
    #[must_use]
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// Stable type name: the final `/`-segment of the type url.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.type_url
            .rsplit('/')
            .next()
            .unwrap_or(self.type_url.as_str())
    }

    /// Raw encoded value.
    #[must_use]
    pub fn value(&self) -> &Bytes {
        &self.value
    }
}

/// Optional knobs for a publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Correlation id preserved through propagation.
    pub correlation_id: Option<EventId>,
    /// Raw hop budget override; `0` and values above [`HOP_CEILING`] are
    /// coerced to [`DEFAULT_MAX_HOPS`].
    pub max_hop_count: Option<u32>,
}

/// Coerces a raw hop budget into the accepted range.
#[must_use]
pub fn coerce_max_hops(requested: u32) -> u32 {
    if requested == 0 || requested > HOP_CEILING {
        DEFAULT_MAX_HOPS
    } else {
        requested
    }
}

/// Canonical message container travelling through the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    id: EventId,
    correlation_id: Option<EventId>,
    publisher_id: AgentId,
    direction: Direction,
    payload: TypedPayload,
    current_hop_count: u32,
    max_hop_count: u32,
    visited_agents: HashSet<AgentId>,
    timestamp_millis: i64,
}

impl EventEnvelope {
    /// Creates a fresh envelope at its origin.
    ///
    /// The publisher is the first entry of the visited set; the hop count
    /// starts at zero and the hop budget is coerced per [`coerce_max_hops`].
    #[must_use]
    pub fn new(
        publisher_id: AgentId,
        payload: TypedPayload,
        direction: Direction,
        options: PublishOptions,
        timestamp_millis: i64,
    ) -> Self {
        let max_hop_count = coerce_max_hops(options.max_hop_count.unwrap_or(DEFAULT_MAX_HOPS));
        let mut visited_agents = HashSet::new();
        visited_agents.insert(publisher_id);

        Self {
            id: EventId::generate(),
            correlation_id: options.correlation_id,
            publisher_id,
            direction,
            payload,
            current_hop_count: 0,
            max_hop_count,
            visited_agents,
            timestamp_millis,
        }
    }

    /// Rebuilds an envelope from decoded wire fields. Used by codecs and
    /// transports; regular publication goes through [`EventEnvelope::new`].
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn from_wire_parts(
        id: EventId,
        correlation_id: Option<EventId>,
        publisher_id: AgentId,
        direction: Direction,
        payload: TypedPayload,
        current_hop_count: u32,
        max_hop_count: u32,
        visited_agents: HashSet<AgentId>,
        timestamp_millis: i64,
    ) -> Self {
        Self {
            id,
            correlation_id,
            publisher_id,
            direction,
            payload,
            current_hop_count,
            max_hop_count,
            visited_agents,
            timestamp_millis,
        }
    }

    /// Produces the copy delivered to `recipient` when `via` forwards this
    /// envelope: hop count incremented, forwarder and recipient recorded in
    /// the visited set, direction rewritten as the router decided.
    #[must_use]
    pub fn forwarded(&self, direction: Direction, via: AgentId, recipient: AgentId) -> Self {
        let mut copy = self.clone();
        copy.direction = direction;
        copy.current_hop_count = self.current_hop_count.saturating_add(1);
        copy.visited_agents.insert(via);
        copy.visited_agents.insert(recipient);
        copy
    }

    /// Envelope identity.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Correlation id, preserved through propagation.
    #[must_use]
    pub fn correlation_id(&self) -> Option<EventId> {
        self.correlation_id
    }

    /// Agent that originally published this envelope.
    #[must_use]
    pub fn publisher_id(&self) -> AgentId {
        self.publisher_id
    }

    /// Travel direction of this copy.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The typed payload.
    #[must_use]
    pub fn payload(&self) -> &TypedPayload {
        &self.payload
    }

    /// Hops taken so far.
    #[must_use]
    pub fn current_hop_count(&self) -> u32 {
        self.current_hop_count
    }

    /// Hop budget (already coerced).
    #[must_use]
    pub fn max_hop_count(&self) -> u32 {
        self.max_hop_count
    }

    /// Agents this envelope has passed through or been delivered to.
    #[must_use]
    pub fn visited_agents(&self) -> &HashSet<AgentId> {
        &self.visited_agents
    }

    /// Publication timestamp, milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    /// Whether the given agent is already in the visited set.
    #[must_use]
    pub fn has_visited(&self, agent_id: AgentId) -> bool {
        self.visited_agents.contains(&agent_id)
    }

    /// Effective hop limit: the coerced budget clamped at [`HOP_CEILING`].
    #[must_use]
    pub fn effective_hop_limit(&self) -> u32 {
        self.max_hop_count.min(HOP_CEILING)
    }

    /// Whether this copy has exhausted its hop budget and must be dropped.
    #[must_use]
    pub fn hop_exhausted(&self) -> bool {
        self.current_hop_count >= self.effective_hop_limit()
    }
}
