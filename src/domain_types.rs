//! Domain types for the canopy agent framework
//!
//! This module defines strongly-typed domain values to prevent primitive
//! obsession and improve type safety throughout the codebase.

use nutype::nutype;
use uuid::Uuid;

/// Unique identifier for an agent, stable across activations.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct AgentId(Uuid);

impl AgentId {
    /// Creates a new random agent ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Parses an agent ID from its canonical text form
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid UUID string.
    pub fn parse(text: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(text).map(Self::new)
    }

    /// Gets the underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.into_inner()
    }
}

/// Globally unique identifier for an event or envelope
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Parses an event ID from its canonical text form
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid UUID string.
    pub fn parse(text: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(text).map(Self::new)
    }

    /// Gets the underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.into_inner()
    }
}

/// Bounded capacity of a per-agent envelope stream
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct StreamCapacity(usize);

impl StreamCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Bound of the per-agent dedup cache (oldest-out eviction)
#[nutype(
    validate(greater_or_equal = 16, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct DedupCacheCapacity(usize);

impl DedupCacheCapacity {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Default hop budget assigned to envelopes whose publisher did not override it
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 50
)]
pub struct MaxHops(u32);

impl MaxHops {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Execution priority of a handler; lower values execute first.
///
/// The default places a handler after every explicitly prioritised one.
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 2_147_483_647
)]
pub struct HandlerPriority(i32);

impl HandlerPriority {
    /// Gets the value as i32
    #[must_use]
    pub fn as_i32(&self) -> i32 {
        self.into_inner()
    }
}

/// Version interval between snapshots for interval-based snapshot policies
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 100
)]
pub struct SnapshotInterval(u64);

impl SnapshotInterval {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_round_trips_through_canonical_text() {
        let id = AgentId::generate();
        let parsed = AgentId::parse(&id.to_string()).expect("canonical text should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn stream_capacity_rejects_zero() {
        assert!(StreamCapacity::try_new(0).is_err());
        assert_eq!(StreamCapacity::default().as_usize(), 1000);
    }

    #[test]
    fn dedup_cache_capacity_defaults_to_ten_thousand() {
        assert_eq!(DedupCacheCapacity::default().as_usize(), 10_000);
    }

    #[test]
    fn max_hops_rejects_values_over_ceiling() {
        assert!(MaxHops::try_new(101).is_err());
        assert_eq!(MaxHops::default().as_u32(), 50);
    }

    #[test]
    fn handler_priority_defaults_after_explicit_priorities() {
        assert!(HandlerPriority::from(0) < HandlerPriority::default());
    }
}
