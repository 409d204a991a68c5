//! Canonical wire encoding for envelopes, state events, and snapshots
//!
//! The format is self-delimiting binary with stable field ordering: strings
//! and byte blobs are u32-length-prefixed, integers are fixed-width
//! little-endian, and collections are count-prefixed. Readers ignore unknown
//! trailing bytes, which is what allows fields to be appended later.

use std::collections::{BTreeMap, HashSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::domain_types::{AgentId, EventId};
use crate::envelope::{Direction, EventEnvelope, TYPE_URL_PREFIX, TypedPayload};
use crate::event_store::{Snapshot, StateEvent};

/// Errors raised while decoding wire bytes.
#[derive(Debug, Error)]
pub enum WireError {
    /// The buffer ended before a complete field was read.
    #[error("truncated record: needed {needed} more bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the current field still required.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A string field held invalid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// An identifier field was not a canonical UUID.
    #[error("invalid identifier: {text}")]
    InvalidId {
        /// The offending text.
        text: String,
    },

    /// The direction discriminant was not one of the known values.
    #[error("unknown direction discriminant: {value}")]
    UnknownDirection {
        /// The offending discriminant.
        value: u8,
    },
}

fn need(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, text: &str) {
    buf.put_u32_le(text.len() as u32);
    buf.put_slice(text.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_i64_le())
}

fn get_str(buf: &mut &[u8]) -> Result<String, WireError> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    let text = std::str::from_utf8(&buf[..len])
        .map_err(|_| WireError::InvalidUtf8)?
        .to_string();
    buf.advance(len);
    Ok(text)
}

fn get_bytes(buf: &mut &[u8]) -> Result<Bytes, WireError> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    let value = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(value)
}

fn get_agent_id(buf: &mut &[u8]) -> Result<AgentId, WireError> {
    let text = get_str(buf)?;
    AgentId::parse(&text).map_err(|_| WireError::InvalidId { text })
}

fn get_event_id(buf: &mut &[u8]) -> Result<EventId, WireError> {
    let text = get_str(buf)?;
    EventId::parse(&text).map_err(|_| WireError::InvalidId { text })
}

/// An absent optional id encodes as an empty string.
fn get_optional_event_id(buf: &mut &[u8]) -> Result<Option<EventId>, WireError> {
    let text = get_str(buf)?;
    if text.is_empty() {
        return Ok(None);
    }
    EventId::parse(&text)
        .map(Some)
        .map_err(|_| WireError::InvalidId { text })
}

fn put_optional_event_id(buf: &mut BytesMut, id: Option<EventId>) {
    match id {
        Some(id) => put_str(buf, &id.to_string()),
        None => put_str(buf, ""),
    }
}

/// Visited sets are encoded in sorted order so equal envelopes produce
/// identical bytes.
fn put_agent_set(buf: &mut BytesMut, agents: &HashSet<AgentId>) {
    let mut sorted: Vec<AgentId> = agents.iter().copied().collect();
    sorted.sort();
    buf.put_u32_le(sorted.len() as u32);
    for agent in sorted {
        put_str(buf, &agent.to_string());
    }
}

fn get_agent_set(buf: &mut &[u8]) -> Result<HashSet<AgentId>, WireError> {
    let count = get_u32(buf)? as usize;
    let mut agents = HashSet::with_capacity(count);
    for _ in 0..count {
        agents.insert(get_agent_id(buf)?);
    }
    Ok(agents)
}

fn put_metadata(buf: &mut BytesMut, metadata: &BTreeMap<String, String>) {
    buf.put_u32_le(metadata.len() as u32);
    for (key, value) in metadata {
        put_str(buf, key);
        put_str(buf, value);
    }
}

fn get_metadata(buf: &mut &[u8]) -> Result<BTreeMap<String, String>, WireError> {
    let count = get_u32(buf)? as usize;
    let mut metadata = BTreeMap::new();
    for _ in 0..count {
        let key = get_str(buf)?;
        let value = get_str(buf)?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

/// Encodes an envelope into its canonical wire form.
#[must_use]
pub fn encode_envelope(envelope: &EventEnvelope) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + envelope.payload().value().len());

    put_str(&mut buf, &envelope.id().to_string());
    put_optional_event_id(&mut buf, envelope.correlation_id());
    put_str(&mut buf, &envelope.publisher_id().to_string());
    buf.put_u8(envelope.direction().as_wire());
    put_str(&mut buf, envelope.payload().type_url());
    put_bytes(&mut buf, envelope.payload().value());
    buf.put_u32_le(envelope.current_hop_count());
    buf.put_u32_le(envelope.max_hop_count());
    put_agent_set(&mut buf, envelope.visited_agents());
    buf.put_i64_le(envelope.timestamp_millis());

    buf.freeze()
}

/// Decodes an envelope, ignoring any unknown trailing bytes.
///
/// # Errors
///
/// Returns a [`WireError`] when the record is truncated or a field is
/// malformed.
pub fn decode_envelope(mut bytes: &[u8]) -> Result<EventEnvelope, WireError> {
    let buf = &mut bytes;

    let id = get_event_id(buf)?;
    let correlation_id = get_optional_event_id(buf)?;
    let publisher_id = get_agent_id(buf)?;
    let direction_wire = get_u8(buf)?;
    let direction = Direction::from_wire(direction_wire).ok_or(WireError::UnknownDirection {
        value: direction_wire,
    })?;
    let type_url = get_str(buf)?;
    let value = get_bytes(buf)?;
    let current_hop_count = get_u32(buf)?;
    let max_hop_count = get_u32(buf)?;
    let visited_agents = get_agent_set(buf)?;
    let timestamp_millis = get_i64(buf)?;

    Ok(EventEnvelope::from_wire_parts(
        id,
        correlation_id,
        publisher_id,
        direction,
        TypedPayload::new(type_url, value),
        current_hop_count,
        max_hop_count,
        visited_agents,
        timestamp_millis,
    ))
}

/// Encodes a state event into its canonical wire form.
#[must_use]
pub fn encode_state_event(event: &StateEvent) -> Bytes {
    let mut buf = BytesMut::with_capacity(96 + event.event_data.len());

    put_str(&mut buf, &event.event_id.to_string());
    put_str(&mut buf, &event.agent_id.to_string());
    buf.put_u64_le(event.version);
    buf.put_i64_le(event.timestamp_millis);
    put_str(&mut buf, &event.event_type);
    put_str(&mut buf, &format!("{TYPE_URL_PREFIX}/{}", event.event_type));
    put_bytes(&mut buf, &event.event_data);
    put_metadata(&mut buf, &event.metadata);
    put_optional_event_id(&mut buf, event.correlation_id);

    buf.freeze()
}

/// Decodes a state event, ignoring any unknown trailing bytes.
///
/// # Errors
///
/// Returns a [`WireError`] when the record is truncated or a field is
/// malformed.
pub fn decode_state_event(mut bytes: &[u8]) -> Result<StateEvent, WireError> {
    let buf = &mut bytes;

    let event_id = get_event_id(buf)?;
    let agent_id = get_agent_id(buf)?;
    let version = get_u64(buf)?;
    let timestamp_millis = get_i64(buf)?;
    let event_type = get_str(buf)?;
    let _type_url = get_str(buf)?;
    let event_data = get_bytes(buf)?;
    let metadata = get_metadata(buf)?;
    let correlation_id = get_optional_event_id(buf)?;

    Ok(StateEvent {
        event_id,
        agent_id,
        version,
        timestamp_millis,
        event_type,
        event_data,
        metadata,
        correlation_id,
    })
}

/// Encodes a snapshot into its canonical wire form.
#[must_use]
pub fn encode_snapshot(snapshot: &Snapshot) -> Bytes {
    let mut buf = BytesMut::with_capacity(96 + snapshot.state_data.len());

    put_str(&mut buf, &snapshot.agent_id.to_string());
    buf.put_u64_le(snapshot.version);
    put_str(
        &mut buf,
        &format!("{TYPE_URL_PREFIX}/{}", snapshot.state_type),
    );
    put_bytes(&mut buf, &snapshot.state_data);
    buf.put_i64_le(snapshot.timestamp_millis);
    put_metadata(&mut buf, &snapshot.metadata);

    buf.freeze()
}

/// Decodes a snapshot, ignoring any unknown trailing bytes.
///
/// # Errors
///
/// Returns a [`WireError`] when the record is truncated or a field is
/// malformed.
pub fn decode_snapshot(mut bytes: &[u8]) -> Result<Snapshot, WireError> {
    let buf = &mut bytes;

    let agent_id = get_agent_id(buf)?;
    let version = get_u64(buf)?;
    let state_type_url = get_str(buf)?;
    let state_type = state_type_url
        .rsplit('/')
        .next()
        .unwrap_or(state_type_url.as_str())
        .to_string();
    let state_data = get_bytes(buf)?;
    let timestamp_millis = get_i64(buf)?;
    let metadata = get_metadata(buf)?;

    Ok(Snapshot {
        agent_id,
        version,
        state_type,
        state_data,
        timestamp_millis,
        metadata,
    })
}

/// Frames a sequence of state events as one storage-cell value.
#[must_use]
pub fn encode_event_log(events: &[StateEvent]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(events.len() as u32);
    for event in events {
        let record = encode_state_event(event);
        buf.put_u32_le(record.len() as u32);
        buf.put_slice(&record);
    }
    buf.freeze()
}

/// Decodes a framed sequence of state events.
///
/// # Errors
///
/// Returns a [`WireError`] when the framing or any record is malformed.
pub fn decode_event_log(mut bytes: &[u8]) -> Result<Vec<StateEvent>, WireError> {
    let buf = &mut bytes;
    let count = get_u32(buf)? as usize;
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        let len = get_u32(buf)? as usize;
        need(buf, len)?;
        events.push(decode_state_event(&buf[..len])?);
        buf.advance(len);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::PublishOptions;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn sample_envelope() -> EventEnvelope {
        let payload = TypedPayload::new("canopy.agents/Greeting", Bytes::from_static(b"{}"));
        let mut envelope = EventEnvelope::new(
            AgentId::generate(),
            payload,
            Direction::Both,
            PublishOptions {
                correlation_id: Some(EventId::generate()),
                max_hop_count: Some(12),
            },
            1_712_000_000_123,
        );
        envelope = envelope.forwarded(Direction::Up, envelope.publisher_id(), AgentId::generate());
        envelope
    }

    fn sample_state_event() -> StateEvent {
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), "test".to_string());
        metadata.insert("attempt".to_string(), "1".to_string());
        StateEvent {
            event_id: EventId::generate(),
            agent_id: AgentId::generate(),
            version: 42,
            timestamp_millis: 1_712_000_000_456,
            event_type: "Deposited".to_string(),
            event_data: Bytes::from_static(br#"{"amount":100}"#),
            metadata,
            correlation_id: None,
        }
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = sample_envelope();
        let bytes = encode_envelope(&envelope);
        let decoded = decode_envelope(&bytes).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn envelope_encoding_is_byte_stable() {
        let envelope = sample_envelope();
        let bytes = encode_envelope(&envelope);
        let reencoded = encode_envelope(&decode_envelope(&bytes).expect("decode"));
        assert_eq!(bytes, reencoded);
    }

    #[test]
    fn unknown_trailing_bytes_are_ignored() {
        let envelope = sample_envelope();
        let mut bytes = encode_envelope(&envelope).to_vec();
        bytes.extend_from_slice(b"future-field-bytes");
        let decoded = decode_envelope(&bytes).expect("decode with trailing bytes");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let bytes = encode_envelope(&sample_envelope());
        let truncated = &bytes[..bytes.len() - 4];
        assert!(matches!(
            decode_envelope(truncated),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_direction_is_rejected() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &EventId::generate().to_string());
        put_str(&mut buf, "");
        put_str(&mut buf, &AgentId::generate().to_string());
        buf.put_u8(9);
        assert!(matches!(
            decode_envelope(&buf),
            Err(WireError::UnknownDirection { value: 9 })
        ));
    }

    #[test]
    fn state_event_round_trips() {
        let event = sample_state_event();
        let bytes = encode_state_event(&event);
        let decoded = decode_state_event(&bytes).expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn snapshot_round_trips() {
        let snapshot = Snapshot {
            agent_id: AgentId::generate(),
            version: 10,
            state_type: "AccountState".to_string(),
            state_data: Bytes::from_static(br#"{"balance":450}"#),
            timestamp_millis: 1_712_000_000_789,
            metadata: BTreeMap::new(),
        };
        let bytes = encode_snapshot(&snapshot);
        let decoded = decode_snapshot(&bytes).expect("decode");
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn event_log_framing_round_trips() {
        let events = vec![sample_state_event(), sample_state_event()];
        let bytes = encode_event_log(&events);
        let decoded = decode_event_log(&bytes).expect("decode");
        assert_eq!(decoded, events);
    }

    fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<u128>().prop_map(Uuid::from_u128)
    }

    fn arb_direction() -> impl Strategy<Value = Direction> {
        prop_oneof![
            Just(Direction::Up),
            Just(Direction::Down),
            Just(Direction::Both),
        ]
    }

    prop_compose! {
        fn arb_envelope()(
            id in arb_uuid(),
            correlation in proptest::option::of(arb_uuid()),
            publisher in arb_uuid(),
            direction in arb_direction(),
            type_name in "[A-Za-z][A-Za-z0-9]{0,24}",
            value in proptest::collection::vec(any::<u8>(), 0..256),
            hops in 0u32..100,
            max_hops in 1u32..=100,
            visited in proptest::collection::hash_set(arb_uuid(), 0..8),
            timestamp in any::<i64>(),
        ) -> EventEnvelope {
            EventEnvelope::from_wire_parts(
                EventId::new(id),
                correlation.map(EventId::new),
                AgentId::new(publisher),
                direction,
                TypedPayload::new(format!("canopy.agents/{type_name}"), Bytes::from(value)),
                hops,
                max_hops,
                visited.into_iter().map(AgentId::new).collect(),
                timestamp,
            )
        }
    }

    proptest! {
        #[test]
        fn envelope_wire_round_trip_holds_for_all_canonical_values(envelope in arb_envelope()) {
            let bytes = encode_envelope(&envelope);
            let decoded = decode_envelope(&bytes).expect("decode");
            prop_assert_eq!(&decoded, &envelope);
            prop_assert_eq!(encode_envelope(&decoded), bytes);
        }
    }
}
