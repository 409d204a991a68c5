//! Handler registration and dispatch
//!
//! A registry is built once per agent type by an explicit registration step:
//! the type registers `(payload type, priority, handler fn)` tuples, plus
//! catch-all handlers that see the raw envelope. Registering a typed handler
//! also installs the decode function for its payload type, which is the only
//! way type names resolve to concrete payloads at dispatch time.

use std::any::Any;
use std::collections::HashMap;

use futures::future::BoxFuture;
use tracing::warn;

use crate::agent::AgentContext;
use crate::domain_types::HandlerPriority;
use crate::envelope::{EventEnvelope, Payload};

/// Future returned by agent handlers.
pub type HandlerFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;

/// A typed handler: receives the decoded payload.
pub type TypedHandlerFn<A, P> = for<'a> fn(&'a mut A, &'a AgentContext, P) -> HandlerFuture<'a>;

/// A catch-all handler: receives the raw envelope.
pub type EnvelopeHandlerFn<A> =
    for<'a> fn(&'a mut A, &'a AgentContext, &'a EventEnvelope) -> HandlerFuture<'a>;

type ErasedPayload = Box<dyn Any + Send>;
type DecodeFn = fn(&[u8]) -> Result<ErasedPayload, serde_json::Error>;
type TypedInvoker<A> = Box<
    dyn for<'a> Fn(&'a mut A, &'a AgentContext, ErasedPayload) -> HandlerFuture<'a> + Send + Sync,
>;

fn decode_erased<P: Payload>(bytes: &[u8]) -> Result<ErasedPayload, serde_json::Error> {
    let payload: P = serde_json::from_slice(bytes)?;
    Ok(Box::new(payload))
}

/// One handler failure captured during dispatch.
#[derive(Debug)]
pub struct HandlerFailure {
    /// Registered name of the failing handler.
    pub handler_name: String,
    /// The error the handler returned (or the decode mismatch).
    pub error: anyhow::Error,
}

enum HandlerBinding<A> {
    Typed {
        type_name: &'static str,
        invoke: TypedInvoker<A>,
    },
    CatchAll {
        invoke: EnvelopeHandlerFn<A>,
    },
}

struct HandlerEntry<A> {
    name: String,
    priority: HandlerPriority,
    /// Registration order; breaks priority ties stably.
    order: usize,
    binding: HandlerBinding<A>,
}

/// Ordered handler table for one agent type.
pub struct HandlerRegistry<A> {
    entries: Vec<HandlerEntry<A>>,
    decoders: HashMap<&'static str, DecodeFn>,
}

impl<A: 'static> Default for HandlerRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: 'static> HandlerRegistry<A> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            decoders: HashMap::new(),
        }
    }

    /// Registers a typed handler for payload type `P` and installs the
    /// decode function for `P`'s type name.
    pub fn on<P: Payload>(
        &mut self,
        name: impl Into<String>,
        priority: HandlerPriority,
        handler: TypedHandlerFn<A, P>,
    ) {
        self.decoders
            .insert(P::TYPE_NAME, decode_erased::<P> as DecodeFn);

        let invoke: TypedInvoker<A> = Box::new(move |agent, ctx, payload| {
            match payload.downcast::<P>() {
                Ok(payload) => handler(agent, ctx, *payload),
                Err(_) => Box::pin(async move {
                    Err(anyhow::anyhow!(
                        "decoded payload did not downcast as {}",
                        P::TYPE_NAME
                    ))
                }),
            }
        });

        let order = self.entries.len();
        self.entries.push(HandlerEntry {
            name: name.into(),
            priority,
            order,
            binding: HandlerBinding::Typed {
                type_name: P::TYPE_NAME,
                invoke,
            },
        });
    }

    /// Registers a catch-all handler that runs for every envelope, after the
    /// typed handlers.
    pub fn on_envelope(
        &mut self,
        name: impl Into<String>,
        priority: HandlerPriority,
        handler: EnvelopeHandlerFn<A>,
    ) {
        let order = self.entries.len();
        self.entries.push(HandlerEntry {
            name: name.into(),
            priority,
            order,
            binding: HandlerBinding::CatchAll { invoke: handler },
        });
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handlers have been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every matching handler for the envelope: typed handlers first,
    /// then catch-alls, each group in ascending priority with registration
    /// order breaking ties.
    ///
    /// Every handler runs inside its own error capture; one failure never
    /// stops the rest. Failures come back to the caller, which decides how
    /// to report them.
    pub(crate) async fn dispatch(
        &self,
        agent: &mut A,
        ctx: &AgentContext,
        envelope: &EventEnvelope,
    ) -> Vec<HandlerFailure> {
        let mut failures = Vec::new();
        let type_name = envelope.payload().type_name();

        let mut typed: Vec<&HandlerEntry<A>> = self
            .entries
            .iter()
            .filter(|entry| {
                matches!(&entry.binding, HandlerBinding::Typed { type_name: t, .. } if *t == type_name)
            })
            .collect();
        typed.sort_by_key(|entry| (entry.priority, entry.order));

        match self.decoders.get(type_name) {
            None => {
                warn!(
                    envelope_id = %envelope.id(),
                    payload_type = type_name,
                    "payload type is not known to this agent type; skipping typed handlers"
                );
            }
            Some(decode) => {
                for entry in typed {
                    let HandlerBinding::Typed { invoke, .. } = &entry.binding else {
                        continue;
                    };
                    match decode(envelope.payload().value()) {
                        Err(error) => {
                            warn!(
                                envelope_id = %envelope.id(),
                                payload_type = type_name,
                                %error,
                                "payload failed to decode; skipping typed handlers"
                            );
                            break;
                        }
                        Ok(payload) => {
                            if let Err(error) = invoke(&mut *agent, ctx, payload).await {
                                failures.push(HandlerFailure {
                                    handler_name: entry.name.clone(),
                                    error,
                                });
                            }
                        }
                    }
                }
            }
        }

        let mut catch_alls: Vec<&HandlerEntry<A>> = self
            .entries
            .iter()
            .filter(|entry| matches!(&entry.binding, HandlerBinding::CatchAll { .. }))
            .collect();
        catch_alls.sort_by_key(|entry| (entry.priority, entry.order));

        for entry in catch_alls {
            let HandlerBinding::CatchAll { invoke } = &entry.binding else {
                continue;
            };
            if let Err(error) = invoke(&mut *agent, ctx, envelope).await {
                failures.push(HandlerFailure {
                    handler_name: entry.name.clone(),
                    error,
                });
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentContext;
    use crate::domain_types::AgentId;
    use crate::envelope::{Direction, PublishOptions, TypedPayload};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        sequence: u32,
    }

    impl Payload for Ping {
        const TYPE_NAME: &'static str = "Ping";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pong;

    impl Payload for Pong {
        const TYPE_NAME: &'static str = "Pong";
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
        last_sequence: u32,
    }

    fn first<'a>(agent: &'a mut Recorder, _ctx: &'a AgentContext, ping: Ping) -> HandlerFuture<'a> {
        Box::pin(async move {
            agent.calls.push("first");
            agent.last_sequence = ping.sequence;
            Ok(())
        })
    }

    fn second<'a>(agent: &'a mut Recorder, _ctx: &'a AgentContext, _ping: Ping) -> HandlerFuture<'a> {
        Box::pin(async move {
            agent.calls.push("second");
            Ok(())
        })
    }

    fn failing<'a>(
        _agent: &'a mut Recorder,
        _ctx: &'a AgentContext,
        _ping: Ping,
    ) -> HandlerFuture<'a> {
        Box::pin(async move { Err(anyhow::anyhow!("boom")) })
    }

    fn observe<'a>(
        agent: &'a mut Recorder,
        _ctx: &'a AgentContext,
        _envelope: &'a EventEnvelope,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            agent.calls.push("observe");
            Ok(())
        })
    }

    fn ping_envelope() -> EventEnvelope {
        let payload = TypedPayload::encode(&Ping { sequence: 9 }).expect("encode");
        EventEnvelope::new(
            AgentId::generate(),
            payload,
            Direction::Down,
            PublishOptions::default(),
            0,
        )
    }

    #[tokio::test]
    async fn typed_handlers_run_in_priority_order_before_catch_alls() {
        let mut registry = HandlerRegistry::new();
        // Registered out of order on purpose; priority must win.
        registry.on_envelope("observe", HandlerPriority::from(0), observe);
        registry.on::<Ping>("second", HandlerPriority::from(2), second);
        registry.on::<Ping>("first", HandlerPriority::from(1), first);

        let mut agent = Recorder::default();
        let ctx = AgentContext::detached(AgentId::generate());
        let failures = registry.dispatch(&mut agent, &ctx, &ping_envelope()).await;

        assert!(failures.is_empty());
        assert_eq!(agent.calls, vec!["first", "second", "observe"]);
        assert_eq!(agent.last_sequence, 9);
    }

    #[tokio::test]
    async fn priority_ties_break_by_registration_order() {
        let mut registry = HandlerRegistry::new();
        registry.on::<Ping>("second", HandlerPriority::default(), second);
        registry.on::<Ping>("first", HandlerPriority::default(), first);

        let mut agent = Recorder::default();
        let ctx = AgentContext::detached(AgentId::generate());
        registry.dispatch(&mut agent, &ctx, &ping_envelope()).await;

        assert_eq!(agent.calls, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn handler_failure_does_not_stop_remaining_handlers() {
        let mut registry = HandlerRegistry::new();
        registry.on::<Ping>("failing", HandlerPriority::from(1), failing);
        registry.on::<Ping>("second", HandlerPriority::from(2), second);

        let mut agent = Recorder::default();
        let ctx = AgentContext::detached(AgentId::generate());
        let failures = registry.dispatch(&mut agent, &ctx, &ping_envelope()).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].handler_name, "failing");
        assert!(failures[0].error.to_string().contains("boom"));
        assert_eq!(agent.calls, vec!["second"]);
    }

    fn pong_noop<'a>(
        _agent: &'a mut Recorder,
        _ctx: &'a AgentContext,
        _pong: Pong,
    ) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    #[tokio::test]
    async fn unknown_payload_type_still_reaches_catch_alls() {
        let mut registry = HandlerRegistry::new();
        registry.on::<Pong>("pong", HandlerPriority::default(), pong_noop);
        registry.on_envelope("observe", HandlerPriority::default(), observe);

        let mut agent = Recorder::default();
        let ctx = AgentContext::detached(AgentId::generate());
        let failures = registry.dispatch(&mut agent, &ctx, &ping_envelope()).await;

        assert!(failures.is_empty());
        assert_eq!(agent.calls, vec!["observe"]);
    }

    #[tokio::test]
    async fn malformed_payload_skips_typed_handlers() {
        let mut registry = HandlerRegistry::new();
        registry.on::<Ping>("first", HandlerPriority::default(), first);
        registry.on_envelope("observe", HandlerPriority::default(), observe);

        let envelope = EventEnvelope::new(
            AgentId::generate(),
            TypedPayload::new(
                "canopy.agents/Ping",
                bytes::Bytes::from_static(b"not json"),
            ),
            Direction::Down,
            PublishOptions::default(),
            0,
        );

        let mut agent = Recorder::default();
        let ctx = AgentContext::detached(AgentId::generate());
        let failures = registry.dispatch(&mut agent, &ctx, &envelope).await;

        assert!(failures.is_empty());
        assert_eq!(agent.calls, vec!["observe"]);
    }
}
