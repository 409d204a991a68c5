//! # Canopy: hierarchical agents with directional event propagation
//!
//! Canopy is a library for building trees of stateful, single-threaded
//! agents that communicate by typed events. Envelopes propagate UP toward
//! parents, DOWN toward children, or BOTH from their origin, with hop
//! limits, loop prevention, and per-agent deduplication. Agents that need
//! durable state compose an event-sourced [`Journal`](journal::Journal)
//! with batched optimistic appends, snapshots, and replay-on-activation.
//!
//! ## Architecture
//!
//! - [`envelope`]: the canonical message container and its wire-stable
//!   metadata (direction, hops, visited set, correlation).
//! - [`stream`]: one bounded FIFO stream per agent with a single cooperative
//!   consumer, which is the framework's only ordering guarantee.
//! - [`handlers`]: explicit per-type handler registration with priorities
//!   and catch-alls; every handler runs fault-isolated.
//! - [`router`]: envelope construction, directional fan-out, the anti-cycle
//!   rule, and best-effort delivery under backpressure.
//! - [`lifecycle`]: idempotent activation, graceful deactivation, and
//!   single-writer hierarchy mutation.
//! - [`event_store`]: the append-with-expected-version port with in-memory,
//!   storage-cell, and SQLite implementations.
//! - [`journal`]: pending-event staging, confirmation, snapshot policies,
//!   and replay for event-sourced agents.
//! - [`transport`]: the port toward agents resident elsewhere.
//!
//! ## Example
//!
//! ```rust,no_run
//! use canopy::{AgentRuntime, Direction, RuntimeConfig};
//! use canopy::domain_types::AgentId;
//!
//! # use canopy::{Agent, HandlerRegistry};
//! # struct Sensor;
//! # #[async_trait::async_trait]
//! # impl Agent for Sensor {
//! #     fn register_handlers(_registry: &mut HandlerRegistry<Self>) {}
//! # }
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Reading { celsius: f64 }
//! # impl canopy::Payload for Reading { const TYPE_NAME: &'static str = "Reading"; }
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let runtime = AgentRuntime::new(RuntimeConfig::development());
//! let sensor = AgentId::generate();
//! runtime
//!     .lifecycle()
//!     .get_or_activate(sensor, |_| async { Ok(Sensor) })
//!     .await?;
//! runtime
//!     .publish(sensor, &Reading { celsius: 21.5 }, Direction::Up)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod domain_types;
pub mod envelope;
pub mod event_store;
pub mod handlers;
pub mod journal;
pub mod lifecycle;
pub mod observability;
pub mod router;
pub mod runtime;
pub mod stream;
pub mod time_provider;
pub mod transport;
pub mod wire;

pub use agent::{Agent, AgentContext, EventHandlerExceptionEvent};
pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use domain_types::{AgentId, EventId, HandlerPriority};
pub use envelope::{Direction, EventEnvelope, Payload, PublishOptions, TypedPayload};
pub use event_store::{EventRange, EventStore, EventStoreError, Snapshot, StateEvent};
pub use handlers::{EnvelopeHandlerFn, HandlerFuture, HandlerRegistry, TypedHandlerFn};
pub use journal::{
    HybridPolicy, IntervalPolicy, Journal, JournalState, NeverSnapshot, SnapshotPolicy,
    StateTransitions,
};
pub use lifecycle::{AgentHandle, Hierarchy, LifecycleManager, LifecycleState};
pub use router::{PublishError, Router};
pub use runtime::AgentRuntime;
pub use stream::{EnqueueError, PerAgentStream, ShutdownSignal};
pub use transport::{LoopbackTransport, NullTransport, RemoteTransport};
