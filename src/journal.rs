//! Event-sourced state: staging, confirmation, and replay
//!
//! A [`Journal`] is composed into a concrete agent (no inheritance): the
//! agent raises typed events into the pending batch, confirms them to the
//! store, and replays snapshot-plus-log on activation. State only ever
//! changes through the registered pure transitions, after durability.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain_types::{AgentId, EventId, SnapshotInterval};
use crate::envelope::Payload;
use crate::event_store::{EventRange, EventStore, EventStoreError, Snapshot, StateEvent};
use crate::time_provider::{SharedTimeProvider, system_time_provider};

/// State of an event-sourced agent: a value with a canonical serialized
/// form, rebuilt purely from its event log.
pub trait JournalState:
    Clone + Default + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static
{
    /// Stable name of the state schema, recorded with snapshots.
    const STATE_NAME: &'static str;
}

type Applier<S> = Box<dyn Fn(S, &StateEvent) -> Result<S, serde_json::Error> + Send + Sync>;

/// Table of pure transition functions, keyed by event type name.
///
/// Doubles as the replay-time decode registry: registering a transition for
/// `P` is what makes `P`'s type name resolvable.
pub struct StateTransitions<S> {
    appliers: HashMap<&'static str, Applier<S>>,
}

impl<S: 'static> Default for StateTransitions<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> StateTransitions<S> {
    /// Creates an empty transition table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            appliers: HashMap::new(),
        }
    }

    /// Registers the pure transition for event type `P`.
    ///
    /// The function must be deterministic, free of I/O, and idempotent for
    /// identical `(state, event)` input; that is what makes replay safe.
    pub fn on<P: Payload>(&mut self, apply: fn(S, P) -> S) {
        self.appliers.insert(
            P::TYPE_NAME,
            Box::new(move |state, event| {
                let payload: P = serde_json::from_slice(&event.event_data)?;
                Ok(apply(state, payload))
            }),
        );
    }

    /// Applies one event. Unknown types and undecodable payloads are
    /// absorbed with a warning and leave the state unchanged, which is the
    /// semantically neutral outcome for pure transitions.
    pub(crate) fn apply(&self, state: S, event: &StateEvent) -> S
    where
        S: Clone,
    {
        let Some(applier) = self.appliers.get(event.event_type.as_str()) else {
            warn!(
                agent_id = %event.agent_id,
                event_type = event.event_type,
                version = event.version,
                "no transition registered for event type; skipping"
            );
            return state;
        };
        // The applier consumes the state, so keep a fallback for the error
        // path via Clone.
        match applier(state.clone(), event) {
            Ok(next) => next,
            Err(error) => {
                warn!(
                    agent_id = %event.agent_id,
                    event_type = event.event_type,
                    version = event.version,
                    %error,
                    "event payload failed to decode; skipping"
                );
                state
            }
        }
    }

    /// Whether a transition is registered for the type name.
    #[must_use]
    pub fn resolves(&self, event_type: &str) -> bool {
        self.appliers.contains_key(event_type)
    }
}

/// Decides when a confirmed version warrants a snapshot.
pub trait SnapshotPolicy: Send + Sync {
    /// Consulted after each successful confirmation.
    fn should_snapshot(&mut self, version: u64) -> bool;
}

/// Never snapshots; replay always folds the full log.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSnapshot;

impl SnapshotPolicy for NeverSnapshot {
    fn should_snapshot(&mut self, _version: u64) -> bool {
        false
    }
}

/// Snapshots every `N` versions.
#[derive(Debug, Clone, Copy)]
pub struct IntervalPolicy {
    every: SnapshotInterval,
}

impl IntervalPolicy {
    /// Creates a policy snapshotting when `version % every == 0`.
    #[must_use]
    pub fn new(every: SnapshotInterval) -> Self {
        Self { every }
    }
}

impl SnapshotPolicy for IntervalPolicy {
    fn should_snapshot(&mut self, version: u64) -> bool {
        version % self.every.as_u64() == 0
    }
}

/// Snapshots every `N` versions or whenever the last snapshot is older than
/// `max_age`, whichever comes first.
pub struct HybridPolicy {
    every: SnapshotInterval,
    max_age: Duration,
    last_snapshot: SystemTime,
    time: SharedTimeProvider,
}

impl HybridPolicy {
    /// Creates a hybrid policy on the system clock.
    #[must_use]
    pub fn new(every: SnapshotInterval, max_age: Duration) -> Self {
        Self::with_time_provider(every, max_age, system_time_provider())
    }

    /// Creates a hybrid policy on an explicit clock.
    #[must_use]
    pub fn with_time_provider(
        every: SnapshotInterval,
        max_age: Duration,
        time: SharedTimeProvider,
    ) -> Self {
        let last_snapshot = time.now();
        Self {
            every,
            max_age,
            last_snapshot,
            time,
        }
    }
}

impl SnapshotPolicy for HybridPolicy {
    fn should_snapshot(&mut self, version: u64) -> bool {
        let now = self.time.now();
        let aged = now
            .duration_since(self.last_snapshot)
            .map_or(false, |elapsed| elapsed >= self.max_age);
        let due = version % self.every.as_u64() == 0 || aged;
        if due {
            self.last_snapshot = now;
        }
        due
    }
}

/// Errors raised while staging an event.
#[derive(Debug, Error)]
pub enum RaiseError {
    /// The payload failed to serialize.
    #[error("event payload failed to encode: {source}")]
    Encoding {
        /// Serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Event-sourced core composed into a concrete agent.
pub struct Journal<S: JournalState> {
    agent_id: AgentId,
    store: Option<Arc<dyn EventStore>>,
    transitions: StateTransitions<S>,
    state: S,
    version: u64,
    pending: Vec<StateEvent>,
    policy: Box<dyn SnapshotPolicy>,
    time: SharedTimeProvider,
}

impl<S: JournalState> Journal<S> {
    /// Creates a journal with zero state and no store bound.
    #[must_use]
    pub fn new(agent_id: AgentId, transitions: StateTransitions<S>) -> Self {
        Self {
            agent_id,
            store: None,
            transitions,
            state: S::default(),
            version: 0,
            pending: Vec::new(),
            policy: Box::new(IntervalPolicy::new(SnapshotInterval::default())),
            time: system_time_provider(),
        }
    }

    /// Binds the event store confirmation persists to.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the snapshot policy.
    #[must_use]
    pub fn with_snapshot_policy(mut self, policy: impl SnapshotPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_time_provider(mut self, time: SharedTimeProvider) -> Self {
        self.time = time;
        self
    }

    /// Agent this journal belongs to.
    #[must_use]
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Current state. Only [`Journal::confirm`] and [`Journal::replay`]
    /// change it.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Version of the last confirmed event.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of staged, unconfirmed events.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    /// Stages an event with a provisional version. Never mutates state.
    ///
    /// # Errors
    ///
    /// [`RaiseError`] when the payload fails to serialize.
    pub fn raise<P: Payload>(&mut self, payload: &P) -> Result<EventId, RaiseError> {
        self.raise_with(payload, BTreeMap::new(), None)
    }

    /// Stages an event with metadata and a correlation id.
    ///
    /// # Errors
    ///
    /// [`RaiseError`] when the payload fails to serialize.
    pub fn raise_with<P: Payload>(
        &mut self,
        payload: &P,
        metadata: BTreeMap<String, String>,
        correlation_id: Option<EventId>,
    ) -> Result<EventId, RaiseError> {
        let event_id = EventId::generate();
        let provisional_version = self.version + self.pending.len() as u64 + 1;
        let event = StateEvent {
            event_id,
            agent_id: self.agent_id,
            version: provisional_version,
            timestamp_millis: self.time.now_millis(),
            event_type: P::TYPE_NAME.to_string(),
            event_data: Bytes::from(serde_json::to_vec(payload)?),
            metadata,
            correlation_id,
        };
        self.pending.push(event);
        Ok(event_id)
    }

    /// Commits the pending batch, applies it to the state, and consults the
    /// snapshot policy. A no-op when nothing is staged.
    ///
    /// On a concurrency conflict the pending events stay staged and the
    /// state is untouched; the caller reloads and retries under its own
    /// policy. The call is not cancellable mid-batch: once the append is
    /// issued its outcome is awaited.
    ///
    /// # Errors
    ///
    /// [`EventStoreError`] from the append; snapshot failures are absorbed
    /// with a warning.
    pub async fn confirm(&mut self) -> Result<u64, EventStoreError> {
        if self.pending.is_empty() {
            return Ok(self.version);
        }
        let Some(store) = self.store.clone() else {
            warn!(
                agent_id = %self.agent_id,
                staged = self.pending.len(),
                "no event store bound; discarding staged events"
            );
            self.pending.clear();
            return Ok(self.version);
        };

        let batch = self.pending.clone();
        let new_version = store
            .append_events(self.agent_id, batch, self.version)
            .await?;

        // Durability first, then the visible state change.
        for event in &self.pending {
            self.state = self
                .transitions
                .apply(std::mem::take(&mut self.state), event);
            self.version = event.version;
        }
        debug_assert_eq!(self.version, new_version);
        self.version = new_version;
        self.pending.clear();

        if self.policy.should_snapshot(self.version) {
            self.save_snapshot(&store).await;
        }

        Ok(new_version)
    }

    async fn save_snapshot(&self, store: &Arc<dyn EventStore>) {
        let state_data = match serde_json::to_vec(&self.state) {
            Ok(bytes) => Bytes::from(bytes),
            Err(error) => {
                warn!(
                    agent_id = %self.agent_id,
                    %error,
                    "state failed to serialize; snapshot skipped"
                );
                return;
            }
        };
        let snapshot = Snapshot {
            agent_id: self.agent_id,
            version: self.version,
            state_type: S::STATE_NAME.to_string(),
            state_data,
            timestamp_millis: self.time.now_millis(),
            metadata: BTreeMap::new(),
        };
        if let Err(error) = store.save_snapshot(snapshot).await {
            warn!(
                agent_id = %self.agent_id,
                version = self.version,
                %error,
                "snapshot save failed; continuing without it"
            );
        }
    }

    /// Rebuilds state from the latest snapshot plus trailing events.
    ///
    /// Invoked on activation; calling it again yields the identical state
    /// and version.
    ///
    /// # Errors
    ///
    /// [`EventStoreError`] from the store reads. A corrupt snapshot is
    /// absorbed: replay falls back to folding the full log.
    pub async fn replay(&mut self) -> Result<(), EventStoreError> {
        let Some(store) = self.store.clone() else {
            warn!(agent_id = %self.agent_id, "no event store bound; nothing to replay");
            return Ok(());
        };

        self.state = S::default();
        self.version = 0;

        if let Some(snapshot) = store.latest_snapshot(self.agent_id).await? {
            match serde_json::from_slice::<S>(&snapshot.state_data) {
                Ok(state) => {
                    self.state = state;
                    self.version = snapshot.version;
                }
                Err(error) => {
                    warn!(
                        agent_id = %self.agent_id,
                        snapshot_version = snapshot.version,
                        %error,
                        "snapshot failed to decode; replaying the full log"
                    );
                }
            }
        }

        let events = store
            .events(self.agent_id, EventRange::from(self.version + 1))
            .await?;
        let replayed = events.len();
        for event in &events {
            self.state = self
                .transitions
                .apply(std::mem::take(&mut self.state), event);
            self.version = event.version;
        }
        debug!(
            agent_id = %self.agent_id,
            version = self.version,
            replayed,
            "replay complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::time_provider::ManualTimeProvider;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct CounterState {
        count: i64,
    }

    impl JournalState for CounterState {
        const STATE_NAME: &'static str = "CounterState";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Incremented {
        by: i64,
    }

    impl Payload for Incremented {
        const TYPE_NAME: &'static str = "Incremented";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Decremented {
        by: i64,
    }

    impl Payload for Decremented {
        const TYPE_NAME: &'static str = "Decremented";
    }

    fn transitions() -> StateTransitions<CounterState> {
        let mut transitions: StateTransitions<CounterState> = StateTransitions::new();
        transitions.on::<Incremented>(|state, event| CounterState {
            count: state.count + event.by,
        });
        transitions.on::<Decremented>(|state, event| CounterState {
            count: state.count - event.by,
        });
        transitions
    }

    fn journal(store: &Arc<InMemoryEventStore>) -> Journal<CounterState> {
        Journal::new(AgentId::generate(), transitions())
            .with_store(Arc::clone(store) as Arc<dyn EventStore>)
    }

    #[tokio::test]
    async fn raise_stages_without_mutating_state() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut journal = journal(&store);

        journal.raise(&Incremented { by: 5 }).expect("raise");
        journal.raise(&Incremented { by: 7 }).expect("raise");

        assert_eq!(journal.state().count, 0);
        assert_eq!(journal.version(), 0);
        assert_eq!(journal.pending_events(), 2);
    }

    #[tokio::test]
    async fn confirm_persists_then_applies_in_order() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut journal = journal(&store);
        let agent_id = journal.agent_id();

        journal.raise(&Incremented { by: 5 }).expect("raise");
        journal.raise(&Decremented { by: 2 }).expect("raise");
        let version = journal.confirm().await.expect("confirm");

        assert_eq!(version, 2);
        assert_eq!(journal.state().count, 3);
        assert_eq!(journal.pending_events(), 0);
        assert_eq!(store.latest_version(agent_id).await.expect("version"), 2);
    }

    #[tokio::test]
    async fn confirm_with_empty_pending_is_a_no_op() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut journal = journal(&store);
        assert_eq!(journal.confirm().await.expect("confirm"), 0);
    }

    #[tokio::test]
    async fn confirm_without_store_warns_and_clears() {
        let mut journal = Journal::new(AgentId::generate(), transitions());
        journal.raise(&Incremented { by: 1 }).expect("raise");
        assert_eq!(journal.confirm().await.expect("confirm"), 0);
        assert_eq!(journal.pending_events(), 0);
        assert_eq!(journal.state().count, 0);
    }

    #[tokio::test]
    async fn conflict_leaves_pending_staged_and_state_untouched() {
        let store = Arc::new(InMemoryEventStore::new());
        let agent_id = AgentId::generate();
        let mut left = Journal::new(agent_id, transitions())
            .with_store(Arc::clone(&store) as Arc<dyn EventStore>);
        let mut right = Journal::new(agent_id, transitions())
            .with_store(Arc::clone(&store) as Arc<dyn EventStore>);

        left.raise(&Incremented { by: 1 }).expect("raise");
        left.confirm().await.expect("confirm");

        right.raise(&Incremented { by: 9 }).expect("raise");
        let result = right.confirm().await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
        assert_eq!(right.pending_events(), 1);
        assert_eq!(right.state().count, 0);

        // Reload and retry, the caller's policy.
        right.replay().await.expect("replay");
        assert_eq!(right.version(), 1);
        // Provisional versions are reassigned relative to the new version.
        right.pending.clear();
        right.raise(&Incremented { by: 9 }).expect("raise");
        assert_eq!(right.confirm().await.expect("confirm"), 2);
        assert_eq!(right.state().count, 10);
    }

    #[tokio::test]
    async fn replay_equals_folding_the_full_log_from_zero() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut journal = journal(&store);
        let agent_id = journal.agent_id();

        for by in 1..=6 {
            journal.raise(&Incremented { by }).expect("raise");
            journal.confirm().await.expect("confirm");
        }

        let mut fresh = Journal::new(agent_id, transitions())
            .with_store(Arc::clone(&store) as Arc<dyn EventStore>);
        fresh.replay().await.expect("replay");

        assert_eq!(fresh.version(), journal.version());
        assert_eq!(fresh.state(), journal.state());

        // Replaying twice yields identical state and version.
        fresh.replay().await.expect("replay");
        assert_eq!(fresh.version(), 6);
        assert_eq!(fresh.state().count, 21);
    }

    #[tokio::test]
    async fn unknown_event_types_skip_but_advance_the_version() {
        let store = Arc::new(InMemoryEventStore::new());
        let agent_id = AgentId::generate();

        // A log written by a schema this replica does not know.
        let foreign = StateEvent {
            event_id: EventId::generate(),
            agent_id,
            version: 0,
            timestamp_millis: 0,
            event_type: "Renamed".to_string(),
            event_data: Bytes::from_static(b"{}"),
            metadata: BTreeMap::new(),
            correlation_id: None,
        };
        let known = StateEvent {
            event_id: EventId::generate(),
            agent_id,
            version: 0,
            timestamp_millis: 0,
            event_type: "Incremented".to_string(),
            event_data: Bytes::from_static(br#"{"by":4}"#),
            metadata: BTreeMap::new(),
            correlation_id: None,
        };
        store
            .append_events(agent_id, vec![foreign, known], 0)
            .await
            .expect("append");

        let mut journal = Journal::new(agent_id, transitions())
            .with_store(Arc::clone(&store) as Arc<dyn EventStore>);
        journal.replay().await.expect("replay");

        assert_eq!(journal.version(), 2);
        assert_eq!(journal.state().count, 4);
    }

    #[tokio::test]
    async fn interval_policy_snapshots_on_the_interval() {
        let store = Arc::new(InMemoryEventStore::new());
        let agent_id = AgentId::generate();
        let mut journal = Journal::new(agent_id, transitions())
            .with_store(Arc::clone(&store) as Arc<dyn EventStore>)
            .with_snapshot_policy(IntervalPolicy::new(
                SnapshotInterval::try_new(3).expect("interval"),
            ));

        for by in 1..=4 {
            journal.raise(&Incremented { by }).expect("raise");
            journal.confirm().await.expect("confirm");
        }

        let snapshot = store
            .latest_snapshot(agent_id)
            .await
            .expect("read")
            .expect("snapshot at version 3");
        assert_eq!(snapshot.version, 3);
        assert_eq!(snapshot.state_type, "CounterState");
    }

    #[tokio::test]
    async fn hybrid_policy_triggers_on_age() {
        let clock = Arc::new(ManualTimeProvider::new());
        let mut policy = HybridPolicy::with_time_provider(
            SnapshotInterval::try_new(1_000).expect("interval"),
            Duration::from_secs(60),
            Arc::clone(&clock) as SharedTimeProvider,
        );

        assert!(!policy.should_snapshot(1));
        clock.advance(Duration::from_secs(61));
        assert!(policy.should_snapshot(2));
        // The trigger recorded the snapshot time; the next version is fresh.
        assert!(!policy.should_snapshot(3));
    }
}
