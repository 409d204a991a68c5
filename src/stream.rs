//! Per-agent envelope streams
//!
//! Exactly one bounded FIFO stream feeds each resident agent. Enqueueing is
//! non-blocking and rejects on backpressure; a single cooperative consumer
//! drains the queue, which is what gives the framework its
//! at-most-one-concurrent-delivery-per-agent guarantee.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{Notify, mpsc};

use crate::domain_types::{AgentId, StreamCapacity};
use crate::envelope::EventEnvelope;

/// Rejection reasons for a non-blocking enqueue.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The stream is at capacity.
    #[error("stream for agent {agent_id} is full")]
    BackpressureFull {
        /// Target agent.
        agent_id: AgentId,
    },

    /// The stream no longer accepts envelopes.
    #[error("stream for agent {agent_id} is closed")]
    Closed {
        /// Target agent.
        agent_id: AgentId,
    },
}

/// Cancellation signal shared between a consumer and its controller.
///
/// Triggering never interrupts an in-flight dispatch; the consumer observes
/// the signal between envelopes.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the signal, waking every waiter.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the signal has been tripped.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once the signal trips; immediately if it already has.
    pub async fn triggered(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Ingestion side of a per-agent stream.
#[derive(Debug)]
pub struct PerAgentStream {
    agent_id: AgentId,
    sender: Mutex<Option<mpsc::Sender<EventEnvelope>>>,
}

impl PerAgentStream {
    /// Creates a stream and its single consumer.
    #[must_use]
    pub fn channel(agent_id: AgentId, capacity: StreamCapacity) -> (Self, StreamConsumer) {
        let (sender, receiver) = mpsc::channel(capacity.as_usize());
        let stream = Self {
            agent_id,
            sender: Mutex::new(Some(sender)),
        };
        let consumer = StreamConsumer {
            agent_id,
            receiver,
            shutdown: ShutdownSignal::new(),
        };
        (stream, consumer)
    }

    /// Enqueues an envelope without blocking.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::BackpressureFull`] at capacity,
    /// [`EnqueueError::Closed`] after [`PerAgentStream::close`].
    pub fn try_enqueue(&self, envelope: EventEnvelope) -> Result<(), EnqueueError> {
        let agent_id = self.agent_id;
        let sender = {
            let guard = self.sender.lock().map_err(|_| EnqueueError::Closed { agent_id })?;
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(EnqueueError::Closed { agent_id });
        };
        sender.try_send(envelope).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => EnqueueError::BackpressureFull { agent_id },
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed { agent_id },
        })
    }

    /// Closes ingestion. Already-queued envelopes stay available to the
    /// consumer for draining.
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    /// Whether ingestion has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().map_or(true, |guard| guard.is_none())
    }
}

/// Single consumer of a per-agent stream.
#[derive(Debug)]
pub struct StreamConsumer {
    agent_id: AgentId,
    receiver: mpsc::Receiver<EventEnvelope>,
    shutdown: ShutdownSignal,
}

impl StreamConsumer {
    /// Agent this consumer serves.
    #[must_use]
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Shutdown handle for this consumer.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Receives the next envelope in FIFO order.
    ///
    /// Returns `None` once the shutdown signal trips (any drain tail is
    /// discarded) or after the stream closed and the queue drained.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        tokio::select! {
            biased;
            () = self.shutdown.triggered() => None,
            envelope = self.receiver.recv() => envelope,
        }
    }
}
