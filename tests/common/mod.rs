//! Shared probe agents and helpers for the end-to-end tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use canopy::domain_types::AgentId;
use canopy::{
    Agent, AgentContext, AgentHandle, AgentRuntime, Direction, EventEnvelope, HandlerFuture,
    HandlerPriority, HandlerRegistry,
};
use serde::{Deserialize, Serialize};

/// One observed dispatch at a probe agent.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub agent_id: AgentId,
    pub envelope_id: canopy::EventId,
    pub publisher_id: AgentId,
    pub payload_type: String,
    pub direction: Direction,
    pub hop_count: u32,
    pub max_hop_count: u32,
    pub visited: HashSet<AgentId>,
}

pub type DeliveryLog = Arc<Mutex<Vec<Delivery>>>;

pub fn delivery_log() -> DeliveryLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Agent that records every envelope it is dispatched.
pub struct Probe {
    pub deliveries: DeliveryLog,
}

fn record<'a>(
    agent: &'a mut Probe,
    ctx: &'a AgentContext,
    envelope: &'a EventEnvelope,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        agent.deliveries.lock().unwrap().push(Delivery {
            agent_id: ctx.agent_id(),
            envelope_id: envelope.id(),
            publisher_id: envelope.publisher_id(),
            payload_type: envelope.payload().type_name().to_string(),
            direction: envelope.direction(),
            hop_count: envelope.current_hop_count(),
            max_hop_count: envelope.max_hop_count(),
            visited: envelope.visited_agents().clone(),
        });
        Ok(())
    })
}

#[async_trait]
impl Agent for Probe {
    fn register_handlers(registry: &mut HandlerRegistry<Self>) {
        registry.on_envelope("record", HandlerPriority::default(), record);
    }
}

/// Activates a probe agent that appends into `log`.
pub async fn activate_probe(runtime: &AgentRuntime, id: AgentId, log: &DeliveryLog) -> AgentHandle {
    let log = Arc::clone(log);
    runtime
        .lifecycle()
        .get_or_activate(id, move |_| async move { Ok(Probe { deliveries: log }) })
        .await
        .expect("probe activation should succeed")
}

/// Polls `check` until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + deadline;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Grace period for asserting that nothing further arrives.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

pub fn deliveries_for(log: &DeliveryLog, agent_id: AgentId) -> Vec<Delivery> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|delivery| delivery.agent_id == agent_id)
        .cloned()
        .collect()
}

pub fn total_deliveries(log: &DeliveryLog) -> usize {
    log.lock().unwrap().len()
}

/// Plain broadcast payload used by the propagation scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
}

impl canopy::Payload for Note {
    const TYPE_NAME: &'static str = "Note";
}

impl Note {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}
