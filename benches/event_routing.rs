//! Benchmarks for envelope codec throughput and publish fan-out.

use std::hint::black_box;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use canopy::domain_types::AgentId;
use canopy::{
    Agent, AgentRuntime, Direction, EventEnvelope, HandlerRegistry, PublishOptions, RuntimeConfig,
    TypedPayload, wire,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Blob {
    data: Vec<u8>,
}

impl canopy::Payload for Blob {
    const TYPE_NAME: &'static str = "Blob";
}

/// Agent that absorbs envelopes without recording them.
struct Sink;

#[async_trait]
impl Agent for Sink {
    fn register_handlers(_registry: &mut HandlerRegistry<Self>) {}
}

fn sample_envelope(payload_size: usize) -> EventEnvelope {
    let payload = TypedPayload::new(
        "canopy.agents/Blob",
        Bytes::from(vec![0u8; payload_size]),
    );
    let origin = AgentId::generate();
    EventEnvelope::new(
        origin,
        payload,
        Direction::Both,
        PublishOptions::default(),
        1_712_000_000_000,
    )
    .forwarded(Direction::Down, origin, AgentId::generate())
}

fn bench_wire_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_codec");

    for payload_size in [64usize, 1024, 16_384] {
        let envelope = sample_envelope(payload_size);
        let bytes = wire::encode_envelope(&envelope);
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(
            BenchmarkId::new("encode", payload_size),
            &envelope,
            |b, envelope| b.iter(|| wire::encode_envelope(black_box(envelope))),
        );
        group.bench_with_input(
            BenchmarkId::new("decode", payload_size),
            &bytes,
            |b, bytes| b.iter(|| wire::decode_envelope(black_box(bytes)).expect("decode")),
        );
    }

    group.finish();
}

fn bench_publish_fanout(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");

    let (runtime, parent) = rt.block_on(async {
        let runtime = Arc::new(AgentRuntime::new(RuntimeConfig::production()));
        let parent = AgentId::generate();
        runtime
            .lifecycle()
            .get_or_activate(parent, |_| async { Ok(Sink) })
            .await
            .expect("activate parent");
        for _ in 0..8 {
            let child = AgentId::generate();
            runtime
                .lifecycle()
                .get_or_activate(child, |_| async { Ok(Sink) })
                .await
                .expect("activate child");
            runtime.lifecycle().add_child(parent, child).expect("link");
        }
        (runtime, parent)
    });

    c.bench_function("publish_down_8_children", |b| {
        b.iter(|| {
            rt.block_on(async {
                runtime
                    .publish(parent, &Blob { data: vec![0u8; 64] }, Direction::Down)
                    .await
                    .expect("publish")
            })
        });
    });
}

criterion_group!(benches, bench_wire_codec, bench_publish_fanout);
criterion_main!(benches);
