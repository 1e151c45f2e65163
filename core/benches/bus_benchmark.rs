/// In-memory bus and routing benchmarks using Criterion
///
/// Run with: cargo bench --bench bus_benchmark
///
/// Benchmarks cover:
/// - Single publisher throughput on one inbox
/// - Wildcard fan-out to many subscribers
/// - Router send_dm (inbox + mirror) cost
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use multiverse_core::broker::{BrokerConnection, EventBus};
use multiverse_core::{AgentRegistry, Message, MessageKind, MessageRouter, SubjectScheme};
use std::sync::Arc;

fn payload(i: u64) -> Vec<u8> {
    Message::new("bench@example.com", "agent_roy", format!("payload {i}"), MessageKind::Dm)
        .unwrap()
        .to_bytes()
        .unwrap()
}

/// Benchmark: Single publisher, single inbox subscriber
fn bench_single_publisher(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_single_publisher");
    let scheme = SubjectScheme::default();
    let inbox = scheme.inbox("roy").unwrap();

    for count in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            b.iter(|| {
                rt.block_on(async {
                    let bus = EventBus::new("bench");
                    let (_id, mut rx) = bus.subscribe(&inbox);

                    let consumer = tokio::spawn(async move {
                        let mut received = 0;
                        while rx.recv().await.is_some() {
                            received += 1;
                            if received >= count {
                                break;
                            }
                        }
                    });

                    for i in 0..count {
                        bus.publish(inbox.as_str(), payload(i)).await;
                    }
                    consumer.await.unwrap();
                })
            });
        });
    }

    group.finish();
}

/// Benchmark: One publication matched by N wildcard subscribers
fn bench_wildcard_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus_wildcard_fanout");
    let scheme = SubjectScheme::default();
    let event_count = 500u64;

    for subs in [2usize, 5, 10].iter() {
        group.throughput(Throughput::Elements(event_count * *subs as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{subs}_subs")),
            subs,
            |b, &subs| {
                let rt = tokio::runtime::Runtime::new().unwrap();
                b.iter(|| {
                    rt.block_on(async {
                        let bus = EventBus::new("bench");
                        let mut consumers = Vec::with_capacity(subs);
                        for _ in 0..subs {
                            let (_id, mut rx) = bus.subscribe(&scheme.all_inboxes());
                            consumers.push(tokio::spawn(async move {
                                for _ in 0..event_count {
                                    if rx.recv().await.is_none() {
                                        break;
                                    }
                                }
                            }));
                        }

                        let inbox = scheme.inbox("moss").unwrap();
                        for i in 0..event_count {
                            bus.publish(inbox.as_str(), payload(i)).await;
                        }
                        for consumer in consumers {
                            consumer.await.unwrap();
                        }
                    })
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Router send_dm latency with nobody listening
fn bench_send_dm(c: &mut Criterion) {
    let mut group = c.benchmark_group("router_send_dm");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = MessageRouter::new(
        Arc::new(BrokerConnection::in_memory(Arc::new(EventBus::new("bench")))),
        Arc::new(AgentRegistry::stock()),
        SubjectScheme::default(),
    );

    group.bench_function("single_dm", |b| {
        b.iter(|| {
            rt.block_on(async {
                let msg = router.send_dm("bench@example.com", "sylvia", "ping").await.unwrap();
                black_box(msg);
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_publisher,
    bench_wildcard_fanout,
    bench_send_dm,
);
criterion_main!(benches);
