//! Routing and State Benchmarks
//!
//! Measures the hot paths of a supervisor turn:
//! - Session construction and turn append
//! - Capability classification
//! - Registry lookup under varying agent counts
//! - Store round-trips on both backends

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use switchyard_core::agent::{register_builtin_agents, AgentDescriptor, AgentRegistry};
use switchyard_core::classify::{CapabilityClassifier, KeywordClassifier};
use switchyard_core::session::{Session, SessionStore, Turn};
use switchyard_core::state::{MemoryStore, SqliteStore, StateBackend};

/// Benchmark session value operations
fn bench_session_types(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_types");

    group.bench_function("new_session", |b| {
        b.iter(|| {
            let session = Session::new("bench-session", None, "sup-bench", chrono::Duration::seconds(3600));
            black_box(session)
        })
    });

    for count in [10, 50, 100].iter() {
        group.bench_with_input(BenchmarkId::new("push_turns", count), count, |b, &count| {
            b.iter(|| {
                let mut session =
                    Session::new("bench-session", None, "sup-bench", chrono::Duration::seconds(3600));
                for i in 0..count {
                    session.push_turn(Turn::user(format!("Message {}", i)));
                }
                black_box(session)
            })
        });
    }

    group.finish();
}

/// Benchmark keyword classification
fn bench_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("classification");
    let classifier = KeywordClassifier::new();

    group.bench_function("short_message", |b| {
        b.iter(|| classifier.classify(black_box("Check my availability")))
    });

    group.bench_function("multi_intent_message", |b| {
        b.iter(|| {
            classifier.classify(black_box(
                "Check if I am free on Friday, then book a review slot and cancel the standup",
            ))
        })
    });

    group.finish();
}

/// Benchmark capability lookup as the registry grows
fn bench_registry_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_lookup");

    for count in [4, 32, 128].iter() {
        group.bench_with_input(BenchmarkId::new("find_by_capabilities", count), count, |b, &count| {
            let registry = AgentRegistry::new(chrono::Duration::seconds(90));
            register_builtin_agents(&registry).unwrap();
            for i in 0..count {
                let descriptor = AgentDescriptor::new(format!("filler-{}", i), "filler")
                    .with_capability("unrelated-tag");
                registry
                    .register(
                        descriptor,
                        Arc::new(switchyard_core::agent::ScriptedAgent::acknowledger(format!(
                            "filler-{}",
                            i
                        ))),
                    )
                    .unwrap();
            }
            let required = ["calendar-read".to_string()].into_iter().collect();

            b.iter(|| registry.find_by_capabilities(black_box(&required)))
        });
    }

    group.finish();
}

/// Benchmark store round-trips on both backends
fn bench_store_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_roundtrip");
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("memory_create_update", |b| {
        let store = SessionStore::new(Arc::new(MemoryStore::new()), chrono::Duration::seconds(3600));
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let id = format!("bench-{}", n);
            rt.block_on(async {
                store
                    .create_session(Some(id.clone()), None, "sup-bench")
                    .await
                    .unwrap();
                store
                    .update_session(&id, "sup-bench", |s| s.push_turn(Turn::user("hello")))
                    .await
                    .unwrap()
            })
        })
    });

    group.bench_function("sqlite_create_update", |b| {
        let backend = Arc::new(SqliteStore::in_memory().unwrap());
        let store = SessionStore::new(backend, chrono::Duration::seconds(3600));
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let id = format!("bench-{}", n);
            rt.block_on(async {
                store
                    .create_session(Some(id.clone()), None, "sup-bench")
                    .await
                    .unwrap();
                store
                    .update_session(&id, "sup-bench", |s| s.push_turn(Turn::user("hello")))
                    .await
                    .unwrap()
            })
        })
    });

    group.bench_function("memory_fetch", |b| {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryStore::new());
        let store = SessionStore::new(backend, chrono::Duration::seconds(3600));
        rt.block_on(async {
            store
                .create_session(Some("bench-read".to_string()), None, "sup-bench")
                .await
                .unwrap();
        });

        b.iter(|| rt.block_on(store.get_session(black_box("bench-read"))).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_session_types,
    bench_classification,
    bench_registry_lookup,
    bench_store_roundtrip,
);

criterion_main!(benches);
