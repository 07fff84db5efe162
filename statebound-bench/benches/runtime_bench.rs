//! File-backed runtime benchmarks: send with configuration write-back.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::Map;
use statebound_core::{EventEnvelope, RecordKey};
use statebound_storage::Runtime;
use tempfile::TempDir;

const CHART: &str = r#"
initial: draft
states:
  - name: draft
    transitions:
      - event: confirm
        target: confirmed
  - name: confirmed
    transitions:
      - event: reopen
        target: draft
"#;

fn create_runtime() -> (TempDir, Runtime, RecordKey) {
    let dir = TempDir::new().unwrap();
    let runtime = Runtime::open(dir.path()).unwrap();
    runtime.registry().create("bench.order", CHART).unwrap();
    let key = runtime
        .records()
        .create("bench.order", Some("r1"), Map::new())
        .unwrap()
        .key();
    (dir, runtime, key)
}

fn bench_send_persisted(c: &mut Criterion) {
    let mut group = c.benchmark_group("runtime_send");
    group.throughput(Throughput::Elements(2));

    let (_dir, runtime, key) = create_runtime();
    group.bench_function("confirm_reopen", |b| {
        b.iter(|| {
            black_box(runtime.send(&key, EventEnvelope::call("confirm")).unwrap());
            black_box(runtime.send(&key, EventEnvelope::call("reopen")).unwrap())
        })
    });

    group.finish();
}

fn bench_statechart_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("runtime_statechart_write");

    let (_dir, runtime, key) = create_runtime();
    runtime.interpreter(&key).unwrap();

    // Each write evicts the cached interpreter; the send rebuilds it.
    group.bench_function("write_then_send", |b| {
        b.iter(|| {
            runtime.registry().write("bench.order", CHART).unwrap();
            black_box(runtime.send(&key, EventEnvelope::call("confirm")).unwrap());
            black_box(runtime.send(&key, EventEnvelope::call("reopen")).unwrap())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_send_persisted, bench_statechart_write);
criterion_main!(benches);
