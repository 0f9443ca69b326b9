use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use langgraph_checkpoint_tiered::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointStoreConfig,
    InMemoryBlobStore, InMemoryKeyValueStore, TieredCheckpointSaver,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

fn saver() -> TieredCheckpointSaver {
    let config = CheckpointStoreConfig::default().with_inline_threshold(16 * 1024);
    TieredCheckpointSaver::with_config(
        Arc::new(InMemoryKeyValueStore::new()),
        Arc::new(InMemoryBlobStore::new()),
        config,
    )
    .unwrap()
}

fn checkpoint_with_payload(bytes: usize) -> Checkpoint {
    let mut values = BTreeMap::new();
    values.insert("messages".to_string(), json!(["hello", "world"]));
    values.insert("document".to_string(), json!("x".repeat(bytes)));
    Checkpoint::new(values, BTreeMap::new(), BTreeMap::new())
}

fn checkpoint_save_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("checkpoint save");

    // 1 KiB stays inline, 64 KiB crosses the threshold and is offloaded
    for bytes in [1024usize, 64 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(bytes), &bytes, |b, &bytes| {
            let saver = saver();
            let config = CheckpointConfig::new("bench-thread");
            b.to_async(&runtime).iter(|| async {
                saver
                    .put(
                        &config,
                        black_box(checkpoint_with_payload(bytes)),
                        black_box(CheckpointMetadata::new()),
                    )
                    .await
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn checkpoint_load_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("checkpoint load");

    for bytes in [1024usize, 64 * 1024] {
        let saver = saver();
        let saved_config = runtime
            .block_on(saver.put(
                &CheckpointConfig::new("bench-thread"),
                checkpoint_with_payload(bytes),
                CheckpointMetadata::new(),
            ))
            .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(bytes), &bytes, |b, _| {
            b.to_async(&runtime).iter(|| async {
                saver.get_tuple(black_box(&saved_config)).await.unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, checkpoint_save_benchmark, checkpoint_load_benchmark);
criterion_main!(benches);
