use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use docstore::{Config, DocumentStore, FileHeaderContext, InlineExecutor, NoopTlogSync};

/// Build a store with `file_count` rotated-out frozen files, each half
/// overwritten so roughly half of every file's bytes are bloat, then hand
/// back the tempdir (kept alive so its files stay on disk for the bench).
fn seeded_store(file_count: u32) -> (tempfile::TempDir, DocumentStore) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        max_file_size: 4096,
        max_disk_bloat_factor: 0.2,
        ..Config::default()
    };
    let store = DocumentStore::open(
        dir.path(),
        config,
        Arc::new(InlineExecutor),
        Arc::new(NoopTlogSync),
        None,
        FileHeaderContext::new("docstore-bench"),
        false,
    )
    .unwrap();

    let lids_per_file = 20u32;
    let total_lids = file_count * lids_per_file;
    let mut serial = 1u64;
    for lid in 0..total_lids {
        store.write(serial, lid, &[1u8; 64]).unwrap();
        serial += 1;
    }
    // Overwrite the first half of every lid range so the store accumulates
    // bloat in the now-frozen files behind the active one.
    for lid in 0..(total_lids / 2) {
        store.write(serial, lid, &[2u8; 64]).unwrap();
        serial += 1;
    }
    store.init_flush().unwrap();
    (dir, store)
}

fn bench_compact_round(c: &mut Criterion) {
    c.bench_function("compact_round_8_files", |b| {
        b.iter_with_setup(
            || seeded_store(8),
            |(_dir, store)| {
                while store.compact().unwrap() {}
            },
        )
    });
}

fn bench_estimate_gain(c: &mut Criterion) {
    let (_dir, store) = seeded_store(8);
    c.bench_function("estimate_compact_gain_8_files", |b| {
        b.iter(|| store.estimate_compact_gain())
    });
}

criterion_group!(benches, bench_compact_round, bench_estimate_gain);
criterion_main!(benches);
