//! Commit and read-path microbenchmarks.
//!
//! Covers the single-writer fast path, multi-cell commits, both read paths
//! (advisory and snapshot-pinned) and the conflict/restart cycle.

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use verso_mvcc::{Epoch, Runtime, VersionedCell};

fn bench_commit_throughput(c: &mut Criterion) {
    c.bench_function("commit_single_cell", |b| {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 0_u64);
        let mut tick = 0_u64;
        b.iter(|| {
            tick += 1;
            runtime.transaction(|txn| {
                cell.write(tick);
                assert!(txn.commit());
            });
        });
    });

    c.bench_function("commit_eight_cells", |b| {
        let runtime = Runtime::new();
        let cells: Vec<VersionedCell<u64>> =
            (0..8).map(|_| VersionedCell::new(&runtime, 0)).collect();
        let mut tick = 0_u64;
        b.iter(|| {
            tick += 1;
            runtime.transaction(|txn| {
                for cell in &cells {
                    cell.write(tick);
                }
                assert!(txn.commit());
            });
        });
    });

    c.bench_function("reuse_handle_commit", |b| {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 0_u64);
        let txn = runtime.begin();
        let mut tick = 0_u64;
        b.iter(|| {
            tick += 1;
            txn.run(|| {
                cell.write(tick);
                assert!(txn.commit());
            });
        });
    });
}

fn bench_read_paths(c: &mut Criterion) {
    c.bench_function("advisory_read", |b| {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 42_u64);
        b.iter(|| black_box(cell.read()));
    });

    c.bench_function("snapshot_read", |b| {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 42_u64);
        let txn = runtime.begin();
        let _scope = txn.scope();
        b.iter(|| black_box(cell.read()));
    });

    c.bench_function("snapshot_read_deep_history", |b| {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 0_u64);
        // Pin an old snapshot so thirty-two versions stay retained.
        let pin = runtime.begin();
        for version in 1..=32_u64 {
            runtime.transaction(|txn| {
                cell.write(version);
                assert!(txn.commit());
            });
        }
        let _scope = pin.scope();
        b.iter(|| black_box(cell.read()));
    });
}

fn bench_conflict_cycle(c: &mut Criterion) {
    c.bench_function("conflict_and_retry", |b| {
        let runtime = Runtime::with_initial_epoch(Epoch(600));
        let cell = VersionedCell::new(&runtime, 0_u64);
        let mut tick = 0_u64;
        b.iter(|| {
            tick += 1;
            let loser = runtime.begin();
            runtime.transaction(|winner| {
                cell.write(tick);
                assert!(winner.commit());
            });
            let conflicted = loser.run(|| {
                cell.write(tick + 1);
                !loser.commit()
            });
            assert!(conflicted);
            let retried = loser.run(|| {
                cell.write(tick + 1);
                loser.commit()
            });
            assert!(retried);
        });
    });
}

criterion_group!(
    benches,
    bench_commit_throughput,
    bench_read_paths,
    bench_conflict_cycle
);
criterion_main!(benches);
