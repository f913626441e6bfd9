//! Concurrency stress: snapshot balance under contended transfers, pinned
//! reader stability, lost-update prevention and reclamation liveness.

use std::sync::{Arc, Barrier};
use std::thread;
use verso_mvcc::{Epoch, Runtime, VersionedCell};

fn lcg_next(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1);
    *state
}

/// Threads repeatedly move one unit between two randomly chosen cells,
/// retrying on conflict. Inside every snapshot the balance must be zero;
/// after quiescence everything must have drained.
fn run_transfer_workload(threads: u64, iterations: u64, cell_count: usize) {
    let runtime = Runtime::with_initial_epoch(Epoch(600));
    let cells: Vec<VersionedCell<i64>> = (0..cell_count)
        .map(|_| VersionedCell::new(&runtime, 0))
        .collect();
    let barrier = Arc::new(Barrier::new(usize::try_from(threads).expect("thread count")));

    thread::scope(|scope| {
        for thread_id in 0..threads {
            let runtime = Arc::clone(&runtime);
            let cells = cells.clone();
            let barrier = Arc::clone(&barrier);
            scope.spawn(move || {
                let mut rng = thread_id
                    .wrapping_add(1)
                    .wrapping_mul(0x9E37_79B9_7F4A_7C15);
                barrier.wait();
                for _ in 0..iterations {
                    let debit = usize::try_from(lcg_next(&mut rng)).unwrap_or(usize::MAX)
                        % cells.len();
                    let credit = usize::try_from(lcg_next(&mut rng)).unwrap_or(usize::MAX)
                        % cells.len();
                    loop {
                        let txn = runtime.begin();
                        let committed = txn.run(|| {
                            let total: i64 = cells.iter().map(VersionedCell::read).sum();
                            assert_eq!(total, 0, "snapshot observed an unbalanced transfer");
                            cells[debit].mutate(|value| *value -= 1);
                            cells[credit].mutate(|value| *value += 1);
                            txn.commit()
                        });
                        if committed {
                            break;
                        }
                    }
                }
            });
        }
    });

    let total: i64 = cells.iter().map(VersionedCell::read).sum();
    assert_eq!(total, 0);
    for cell in &cells {
        assert_eq!(cell.history_size(), 0, "history must drain at quiescence");
    }
    assert!(runtime.registry().is_empty());
    assert_eq!(runtime.earliest_epoch(), runtime.current_epoch());
    assert_eq!(runtime.gc().active_sections(), 0);
    assert_eq!(runtime.gc().pending_cleanups(), 0);
}

#[test]
fn transfers_balance_two_cells() {
    run_transfer_workload(10, 150, 2);
}

#[test]
fn transfers_balance_many_cells() {
    run_transfer_workload(8, 120, 16);
}

#[test]
fn pinned_readers_observe_a_frozen_value() {
    let runtime = Runtime::with_initial_epoch(Epoch(600));
    let cell = VersionedCell::new(&runtime, 0_i64);
    let started = Arc::new(Barrier::new(5));

    thread::scope(|scope| {
        // Four pinned readers, one writer.
        for _ in 0..4 {
            let runtime = Arc::clone(&runtime);
            let cell = cell.clone();
            let started = Arc::clone(&started);
            scope.spawn(move || {
                let txn = runtime.begin();
                let first = txn.run(|| cell.read());
                started.wait();
                for _ in 0..2_000 {
                    let again = txn.run(|| cell.read());
                    assert_eq!(again, first, "snapshot read changed under a pin");
                }
            });
        }

        let runtime = Arc::clone(&runtime);
        let cell = cell.clone();
        let started = Arc::clone(&started);
        scope.spawn(move || {
            started.wait();
            for _ in 0..500 {
                runtime.transaction(|txn| {
                    cell.mutate(|value| *value += 1);
                    assert!(txn.commit());
                });
            }
        });
    });

    assert_eq!(cell.read(), 500);
    assert_eq!(cell.history_size(), 0);
}

#[test]
fn no_lost_updates_on_one_cell() {
    const THREADS: u64 = 8;
    const INCREMENTS: u64 = 100;

    let runtime = Runtime::with_initial_epoch(Epoch(600));
    let cell = VersionedCell::new(&runtime, 0_i64);
    let barrier = Arc::new(Barrier::new(usize::try_from(THREADS).expect("thread count")));

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let runtime = Arc::clone(&runtime);
            let cell = cell.clone();
            let barrier = Arc::clone(&barrier);
            scope.spawn(move || {
                barrier.wait();
                for _ in 0..INCREMENTS {
                    loop {
                        let txn = runtime.begin();
                        let committed = txn.run(|| {
                            cell.mutate(|value| *value += 1);
                            txn.commit()
                        });
                        if committed {
                            break;
                        }
                    }
                }
            });
        }
    });

    let expected = i64::try_from(THREADS * INCREMENTS).expect("total fits");
    assert_eq!(cell.read(), expected, "every successful increment must survive");
    assert_eq!(cell.history_size(), 0);
    assert!(runtime.registry().is_empty());
}

#[test]
fn disjoint_writers_only_contend_on_the_commit_lock() {
    const THREADS: usize = 8;
    const ROUNDS: i64 = 200;

    let runtime = Runtime::with_initial_epoch(Epoch(600));
    let cells: Vec<VersionedCell<i64>> = (0..THREADS)
        .map(|_| VersionedCell::new(&runtime, 0))
        .collect();
    let barrier = Arc::new(Barrier::new(THREADS));

    thread::scope(|scope| {
        for (index, cell) in cells.iter().enumerate() {
            let runtime = Arc::clone(&runtime);
            let cell = cell.clone();
            let barrier = Arc::clone(&barrier);
            scope.spawn(move || {
                barrier.wait();
                let mut conflicts = 0_u32;
                for _ in 0..ROUNDS {
                    let txn = runtime.begin();
                    let committed = txn.run(|| {
                        cell.mutate(|value| *value += 1);
                        txn.commit()
                    });
                    if !committed {
                        conflicts += 1;
                    }
                }
                assert_eq!(conflicts, 0, "writer {index} touched only its own cell");
            });
        }
    });

    for cell in &cells {
        assert_eq!(cell.read(), ROUNDS);
        assert_eq!(cell.history_size(), 0);
    }
    let committed_epochs = u64::try_from(THREADS).expect("fits") * u64::try_from(ROUNDS).expect("fits");
    assert_eq!(runtime.current_epoch(), Epoch(600 + committed_epochs));
}
