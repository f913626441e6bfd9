//! Minimal walkthrough: concurrent transfers between two accounts with
//! conflict retries, then epoch compression.

use std::sync::Arc;
use std::thread;
use verso_mvcc::{Runtime, VersionedCell};

fn main() {
    let runtime = Runtime::new();
    let checking = VersionedCell::new(&runtime, 1_000_i64);
    let savings = VersionedCell::new(&runtime, 0_i64);

    thread::scope(|scope| {
        for _ in 0..4 {
            let runtime = Arc::clone(&runtime);
            let checking = checking.clone();
            let savings = savings.clone();
            scope.spawn(move || {
                for _ in 0..250 {
                    loop {
                        let txn = runtime.begin();
                        let committed = txn.run(|| {
                            checking.mutate(|balance| *balance -= 1);
                            savings.mutate(|balance| *balance += 1);
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

    let stats = runtime.stats();
    println!("checking: {}", checking.read());
    println!("savings:  {}", savings.read());
    println!("commits:  {} ({} conflicts retried)", stats.commits, stats.conflicts);

    runtime.compress_epochs();
    println!("epoch after compression: {}", runtime.current_epoch());

    assert_eq!(checking.read() + savings.read(), 1_000);
    assert_eq!(savings.read(), 1_000);
}
