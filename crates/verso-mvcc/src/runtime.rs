//! The runtime: one MVCC domain wiring the epoch clock, the snapshot
//! registry, the commit lock and the reclamation domain together.
//!
//! A process normally holds a single [`Runtime`] behind [`global`]; tests
//! and embedders that need isolated epoch spaces can instantiate their own.

use crate::clock::EpochClock;
use crate::registry::SnapshotRegistry;
use crate::txn::Transaction;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::info;
use verso_gc::GcDomain;
use verso_types::{Epoch, SnapshotId};

/// Monotonic commit-outcome counters for one runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub commits: u64,
    pub conflicts: u64,
}

/// One logical MVCC domain: clock, registry, commit serialization and the
/// critical-section list.
///
/// Lock order across the domain is commit lock → registry mutex → per-cell
/// mutex → gc list lock. Nothing ever takes them in the other direction.
pub struct Runtime {
    clock: Arc<EpochClock>,
    registry: SnapshotRegistry,
    commit_lock: Mutex<()>,
    gc: GcDomain,
    next_snapshot_id: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
}

impl Runtime {
    /// A runtime starting at [`Epoch::FIRST`].
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_initial_epoch(Epoch::FIRST)
    }

    /// A runtime whose clock starts at `initial` (both current and
    /// earliest).
    #[must_use]
    pub fn with_initial_epoch(initial: Epoch) -> Arc<Self> {
        let clock = Arc::new(EpochClock::new(initial));
        let registry = SnapshotRegistry::new(Arc::clone(&clock));
        info!(target: "verso::runtime", epoch = %initial, "runtime_created");
        Arc::new(Self {
            clock,
            registry,
            commit_lock: Mutex::new(()),
            gc: GcDomain::new(),
            next_snapshot_id: AtomicU64::new(1),
            commits: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        })
    }

    /// Open a transaction: enter a critical section and register a snapshot
    /// at the current epoch.
    ///
    /// The returned handle must still be *entered* ([`Transaction::run`] or
    /// [`Transaction::scope`]) before cells resolve it as the thread's
    /// current transaction.
    #[must_use]
    pub fn begin(self: &Arc<Self>) -> Transaction {
        Transaction::open(self)
    }

    /// Open a transaction, enter it for the duration of `f`, and close it
    /// afterwards. Committing remains the caller's decision.
    pub fn transaction<R>(self: &Arc<Self>, f: impl FnOnce(&Transaction) -> R) -> R {
        let txn = self.begin();
        txn.run(|| f(&txn))
    }

    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        self.clock.current()
    }

    #[must_use]
    pub fn earliest_epoch(&self) -> Epoch {
        self.clock.earliest()
    }

    /// Renumber all live epochs down to `1..=n` and reset the clock to
    /// `n + 1`. Serialized against every commit.
    pub fn compress_epochs(&self) {
        let _commit = self.commit_lock.lock();
        self.registry.compress();
    }

    /// The registry governing snapshot lifetimes in this domain.
    #[must_use]
    pub fn registry(&self) -> &SnapshotRegistry {
        &self.registry
    }

    /// The reclamation domain cells retire their histories through.
    #[must_use]
    pub fn gc(&self) -> &GcDomain {
        &self.gc
    }

    pub(crate) fn clock(&self) -> &EpochClock {
        &self.clock
    }

    pub(crate) fn commit_lock(&self) -> &Mutex<()> {
        &self.commit_lock
    }

    pub(crate) fn next_snapshot_id(&self) -> SnapshotId {
        SnapshotId(self.next_snapshot_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn record_commit_outcome(&self, success: bool) {
        if success {
            self.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Lifetime commit/conflict counters.
    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            commits: self.commits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("current_epoch", &self.clock.current())
            .field("earliest_epoch", &self.clock.earliest())
            .field("registry", &self.registry)
            .field("gc", &self.gc)
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

/// The process-wide runtime, created on first use.
#[must_use]
pub fn global() -> &'static Arc<Runtime> {
    GLOBAL.get_or_init(Runtime::new)
}

/// Open a transaction on the process-wide runtime.
#[must_use]
pub fn open_transaction() -> Transaction {
    global().begin()
}

/// Current epoch of the process-wide runtime.
#[must_use]
pub fn current_epoch() -> Epoch {
    global().current_epoch()
}

/// Earliest live snapshot epoch of the process-wide runtime.
#[must_use]
pub fn earliest_epoch() -> Epoch {
    global().earliest_epoch()
}

/// Enter a critical section of the process-wide runtime's gc domain.
pub fn enter_critical() {
    global().gc().enter();
}

/// Leave the current critical section of the process-wide runtime.
pub fn leave_critical() {
    global().gc().leave();
}

/// Defer `cleanup` until no critical section of the process-wide runtime
/// can observe its target.
pub fn schedule_cleanup(cleanup: impl FnOnce() + Send + 'static) {
    global().gc().defer(cleanup);
}

/// Compress the epochs of the process-wide runtime.
pub fn compress_epochs() {
    global().compress_epochs();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::VersionedCell;

    #[test]
    fn isolated_runtimes_have_isolated_epochs() {
        let first = Runtime::with_initial_epoch(Epoch(600));
        let second = Runtime::with_initial_epoch(Epoch(10));
        first.transaction(|txn| assert!(txn.commit()));
        assert_eq!(first.current_epoch(), Epoch(601));
        assert_eq!(second.current_epoch(), Epoch(10));
    }

    #[test]
    fn global_runtime_round_trip() {
        let cell = VersionedCell::new(global(), 0_i64);
        let txn = open_transaction();
        let committed = txn.run(|| {
            cell.write(9);
            txn.commit()
        });
        assert!(committed);
        drop(txn);
        assert_eq!(cell.read(), 9);
        assert!(current_epoch() >= Epoch(2));
        assert!(earliest_epoch() <= current_epoch());
    }

    #[test]
    fn global_critical_sections_balance() {
        enter_critical();
        assert!(global().gc().in_critical());
        enter_critical();
        leave_critical();
        assert!(global().gc().in_critical(), "nested leave must not unpin");
        leave_critical();
        assert!(!global().gc().in_critical());
    }

    #[test]
    fn stats_count_commit_outcomes() {
        let runtime = Runtime::with_initial_epoch(Epoch(600));
        let cell = VersionedCell::new(&runtime, 0_i64);
        assert_eq!(runtime.stats(), RuntimeStats::default());

        let loser = runtime.begin();
        runtime.transaction(|winner| {
            cell.write(1);
            assert!(winner.commit());
        });
        let outcome = loser.run(|| {
            cell.write(2);
            loser.commit()
        });
        assert!(!outcome);

        let stats = runtime.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.conflicts, 1);
    }

    #[test]
    fn compress_on_a_quiet_runtime_resets_the_clock() {
        let runtime = Runtime::with_initial_epoch(Epoch(90_000));
        runtime.transaction(|txn| assert!(txn.commit()));
        assert_eq!(runtime.current_epoch(), Epoch(90_001));
        runtime.compress_epochs();
        assert_eq!(runtime.current_epoch(), Epoch::FIRST);
        assert_eq!(runtime.earliest_epoch(), Epoch::FIRST);
    }
}
