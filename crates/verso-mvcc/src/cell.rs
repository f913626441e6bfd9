//! Versioned cells: typed containers with an epoch-tagged version history.
//!
//! A cell's history is an immutable array of `(value, valid_to)` entries
//! behind an [`ArcSwap`]: readers follow one pointer load and never block.
//! Every mutation (staging, rollback, reclamation, renaming) copies the
//! array under the per-cell mutex, publishes the copy with a release swap,
//! and retires the superseded array through the critical-section domain so
//! that no in-flight reader can observe freed entries.
//!
//! The newest entry carries `valid_to = ∞`; `valid_from` of an entry is the
//! `valid_to` of its predecessor, or 1 for the first. A snapshot at epoch
//! `e` observes the single entry whose span contains `e`.

use crate::object::{EpochRenumbering, VersionedObject};
use crate::runtime::Runtime;
use crate::txn;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};
use verso_error::{Result, VersoError};
use verso_types::Epoch;

pub(crate) fn no_transaction() -> ! {
    error!(target: "verso::cell", "mutate without an active transaction");
    panic!("verso-mvcc: mutate() requires an active transaction on this thread");
}

#[derive(Debug, Clone)]
pub(crate) struct HistoryEntry<T> {
    pub(crate) value: T,
    pub(crate) valid_to: Epoch,
}

#[derive(Debug)]
pub(crate) struct History<T> {
    pub(crate) entries: Vec<HistoryEntry<T>>,
}

impl<T> History<T> {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// `valid_from` of the entry at `index`.
    pub(crate) fn valid_from(&self, index: usize) -> Epoch {
        if index == 0 {
            Epoch::FIRST
        } else {
            self.entries[index - 1].valid_to
        }
    }

    pub(crate) fn newest_valid_from(&self) -> Epoch {
        self.valid_from(self.entries.len() - 1)
    }

    /// The value visible at `epoch`: newest entry whose span starts at or
    /// before it. Falls back to the oldest retained entry, whose lower
    /// bound is unrecorded.
    pub(crate) fn value_at(&self, epoch: Epoch) -> &T {
        for index in (1..self.entries.len()).rev() {
            if self.valid_from(index) <= epoch {
                return &self.entries[index].value;
            }
        }
        &self.entries[0].value
    }

    /// Locate the version identified by `unused_valid_from`, including the
    /// oldest-entry shortcut for boundaries that predate the retained range.
    pub(crate) fn find_valid_from(&self, unused_valid_from: Epoch) -> Option<usize> {
        for index in 0..self.entries.len() {
            let oldest_shortcut = index == 0 && unused_valid_from < self.entries[0].valid_to;
            if self.valid_from(index) == unused_valid_from || oldest_shortcut {
                return Some(index);
            }
        }
        None
    }

    /// Stamp the newest entry and append a speculative successor.
    pub(crate) fn stage(&mut self, value: T, new_epoch: Epoch) {
        self.entries
            .last_mut()
            .expect("cell history is never empty")
            .valid_to = new_epoch;
        self.entries.push(HistoryEntry {
            value,
            valid_to: Epoch::INFINITE,
        });
    }

    /// Drop the speculative newest entry, restoring its predecessor.
    pub(crate) fn unstage(&mut self) {
        self.entries.pop();
        self.entries
            .last_mut()
            .expect("cell history is never empty")
            .valid_to = Epoch::INFINITE;
    }

    /// Remove the version at `index`; its predecessor inherits the span.
    pub(crate) fn excise(&mut self, index: usize) {
        let removed = self.entries.remove(index);
        if index > 0 {
            self.entries[index - 1].valid_to = removed.valid_to;
        }
    }

    /// Relocate every boundary through `renumbering`, refusing renames that
    /// would leave the boundaries out of order.
    pub(crate) fn rename(&mut self, renumbering: &EpochRenumbering) -> Result<()> {
        let mut previous = Epoch(0);
        for entry in &mut self.entries {
            let renamed = renumbering.renumber(entry.valid_to);
            if renamed <= previous {
                return Err(VersoError::EpochOrder {
                    detail: format!(
                        "renaming valid_to {} to {renamed} would break boundary order",
                        entry.valid_to
                    ),
                });
            }
            previous = renamed;
            entry.valid_to = renamed;
        }
        Ok(())
    }
}

impl<T: Clone> History<T> {
    pub(crate) fn single(value: T) -> Self {
        Self {
            entries: vec![HistoryEntry {
                value,
                valid_to: Epoch::INFINITE,
            }],
        }
    }

    fn cloned_entries(&self) -> Vec<HistoryEntry<T>> {
        self.entries.clone()
    }
}

struct CellInner<T> {
    runtime: Arc<Runtime>,
    history: ArcSwap<History<T>>,
    write_lock: Mutex<()>,
    weak_self: Weak<CellInner<T>>,
}

impl<T> CellInner<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    /// Swap in a new history and retire the old array through the
    /// critical-section domain. Callers hold the per-cell mutex.
    fn publish(&self, next: History<T>) {
        let old = self.history.swap(Arc::new(next));
        self.runtime.gc().defer(move || drop(old));
    }

    fn read_at(&self, epoch: Epoch) -> T {
        let earliest = self.runtime.clock().earliest();
        if epoch < earliest {
            crate::fatal(&VersoError::ExpiredEpoch { epoch, earliest });
        }
        self.history.load().value_at(epoch).clone()
    }
}

impl<T> fmt::Debug for CellInner<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let history = self.history.load();
        let mut list = f.debug_list();
        for (index, entry) in history.entries.iter().enumerate() {
            list.entry(&format_args!(
                "{:?} [{}..{})",
                entry.value,
                history.valid_from(index),
                entry.valid_to
            ));
        }
        list.finish()
    }
}

impl<T> VersionedObject for CellInner<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn setup(&self, old_epoch: Epoch, new_epoch: Epoch, local: &dyn Any) -> Result<bool> {
        let _write = self.write_lock.lock();

        let current = self.runtime.clock().current();
        if current.checked_next() != Some(new_epoch) {
            return Err(VersoError::EpochOrder {
                detail: format!("setup at epoch {new_epoch} while current epoch is {current}"),
            });
        }

        let history = self.history.load();
        let valid_from = history.newest_valid_from();
        if valid_from > old_epoch {
            debug!(
                target: "verso::cell",
                old_epoch = %old_epoch,
                newest_valid_from = %valid_from,
                "setup_conflict"
            );
            return Ok(false);
        }

        let Some(value) = local.downcast_ref::<T>() else {
            return Err(VersoError::RegistryCorruption {
                detail: "sandbox slot type does not match cell payload".to_owned(),
            });
        };

        let mut next = History {
            entries: history.cloned_entries(),
        };
        next.stage(value.clone(), new_epoch);
        drop(history);
        self.publish(next);
        trace!(target: "verso::cell", new_epoch = %new_epoch, "setup_staged");
        Ok(true)
    }

    fn commit(&self, new_epoch: Epoch) {
        let history = self.history.load();
        let len = history.len();
        assert!(len >= 2, "commit hook on a cell with no staged version");
        // The previous newest entry just became obsolete for every future
        // snapshot; its destruction is gated on its valid_from.
        let unused_valid_from = history.valid_from(len - 2);
        drop(history);

        let weak: Weak<dyn VersionedObject> = self.weak_self.clone();
        self.runtime
            .registry()
            .register_cleanup(weak, unused_valid_from, new_epoch);
        trace!(
            target: "verso::cell",
            new_epoch = %new_epoch,
            unused_valid_from = %unused_valid_from,
            "commit_applied"
        );
    }

    fn rollback(&self, _new_epoch: Epoch, _local: &dyn Any) {
        let _write = self.write_lock.lock();
        let history = self.history.load();
        let len = history.len();
        assert!(len >= 2, "rollback on a cell with no staged version");
        let mut next = History {
            entries: history.cloned_entries(),
        };
        next.unstage();
        drop(history);
        self.publish(next);
        trace!(target: "verso::cell", "setup_rolled_back");
    }

    fn cleanup(&self, unused_valid_from: Epoch, trigger_epoch: Epoch) -> Result<()> {
        let _write = self.write_lock.lock();
        let history = self.history.load();
        if history.len() < 2 {
            return Err(VersoError::RegistryCorruption {
                detail: format!(
                    "cleanup of valid_from {unused_valid_from} (trigger {trigger_epoch}) \
                     with no obsolete versions"
                ),
            });
        }

        let Some(index) = history.find_valid_from(unused_valid_from) else {
            return Err(VersoError::RegistryCorruption {
                detail: format!(
                    "no version with valid_from {unused_valid_from} (trigger {trigger_epoch})"
                ),
            });
        };

        let mut next = History {
            entries: history.cloned_entries(),
        };
        next.excise(index);
        drop(history);
        self.publish(next);
        trace!(
            target: "verso::cell",
            unused_valid_from = %unused_valid_from,
            trigger_epoch = %trigger_epoch,
            "version_cleaned"
        );
        Ok(())
    }

    fn rename_epochs(&self, renumbering: &EpochRenumbering) -> Result<()> {
        let _write = self.write_lock.lock();
        let history = self.history.load();
        let mut next = History {
            entries: history.cloned_entries(),
        };
        next.rename(renumbering)?;
        drop(history);
        self.publish(next);
        Ok(())
    }

    fn describe_local(&self, local: &dyn Any) -> String {
        match local.downcast_ref::<T>() {
            Some(value) => format!("{value:?}"),
            None => "<type mismatch>".to_owned(),
        }
    }
}

/// A typed cell participating in the MVCC commit protocol.
///
/// Cloning the handle is cheap and yields the same underlying cell.
pub struct VersionedCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for VersionedCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> VersionedCell<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    /// Create a cell holding `initial`, valid for every epoch.
    #[must_use]
    pub fn new(runtime: &Arc<Runtime>, initial: T) -> Self {
        let inner = Arc::new_cyclic(|weak_self| CellInner {
            runtime: Arc::clone(runtime),
            history: ArcSwap::from_pointee(History::single(initial)),
            write_lock: Mutex::new(()),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    /// The value visible to the calling thread's transaction, or to the
    /// current epoch when no transaction is active (an advisory read).
    ///
    /// Inside a transaction, a previously staged local value shadows the
    /// history (read-your-writes).
    #[must_use]
    pub fn read(&self) -> T {
        let inner = &self.inner;
        let from_transaction = txn::with_current_for(&inner.runtime, |core| {
            if let Some(local) = core.sandbox.borrow().local::<T>(self.key()) {
                return local.clone();
            }
            inner.read_at(core.snapshot.epoch())
        });
        match from_transaction {
            Some(value) => value,
            None => inner.read_at(inner.runtime.clock().current()),
        }
    }

    /// Apply `apply` to the transaction-local copy of the value, creating
    /// the copy from the snapshot's view on first access.
    ///
    /// # Panics
    ///
    /// Panics when the calling thread has no active transaction on this
    /// cell's runtime.
    pub fn mutate(&self, apply: impl FnOnce(&mut T)) {
        let inner = &self.inner;
        let applied = txn::with_current_for(&inner.runtime, |core| {
            let epoch = core.snapshot.epoch();
            let mut sandbox = core.sandbox.borrow_mut();
            let object: Arc<dyn VersionedObject> = Arc::clone(&self.inner) as Arc<dyn VersionedObject>;
            let local = sandbox.local_or_insert_with(object, self.key(), || inner.read_at(epoch));
            apply(local);
        });
        if applied.is_none() {
            no_transaction();
        }
    }

    /// Stage `value` as this transaction's local value for the cell.
    ///
    /// # Panics
    ///
    /// Panics when the calling thread has no active transaction on this
    /// cell's runtime.
    pub fn write(&self, value: T) {
        self.mutate(move |local| *local = value);
    }

    /// Number of obsolete versions currently retained for live snapshots.
    #[must_use]
    pub fn history_size(&self) -> usize {
        self.inner.history.load().len() - 1
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner).cast::<()>() as usize
    }
}

impl<T> fmt::Debug for VersionedCell<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VersionedCell").field(&self.inner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verso_types::SnapshotStatus;

    #[test]
    fn advisory_read_outside_any_transaction() {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 7_i64);
        assert_eq!(cell.read(), 7);
        assert_eq!(cell.history_size(), 0);
    }

    #[test]
    fn staged_writes_shadow_the_history() {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 0_i64);
        runtime.transaction(|txn| {
            assert_eq!(cell.read(), 0);
            cell.write(41);
            assert_eq!(cell.read(), 41, "read-your-writes");
            cell.mutate(|value| *value += 1);
            assert_eq!(cell.read(), 42);
            assert!(txn.commit());
            assert_eq!(txn.status(), SnapshotStatus::Committed);
        });
        assert_eq!(cell.read(), 42);
    }

    #[test]
    fn failed_commit_leaves_the_cell_untouched() {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 0_i64);

        let stale = runtime.begin();
        runtime.transaction(|txn| {
            cell.write(1);
            assert!(txn.commit());
        });

        let conflicted = stale.run(|| {
            cell.write(99);
            stale.commit()
        });
        assert!(!conflicted);
        // The failed restart moved the stale snapshot forward, draining the
        // version it was holding; only the committed value remains.
        assert_eq!(cell.history_size(), 0);

        runtime.transaction(|_txn| {
            assert_eq!(cell.read(), 1);
        });
    }

    #[test]
    fn old_snapshot_keeps_reading_its_version() {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 10_i64);

        let old = runtime.begin();
        runtime.transaction(|txn| {
            cell.write(20);
            assert!(txn.commit());
        });

        old.run(|| assert_eq!(cell.read(), 10));
        assert_eq!(cell.read(), 20);
        assert_eq!(cell.history_size(), 1);

        drop(old);
        assert_eq!(cell.history_size(), 0, "history drains with its last reader");
    }

    #[test]
    #[should_panic(expected = "requires an active transaction")]
    fn mutate_outside_a_transaction_is_fatal() {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 0_i64);
        cell.mutate(|value| *value += 1);
    }

    #[test]
    fn cells_of_different_payloads_share_one_commit() {
        let runtime = Runtime::new();
        let count = VersionedCell::new(&runtime, 0_u32);
        let label = VersionedCell::new(&runtime, String::from("start"));

        runtime.transaction(|txn| {
            count.write(3);
            label.write(String::from("done"));
            assert!(txn.commit());
        });

        assert_eq!(count.read(), 3);
        assert_eq!(label.read(), "done");
    }

    #[test]
    fn debug_formats_spans() {
        let runtime = Runtime::new();
        let cell = VersionedCell::new(&runtime, 5_i64);
        let rendered = format!("{cell:?}");
        assert!(rendered.contains('5'));
        assert!(rendered.contains("inf"));
    }
}
