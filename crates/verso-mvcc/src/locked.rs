//! Mutex-guarded cells.
//!
//! [`LockedCell`] is the simpler sibling of [`VersionedCell`]: the version
//! history lives under the per-cell mutex and every operation — reads
//! included — takes it for the duration of one history walk. Nothing escapes
//! the lock, so reclamation needs no critical-section gating here; removed
//! entries drop in place.
//!
//! Prefer [`VersionedCell`] for read-heavy cells. The locked flavor suits
//! cells whose payload is expensive to clone structurally, since staging
//! mutates the history vector in place instead of copying the whole array.
//!
//! [`VersionedCell`]: crate::cell::VersionedCell

use crate::cell::History;
use crate::object::{EpochRenumbering, VersionedObject};
use crate::runtime::Runtime;
use crate::txn;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};
use verso_error::{Result, VersoError};
use verso_types::Epoch;

struct LockedInner<T> {
    runtime: Arc<Runtime>,
    history: Mutex<History<T>>,
    weak_self: Weak<LockedInner<T>>,
}

impl<T> LockedInner<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn read_at(&self, epoch: Epoch) -> T {
        let earliest = self.runtime.clock().earliest();
        if epoch < earliest {
            crate::fatal(&VersoError::ExpiredEpoch { epoch, earliest });
        }
        self.history.lock().value_at(epoch).clone()
    }
}

impl<T> fmt::Debug for LockedInner<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let history = self.history.lock();
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

impl<T> VersionedObject for LockedInner<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn setup(&self, old_epoch: Epoch, new_epoch: Epoch, local: &dyn Any) -> Result<bool> {
        let mut history = self.history.lock();

        let current = self.runtime.clock().current();
        if current.checked_next() != Some(new_epoch) {
            return Err(VersoError::EpochOrder {
                detail: format!("setup at epoch {new_epoch} while current epoch is {current}"),
            });
        }

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
        history.stage(value.clone(), new_epoch);
        Ok(true)
    }

    fn commit(&self, new_epoch: Epoch) {
        let unused_valid_from = {
            let history = self.history.lock();
            let len = history.len();
            assert!(len >= 2, "commit hook on a cell with no staged version");
            history.valid_from(len - 2)
        };
        let weak: Weak<dyn VersionedObject> = self.weak_self.clone();
        self.runtime
            .registry()
            .register_cleanup(weak, unused_valid_from, new_epoch);
    }

    fn rollback(&self, _new_epoch: Epoch, _local: &dyn Any) {
        let mut history = self.history.lock();
        assert!(history.len() >= 2, "rollback on a cell with no staged version");
        history.unstage();
    }

    fn cleanup(&self, unused_valid_from: Epoch, trigger_epoch: Epoch) -> Result<()> {
        let mut history = self.history.lock();
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
        history.excise(index);
        trace!(
            target: "verso::cell",
            unused_valid_from = %unused_valid_from,
            trigger_epoch = %trigger_epoch,
            "version_cleaned"
        );
        Ok(())
    }

    fn rename_epochs(&self, renumbering: &EpochRenumbering) -> Result<()> {
        self.history.lock().rename(renumbering)
    }

    fn describe_local(&self, local: &dyn Any) -> String {
        match local.downcast_ref::<T>() {
            Some(value) => format!("{value:?}"),
            None => "<type mismatch>".to_owned(),
        }
    }
}

/// A typed cell whose history is guarded by its mutex.
///
/// Same contract as [`VersionedCell`](crate::cell::VersionedCell); both
/// flavors participate interchangeably in the same commit.
pub struct LockedCell<T> {
    inner: Arc<LockedInner<T>>,
}

impl<T> Clone for LockedCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> LockedCell<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    #[must_use]
    pub fn new(runtime: &Arc<Runtime>, initial: T) -> Self {
        let inner = Arc::new_cyclic(|weak_self| LockedInner {
            runtime: Arc::clone(runtime),
            history: Mutex::new(History::single(initial)),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

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
            crate::cell::no_transaction();
        }
    }

    /// # Panics
    ///
    /// Panics when the calling thread has no active transaction on this
    /// cell's runtime.
    pub fn write(&self, value: T) {
        self.mutate(move |local| *local = value);
    }

    #[must_use]
    pub fn history_size(&self) -> usize {
        self.inner.history.lock().len() - 1
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner).cast::<()>() as usize
    }
}

impl<T> fmt::Debug for LockedCell<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockedCell").field(&self.inner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::VersionedCell;

    #[test]
    fn locked_cell_round_trip() {
        let runtime = Runtime::new();
        let cell = LockedCell::new(&runtime, 0_i64);
        runtime.transaction(|txn| {
            cell.mutate(|value| *value += 5);
            assert_eq!(cell.read(), 5, "read-your-writes");
            assert!(txn.commit());
        });
        assert_eq!(cell.read(), 5);
        assert_eq!(cell.history_size(), 0);
    }

    #[test]
    fn locked_cell_snapshot_isolation() {
        let runtime = Runtime::new();
        let cell = LockedCell::new(&runtime, 1_i64);

        let old = runtime.begin();
        runtime.transaction(|txn| {
            cell.write(2);
            assert!(txn.commit());
        });

        old.run(|| assert_eq!(cell.read(), 1));
        assert_eq!(cell.read(), 2);
        assert_eq!(cell.history_size(), 1);
        drop(old);
        assert_eq!(cell.history_size(), 0);
    }

    #[test]
    fn locked_cell_conflict_detection() {
        let runtime = Runtime::new();
        let cell = LockedCell::new(&runtime, 0_i64);

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
        assert_eq!(cell.read(), 1);
    }

    #[test]
    fn both_cell_flavors_commit_together() {
        let runtime = Runtime::new();
        let swapped = VersionedCell::new(&runtime, 0_i64);
        let locked = LockedCell::new(&runtime, 0_i64);

        runtime.transaction(|txn| {
            swapped.mutate(|value| *value += 1);
            locked.mutate(|value| *value += 2);
            assert!(txn.commit());
        });
        assert_eq!(swapped.read(), 1);
        assert_eq!(locked.read(), 2);

        // A conflict on either flavor rolls back the staged prefix of both.
        let stale = runtime.begin();
        runtime.transaction(|txn| {
            locked.write(9);
            assert!(txn.commit());
        });
        let outcome = stale.run(|| {
            swapped.mutate(|value| *value += 10);
            locked.mutate(|value| *value += 10);
            stale.commit()
        });
        assert!(!outcome, "the locked cell moved after the stale snapshot");
        assert_eq!(swapped.read(), 1, "staged prefix must roll back");
        assert_eq!(locked.read(), 9);

        drop(stale);
        assert_eq!(swapped.history_size(), 0);
        assert_eq!(locked.history_size(), 0);
    }

    #[test]
    fn locked_cell_survives_compression() {
        let runtime = Runtime::with_initial_epoch(Epoch(600));
        let cell = LockedCell::new(&runtime, 0_i64);

        let pin = runtime.begin();
        runtime.transaction(|txn| {
            cell.write(7);
            assert!(txn.commit());
        });
        pin.run(|| assert_eq!(cell.read(), 0));

        runtime.compress_epochs();
        assert_eq!(pin.epoch(), Epoch(1));
        pin.run(|| assert_eq!(cell.read(), 0));
        assert_eq!(cell.read(), 7);

        drop(pin);
        assert_eq!(cell.history_size(), 0);
    }
}
