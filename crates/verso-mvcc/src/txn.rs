//! Transactions and their write sandbox.
//!
//! A transaction is a registered snapshot plus a thread-confined sandbox of
//! speculative per-cell values, wrapped in a critical section for its whole
//! lifetime. The commit protocol is serialized by the runtime's commit
//! lock: stage every sandbox slot in insertion order, and either publish
//! the next epoch and confirm every slot, or roll back the staged prefix.
//!
//! Transactions are deliberately `!Send`: the sandbox, the thread-local
//! `current transaction` stack and the critical-section nesting all belong
//! to the opening thread.

use crate::fatal;
use crate::object::VersionedObject;
use crate::registry::SnapshotCore;
use crate::runtime::Runtime;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};
use verso_types::{Epoch, SnapshotStatus};

struct SandboxSlot {
    object: Arc<dyn VersionedObject>,
    local: Box<dyn Any>,
}

impl SandboxSlot {
    fn local_ref(&self) -> &dyn Any {
        self.local.as_ref()
    }
}

/// The per-transaction buffer of speculative cell values, keyed by cell
/// identity. Slots keep their insertion order; the commit protocol stages
/// and confirms them in that order.
#[derive(Default)]
pub(crate) struct Sandbox {
    slots: Vec<SandboxSlot>,
    index: HashMap<usize, usize>,
}

impl Sandbox {
    pub(crate) fn local<T: 'static>(&self, key: usize) -> Option<&T> {
        self.index
            .get(&key)
            .and_then(|&slot| self.slots[slot].local.downcast_ref::<T>())
    }

    pub(crate) fn local_or_insert_with<T: 'static>(
        &mut self,
        object: Arc<dyn VersionedObject>,
        key: usize,
        init: impl FnOnce() -> T,
    ) -> &mut T {
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                self.slots.push(SandboxSlot {
                    object,
                    local: Box::new(init()),
                });
                let slot = self.slots.len() - 1;
                self.index.insert(key, slot);
                slot
            }
        };
        self.slots[slot]
            .local
            .downcast_mut::<T>()
            .expect("sandbox slot payload type changed between accesses")
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for slot in &self.slots {
            list.entry(&format_args!(
                "{}",
                slot.object.describe_local(slot.local_ref())
            ));
        }
        list.finish()
    }
}

pub(crate) struct TxnCore {
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) snapshot: Arc<SnapshotCore>,
    pub(crate) sandbox: RefCell<Sandbox>,
}

impl Drop for TxnCore {
    fn drop(&mut self) {
        // Unregister first: the dispatched cleanups may defer work against
        // the critical section we are still inside.
        self.runtime.registry().remove(&self.snapshot);
        self.runtime.gc().leave();
    }
}

thread_local! {
    /// Stack of transactions entered on this thread, innermost last.
    static CURRENT: RefCell<Vec<Rc<TxnCore>>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` against the innermost entered transaction belonging to
/// `runtime`, if any.
pub(crate) fn with_current_for<R>(
    runtime: &Arc<Runtime>,
    f: impl FnOnce(&TxnCore) -> R,
) -> Option<R> {
    let core = CURRENT.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|core| Arc::ptr_eq(&core.runtime, runtime))
            .map(Rc::clone)
    });
    core.map(|core| f(&core))
}

/// A snapshot-isolated transaction over one runtime's cells.
///
/// Creating a transaction enters a critical section and registers its
/// snapshot at the current epoch; dropping it unregisters and leaves.
/// Cell access requires the transaction to be *entered* on the calling
/// thread — see [`Transaction::scope`] and [`Transaction::run`].
pub struct Transaction {
    core: Rc<TxnCore>,
}

impl Transaction {
    pub(crate) fn open(runtime: &Arc<Runtime>) -> Self {
        runtime.gc().enter();
        let snapshot = SnapshotCore::new(runtime.next_snapshot_id());
        runtime.registry().register(&snapshot);
        trace!(
            target: "verso::txn",
            id = %snapshot.id(),
            epoch = %snapshot.epoch(),
            "transaction_opened"
        );
        Self {
            core: Rc::new(TxnCore {
                runtime: Arc::clone(runtime),
                snapshot,
                sandbox: RefCell::new(Sandbox::default()),
            }),
        }
    }

    /// The epoch this transaction reads at.
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.core.snapshot.epoch()
    }

    /// How many times the snapshot has been restarted.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.core.snapshot.retries()
    }

    #[must_use]
    pub fn status(&self) -> SnapshotStatus {
        self.core.snapshot.status()
    }

    /// Number of cells with a staged local value.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.core.sandbox.borrow().len()
    }

    /// Make this the calling thread's current transaction for the guard's
    /// lifetime.
    #[must_use]
    pub fn scope(&self) -> TransactionScope<'_> {
        CURRENT.with(|stack| stack.borrow_mut().push(Rc::clone(&self.core)));
        TransactionScope {
            core: Rc::clone(&self.core),
            _transaction: std::marker::PhantomData,
        }
    }

    /// Run `f` with this transaction entered on the calling thread.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = self.scope();
        f()
    }

    /// Attempt to commit every staged write.
    ///
    /// Returns `false` on a write-write conflict; the snapshot is then
    /// restarted so a retry reads the now-current state. Either way the
    /// sandbox is cleared and the transaction handle remains usable.
    pub fn commit(&self) -> bool {
        let core = &self.core;
        let runtime = &core.runtime;
        core.snapshot.set_status(SnapshotStatus::Committing);

        let guard = runtime.commit_lock().lock();
        let old_epoch = core.snapshot.epoch();
        let new_epoch = runtime
            .clock()
            .current()
            .checked_next()
            .expect("epoch counter exhausted; compress_epochs was never invoked");

        let mut sandbox = core.sandbox.borrow_mut();
        let mut conflicted_at = None;
        for (index, slot) in sandbox.slots.iter().enumerate() {
            match slot.object.setup(old_epoch, new_epoch, slot.local_ref()) {
                Ok(true) => {}
                Ok(false) => {
                    conflicted_at = Some(index);
                    break;
                }
                Err(err) => fatal(&err),
            }
        }

        let success = conflicted_at.is_none();
        if success {
            // Publish the epoch before anything else becomes visible: a
            // snapshot registered after this point must never observe the
            // histories of the old epoch being torn down.
            let advanced = runtime.clock().advance();
            debug_assert_eq!(advanced, new_epoch);
            // Move our own snapshot onto the new epoch so the cleanups the
            // commit hooks register are gated by it, not by the entry we
            // are leaving.
            runtime.registry().remove(&core.snapshot);
            runtime.registry().register(&core.snapshot);
            for slot in &sandbox.slots {
                slot.object.commit(new_epoch);
            }
        } else {
            let staged = conflicted_at.unwrap_or(0);
            for slot in &sandbox.slots[..staged] {
                slot.object.rollback(new_epoch, slot.local_ref());
            }
        }
        drop(guard);
        runtime.record_commit_outcome(success);

        let writes = sandbox.len();
        sandbox.clear();
        drop(sandbox);

        if success {
            core.snapshot.set_status(SnapshotStatus::Committed);
            // A fresh reclamation window: deferrals of the next attempt
            // must not be pinned by the window that observed old versions.
            runtime.gc().renew();
            debug!(
                target: "verso::txn",
                id = %core.snapshot.id(),
                epoch = %new_epoch,
                writes,
                "commit_published"
            );
            true
        } else {
            core.snapshot.set_status(SnapshotStatus::Failed);
            debug!(
                target: "verso::txn",
                id = %core.snapshot.id(),
                old_epoch = %old_epoch,
                writes,
                "commit_conflict"
            );
            self.restart();
            false
        }
    }

    /// Restart the snapshot after a conflict: bump the retry counter and,
    /// when the epoch has advanced, re-register at the current one.
    pub fn restart(&self) {
        let core = &self.core;
        core.snapshot.set_status(SnapshotStatus::Restarting);
        core.snapshot.bump_retries();
        if core.runtime.clock().current() != core.snapshot.epoch() {
            core.runtime.registry().remove(&core.snapshot);
            core.runtime.registry().register(&core.snapshot);
        }
        trace!(
            target: "verso::txn",
            id = %core.snapshot.id(),
            epoch = %core.snapshot.epoch(),
            retries = core.snapshot.retries(),
            "transaction_restarted"
        );
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.core.snapshot.id())
            .field("epoch", &self.core.snapshot.epoch())
            .field("retries", &self.core.snapshot.retries())
            .field("status", &self.core.snapshot.status())
            .field("sandbox", &self.core.sandbox.borrow())
            .finish()
    }
}

/// RAII guard making a transaction the thread's current one; restores the
/// previous current transaction on drop.
#[must_use]
pub struct TransactionScope<'a> {
    core: Rc<TxnCore>,
    _transaction: std::marker::PhantomData<&'a Transaction>,
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert!(
                popped.is_some_and(|core| Rc::ptr_eq(&core, &self.core)),
                "transaction scopes dropped out of order"
            );
        });
    }
}
