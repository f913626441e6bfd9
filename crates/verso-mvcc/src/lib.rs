#![forbid(unsafe_code)]
//! An in-process MVCC runtime for shared mutable data.
//!
//! Application threads read and modify [`VersionedCell`]s inside short
//! [`Transaction`]s. Every transaction reads at a fixed snapshot epoch;
//! writes stay in a thread-confined sandbox until an optimistic commit
//! either publishes them under the next epoch or reports a write-write
//! conflict for the caller to retry. Obsolete versions are reclaimed only
//! once the last snapshot able to read them has gone, with the final
//! destruction gated by `verso-gc`'s critical sections so that lock-free
//! readers never observe freed history arrays.
//!
//! ```
//! use verso_mvcc::{Runtime, VersionedCell};
//!
//! let runtime = Runtime::new();
//! let balance = VersionedCell::new(&runtime, 100_i64);
//!
//! runtime.transaction(|txn| {
//!     balance.mutate(|value| *value -= 30);
//!     assert!(txn.commit());
//! });
//!
//! assert_eq!(balance.read(), 70);
//! ```
//!
//! # Structure
//!
//! - [`clock`]: the monotone epoch pair (`current`, `earliest`)
//! - [`cell`]: typed cells with copy-on-write version histories
//! - [`locked`]: the mutex-guarded cell flavor
//! - [`registry`]: epoch-keyed snapshot bookkeeping and cleanup hand-off
//! - [`txn`]: transactions, the sandbox and the commit protocol
//! - [`runtime`]: domain wiring plus the process-wide instance
//!
//! Conflicts are an expected outcome and surface as `false` from
//! [`Transaction::commit`]. Everything else in the error taxonomy —
//! expired epochs, nesting violations, registry corruption, epoch-order
//! violations — is a programmer bug: it is logged at error level and the
//! runtime aborts by panicking.

pub mod cell;
pub mod clock;
pub mod locked;
pub mod object;
pub mod registry;
pub mod runtime;
pub mod txn;

pub use cell::VersionedCell;
pub use clock::EpochClock;
pub use locked::LockedCell;
pub use object::{EpochRenumbering, VersionedObject};
pub use registry::SnapshotRegistry;
pub use runtime::{
    Runtime, RuntimeStats, compress_epochs, current_epoch, earliest_epoch, enter_critical, global,
    leave_critical, open_transaction, schedule_cleanup,
};
pub use txn::{Transaction, TransactionScope};
pub use verso_error::{Result, VersoError};
pub use verso_types::{Epoch, SnapshotId, SnapshotStatus};

use tracing::error;

/// Abort on an invariant violation: log and panic.
pub(crate) fn fatal(err: &VersoError) -> ! {
    error!(target: "verso::runtime", error = %err, "fatal_invariant_violation");
    panic!("verso-mvcc: {err}");
}
