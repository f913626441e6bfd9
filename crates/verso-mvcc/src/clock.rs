//! The process-wide epoch clock.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use verso_error::{Result, VersoError};
use verso_types::Epoch;

/// Monotone pair of counters: the current epoch (tail of the commit order)
/// and the earliest epoch any live snapshot still reads at.
///
/// Both are plain atomics. `current` is published with a release store and
/// only ever advanced while the commit lock is held; `earliest` moves only
/// under the registry mutex. [`EpochClock::reset`] is the single exception
/// to monotonicity and belongs to epoch compression, which holds both locks.
#[derive(Debug)]
pub struct EpochClock {
    current: AtomicU64,
    earliest: AtomicU64,
}

impl EpochClock {
    #[must_use]
    pub fn new(initial: Epoch) -> Self {
        Self {
            current: AtomicU64::new(initial.get()),
            earliest: AtomicU64::new(initial.get()),
        }
    }

    /// The current epoch (acquire load).
    #[must_use]
    pub fn current(&self) -> Epoch {
        Epoch(self.current.load(Ordering::Acquire))
    }

    /// The floor of live snapshot epochs (acquire load).
    #[must_use]
    pub fn earliest(&self) -> Epoch {
        Epoch(self.earliest.load(Ordering::Acquire))
    }

    /// Publish `current + 1` with a release store and return it.
    ///
    /// Must only be called with the commit lock held; the release pairs with
    /// the acquire load in snapshot registration, so a snapshot registered
    /// after this call observes every write of the publishing commit.
    ///
    /// # Panics
    ///
    /// Panics when the epoch counter is exhausted. Hosts are expected to
    /// compress epochs long before this point.
    pub fn advance(&self) -> Epoch {
        let current = self.current();
        let Some(next) = current.checked_next() else {
            panic!("verso-mvcc: epoch counter exhausted at {current}; compress_epochs was never invoked");
        };
        self.current.store(next.get(), Ordering::Release);
        trace!(target: "verso::clock", epoch = %next, "epoch_advanced");
        next
    }

    /// Raise the earliest-epoch floor.
    ///
    /// # Errors
    ///
    /// Returns [`VersoError::EpochOrder`] when `epoch` would move the floor
    /// backward or past the current epoch.
    pub fn set_earliest(&self, epoch: Epoch) -> Result<()> {
        let earliest = self.earliest();
        let current = self.current();
        if epoch < earliest {
            return Err(VersoError::EpochOrder {
                detail: format!("earliest epoch would move backward: {epoch} < {earliest}"),
            });
        }
        if epoch > current {
            return Err(VersoError::EpochOrder {
                detail: format!("earliest epoch would pass current: {epoch} > {current}"),
            });
        }
        self.earliest.store(epoch.get(), Ordering::Release);
        Ok(())
    }

    /// Reset both counters. Only epoch compression may call this, and only
    /// while holding the commit lock and the registry mutex.
    pub(crate) fn reset(&self, current: Epoch, earliest: Epoch) {
        self.current.store(current.get(), Ordering::Release);
        self.earliest.store(earliest.get(), Ordering::Release);
    }

    /// Distance left before the epoch counter is exhausted.
    #[must_use]
    pub fn headroom(&self) -> u64 {
        u64::MAX - self.current().get()
    }
}
