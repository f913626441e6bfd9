//! The object-safe commit-protocol interface.
//!
//! Cells of heterogeneous payload types participate uniformly in the commit
//! protocol through [`VersionedObject`]. The payload type parameterizes only
//! the cell; the sandbox and the snapshot registry see trait objects plus a
//! type-erased transaction-local value.

use std::any::Any;
use std::fmt;
use verso_error::Result;
use verso_types::Epoch;

/// A resource that takes part in the two-phase commit and in epoch-gated
/// version reclamation.
///
/// `setup` is the only hook that may refuse; `commit` and `rollback` are
/// declared non-failing — any internal error there is an invariant violation
/// and fatal.
pub trait VersionedObject: Send + Sync + fmt::Debug {
    /// Stage the speculative value for `new_epoch`, checking for a
    /// write-write conflict against `old_epoch`.
    ///
    /// Returns `Ok(false)` when a commit since `old_epoch` already replaced
    /// the value this transaction read.
    ///
    /// # Errors
    ///
    /// Returns [`verso_error::VersoError::EpochOrder`] when `new_epoch` is
    /// not the immediate successor of the current epoch.
    fn setup(&self, old_epoch: Epoch, new_epoch: Epoch, local: &dyn Any) -> Result<bool>;

    /// Make a staged value definitive and register reclamation of the
    /// version it obsoleted.
    fn commit(&self, new_epoch: Epoch);

    /// Withdraw a staged value after another object in the same commit
    /// conflicted.
    fn rollback(&self, new_epoch: Epoch, local: &dyn Any);

    /// Destroy the version whose `valid_from` equals `unused_valid_from`.
    /// `trigger_epoch` names the snapshot epoch whose death released it.
    ///
    /// # Errors
    ///
    /// Returns [`verso_error::VersoError::RegistryCorruption`] when no such
    /// version exists.
    fn cleanup(&self, unused_valid_from: Epoch, trigger_epoch: Epoch) -> Result<()>;

    /// Relocate every version boundary through `renumbering`, preserving
    /// order. Called only by epoch compression, under the commit lock and
    /// the registry mutex.
    ///
    /// # Errors
    ///
    /// Returns [`verso_error::VersoError::EpochOrder`] when the renumbering
    /// would leave the boundaries out of order.
    fn rename_epochs(&self, renumbering: &EpochRenumbering) -> Result<()>;

    /// Render a sandbox-local value for diagnostics.
    fn describe_local(&self, local: &dyn Any) -> String;
}

/// Order-preserving dense renumbering of the live snapshot epochs, built by
/// epoch compression.
///
/// Maps every epoch to `1 + |{live epochs < it}|`: the i-th live epoch
/// becomes `i + 1`, a boundary between two live epochs lands with the one
/// above it, and anything above the youngest live epoch maps to `n + 1`.
/// [`Epoch::INFINITE`] is a fixpoint.
#[derive(Debug, Clone)]
pub struct EpochRenumbering {
    live: Vec<Epoch>,
}

impl EpochRenumbering {
    /// Build from the ascending list of live snapshot epochs.
    #[must_use]
    pub fn new(live: Vec<Epoch>) -> Self {
        debug_assert!(live.windows(2).all(|pair| pair[0] < pair[1]));
        Self { live }
    }

    /// The number of live epochs being renumbered.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Map one epoch into the compressed range.
    #[must_use]
    pub fn renumber(&self, epoch: Epoch) -> Epoch {
        if epoch == Epoch::INFINITE {
            return Epoch::INFINITE;
        }
        let below = self.live.partition_point(|&live| live < epoch);
        Epoch(below as u64 + 1)
    }
}
