#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the global commit order.
///
/// Epochs are opaque monotone integers starting at [`Epoch::FIRST`]. Only the
/// epoch clock mutates the process-wide current epoch, and only while the
/// commit lock is held. [`Epoch::INFINITE`] is the sentinel upper bound
/// carried by the newest version of every cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    /// The first epoch ever assigned; no version is valid before it.
    pub const FIRST: Self = Self(1);

    /// Exclusive upper bound of the newest version of a cell.
    pub const INFINITE: Self = Self(u64::MAX);

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    /// The immediately following epoch.
    ///
    /// Returns `None` when the counter is exhausted; callers are expected to
    /// compress epochs long before that point.
    #[must_use]
    pub fn checked_next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INFINITE {
            f.write_str("inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Process-unique identity of a registered snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Lifecycle of a snapshot, from registration through commit or restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    Uninitialized,
    Initialized,
    Restarting,
    Restarted,
    Committing,
    Committed,
    Failed,
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Restarting => "restarting",
            Self::Restarted => "restarted",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
