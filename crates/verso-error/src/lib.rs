#![forbid(unsafe_code)]
//! Error types for the verso runtime.
//!
//! Defines [`VersoError`] and a `Result<T>` alias used throughout the
//! workspace. Every variant here is a programmer bug or an invariant
//! violation: commit conflicts are *not* errors (they surface as a `false`
//! commit outcome and are retried by the caller). Internal layers propagate
//! these as `Result` so they can be asserted in tests; the runtime treats
//! them as fatal at its public boundary.

use thiserror::Error;
use verso_types::Epoch;

/// Unified error type for all verso invariant violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersoError {
    #[error("read at epoch {epoch} predates earliest live snapshot {earliest}: version history already reclaimed")]
    ExpiredEpoch { epoch: Epoch, earliest: Epoch },

    #[error("critical-section nesting violation: {detail}")]
    Nesting { detail: &'static str },

    #[error("snapshot registry corruption: {detail}")]
    RegistryCorruption { detail: String },

    #[error("epoch order violation: {detail}")]
    EpochOrder { detail: String },
}

/// Result alias using `VersoError`.
pub type Result<T> = std::result::Result<T, VersoError>;
