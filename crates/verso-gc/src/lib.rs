#![forbid(unsafe_code)]
//! Critical-section gated deferred reclamation.
//!
//! A [`GcDomain`] bounds the lifetime of shared objects by the lifetime of
//! the longest-running reader that could have observed them, without
//! per-object reference counting. Threads bracket their reads with
//! [`GcDomain::enter`]/[`GcDomain::leave`] (or the RAII [`SectionGuard`]
//! from [`GcDomain::pin`]); work that must not run while any such reader is
//! still active is handed to [`GcDomain::defer`].
//!
//! # Design
//!
//! Each thread's outermost `enter` links a record into a global list ordered
//! by entry time; nested enters only bump a thread-local counter. When a
//! section ends while an *older* section is still running, everything the
//! young section deferred might still be referenced by the old one — so its
//! cleanup queue is transferred to the predecessor record. When the oldest
//! section ends, no active reader can hold references to anything it
//! accumulated, and its queue runs immediately (after the list lock is
//! released).
//!
//! # Logging
//!
//! - **TRACE** `verso::gc`: `section_enter` / `section_leave` — outermost
//!   transitions with the record index
//! - **DEBUG** `verso::gc`: `cleanups_transferred` — queue handed to a
//!   predecessor record
//! - **DEBUG** `verso::gc`: `cleanups_executed` — queue drained on exit

mod domain;

pub use domain::{Cleanup, GcDomain, ReclaimStats, SectionGuard};
