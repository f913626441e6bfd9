//! The snapshot registry: epoch-keyed bookkeeping of live snapshots and of
//! the obsolete versions whose destruction they delay.
//!
//! One mutex guards the whole map. Each entry pairs the snapshots reading at
//! that epoch with the cleanup records gated by them. When an entry's last
//! snapshot leaves, its records are either handed to the predecessor entry
//! (still readable there) or dispatched back to the owning cells — after the
//! registry mutex is dropped, because `cleanup` takes the per-cell mutex and
//! the lock order runs registry → cell, never the reverse.
//!
//! # Logging
//!
//! - **TRACE** `verso::registry`: `snapshot_registered` / `snapshot_removed` /
//!   `cleanup_registered`
//! - **DEBUG** `verso::registry`: `registry_entry_cleaned` — an epoch entry
//!   drained, with transfer/dispatch counts
//! - **INFO**  `verso::registry`: `epochs_compressed`

use crate::clock::EpochClock;
use crate::fatal;
use crate::object::{EpochRenumbering, VersionedObject};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace};
use verso_error::VersoError;
use verso_types::{Epoch, SnapshotId, SnapshotStatus};

/// Shared state of one registered snapshot.
///
/// The epoch is atomic because epoch compression renames snapshots from
/// under their owning transactions.
#[derive(Debug)]
pub(crate) struct SnapshotCore {
    id: SnapshotId,
    epoch: AtomicU64,
    retries: AtomicU32,
    status: Mutex<SnapshotStatus>,
}

impl SnapshotCore {
    pub(crate) fn new(id: SnapshotId) -> Arc<Self> {
        Arc::new(Self {
            id,
            epoch: AtomicU64::new(0),
            retries: AtomicU32::new(0),
            status: Mutex::new(SnapshotStatus::Uninitialized),
        })
    }

    pub(crate) fn id(&self) -> SnapshotId {
        self.id
    }

    pub(crate) fn epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::Acquire))
    }

    fn set_epoch(&self, epoch: Epoch) {
        self.epoch.store(epoch.get(), Ordering::Release);
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn status(&self) -> SnapshotStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: SnapshotStatus) {
        *self.status.lock() = status;
    }

    fn after_register(&self) {
        let mut status = self.status.lock();
        *status = match *status {
            SnapshotStatus::Uninitialized => SnapshotStatus::Initialized,
            SnapshotStatus::Restarting => SnapshotStatus::Restarted,
            other => other,
        };
    }
}

/// A weak pointer back to the cell owning an obsolete version, plus the
/// version's bounds: `valid_from` identifies it inside the cell, and
/// `obsoleted_at` (the epoch of the commit that replaced it) lets epoch
/// compression decide whether any live snapshot can still read it.
struct CleanupRecord {
    object: Weak<dyn VersionedObject>,
    valid_from: Epoch,
    obsoleted_at: Epoch,
}

#[derive(Default)]
struct EpochEntry {
    snapshots: HashMap<SnapshotId, Arc<SnapshotCore>>,
    cleanups: Vec<CleanupRecord>,
}

type Entries = BTreeMap<Epoch, EpochEntry>;

/// Process-wide registry of live snapshots, keyed by epoch.
pub struct SnapshotRegistry {
    clock: Arc<EpochClock>,
    entries: Mutex<Entries>,
}

impl SnapshotRegistry {
    pub(crate) fn new(clock: Arc<EpochClock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register `snapshot` at the current epoch.
    ///
    /// A new registration always lands at the tail of the map; anything else
    /// means the epoch went backward and is fatal. Registration also settles
    /// the previously most-recent entry when its last snapshot left while
    /// this one was being created.
    pub(crate) fn register(&self, snapshot: &Arc<SnapshotCore>) {
        let mut entries = self.entries.lock();
        let epoch = self.clock.current();
        snapshot.set_epoch(epoch);

        let previous_latest = entries
            .keys()
            .next_back()
            .copied()
            .filter(|&latest| latest != epoch);

        entries
            .entry(epoch)
            .or_default()
            .snapshots
            .insert(snapshot.id(), Arc::clone(snapshot));

        if entries.keys().next_back() != Some(&epoch) {
            fatal(&VersoError::RegistryCorruption {
                detail: format!(
                    "snapshot {} registered at stale epoch {epoch}",
                    snapshot.id()
                ),
            });
        }

        snapshot.after_register();
        trace!(
            target: "verso::registry",
            id = %snapshot.id(),
            epoch = %epoch,
            "snapshot_registered"
        );

        if let Some(stale) = previous_latest {
            let drained = entries
                .get(&stale)
                .is_some_and(|entry| entry.snapshots.is_empty());
            if drained {
                self.perform_cleanup(stale, entries);
            }
        }
    }

    /// Remove `snapshot` from its epoch entry, settling the entry when it
    /// was the last reader there.
    pub(crate) fn remove(&self, snapshot: &Arc<SnapshotCore>) {
        let mut entries = self.entries.lock();
        if entries.is_empty() {
            fatal(&VersoError::RegistryCorruption {
                detail: format!("snapshot {} removed from an empty registry", snapshot.id()),
            });
        }
        let epoch = snapshot.epoch();
        let Some(entry) = entries.get_mut(&epoch) else {
            fatal(&VersoError::RegistryCorruption {
                detail: format!("snapshot {} not found at epoch {epoch}", snapshot.id()),
            });
        };
        if entry.snapshots.remove(&snapshot.id()).is_none() {
            fatal(&VersoError::RegistryCorruption {
                detail: format!(
                    "snapshot {} missing from its epoch bucket {epoch}",
                    snapshot.id()
                ),
            });
        }
        trace!(
            target: "verso::registry",
            id = %snapshot.id(),
            epoch = %epoch,
            "snapshot_removed"
        );
        if entry.snapshots.is_empty() {
            self.perform_cleanup(epoch, entries);
        }
    }

    /// Gate destruction of an obsolete version behind the most recent
    /// registry entry. Called only while the commit lock is held.
    pub(crate) fn register_cleanup(
        &self,
        object: Weak<dyn VersionedObject>,
        valid_from: Epoch,
        obsoleted_at: Epoch,
    ) {
        let mut entries = self.entries.lock();
        let Some((&epoch, entry)) = entries.iter_mut().next_back() else {
            fatal(&VersoError::RegistryCorruption {
                detail: format!("cleanup of valid_from {valid_from} registered with no live snapshots"),
            });
        };
        entry.cleanups.push(CleanupRecord {
            object,
            valid_from,
            obsoleted_at,
        });
        trace!(
            target: "verso::registry",
            epoch = %epoch,
            valid_from = %valid_from,
            "cleanup_registered"
        );
    }

    /// Retire the drained entry at `epoch`: hand still-visible records to
    /// the predecessor entry, advance the earliest-epoch floor when the
    /// oldest entry died, then dispatch the unreachable records with the
    /// registry mutex released.
    fn perform_cleanup(&self, epoch: Epoch, mut entries: MutexGuard<'_, Entries>) {
        let Some(entry) = entries.remove(&epoch) else {
            fatal(&VersoError::RegistryCorruption {
                detail: format!("cleanup of a missing registry entry at {epoch}"),
            });
        };
        if !entry.snapshots.is_empty() {
            fatal(&VersoError::RegistryCorruption {
                detail: format!("cleanup of epoch {epoch} with snapshots still registered"),
            });
        }

        let previous = entries.range(..epoch).next_back().map(|(&key, _)| key);
        let mut drained = Vec::new();
        match previous {
            Some(previous_epoch) => {
                let previous_entry = entries
                    .get_mut(&previous_epoch)
                    .expect("predecessor entry vanished under the registry lock");
                for record in entry.cleanups {
                    if previous_epoch >= record.valid_from {
                        // A reader at the predecessor can still see this
                        // version; it inherits the record.
                        previous_entry.cleanups.push(record);
                    } else {
                        drained.push(record);
                    }
                }
            }
            None => {
                // The oldest epoch died; the floor moves to the new oldest,
                // or to the current epoch when no snapshot remains.
                drained = entry.cleanups;
                let next_earliest = entries
                    .keys()
                    .next()
                    .copied()
                    .unwrap_or_else(|| self.clock.current());
                if let Err(err) = self.clock.set_earliest(next_earliest) {
                    fatal(&err);
                }
            }
        }
        debug!(
            target: "verso::registry",
            epoch = %epoch,
            dispatched = drained.len(),
            "registry_entry_cleaned"
        );
        drop(entries);

        for record in drained {
            let Some(object) = record.object.upgrade() else {
                trace!(
                    target: "verso::registry",
                    valid_from = %record.valid_from,
                    "cleanup_target_dropped"
                );
                continue;
            };
            if let Err(err) = object.cleanup(record.valid_from, epoch) {
                fatal(&err);
            }
        }
    }

    /// Renumber the live epochs to the dense range `1..=n`, preserving
    /// order, and reset the clock to `current = n + 1`, `earliest = 1`.
    ///
    /// Runs entirely under the registry mutex (the caller holds the commit
    /// lock). Versions that no live snapshot can read are destroyed first:
    /// keeping them would force two surviving boundaries onto the same
    /// compressed epoch. Cell boundaries are relocated before the snapshot
    /// handles are renamed, so a snapshot keeps selecting the same version
    /// on either side of its own renaming.
    pub(crate) fn compress(&self) {
        let mut entries = self.entries.lock();
        let live: Vec<Epoch> = entries.keys().copied().collect();

        let mut flush = Vec::new();
        for (&epoch, entry) in entries.iter_mut() {
            let mut index = 0;
            while index < entry.cleanups.len() {
                let record = &entry.cleanups[index];
                let reachable = live
                    .iter()
                    .any(|&snapshot| record.valid_from <= snapshot && snapshot < record.obsoleted_at);
                if reachable {
                    index += 1;
                } else {
                    flush.push((epoch, entry.cleanups.swap_remove(index)));
                }
            }
        }
        for (trigger, record) in flush {
            let Some(object) = record.object.upgrade() else {
                continue;
            };
            if let Err(err) = object.cleanup(record.valid_from, trigger) {
                fatal(&err);
            }
        }

        let renumbering = EpochRenumbering::new(live);

        // Every cell with surviving obsolete versions appears in at least
        // one record; rename each exactly once.
        let mut cells: Vec<Arc<dyn VersionedObject>> = Vec::new();
        for entry in entries.values() {
            for record in &entry.cleanups {
                if let Some(object) = record.object.upgrade() {
                    let ptr = Arc::as_ptr(&object) as *const ();
                    if !cells
                        .iter()
                        .any(|known| std::ptr::eq(Arc::as_ptr(known) as *const (), ptr))
                    {
                        cells.push(object);
                    }
                }
            }
        }
        for cell in &cells {
            if let Err(err) = cell.rename_epochs(&renumbering) {
                fatal(&err);
            }
        }

        let old_entries = std::mem::take(&mut *entries);
        for (old_epoch, mut entry) in old_entries {
            let new_epoch = renumbering.renumber(old_epoch);
            for record in &mut entry.cleanups {
                record.valid_from = renumbering.renumber(record.valid_from);
                record.obsoleted_at = renumbering.renumber(record.obsoleted_at);
            }
            for snapshot in entry.snapshots.values() {
                snapshot.set_epoch(new_epoch);
            }
            debug!(
                target: "verso::registry",
                old_epoch = %old_epoch,
                new_epoch = %new_epoch,
                "epoch_renumbered"
            );
            entries.insert(new_epoch, entry);
        }

        let live_count = renumbering.live_count() as u64;
        let current = Epoch(live_count + 1);
        self.clock.reset(current, Epoch::FIRST);
        info!(
            target: "verso::registry",
            live = live_count,
            current = %current,
            renamed_cells = cells.len(),
            "epochs_compressed"
        );
    }

    /// Number of distinct epochs with registered snapshots.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Total number of cleanup records awaiting dispatch.
    #[must_use]
    pub fn pending_cleanups(&self) -> usize {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.cleanups.len())
            .sum()
    }

    /// Whether no snapshot is registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for SnapshotRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(entries) = self.entries.try_lock() else {
            return f.write_str("SnapshotRegistry { <locked> }");
        };
        let mut map = f.debug_map();
        for (epoch, entry) in entries.iter() {
            map.entry(
                &format_args!("{epoch}"),
                &format_args!(
                    "{} snapshots, {} cleanups",
                    entry.snapshots.len(),
                    entry.cleanups.len()
                ),
            );
        }
        map.finish()
    }
}
