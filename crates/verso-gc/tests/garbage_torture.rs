//! Torture test for critical-section gated reclamation, modeled on the
//! shared-slot workload: every thread repeatedly publishes a new object into
//! its slot and defers destruction of the old one, while reading every other
//! thread's slot from inside a critical section.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, Weak};
use std::thread;
use verso_gc::GcDomain;

const MAGIC_LIVE: u32 = 0x0003_8D3E;
const MAGIC_DEAD: u32 = 0x0000_4B53;

struct CheckedObject {
    value: usize,
    magic: AtomicU32,
    live: Arc<AtomicUsize>,
}

impl CheckedObject {
    fn new(value: usize, live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            value,
            magic: AtomicU32::new(MAGIC_LIVE),
            live: Arc::clone(live),
        }
    }

    fn get(&self) -> usize {
        assert_eq!(
            self.magic.load(Ordering::SeqCst),
            MAGIC_LIVE,
            "read through a reclaimed object"
        );
        self.value
    }
}

impl Drop for CheckedObject {
    fn drop(&mut self) {
        let previous = self.magic.swap(MAGIC_DEAD, Ordering::SeqCst);
        assert_eq!(previous, MAGIC_LIVE, "object destroyed twice");
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared slots hold only weak handles. The single strong handle to each
/// superseded object lives inside its deferred cleanup, so a successful
/// `Weak::upgrade` from inside a critical section proves the cleanup has not
/// run yet — and a failed upgrade of a value that was current when the
/// section began would be a reclamation-safety bug.
fn run_torture(threads: usize, iterations: usize) {
    let domain = Arc::new(GcDomain::new());
    let live = Arc::new(AtomicUsize::new(0));
    let slots: Arc<Vec<Mutex<Weak<CheckedObject>>>> =
        Arc::new((0..threads).map(|_| Mutex::new(Weak::new())).collect());

    // Seed every slot with an initial object whose strong handle is parked
    // in the owning thread, exactly like the steady-state protocol below.
    let mut currents: Vec<Option<Arc<CheckedObject>>> = (0..threads)
        .map(|slot| {
            let object = Arc::new(CheckedObject::new(0, &live));
            *slots[slot].lock().expect("slot lock") = Arc::downgrade(&object);
            Some(object)
        })
        .collect();

    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|thread_id| {
            let domain = Arc::clone(&domain);
            let live = Arc::clone(&live);
            let slots = Arc::clone(&slots);
            let barrier = Arc::clone(&barrier);
            let mut current = currents[thread_id].take();
            thread::spawn(move || {
                barrier.wait();
                let mut observed = vec![0_usize; slots.len()];
                for iteration in 1..=iterations {
                    domain.enter();

                    for (slot, floor) in observed.iter_mut().enumerate() {
                        let weak = slots[slot].lock().expect("slot lock").clone();
                        let object = weak
                            .upgrade()
                            .expect("object reclaimed while a critical section could observe it");
                        let value = object.get();
                        assert!(
                            value >= *floor,
                            "slot {slot} went backwards: read {value}, had seen {floor}"
                        );
                        *floor = value;
                    }

                    let fresh = Arc::new(CheckedObject::new(iteration, &live));
                    *slots[thread_id].lock().expect("slot lock") = Arc::downgrade(&fresh);
                    let retired = current.replace(fresh).expect("current object");
                    domain.defer(move || drop(retired));

                    domain.leave();
                }
                // Hand the final object back so the test can account for it.
                current.expect("current object")
            })
        })
        .collect();

    let finals: Vec<Arc<CheckedObject>> = handles
        .into_iter()
        .map(|handle| handle.join().expect("torture thread"))
        .collect();

    assert_eq!(domain.active_sections(), 0);
    assert_eq!(domain.pending_cleanups(), 0);
    assert_eq!(live.load(Ordering::SeqCst), threads);
    for (slot, object) in finals.iter().enumerate() {
        assert_eq!(object.get(), iterations, "slot {slot} missed updates");
    }

    drop(finals);
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn torture_single_thread() {
    run_torture(1, 2_000);
}

#[test]
fn torture_two_threads() {
    run_torture(2, 2_000);
}

#[test]
fn torture_many_threads() {
    run_torture(16, 500);
}

#[test]
fn torture_wide() {
    run_torture(48, 120);
}
