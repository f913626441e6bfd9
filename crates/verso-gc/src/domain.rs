use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace};
use verso_error::VersoError;

/// A deferred cleanup closure owned by a critical-section record.
pub type Cleanup = Box<dyn FnOnce() + Send>;

fn fatal(err: &VersoError) -> ! {
    error!(target: "verso::gc", error = %err, "fatal_invariant_violation");
    panic!("verso-gc: {err}");
}

/// One critical-section record in the global list.
///
/// A record is born LIVE when its thread's outermost `enter` links it at the
/// tail. On the matching `leave` it either dies directly (oldest record: the
/// queue runs) or goes through the ZOMBIE stage: the record is unlinked and
/// its queue is moved into the predecessor, which now owns those cleanups.
struct Record {
    prev: Option<usize>,
    next: Option<usize>,
    cleanups: Vec<Cleanup>,
}

#[derive(Default)]
struct SectionList {
    slots: Vec<Option<Record>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    active: usize,
}

impl SectionList {
    fn push_tail(&mut self) -> usize {
        let record = Record {
            prev: self.tail,
            next: None,
            cleanups: Vec::new(),
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(record);
                idx
            }
            None => {
                self.slots.push(Some(record));
                self.slots.len() - 1
            }
        };
        if let Some(tail) = self.tail {
            self.slots[tail]
                .as_mut()
                .expect("list tail points at a freed record")
                .next = Some(idx);
        } else {
            self.head = Some(idx);
        }
        self.tail = Some(idx);
        self.active += 1;
        idx
    }

    /// Unlink `idx` from the list.
    ///
    /// Returns the cleanups that became runnable: empty when the record had a
    /// predecessor (the queue was transferred to it), the record's whole
    /// queue when it was the oldest.
    fn unlink(&mut self, idx: usize) -> Vec<Cleanup> {
        let record = self.slots[idx]
            .take()
            .expect("unlinking a critical record that was already freed");
        match record.prev {
            Some(prev) => {
                self.slots[prev]
                    .as_mut()
                    .expect("record predecessor already freed")
                    .next = record.next;
            }
            None => self.head = record.next,
        }
        match record.next {
            Some(next) => {
                self.slots[next]
                    .as_mut()
                    .expect("record successor already freed")
                    .prev = record.prev;
            }
            None => self.tail = record.prev,
        }
        self.free.push(idx);
        self.active -= 1;

        if let Some(prev) = record.prev {
            let transferred = record.cleanups.len();
            self.slots[prev]
                .as_mut()
                .expect("record predecessor already freed")
                .cleanups
                .extend(record.cleanups);
            if transferred > 0 {
                debug!(
                    target: "verso::gc",
                    record = idx,
                    predecessor = prev,
                    transferred,
                    "cleanups_transferred"
                );
            }
            Vec::new()
        } else {
            record.cleanups
        }
    }

    fn pending_cleanups(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|record| record.cleanups.len())
            .sum()
    }
}

struct ThreadSection {
    nesting: usize,
    record: usize,
}

thread_local! {
    /// Per-thread section state, keyed by domain id so that independent
    /// domains (one per runtime) never observe each other's nesting.
    static SECTIONS: RefCell<HashMap<u64, ThreadSection>> = RefCell::new(HashMap::new());
}

static NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic deferral/execution counters for one domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub deferred: u64,
    pub executed: u64,
}

impl ReclaimStats {
    /// Cleanups handed to the domain that have not run yet.
    #[must_use]
    pub fn pending(self) -> u64 {
        self.deferred.saturating_sub(self.executed)
    }
}

/// A reclamation domain: the global critical-section list plus the
/// thread-local nesting state of every thread that uses it.
///
/// The list lock is held only for O(1) pointer work; cleanup closures always
/// run after it is released.
pub struct GcDomain {
    id: u64,
    list: Mutex<SectionList>,
    strict: bool,
    deferred: AtomicU64,
    executed: AtomicU64,
}

impl Default for GcDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl GcDomain {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed),
            list: Mutex::new(SectionList::default()),
            strict: false,
            deferred: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        }
    }

    /// A domain where deferring outside a critical section is a fatal
    /// nesting error instead of an inline run.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    /// Enter a critical section on the calling thread.
    ///
    /// Reentrant: nested calls only increment a thread-local counter. The
    /// outermost call links a fresh record at the tail of the domain list.
    pub fn enter(&self) {
        SECTIONS.with(|sections| {
            let mut sections = sections.borrow_mut();
            if let Some(section) = sections.get_mut(&self.id) {
                section.nesting += 1;
                return;
            }
            let record = self.list.lock().push_tail();
            trace!(target: "verso::gc", record, "section_enter");
            sections.insert(self.id, ThreadSection { nesting: 1, record });
        });
    }

    /// Leave the current critical section.
    ///
    /// The outermost leave unlinks this thread's record; its cleanup queue is
    /// transferred to the predecessor record if one exists, and executed
    /// right here otherwise.
    ///
    /// # Panics
    ///
    /// Panics (fatal nesting violation) when the thread is not inside a
    /// critical section of this domain.
    pub fn leave(&self) {
        let finished = SECTIONS.with(|sections| {
            let mut sections = sections.borrow_mut();
            let Some(section) = sections.get_mut(&self.id) else {
                fatal(&VersoError::Nesting {
                    detail: "leave_critical with no active critical section",
                });
            };
            section.nesting -= 1;
            if section.nesting > 0 {
                return None;
            }
            let record = section.record;
            sections.remove(&self.id);
            Some(record)
        });
        let Some(record) = finished else {
            return;
        };
        let ready = self.list.lock().unlink(record);
        trace!(target: "verso::gc", record, ready = ready.len(), "section_leave");
        self.run_cleanups(ready);
    }

    /// Enter a critical section for the lifetime of the returned guard.
    #[must_use]
    pub fn pin(&self) -> SectionGuard<'_> {
        self.enter();
        SectionGuard {
            domain: self,
            _not_send: PhantomData,
        }
    }

    /// Retire the calling thread's critical section and immediately open a
    /// fresh one, so that later deferrals are gated by a new window.
    ///
    /// With nested sections this is a no-op: the outer levels still pin the
    /// current window.
    ///
    /// # Panics
    ///
    /// Panics (fatal nesting violation) when the thread is not inside a
    /// critical section of this domain.
    pub fn renew(&self) {
        let outermost = SECTIONS.with(|sections| {
            let sections = sections.borrow();
            match sections.get(&self.id) {
                None => fatal(&VersoError::Nesting {
                    detail: "renew_critical with no active critical section",
                }),
                Some(section) if section.nesting == 1 => Some(section.record),
                Some(_) => None,
            }
        });
        let Some(old_record) = outermost else {
            return;
        };
        let (ready, new_record) = {
            let mut list = self.list.lock();
            let ready = list.unlink(old_record);
            let new_record = list.push_tail();
            (ready, new_record)
        };
        SECTIONS.with(|sections| {
            if let Some(section) = sections.borrow_mut().get_mut(&self.id) {
                section.record = new_record;
            }
        });
        trace!(
            target: "verso::gc",
            old_record,
            new_record,
            ready = ready.len(),
            "section_renewed"
        );
        self.run_cleanups(ready);
    }

    /// Defer `cleanup` until every critical section that could have observed
    /// its target has ended.
    ///
    /// Inside a critical section the closure joins the calling thread's
    /// record. Outside one it is gated behind the youngest live record of
    /// *any* thread, or — when the whole domain is quiescent — run inline.
    ///
    /// # Panics
    ///
    /// In a [`GcDomain::strict`] domain, deferring outside a critical
    /// section is a fatal nesting violation.
    pub fn defer(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.defer_boxed(Box::new(cleanup));
    }

    fn defer_boxed(&self, cleanup: Cleanup) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
        let record = SECTIONS.with(|sections| {
            sections
                .borrow()
                .get(&self.id)
                .map(|section| section.record)
        });
        if let Some(record) = record {
            self.list
                .lock()
                .slots[record]
                .as_mut()
                .expect("current thread's critical record was freed")
                .cleanups
                .push(cleanup);
            return;
        }
        if self.strict {
            fatal(&VersoError::Nesting {
                detail: "schedule_cleanup outside a critical section in strict mode",
            });
        }
        let mut list = self.list.lock();
        if let Some(tail) = list.tail {
            // Some other thread is inside a section that may already hold a
            // reference; gate behind it.
            list.slots[tail]
                .as_mut()
                .expect("list tail points at a freed record")
                .cleanups
                .push(cleanup);
            return;
        }
        drop(list);
        trace!(target: "verso::gc", "cleanup_inline");
        cleanup();
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Lifetime deferral/execution counters.
    #[must_use]
    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            deferred: self.deferred.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
        }
    }

    /// Whether the calling thread is inside a critical section of this domain.
    #[must_use]
    pub fn in_critical(&self) -> bool {
        SECTIONS.with(|sections| sections.borrow().contains_key(&self.id))
    }

    /// Number of live critical-section records across all threads.
    #[must_use]
    pub fn active_sections(&self) -> usize {
        self.list.lock().active
    }

    /// Number of cleanups queued against live records.
    #[must_use]
    pub fn pending_cleanups(&self) -> usize {
        self.list.lock().pending_cleanups()
    }

    fn run_cleanups(&self, ready: Vec<Cleanup>) {
        if ready.is_empty() {
            return;
        }
        debug!(target: "verso::gc", count = ready.len(), "cleanups_executed");
        let count = ready.len() as u64;
        for cleanup in ready {
            cleanup();
        }
        self.executed.fetch_add(count, Ordering::Relaxed);
    }
}

impl fmt::Debug for GcDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self.list.lock();
        f.debug_struct("GcDomain")
            .field("id", &self.id)
            .field("active_sections", &list.active)
            .field("pending_cleanups", &list.pending_cleanups())
            .field("strict", &self.strict)
            .finish()
    }
}

/// RAII critical section; leaving happens on drop.
///
/// Not `Send`: the guard refers to the entering thread's nesting state.
#[must_use]
pub struct SectionGuard<'a> {
    domain: &'a GcDomain,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        self.domain.leave();
    }
}
