//! The per-thread owner of counters and the set of currently enabled
//! counters for that thread. Only the owning thread ever mutates a
//! `ThreadPoolInner` in practice, but `Arc<ThreadPoolInner>` is reachable
//! from other threads too — a `Parent::Pool` weak handle lives inside every
//! `CounterInner` (`counter.rs`), and a Tracked block allocated on one
//! thread can be freed on another (`allocator.rs`), so its interior
//! mutability has to be `Sync`-safe regardless of who actually contends for
//! it. `parking_lot::Mutex`, the same tool `CounterInner`'s `Totals` already
//! uses for the same reason.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::counter::{Counter, CounterInner};

pub(crate) struct ThreadPoolInner {
    /// Every counter this pool has ever created, in creation order — kept
    /// alive here for the pool's lifetime regardless of what the user does
    /// with their `Counter` handles.
    created: Mutex<Vec<Arc<CounterInner>>>,
    /// The counters currently enabled on this thread, in the order they were
    /// enabled — broadcast target for `add`/`modify`/`remove`.
    enabled: Mutex<Vec<Arc<CounterInner>>>,
    /// Mirrors "this thread has at least one enabled counter", so the
    /// allocator hook's fast-path check doesn't need to inspect `enabled`'s
    /// length. Also the target of `enable_this_thread`/`disable_this_thread`
    /// (see `guards.rs`) — a user override can set this to `false` even with
    /// counters enabled, or to `true` with none.
    accounting_disabled: AtomicBool,
}

impl ThreadPoolInner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
            enabled: Mutex::new(Vec::new()),
            accounting_disabled: AtomicBool::new(false),
        })
    }

    pub(crate) fn create_counter(self: &Arc<Self>, name: impl Into<String>) -> Counter {
        let counter = Counter::new_root(Arc::downgrade(self), name);
        self.created.lock().push(counter_inner_handle(&counter));
        counter
    }

    /// Appends `counter` to the enabled set if it isn't already there, and
    /// marks this thread as accounting-active. No mutual exclusion is
    /// enforced here — unlike a counter-to-counter parent, the pool is happy
    /// to have many top-level counters enabled at once.
    pub(crate) fn inform_enabled(&self, counter: Arc<CounterInner>) {
        let mut enabled = self.enabled.lock();
        if !enabled.iter().any(|c| Arc::ptr_eq(c, &counter)) {
            enabled.push(counter);
        }
        self.accounting_disabled.store(false, Ordering::Relaxed);
    }

    pub(crate) fn inform_disabled(&self, counter: &Arc<CounterInner>) {
        let mut enabled = self.enabled.lock();
        enabled.retain(|c| !Arc::ptr_eq(c, counter));
        if enabled.is_empty() {
            self.accounting_disabled.store(true, Ordering::Relaxed);
        }
    }

    /// Snapshot of the enabled set in insertion order, for the Tracked
    /// notify-set capture at allocation time.
    pub(crate) fn enabled_counters(&self) -> Vec<Arc<CounterInner>> {
        self.enabled.lock().clone()
    }

    pub(crate) fn add(&self, size: usize) {
        for c in self.enabled.lock().iter() {
            c.add(size);
        }
    }

    pub(crate) fn modify(&self, old_size: usize, new_size: usize) {
        for c in self.enabled.lock().iter() {
            c.modify(old_size, new_size);
        }
    }

    pub(crate) fn remove(&self, size: usize) {
        for c in self.enabled.lock().iter() {
            c.remove(size);
        }
    }

    /// Explicit user override via `enable_this_thread`/`disable_this_thread`
    /// (see `guards.rs`), independent of whether any counter is enabled.
    pub(crate) fn set_accounting_disabled(&self, disabled: bool) {
        self.accounting_disabled.store(disabled, Ordering::Relaxed);
    }

    pub(crate) fn accounting_disabled(&self) -> bool {
        self.accounting_disabled.load(Ordering::Relaxed)
    }
}

fn counter_inner_handle(counter: &Counter) -> Arc<CounterInner> {
    Arc::clone(&counter.inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabling_same_counter_twice_does_not_duplicate_broadcast_target() {
        let pool = ThreadPoolInner::new();
        let c = pool.create_counter("c");
        c.enable();
        c.enable();
        assert_eq!(pool.enabled_counters().len(), 1);
    }

    #[test]
    fn disabling_last_counter_marks_thread_inactive() {
        let pool = ThreadPoolInner::new();
        let c = pool.create_counter("c");
        c.enable();
        assert!(!pool.accounting_disabled());
        c.disable();
        assert!(pool.accounting_disabled());
    }

    #[test]
    fn broadcast_reaches_every_enabled_counter() {
        let pool = ThreadPoolInner::new();
        let a = pool.create_counter("a");
        let b = pool.create_counter("b");
        a.enable();
        b.enable();
        pool.add(42);
        assert_eq!(a.snapshot().current_bytes, 42);
        assert_eq!(b.snapshot().current_bytes, 42);
    }
}
