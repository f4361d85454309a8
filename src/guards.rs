//! Thread-local reentrancy tracking and the explicit per-thread on/off
//! switch (`enable_this_thread`/`disable_this_thread`).
//!
//! The allocator hook itself allocates — building a `NotifySet`'s boxed
//! slice, or lazily creating a thread's `ThreadPoolInner` — and those
//! allocations re-enter the very `#[global_allocator]` being implemented.
//! `ReentrancyGuard` is how `allocator.rs` tells such a nested call to take
//! the raw passthrough bypass instead of recursing into accounting logic.

use std::cell::Cell;

thread_local! {
    static REENTRANCY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// True while any `ReentrancyGuard` is held on this thread — the allocator
/// hook checks this first, before anything else, on every call.
pub(crate) fn is_reentrant() -> bool {
    REENTRANCY_DEPTH.with(|d| d.get() > 0)
}

/// RAII token marking "accounting logic is active on this thread". Restores
/// the previous depth on drop rather than clearing to zero, so nested guards
/// (accounting code that itself allocates, however deep) compose correctly.
pub(crate) struct ReentrancyGuard {
    previous: u32,
}

impl ReentrancyGuard {
    pub(crate) fn enter() -> Self {
        let previous = REENTRANCY_DEPTH.with(|d| {
            let previous = d.get();
            d.set(previous + 1);
            previous
        });
        Self { previous }
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        REENTRANCY_DEPTH.with(|d| d.set(self.previous));
    }
}

/// Enables accounting on the current thread. Counters enabled via
/// [`crate::Counter::enable`] already imply this; this function exists for
/// the case where the thread-pool's accounting-disabled flag was previously
/// turned off explicitly (see `disable_this_thread`) and needs to be undone
/// without re-enabling every individual counter.
pub fn enable_this_thread() {
    crate::manager::Manager::instance().set_accounting_disabled_for_current_thread(false);
}

/// Disables accounting on the current thread regardless of which counters
/// are enabled. Every `add`/`modify`/`remove` broadcast on this thread
/// becomes a no-op until `enable_this_thread` is called again. Intended for
/// code that must not be attributed to any counter (allocator internals
/// aside, already handled by `ReentrancyGuard`).
pub fn disable_this_thread() {
    crate::manager::Manager::instance().set_accounting_disabled_for_current_thread(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_guards_restore_previous_depth() {
        assert!(!is_reentrant());
        let outer = ReentrancyGuard::enter();
        assert!(is_reentrant());
        {
            let inner = ReentrancyGuard::enter();
            assert!(is_reentrant());
            drop(inner);
        }
        assert!(is_reentrant());
        drop(outer);
        assert!(!is_reentrant());
    }
}
