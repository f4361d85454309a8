//! Process-wide singleton tying together the thread pools. There is no
//! explicit "create a thread pool" call from user code: the first counter
//! operation on a new thread lazily creates that thread's pool, mirroring
//! the distilled spec's thread-creation hook with ordinary `thread_local!`
//! laziness instead of an explicit callback (see `SPEC_FULL.md` §1.1).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::counter::{Counter, CounterInner};
use crate::thread_pool::ThreadPoolInner;

/// Flipped by the `libc::atexit` callback registered in [`Manager::instance`]
/// the first time it runs. Once set, every accounting entry point becomes a
/// no-op rather than risk touching thread-locals during process teardown,
/// which on some platforms may already be torn down by the time `atexit`
/// callbacks run.
static DISARMED: AtomicBool = AtomicBool::new(false);

extern "C" fn disarm() {
    DISARMED.store(true, Ordering::Relaxed);
}

pub(crate) struct Manager {
    /// Every thread pool ever created, kept alive for the life of the
    /// process. Per the resolved Open Question in `DESIGN.md`, thread pools
    /// are deliberately never torn down or removed from this list even after
    /// their owning thread exits — a thread's last snapshot stays readable.
    pools: Mutex<Vec<Arc<ThreadPoolInner>>>,
}

static MANAGER: Lazy<Manager> = Lazy::new(|| {
    // SAFETY: `disarm` has no arguments, returns nothing, and only touches a
    // plain `AtomicBool` — safe to run at any point during exit.
    unsafe {
        libc::atexit(disarm);
    }
    Manager {
        pools: Mutex::new(Vec::new()),
    }
});

thread_local! {
    // The guard matters here: building a pool allocates (the `Arc` itself,
    // the registry push in `Manager::pools`), and those allocations run
    // through the very `#[global_allocator]` this crate installs. Without
    // the guard, that nested `alloc` would try to read this same
    // thread-local for its enabled-counters snapshot while it is still
    // being initialized. The guard makes `should_account` false for the
    // duration, so the nested allocations take the raw passthrough instead.
    static CURRENT_POOL: Arc<ThreadPoolInner> = {
        let _guard = crate::guards::ReentrancyGuard::enter();
        Manager::instance().register_new_pool()
    };
}

impl Manager {
    pub(crate) fn instance() -> &'static Manager {
        &MANAGER
    }

    fn register_new_pool(&self) -> Arc<ThreadPoolInner> {
        let pool = ThreadPoolInner::new();
        self.pools.lock().push(Arc::clone(&pool));
        pool
    }

    fn disarmed(&self) -> bool {
        DISARMED.load(Ordering::Relaxed)
    }

    fn with_current_pool<R>(&self, f: impl FnOnce(&Arc<ThreadPoolInner>) -> R) -> Option<R> {
        if self.disarmed() {
            return None;
        }
        Some(CURRENT_POOL.with(f))
    }

    pub(crate) fn create_counter(&self, name: impl Into<String>) -> Counter {
        let name = name.into();
        self.with_current_pool(|pool| pool.create_counter(name))
            // A disarmed process still needs to hand back *something*: an
            // unreachable, unenabled counter with no pool backing it.
            .unwrap_or_else(|| Counter::from_inner(detached_counter_inner()))
    }

    pub(crate) fn add_for_current_thread(&self, size: usize) {
        self.with_current_pool(|pool| {
            if !pool.accounting_disabled() {
                pool.add(size);
            }
        });
    }

    pub(crate) fn modify_for_current_thread(&self, old_size: usize, new_size: usize) {
        self.with_current_pool(|pool| {
            if !pool.accounting_disabled() {
                pool.modify(old_size, new_size);
            }
        });
    }

    pub(crate) fn remove_for_current_thread(&self, size: usize) {
        self.with_current_pool(|pool| pool.remove(size));
    }

    /// The counters enabled on this thread at this moment, for a Tracked
    /// block's notify-set snapshot. Empty (not an error) on a disarmed
    /// process or when accounting is disabled on this thread.
    pub(crate) fn enabled_counters_for_current_thread(&self) -> Vec<Arc<CounterInner>> {
        self.with_current_pool(|pool| {
            if pool.accounting_disabled() {
                Vec::new()
            } else {
                pool.enabled_counters()
            }
        })
        .unwrap_or_default()
    }

    pub(crate) fn set_accounting_disabled_for_current_thread(&self, disabled: bool) {
        self.with_current_pool(|pool| pool.set_accounting_disabled(disabled));
    }

    /// Whether the allocator hook's fast path should bypass accounting
    /// entirely on the calling thread right now — true once the process is
    /// disarmed (§4.5.6) or once this thread's own accounting has been
    /// turned off, whether by the last counter disabling itself or by an
    /// explicit `disable_this_thread` (§5's `accounting_disabled` flag).
    /// Checked before any header is placed, so a disabled thread's
    /// allocations stay `Shape::Unknown` rather than silently becoming
    /// Fixed/Tracked blocks nobody is crediting.
    pub(crate) fn accounting_disabled_for_current_thread(&self) -> bool {
        if self.disarmed() {
            return true;
        }
        self.with_current_pool(|pool| pool.accounting_disabled())
            .unwrap_or(true)
    }
}

/// A counter with no pool parent, handed out only once the process has
/// begun exiting — it can still be enabled/disabled/read by a caller holding
/// a stale handle, it just never participates in any broadcast again.
fn detached_counter_inner() -> Arc<CounterInner> {
    Counter::new_root(Default::default(), "<detached>").inner
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_counter_is_enabled_via_current_thread_pool() {
        let c = Manager::instance().create_counter("t");
        c.enable();
        Manager::instance().add_for_current_thread(10);
        assert_eq!(c.snapshot().current_bytes, 10);
    }

    #[test]
    fn disabling_current_thread_suppresses_broadcast() {
        let c = Manager::instance().create_counter("u");
        c.enable();
        Manager::instance().set_accounting_disabled_for_current_thread(true);
        Manager::instance().add_for_current_thread(10);
        assert_eq!(c.snapshot().current_bytes, 0);
        Manager::instance().set_accounting_disabled_for_current_thread(false);
    }
}
