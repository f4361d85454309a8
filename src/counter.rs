//! The observable accounting object: live bytes and allocation counts,
//! optionally arranged into a tree of sub-counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::thread_pool::ThreadPoolInner;

/// The four totals a counter tracks. Kept behind one mutex rather than four
/// atomics: `peak_bytes`/`peak_allocs` are a single logical read-modify-write
/// pair (see `SPEC_FULL.md` §4.2), and a Tracked block's `remove` can reach a
/// counter from a thread other than the one that created it, so these fields
/// cannot rely on the single-writer discipline that lets `enabled` and the
/// parent/child graph stay lock-free.
#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    current_bytes: i64,
    peak_bytes: i64,
    current_allocs: i64,
    peak_allocs: i64,
}

impl Totals {
    fn add(&mut self, size: usize) {
        self.current_bytes += size as i64;
        self.current_allocs += 1;
        if self.current_bytes > self.peak_bytes {
            self.peak_bytes = self.current_bytes;
            self.peak_allocs = self.current_allocs;
        }
    }

    fn modify(&mut self, old_size: usize, new_size: usize) {
        self.current_bytes += new_size as i64 - old_size as i64;
        if self.current_bytes > self.peak_bytes {
            self.peak_bytes = self.current_bytes;
            self.peak_allocs = self.current_allocs;
        }
        if self.current_bytes < 0 {
            warn!(
                current_bytes = self.current_bytes,
                "counter underflow in modify: tracking inconsistency, likely a Tracked \
                 free whose allocation predated a reset"
            );
        }
    }

    fn remove(&mut self, size: usize) {
        self.current_bytes -= size as i64;
        self.current_allocs -= 1;
        if self.current_bytes < 0 || self.current_allocs < 0 {
            warn!(
                current_bytes = self.current_bytes,
                current_allocs = self.current_allocs,
                "counter underflow in remove: tracking inconsistency, likely a Tracked \
                 free whose allocation predated a reset"
            );
        }
    }

    fn reset(&mut self) {
        *self = Totals::default();
    }

    fn reset_maximum(&mut self) {
        self.peak_bytes = self.current_bytes;
        self.peak_allocs = self.current_allocs;
    }
}

/// Where a counter reports enable/disable transitions to: either the thread
/// pool (top-level counters — no mutual exclusion enforced there, see
/// `ThreadPool::inform_enabled`) or another counter (sub-counters, where at
/// most one direct child of the parent may be enabled at a time).
pub(crate) enum Parent {
    Pool(Weak<ThreadPoolInner>),
    Counter(Weak<CounterInner>),
}

pub(crate) struct CounterInner {
    totals: Mutex<Totals>,
    enabled: AtomicBool,
    parent: Parent,
    /// The one direct child currently enabled, if any. Only meaningful for a
    /// counter that has children, but harmless to carry regardless.
    active_child: Mutex<Option<Weak<CounterInner>>>,
    children: Mutex<Vec<Arc<CounterInner>>>,
    name: String,
    /// A weak handle back to this counter's own `Arc`, so `&self` methods
    /// can hand out an `Arc<CounterInner>` (to store in a notify set, or to
    /// register with a parent) without stable Rust's `self: Arc<Self>`
    /// receiver, which only supports `Arc<Self>` by value, not `&Arc<Self>`.
    self_weak: Weak<CounterInner>,
}

impl CounterInner {
    fn new(parent: Parent, name: String) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            totals: Mutex::new(Totals::default()),
            enabled: AtomicBool::new(false),
            parent,
            active_child: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            name,
            self_weak: weak.clone(),
        })
    }

    /// An `Arc` clone of this counter, for handing to a notify-set snapshot
    /// or a parent's bookkeeping.
    pub(crate) fn handle(&self) -> Arc<CounterInner> {
        self.self_weak
            .upgrade()
            .expect("a counter's own weak handle is valid for its whole lifetime")
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn add(&self, size: usize) {
        if self.is_enabled() {
            self.totals.lock().add(size);
        }
    }

    pub(crate) fn modify(&self, old_size: usize, new_size: usize) {
        if self.is_enabled() {
            self.totals.lock().modify(old_size, new_size);
        }
    }

    /// Unlike `add`/`modify`, called unconditionally on every counter in a
    /// Tracked block's notification set regardless of current enabled state
    /// — this is the crediting guarantee the Tracked shape exists for.
    pub(crate) fn remove(&self, size: usize) {
        self.totals.lock().remove(size);
    }

    /// The Tracked-block equivalent of `modify`: applied unconditionally to
    /// every counter in the block's notify set, the same way `remove` is.
    pub(crate) fn force_modify(&self, old_size: usize, new_size: usize) {
        self.totals.lock().modify(old_size, new_size);
    }

    fn set_enabled(&self, new: bool) -> bool {
        let old = self.enabled.swap(new, Ordering::AcqRel);
        if old == new {
            return old;
        }
        match &self.parent {
            Parent::Pool(pool) => {
                if let Some(pool) = pool.upgrade() {
                    if new {
                        pool.inform_enabled(self.handle());
                    } else {
                        pool.inform_disabled(&self.handle());
                    }
                }
            }
            Parent::Counter(parent) => {
                if let Some(parent) = parent.upgrade() {
                    let self_arc = self.handle();
                    if new {
                        parent.activate_child(&self_arc);
                    } else {
                        parent.deactivate_child(&self_arc);
                    }
                }
            }
        }
        old
    }

    /// Makes `child` the one active direct child, quietly disabling whatever
    /// was active before — no recursive notification reaches *its* active
    /// child, per the distilled spec's state machine.
    fn activate_child(&self, child: &Arc<CounterInner>) {
        let mut slot = self.active_child.lock();
        if let Some(prev) = slot.take().and_then(|w| w.upgrade()) {
            if !Arc::ptr_eq(&prev, child) {
                prev.enabled.store(false, Ordering::Release);
            }
        }
        *slot = Some(Arc::downgrade(child));
    }

    fn deactivate_child(&self, child: &Arc<CounterInner>) {
        let mut slot = self.active_child.lock();
        if let Some(active) = slot.as_ref().and_then(|w| w.upgrade()) {
            if Arc::ptr_eq(&active, child) {
                *slot = None;
            }
        }
    }

    fn reset(&self) {
        self.totals.lock().reset();
        for child in self.children.lock().iter() {
            child.reset();
        }
    }

    fn reset_maximum(&self) {
        self.totals.lock().reset_maximum();
        for child in self.children.lock().iter() {
            child.reset_maximum();
        }
    }

    fn current_size(&self) -> i64 {
        let own = self.totals.lock().current_bytes;
        own + self
            .children
            .lock()
            .iter()
            .map(|c| c.current_size())
            .sum::<i64>()
    }

    fn peak_size(&self) -> i64 {
        let own = self.totals.lock().peak_bytes;
        own + self.children.lock().iter().map(|c| c.peak_size()).sum::<i64>()
    }

    fn current_allocations(&self) -> i64 {
        let own = self.totals.lock().current_allocs;
        own + self
            .children
            .lock()
            .iter()
            .map(|c| c.current_allocations())
            .sum::<i64>()
    }

    fn peak_allocations(&self) -> i64 {
        let own = self.totals.lock().peak_allocs;
        own + self
            .children
            .lock()
            .iter()
            .map(|c| c.peak_allocations())
            .sum::<i64>()
    }

    /// Prints one line for `self` (own totals only — descendants get their
    /// own line, per the resolved Open Question in `DESIGN.md`) then
    /// recurses into children with a deeper indent.
    fn dump(&self, out: &mut dyn std::fmt::Write, prefix: &str) {
        let totals = *self.totals.lock();
        let _ = writeln!(
            out,
            "{prefix}{name}: enabled={enabled} current_bytes={cb} peak_bytes={pb} \
             current_allocs={ca} peak_allocs={pa}",
            name = self.name,
            enabled = self.is_enabled(),
            cb = totals.current_bytes,
            pb = totals.peak_bytes,
            ca = totals.current_allocs,
            pa = totals.peak_allocs,
        );
        let child_prefix = format!("{prefix}  ");
        for child in self.children.lock().iter() {
            child.dump(out, &child_prefix);
        }
    }
}

/// A snapshot of a counter's state usable without holding any lock —
/// returned by [`Counter::snapshot`] for callers (like `dump`'s public
/// wrapper) that want the numbers without re-entering `parking_lot`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub current_bytes: i64,
    pub peak_bytes: i64,
    pub current_allocs: i64,
    pub peak_allocs: i64,
}

/// A handle to an accounting counter. Cheap to clone (an `Arc` underneath);
/// every clone refers to the same underlying counter.
///
/// Obtained from [`crate::new_counter`] or [`Counter::create_child`].
#[derive(Clone)]
pub struct Counter {
    pub(crate) inner: Arc<CounterInner>,
}

impl Counter {
    pub(crate) fn from_inner(inner: Arc<CounterInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn new_root(pool: Weak<ThreadPoolInner>, name: impl Into<String>) -> Self {
        Self::from_inner(CounterInner::new(Parent::Pool(pool), name.into()))
    }

    /// Creates a new, initially-disabled sub-counter of `self`, appended to
    /// `self`'s ordered children.
    pub fn create_child(&self, name: impl Into<String>) -> Counter {
        let child = CounterInner::new(Parent::Counter(Arc::downgrade(&self.inner)), name.into());
        self.inner.children.lock().push(Arc::clone(&child));
        Counter::from_inner(child)
    }

    /// Enables the counter, returning its previous state. If this counter
    /// has a parent counter (not just a thread pool), enabling it implicitly
    /// disables whatever sibling was previously the parent's active child.
    pub fn enable(&self) -> bool {
        self.inner.set_enabled(true)
    }

    pub fn disable(&self) -> bool {
        self.inner.set_enabled(false)
    }

    pub fn set_enabled(&self, new: bool) -> bool {
        self.inner.set_enabled(new)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    /// Zeroes all four totals for this counter and every descendant.
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// Sets `peak_* := current_*` for this counter and every descendant.
    pub fn reset_maximum(&self) {
        self.inner.reset_maximum();
    }

    /// This counter's own live bytes plus every descendant's.
    pub fn current_size(&self) -> i64 {
        self.inner.current_size()
    }

    /// This counter's own peak bytes plus every descendant's peak.
    pub fn peak_size(&self) -> i64 {
        self.inner.peak_size()
    }

    pub fn current_allocations(&self) -> i64 {
        self.inner.current_allocations()
    }

    pub fn peak_allocations(&self) -> i64 {
        self.inner.peak_allocations()
    }

    /// This counter's own totals, without descendants — the numbers `dump`
    /// prints on this counter's line.
    pub fn snapshot(&self) -> CounterSnapshot {
        let t = *self.inner.totals.lock();
        CounterSnapshot {
            current_bytes: t.current_bytes,
            peak_bytes: t.peak_bytes,
            current_allocs: t.current_allocs,
            peak_allocs: t.peak_allocs,
        }
    }

    /// Ordered view of this counter's direct children.
    pub fn sub_counters(&self) -> Vec<Counter> {
        self.inner
            .children
            .lock()
            .iter()
            .map(|c| Counter::from_inner(Arc::clone(c)))
            .collect()
    }

    /// Writes a human-readable dump of this counter's subtree to `out`, one
    /// line per counter, each reporting only its own totals.
    pub fn dump(&self, out: &mut dyn std::fmt::Write) {
        self.inner.dump(out, "");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    fn root_counter(name: &str) -> Counter {
        Counter::new_root(Weak::new(), name)
    }

    #[test]
    fn add_tracks_peak_allocs_at_peak_bytes() {
        let c = root_counter("c");
        c.enable();
        c.inner.add(100);
        c.inner.add(200);
        let s = c.snapshot();
        assert_eq!(s.current_bytes, 300);
        assert_eq!(s.peak_bytes, 300);
        assert_eq!(s.current_allocs, 2);
        assert_eq!(s.peak_allocs, 2);

        c.inner.remove(100);
        let s = c.snapshot();
        assert_eq!(s.current_bytes, 200);
        assert_eq!(s.current_allocs, 1);
        assert_eq!(s.peak_bytes, 300);
        assert_eq!(s.peak_allocs, 2);
    }

    #[test]
    fn modify_preserves_alloc_count_and_tracks_peak() {
        let c = root_counter("c");
        c.enable();
        c.inner.add(500);
        c.inner.modify(500, 1500);
        let s = c.snapshot();
        assert_eq!(s.current_bytes, 1500);
        assert_eq!(s.peak_bytes, 1500);
        assert_eq!(s.current_allocs, 1);
        assert_eq!(s.peak_allocs, 1);

        c.inner.modify(1500, 400);
        let s = c.snapshot();
        assert_eq!(s.current_bytes, 400);
        assert_eq!(s.peak_bytes, 1500);
    }

    #[test]
    fn disabled_counter_ignores_events() {
        let c = root_counter("c");
        c.inner.add(100);
        let s = c.snapshot();
        assert_eq!(s.current_bytes, 0);
        assert_eq!(s.current_allocs, 0);
    }

    #[test]
    fn tracked_remove_credits_disabled_counter() {
        let c = root_counter("c");
        c.enable();
        c.inner.add(100);
        c.disable();
        // simulates the Tracked free path, which bypasses `is_enabled`
        c.inner.remove(100);
        let s = c.snapshot();
        assert_eq!(s.current_bytes, 0);
        assert_eq!(s.current_allocs, 0);
    }

    #[test]
    fn at_most_one_active_child() {
        let parent = root_counter("parent");
        let a = parent.create_child("a");
        let b = parent.create_child("b");

        a.enable();
        assert!(a.is_enabled());
        b.enable();
        assert!(b.is_enabled());
        assert!(
            !a.is_enabled(),
            "enabling sibling b must implicitly disable a"
        );
    }

    #[test]
    fn reset_zeroes_subtree() {
        let parent = root_counter("parent");
        let child = parent.create_child("child");
        parent.enable();
        child.enable();
        parent.inner.add(10);
        child.inner.add(20);

        parent.reset();
        assert_eq!(parent.snapshot().current_bytes, 0);
        assert_eq!(child.snapshot().current_bytes, 0);
    }

    #[test]
    fn aggregate_sums_include_descendants() {
        let parent = root_counter("parent");
        let child = parent.create_child("child");
        parent.enable();
        child.enable();
        parent.inner.add(10);
        child.inner.add(20);

        assert_eq!(parent.current_size(), 30);
        assert_eq!(parent.snapshot().current_bytes, 10);
    }
}
