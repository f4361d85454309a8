//! The per-block notification set: a snapshot, taken at allocation time, of
//! the counters that were enabled on the allocating thread.
//!
//! Snapshotting at allocation time rather than consulting the enabled set at
//! free time is what lets a Tracked block credit the counters that were
//! watching when it was born, even if every one of them has since been
//! disabled (see `Counter::remove` call sites in `allocator.rs`).

use std::sync::Arc;

use crate::counter::CounterInner;

/// Non-empty by construction — callers represent an empty snapshot as `None`
/// rather than allocating a `NotifySet` with zero counters, so the common
/// "no counter enabled" path never allocates one at all.
pub(crate) struct NotifySet(Box<[Arc<CounterInner>]>);

impl NotifySet {
    /// Returns `None` for an empty snapshot, so callers never have to carry
    /// around a zero-length heap allocation.
    pub(crate) fn from_enabled(counters: Vec<Arc<CounterInner>>) -> Option<Box<Self>> {
        if counters.is_empty() {
            None
        } else {
            Some(Box::new(Self(counters.into_boxed_slice())))
        }
    }

    pub(crate) fn counters(&self) -> &[Arc<CounterInner>] {
        &self.0
    }
}
