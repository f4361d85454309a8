//! The `#[global_allocator]` hook. One [`AccountingAllocator<A>`] wraps any
//! other `GlobalAlloc` (defaulting to [`std::alloc::System`]) and attributes
//! every allocation it passes through to whichever counters are enabled on
//! the calling thread at that moment.
//!
//! Every method follows the same shape, mirroring the distilled spec's
//! hook-handler state machine (`SPEC_FULL.md` §4.5):
//!
//! 1. Bail out to the inner allocator with no header if accounting is
//!    disarmed, reentrant, or accounting is disabled on this thread
//!    ([`should_account`] — `alloc`/`alloc_zeroed` only: this decides
//!    whether a *new* block gets a header at all). `dealloc`/`realloc`
//!    instead gate on reentrancy alone ([`should_recover`]), since whether
//!    an *existing* pointer carries a header was decided back when it was
//!    allocated, not by the thread's current state.
//! 2. Otherwise take a [`ReentrancyGuard`] so any allocation *this* hook
//!    performs (the Tracked notify-set box) takes the bypass above.
//! 3. Compute the placement length for the block's shape, call through to
//!    the inner allocator for `placement_len + user_size` bytes, write the
//!    header, and broadcast to the enabled counters.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;

use tracing::error;

use crate::guards::{self, ReentrancyGuard};
use crate::header::{self, Shape};
use crate::manager::Manager;
use crate::notify::NotifySet;

/// Picks the cheapest header shape that satisfies `layout`, and the total
/// number of bytes (header + payload) to request from the inner allocator.
enum Plan {
    Fixed { total: usize },
    Variable { total: usize },
    Tracked { total: usize },
}

fn plan_for(layout: Layout, tracked: bool) -> Plan {
    if tracked {
        let header_len = header::tracked_len(layout.align());
        return Plan::Tracked { total: header_len + layout.size() };
    }
    if layout.align() <= header::FIXED_ALIGN {
        Plan::Fixed { total: header::FIXED_LEN + layout.size() }
    } else {
        let header_len = header::variable_len(layout.align());
        Plan::Variable { total: header_len + layout.size() }
    }
}

/// A memory-accounting allocator. Install it with:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: mem_counters::AccountingAllocator = mem_counters::AccountingAllocator::new();
/// ```
///
/// `A` defaults to [`std::alloc::System`]; pass a different inner allocator
/// to account for a custom one instead.
pub struct AccountingAllocator<A = System> {
    inner: A,
}

impl AccountingAllocator<System> {
    pub const fn new() -> Self {
        Self { inner: System }
    }
}

impl Default for AccountingAllocator<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> AccountingAllocator<A> {
    pub const fn with_inner(inner: A) -> Self {
        Self { inner }
    }
}

/// Whether a *new* allocation should be placed with a header at all.
/// Checked first thing in `alloc`/`alloc_zeroed`, mirroring the distilled
/// spec's fast-path guard (`SPEC_FULL.md` §4.5): bypass accounting whenever
/// the engine is reentrant, globally disarmed, or this thread's own
/// accounting has been switched off. A call that fails this check places no
/// header at all, so a later `dealloc`/`realloc` on the same pointer
/// correctly sees `Shape::Unknown` instead of an unaccounted Fixed/Tracked
/// block.
fn should_account() -> bool {
    !guards::is_reentrant() && !Manager::instance().accounting_disabled_for_current_thread()
}

/// Whether `dealloc`/`realloc` should attempt to recover an existing
/// block's header at all. Deliberately **not** the same gate as
/// [`should_account`]: whether a block carries a header is a fact fixed at
/// the moment it was allocated, not a function of the calling thread's
/// *current* disabled/disarmed state, which can legitimately change between
/// a block's allocation and its release (a counter disabling itself, or the
/// process disarming during teardown, while older tracked blocks are still
/// live). Skipping recovery on that state rather than on reentrancy alone
/// would call the real reallocator/deallocator with the header-adjusted
/// user pointer instead of the true base, corrupting the heap. Only
/// reentrancy — meaning this call is itself nested inside the engine's own
/// bookkeeping, against a pointer the engine never classified in the first
/// place — justifies bypassing recovery.
fn should_recover() -> bool {
    !guards::is_reentrant()
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for AccountingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !should_account() {
            return unsafe { self.inner.alloc(layout) };
        }
        let _guard = ReentrancyGuard::enter();

        // The notify-set snapshot is taken *before* the real allocation so a
        // Tracked block's credit list reflects exactly what was enabled at
        // the moment this allocation happened, and the allocation performed
        // to box it up (if any) happens while the guard above is held.
        let enabled = Manager::instance().enabled_counters_for_current_thread();
        let tracked = !enabled.is_empty();
        let notify = if tracked {
            NotifySet::from_enabled(enabled)
                .map(|boxed| unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) })
        } else {
            None
        };

        let plan = plan_for(layout, tracked);
        let total = match plan {
            Plan::Fixed { total } => total,
            Plan::Variable { total } => total,
            Plan::Tracked { total } => total,
        };
        let real_layout = match Layout::from_size_align(total, layout.align()) {
            Ok(l) => l,
            Err(_) => {
                error!(size = layout.size(), align = layout.align(), "layout overflow computing header placement");
                drop_notify(notify);
                return std::ptr::null_mut();
            }
        };

        let real_base = unsafe { self.inner.alloc(real_layout) };
        let Some(real_base) = NonNull::new(real_base) else {
            drop_notify(notify);
            return std::ptr::null_mut();
        };

        let user_ptr = unsafe {
            match plan {
                Plan::Fixed { .. } => header::place_fixed(real_base, layout.size()),
                Plan::Variable { .. } => {
                    header::place_variable(real_base, layout.size(), layout.align())
                }
                Plan::Tracked { .. } => {
                    header::place_tracked(real_base, layout.size(), layout.align(), notify)
                }
            }
        };

        Manager::instance().add_for_current_thread(layout.size());
        user_ptr.as_ptr()
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if !should_account() {
            return unsafe { self.inner.alloc_zeroed(layout) };
        }
        // The zero-init guarantee applies only to the user's `layout.size()`
        // bytes; it says nothing about header placement, so the accounted
        // path below (which calls through to plain `alloc` on the inner
        // allocator and then writes only header bytes) still satisfies it —
        // `alloc` never touches the user-visible payload region.
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            unsafe { std::ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: the `GlobalAlloc` contract guarantees `ptr` denotes a block
        // currently allocated via this allocator, so it is never null.
        let user_ptr = unsafe { NonNull::new_unchecked(ptr) };
        if !should_recover() {
            return unsafe { self.inner.dealloc(ptr, layout) };
        }
        let _guard = ReentrancyGuard::enter();

        let recovered = unsafe { header::recover(user_ptr) };
        match recovered.shape {
            Shape::Unknown => {
                // Never written by this allocator (e.g. allocated while
                // disarmed, or by a different global allocator instance) —
                // pass through untouched rather than guess at a header.
                unsafe { self.inner.dealloc(ptr, layout) };
                return;
            }
            Shape::Tracked => {
                if let Some(notify_ptr) = recovered.notify {
                    // SAFETY: only ever written by `alloc`'s
                    // `NotifySet::from_enabled`, and freed exactly once, here.
                    let notify = unsafe { Box::from_raw(notify_ptr.as_ptr()) };
                    for counter in notify.counters() {
                        counter.remove(recovered.user_size);
                    }
                } else {
                    Manager::instance().remove_for_current_thread(recovered.user_size);
                }
            }
            Shape::Fixed | Shape::Variable => {
                Manager::instance().remove_for_current_thread(recovered.user_size);
            }
        }

        let real_layout = real_layout_for(recovered.shape, recovered.user_size, layout.align());
        unsafe { self.inner.dealloc(recovered.real_base.as_ptr(), real_layout) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: the `GlobalAlloc` contract guarantees `ptr` denotes a block
        // currently allocated via this allocator, so it is never null.
        let user_ptr = unsafe { NonNull::new_unchecked(ptr) };
        if !should_recover() {
            return unsafe { self.inner.realloc(ptr, layout, new_size) };
        }
        let _guard = ReentrancyGuard::enter();

        let recovered = unsafe { header::recover(user_ptr) };
        if recovered.shape == Shape::Unknown {
            return unsafe { self.inner.realloc(ptr, layout, new_size) };
        }

        // Alignment never changes across a realloc, only size does, so the
        // shape stays whatever it already was. A Tracked block keeps its
        // existing notify set rather than resampling the enabled counters.
        let new_layout = match Layout::from_size_align(new_size, layout.align()) {
            Ok(l) => l,
            Err(_) => return std::ptr::null_mut(),
        };
        let notify = recovered.notify;
        let tracked = recovered.shape == Shape::Tracked;
        let plan = plan_for(new_layout, tracked);
        let new_total = match plan {
            Plan::Fixed { total } => total,
            Plan::Variable { total } => total,
            Plan::Tracked { total } => total,
        };
        if Layout::from_size_align(new_total, layout.align()).is_err() {
            return std::ptr::null_mut();
        }

        let old_real_layout =
            real_layout_for(recovered.shape, recovered.user_size, layout.align());
        let new_real_base = unsafe {
            self.inner
                .realloc(recovered.real_base.as_ptr(), old_real_layout, new_total)
        };
        let Some(new_real_base) = NonNull::new(new_real_base) else {
            return std::ptr::null_mut();
        };

        let new_user_ptr = unsafe {
            match recovered.shape {
                Shape::Fixed => header::place_fixed(new_real_base, new_size),
                Shape::Variable => header::place_variable(new_real_base, new_size, layout.align()),
                Shape::Tracked => header::place_tracked(new_real_base, new_size, layout.align(), notify),
                Shape::Unknown => unreachable!("handled above"),
            }
        };

        // A Tracked block's notify set, not the thread's currently-enabled
        // counters, governs every event for that block's whole lifetime —
        // the same rule `dealloc` applies to `remove`, applied here to
        // `modify` so growing or shrinking a Tracked allocation stays
        // attributed to whoever was watching when it was born.
        match notify {
            Some(notify_ptr) => {
                let notify_ref = unsafe { notify_ptr.as_ref() };
                for counter in notify_ref.counters() {
                    counter.force_modify(recovered.user_size, new_size);
                }
            }
            None => Manager::instance().modify_for_current_thread(recovered.user_size, new_size),
        }

        new_user_ptr.as_ptr()
    }
}

/// Reclaims a notify-set box built for an allocation that never happened
/// (the underlying `alloc` failed after the box was built).
fn drop_notify(notify: Option<NonNull<NotifySet>>) {
    if let Some(ptr) = notify {
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }
}

fn real_layout_for(shape: Shape, user_size: usize, align: usize) -> Layout {
    let total = match shape {
        Shape::Fixed => header::FIXED_LEN + user_size,
        Shape::Variable => header::variable_len(align) + user_size,
        Shape::Tracked => header::tracked_len(align) + user_size,
        Shape::Unknown => user_size,
    };
    // SAFETY: `align` came from a `Layout` the caller constructed; `total`
    // was computed the same way at allocation time and never overflows if
    // the original allocation succeeded.
    unsafe { Layout::from_size_align_unchecked(total, align) }
}
