//! The intrusive per-block header codec.
//!
//! Every pointer this crate hands back to a caller is preceded in memory by a
//! small header written by byte-offset arithmetic, *not* by relying on a
//! `#[repr(C)]` struct's natural layout: a native struct pads its *end* to
//! the alignment of its widest field, which would push the magic a few bytes
//! short of `user_ptr - 4`. Placing fields by hand keeps the one invariant
//! the free path depends on: the magic always sits at exactly `user_ptr - 4`.

use std::mem::size_of;
use std::ptr::NonNull;

use crate::notify::NotifySet;

/// Allocations at or below this alignment use the storage-free [`Shape::Fixed`]
/// header. Chosen to cover the overwhelmingly common case (anything up to and
/// including 16-byte-aligned types) without needing to stash the real base
/// pointer.
pub(crate) const FIXED_ALIGN: usize = 16;

const MAGIC_FIXED: u32 = 0xF17D_A110;
const MAGIC_VARIABLE: u32 = 0xA11D_A110;
const MAGIC_TRACKED: u32 = 0x7A0C_A110;

const MAGIC_LEN: usize = size_of::<u32>();
const SIZE_LEN: usize = size_of::<usize>();
const PTR_LEN: usize = size_of::<usize>();

/// The header shape recovered from a user pointer's magic, or [`Shape::Unknown`]
/// if the four bytes before it don't match any magic this crate writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Fixed,
    Variable,
    Tracked,
    Unknown,
}

/// What [`recover`] reads back out of a header.
pub(crate) struct Recovered {
    pub real_base: NonNull<u8>,
    pub user_size: usize,
    pub notify: Option<NonNull<NotifySet>>,
    pub shape: Shape,
}

/// Tightly-packed field width of a shape's header, before any alignment
/// rounding — the distilled spec's `sizeof(Header)`.
const fn field_width(shape_has_base: bool, shape_has_notify: bool) -> usize {
    let mut n = SIZE_LEN + MAGIC_LEN;
    if shape_has_base {
        n += PTR_LEN;
    }
    if shape_has_notify {
        n += PTR_LEN;
    }
    n
}

const FIXED_WIDTH: usize = field_width(false, false);
const VARIABLE_WIDTH: usize = field_width(true, false);
const TRACKED_WIDTH: usize = field_width(true, true);

/// The smallest multiple of `align` that is at least `width` bytes — the
/// alignment-aware placement routine generalised from the distilled spec's
/// aligned-allocation K-formula to every allocation path (see `SPEC_FULL.md`
/// §1.1): every Rust `GlobalAlloc` call carries an explicit `Layout::align`,
/// so there is no "unaligned" case to special-case away.
pub(crate) const fn placement_len(width: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (width + align - 1) & !(align - 1)
}

/// Placement length for the Fixed shape at a fixed, constant alignment —
/// callers only reach for Fixed when `align <= FIXED_ALIGN`, so the result
/// never depends on the caller's requested alignment.
pub(crate) const FIXED_LEN: usize = placement_len(FIXED_WIDTH, FIXED_ALIGN);

/// Placement length for Variable/Tracked shapes at a given real alignment.
pub(crate) fn variable_len(align: usize) -> usize {
    placement_len(VARIABLE_WIDTH, align)
}

pub(crate) fn tracked_len(align: usize) -> usize {
    placement_len(TRACKED_WIDTH, align)
}

/// Writes a `u32` `value` at `base`, interpreted as "four bytes starting at
/// `base`" with no alignment assumption about `base` itself — the header
/// region is never assumed to share a type's natural alignment.
unsafe fn write_u32(base: *mut u8, value: u32) {
    unsafe { base.cast::<u32>().write_unaligned(value) };
}

unsafe fn read_u32(base: *const u8) -> u32 {
    unsafe { base.cast::<u32>().read_unaligned() }
}

unsafe fn write_usize(base: *mut u8, value: usize) {
    unsafe { base.cast::<usize>().write_unaligned(value) };
}

unsafe fn read_usize(base: *const u8) -> usize {
    unsafe { base.cast::<usize>().read_unaligned() }
}

unsafe fn write_ptr(base: *mut u8, value: *mut u8) {
    unsafe { base.cast::<*mut u8>().write_unaligned(value) };
}

unsafe fn read_ptr(base: *const u8) -> *mut u8 {
    unsafe { base.cast::<*mut u8>().read_unaligned() }
}

/// Places a Fixed-shape header ending at `real_base + FIXED_LEN` and returns
/// the user pointer. `real_base` must have room for `FIXED_LEN + user_size`
/// bytes.
pub(crate) unsafe fn place_fixed(real_base: NonNull<u8>, user_size: usize) -> NonNull<u8> {
    let user_ptr = unsafe { real_base.as_ptr().add(FIXED_LEN) };
    unsafe {
        write_usize(user_ptr.sub(MAGIC_LEN + SIZE_LEN), user_size);
        write_u32(user_ptr.sub(MAGIC_LEN), MAGIC_FIXED);
    }
    unsafe { NonNull::new_unchecked(user_ptr) }
}

/// Places a Variable-shape header ending at `real_base + len` where `len =
/// variable_len(align)`, and returns the user pointer.
pub(crate) unsafe fn place_variable(
    real_base: NonNull<u8>,
    user_size: usize,
    align: usize,
) -> NonNull<u8> {
    let len = variable_len(align);
    let user_ptr = unsafe { real_base.as_ptr().add(len) };
    unsafe {
        write_usize(user_ptr.sub(MAGIC_LEN + SIZE_LEN), user_size);
        write_ptr(
            user_ptr.sub(MAGIC_LEN + SIZE_LEN + PTR_LEN),
            real_base.as_ptr(),
        );
        write_u32(user_ptr.sub(MAGIC_LEN), MAGIC_VARIABLE);
    }
    unsafe { NonNull::new_unchecked(user_ptr) }
}

/// Places a Tracked-shape header ending at `real_base + len` where `len =
/// tracked_len(align)`, and returns the user pointer. `notify` becomes the
/// per-block notification set this crate recovers at release time,
/// regardless of which counters in it are enabled by then; `None` (the
/// empty-snapshot case) is stored as a null pointer.
pub(crate) unsafe fn place_tracked(
    real_base: NonNull<u8>,
    user_size: usize,
    align: usize,
    notify: Option<NonNull<NotifySet>>,
) -> NonNull<u8> {
    let len = tracked_len(align);
    let user_ptr = unsafe { real_base.as_ptr().add(len) };
    let notify_ptr = notify.map_or(std::ptr::null_mut(), NonNull::as_ptr).cast::<u8>();
    unsafe {
        write_usize(user_ptr.sub(MAGIC_LEN + SIZE_LEN), user_size);
        write_ptr(
            user_ptr.sub(MAGIC_LEN + SIZE_LEN + PTR_LEN),
            notify_ptr,
        );
        write_ptr(
            user_ptr.sub(MAGIC_LEN + SIZE_LEN + PTR_LEN + PTR_LEN),
            real_base.as_ptr(),
        );
        write_u32(user_ptr.sub(MAGIC_LEN), MAGIC_TRACKED);
    }
    unsafe { NonNull::new_unchecked(user_ptr) }
}

/// Reads the four bytes immediately before `user_ptr` and classifies them.
pub(crate) unsafe fn classify(user_ptr: NonNull<u8>) -> Shape {
    let magic = unsafe { read_u32(user_ptr.as_ptr().sub(MAGIC_LEN)) };
    match magic {
        MAGIC_FIXED => Shape::Fixed,
        MAGIC_VARIABLE => Shape::Variable,
        MAGIC_TRACKED => Shape::Tracked,
        _ => Shape::Unknown,
    }
}

/// Recovers a block's real base pointer, recorded user size, and (for
/// Tracked blocks) notification set. Never dereferences past the magic for
/// [`Shape::Unknown`] blocks.
pub(crate) unsafe fn recover(user_ptr: NonNull<u8>) -> Recovered {
    let shape = unsafe { classify(user_ptr) };
    match shape {
        Shape::Fixed => {
            let user_size = unsafe { read_usize(user_ptr.as_ptr().sub(MAGIC_LEN + SIZE_LEN)) };
            let real_base =
                unsafe { NonNull::new_unchecked(user_ptr.as_ptr().sub(FIXED_LEN)) };
            Recovered { real_base, user_size, notify: None, shape }
        }
        Shape::Variable => {
            let user_size = unsafe { read_usize(user_ptr.as_ptr().sub(MAGIC_LEN + SIZE_LEN)) };
            let base_ptr = unsafe {
                read_ptr(user_ptr.as_ptr().sub(MAGIC_LEN + SIZE_LEN + PTR_LEN))
            };
            let real_base = unsafe { NonNull::new_unchecked(base_ptr) };
            Recovered { real_base, user_size, notify: None, shape }
        }
        Shape::Tracked => {
            let user_size = unsafe { read_usize(user_ptr.as_ptr().sub(MAGIC_LEN + SIZE_LEN)) };
            let notify_ptr = unsafe {
                read_ptr(user_ptr.as_ptr().sub(MAGIC_LEN + SIZE_LEN + PTR_LEN))
            };
            let base_ptr = unsafe {
                read_ptr(user_ptr.as_ptr().sub(MAGIC_LEN + SIZE_LEN + PTR_LEN + PTR_LEN))
            };
            let real_base = unsafe { NonNull::new_unchecked(base_ptr) };
            let notify = NonNull::new(notify_ptr.cast::<NotifySet>());
            Recovered { real_base, user_size, notify, shape }
        }
        Shape::Unknown => Recovered {
            real_base: user_ptr,
            user_size: 0,
            notify: None,
            shape,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_raw(len: usize) -> NonNull<u8> {
        let layout = std::alloc::Layout::from_size_align(len, FIXED_ALIGN).unwrap();
        NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap()
    }

    fn free_raw(ptr: NonNull<u8>, len: usize) {
        let layout = std::alloc::Layout::from_size_align(len, FIXED_ALIGN).unwrap();
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    #[test]
    fn fixed_round_trips() {
        let real_base = alloc_raw(FIXED_LEN + 64);
        let user_ptr = unsafe { place_fixed(real_base, 64) };
        assert_eq!(unsafe { classify(user_ptr) }, Shape::Fixed);
        let recovered = unsafe { recover(user_ptr) };
        assert_eq!(recovered.real_base, real_base);
        assert_eq!(recovered.user_size, 64);
        assert!(recovered.notify.is_none());
        free_raw(real_base, FIXED_LEN + 64);
    }

    #[test]
    fn variable_round_trips_at_large_alignment() {
        let align = 64;
        let len = variable_len(align);
        let real_base = alloc_raw(len + 128);
        let user_ptr = unsafe { place_variable(real_base, 128, align) };
        assert_eq!(unsafe { classify(user_ptr) }, Shape::Variable);
        let recovered = unsafe { recover(user_ptr) };
        assert_eq!(recovered.real_base, real_base);
        assert_eq!(recovered.user_size, 128);
        free_raw(real_base, len + 128);
    }

    #[test]
    fn tracked_round_trips_with_null_notify() {
        let align = 8;
        let len = tracked_len(align);
        let real_base = alloc_raw(len + 16);
        let user_ptr = unsafe { place_tracked(real_base, 16, align, None) };
        assert_eq!(unsafe { classify(user_ptr) }, Shape::Tracked);
        let recovered = unsafe { recover(user_ptr) };
        assert_eq!(recovered.real_base, real_base);
        assert_eq!(recovered.user_size, 16);
        assert!(recovered.notify.is_none());
        free_raw(real_base, len + 16);
    }

    #[test]
    fn unknown_block_is_inert() {
        // A block never written by `place_*`: leave 4 bytes of in-bounds,
        // non-magic padding before the pointer we classify, the way a
        // pointer from outside this crate would never match one of our
        // magics.
        let block = alloc_raw(20);
        unsafe { write_u32(block.as_ptr(), 0xDEAD_BEEF) };
        let user_ptr = unsafe { NonNull::new_unchecked(block.as_ptr().add(4)) };
        let recovered = unsafe { recover(user_ptr) };
        assert_eq!(recovered.shape, Shape::Unknown);
        assert_eq!(recovered.real_base, user_ptr);
        assert_eq!(recovered.user_size, 0);
        free_raw(block, 20);
    }
}
