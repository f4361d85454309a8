//! C-callable shim kept for parity with the `createNewMemoryCounter()` symbol
//! this crate's accounting model was distilled from — historically the only
//! public entry point outside the hook mechanism itself, resolved by clients
//! via dynamic symbol lookup. Rust callers should prefer
//! [`crate::new_counter`] directly; every operation beyond creation and
//! destruction is a method on [`Counter`] itself, called directly in Rust —
//! there is deliberately no further C surface, matching the original's "this
//! is the only entry point outside the hook mechanism" scope.

use crate::counter::Counter;

/// Creates a new, initially-disabled top-level counter on the calling
/// thread's thread pool, and returns an owning pointer. Never null.
#[unsafe(no_mangle)]
pub extern "C" fn create_new_memory_counter() -> *mut Counter {
    Box::into_raw(Box::new(crate::new_counter("ffi-counter")))
}

/// Releases a counter returned by [`create_new_memory_counter`]. The
/// underlying accounting node itself, and any totals already attributed to
/// it, outlive this call if anything else still holds a reference to it
/// (e.g. a child counter, or a pending Tracked block's notify set) — this
/// only frees the handle.
///
/// # Safety
/// `counter` must be null or a pointer previously returned by
/// [`create_new_memory_counter`], and must not be used again after this
/// call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn destroy_memory_counter(counter: *mut Counter) {
    if !counter.is_null() {
        drop(unsafe { Box::from_raw(counter) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_destroy_round_trips() {
        let counter = create_new_memory_counter();
        assert!(!counter.is_null());
        unsafe {
            assert!(!(*counter).is_enabled());
            destroy_memory_counter(counter);
        }
    }
}
