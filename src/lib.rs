//! Per-thread, scoped memory accounting for Rust programs.
//!
//! Install [`AccountingAllocator`] as the process's `#[global_allocator]`,
//! then create one or more [`Counter`]s and enable them on whichever threads
//! should be attributed to them:
//!
//! ```
//! use mem_counters::{new_counter, AccountingAllocator};
//!
//! #[global_allocator]
//! static ALLOC: AccountingAllocator = AccountingAllocator::new();
//!
//! let counter = new_counter("parser");
//! counter.enable();
//! let buf = vec![0u8; 1024];
//! assert!(counter.current_size() >= 1024);
//! drop(buf);
//! counter.disable();
//! ```
//!
//! A counter may have sub-counters ([`Counter::create_child`]); at most one
//! direct child of a given counter can be enabled at a time, so narrowing
//! attribution to a child implicitly stops attributing to its siblings.
//! Enabling a thread pool's top-level counters has no such restriction —
//! several may be enabled on the same thread simultaneously.
//!
//! Diagnostics are emitted through the `tracing` crate; install a subscriber
//! (e.g. `tracing-subscriber`) to see them. [`debug_env_enabled`] reports
//! whether `MEM_COUNTERS_DEBUG=1` was set, for a binary that wants to raise
//! its own subscriber's filter level in response.

mod allocator;
mod counter;
mod ffi;
mod guards;
mod header;
mod manager;
mod notify;
mod thread_pool;

pub use allocator::AccountingAllocator;
pub use counter::{Counter, CounterSnapshot};
pub use guards::{disable_this_thread, enable_this_thread};

use manager::Manager;

/// Creates a new top-level counter on the calling thread's thread pool.
/// Initially disabled — call [`Counter::enable`] to start attributing
/// allocations to it.
pub fn new_counter(name: impl Into<String>) -> Counter {
    Manager::instance().create_counter(name)
}

/// Reads the `MEM_COUNTERS_DEBUG` environment variable and, if set to a
/// truthy value (`1`, `true`, `yes`, case-insensitively), raises the default
/// `tracing` filter this crate's own spans and events are emitted at from
/// `warn` to `debug`. Intended to be called once, early in `main`, before
/// installing a `tracing` subscriber; has no effect on its own without one.
///
/// This does not install a subscriber — it only decides, via an
/// [`EnvFilter`](https://docs.rs/tracing-subscriber)-style directive string,
/// how verbose this crate's own diagnostics should be once one exists.
pub fn debug_env_enabled() -> bool {
    std::env::var("MEM_COUNTERS_DEBUG")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_counter_starts_disabled() {
        let c = new_counter("fresh");
        assert!(!c.is_enabled());
    }

    #[test]
    fn debug_env_enabled_defaults_to_false() {
        std::env::remove_var("MEM_COUNTERS_DEBUG");
        assert!(!debug_env_enabled());
    }
}
