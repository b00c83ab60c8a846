//! Per-thread re-entrancy flags.
//!
//! `hooked` gates whether a thread's activity is traced at all; the service
//! and helper threads clear it for their lifetime. `in_malloc_free` marks
//! that the thread is already inside a hook, so nested allocator calls made
//! by the hook machinery itself are passed straight through.
//!
//! The cells are const-initialized so that first access never allocates, and
//! `try_with` keeps hooks harmless while a thread's TLS is being torn down.

use std::cell::Cell;

struct Flags {
    hooked: Cell<bool>,
    in_malloc_free: Cell<bool>,
}

thread_local! {
    static FLAGS: Flags = const {
        Flags {
            hooked: Cell::new(true),
            in_malloc_free: Cell::new(false),
        }
    };
}

pub fn hooked() -> bool {
    FLAGS.try_with(|f| f.hooked.get()).unwrap_or(false)
}

pub fn set_hooked(value: bool) -> bool {
    FLAGS
        .try_with(|f| f.hooked.replace(value))
        .unwrap_or(false)
}

/// Scope guard disabling tracing for the current thread.
pub struct NoHook {
    was_hooked: bool,
}

impl NoHook {
    #[allow(clippy::new_without_default)]
    pub fn new() -> NoHook {
        NoHook {
            was_hooked: set_hooked(false),
        }
    }
}

impl Drop for NoHook {
    fn drop(&mut self) {
        set_hooked(self.was_hooked);
    }
}

/// Scope guard marking "inside an allocator hook".
pub struct MallocFree {
    prev: bool,
}

impl MallocFree {
    pub fn enter() -> MallocFree {
        MallocFree {
            prev: FLAGS
                .try_with(|f| f.in_malloc_free.replace(true))
                .unwrap_or(true),
        }
    }

    pub fn was_in_malloc_free(&self) -> bool {
        self.prev
    }
}

impl Drop for MallocFree {
    fn drop(&mut self) {
        let _ = FLAGS.try_with(|f| f.in_malloc_free.set(self.prev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nohook_restores() {
        assert!(hooked());
        {
            let _guard = NoHook::new();
            assert!(!hooked());
            {
                let _nested = NoHook::new();
                assert!(!hooked());
            }
            assert!(!hooked());
        }
        assert!(hooked());
    }

    #[test]
    fn malloc_free_nests() {
        let outer = MallocFree::enter();
        assert!(!outer.was_in_malloc_free());
        {
            let inner = MallocFree::enter();
            assert!(inner.was_in_malloc_free());
        }
        drop(outer);
        let fresh = MallocFree::enter();
        assert!(!fresh.was_in_malloc_free());
    }
}
