//! Lazy, refcounted, once-per-process initialization of a shared handle.
//!
//! Several independent subsystems within one process (application threads,
//! the async notifier's helper thread) all want a handle to the same
//! process-wide resource — the attached shared-memory region — but only
//! the first caller should create it, and only the last caller releasing
//! it should tear it down. This is the in-process analogue of
//! [`cpulend_shmem`]'s cross-process attach refcount, used to guard the
//! local side of that same lifecycle (see the "Global state within a
//! process" design note in `SPEC_FULL.md` §9).

use std::sync::{Arc, Mutex};

struct Slot<T> {
    value: Arc<T>,
    refcount: usize,
}

/// A lazily-created, refcounted singleton of `T`, local to one process.
pub struct OnceHandle<T> {
    slot: Mutex<Option<Slot<T>>>,
}

impl<T> Default for OnceHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceHandle<T> {
    /// Creates an empty, uninitialized handle.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Returns the shared value, creating it via `init` if this is the
    /// first live acquirer, and bumps the local refcount either way.
    ///
    /// # Errors
    ///
    /// Propagates `init`'s error without creating or modifying the slot.
    pub fn acquire<F, E>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut slot = self.slot.lock().expect("once-handle mutex poisoned");
        if let Some(existing) = slot.as_mut() {
            existing.refcount += 1;
            return Ok(Arc::clone(&existing.value));
        }
        let value = Arc::new(init()?);
        let handle = Arc::clone(&value);
        *slot = Some(Slot {
            value,
            refcount: 1,
        });
        Ok(handle)
    }

    /// Decrements the local refcount; once it reaches zero, removes the
    /// slot and calls `teardown` with the final value.
    ///
    /// `teardown` is skipped (but the slot still clears) if a clone of
    /// the `Arc` handed out by [`Self::acquire`] outlives this call —
    /// that would indicate a caller kept a handle past its `release`,
    /// which is a usage error this type cannot prevent, only detect.
    ///
    /// Does nothing if the handle is not currently acquired.
    pub fn release<F>(&self, teardown: F)
    where
        F: FnOnce(T),
    {
        let mut slot = self.slot.lock().expect("once-handle mutex poisoned");
        let Some(existing) = slot.as_mut() else {
            return;
        };
        existing.refcount -= 1;
        if existing.refcount > 0 {
            return;
        }
        let Slot { value, .. } = slot.take().expect("slot checked Some above");
        if let Ok(value) = Arc::try_unwrap(value) {
            teardown(value);
        }
    }

    /// Number of outstanding acquirers, for diagnostics and tests.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.slot
            .lock()
            .expect("once-handle mutex poisoned")
            .as_ref()
            .map_or(0, |s| s.refcount)
    }
}
