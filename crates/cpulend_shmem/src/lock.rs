//! The single process-shared, robust mutex guarding a region.
//!
//! Grounded on the raw-`libc`-call-then-check-return-code idiom in
//! `maestro-os-maestro/inttest/src/util.rs`, applied to the `pthread_mutex_t`
//! family of calls instead of that file's `chmod`/`stat`/`mount` family.

use std::io;

/// Initializes `mutex` in place as process-shared and, on platforms that
/// support it, robust.
///
/// # Safety
///
/// `mutex` must point to valid, writable, not-yet-initialized
/// `pthread_mutex_t` storage, and must outlive every lock/unlock call
/// made against it.
pub(crate) unsafe fn init(mutex: *mut libc::pthread_mutex_t) -> io::Result<()> {
    unsafe {
        let mut attr = std::mem::MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let mut attr = attr.assume_init();

        check(libc::pthread_mutexattr_setpshared(
            &raw mut attr,
            libc::PTHREAD_PROCESS_SHARED,
        ))?;

        #[cfg(target_os = "linux")]
        check(libc::pthread_mutexattr_setrobust(
            &raw mut attr,
            libc::PTHREAD_MUTEX_ROBUST,
        ))?;
        #[cfg(not(target_os = "linux"))]
        tracing::warn!(
            "robust process-shared mutexes are not supported on this platform; \
             a process that dies mid-critical-section will deadlock every other \
             attacher"
        );

        check(libc::pthread_mutex_init(mutex, &raw const attr))?;
        libc::pthread_mutexattr_destroy(&raw mut attr);
        Ok(())
    }
}

/// Locks `mutex`, recovering from a prior holder dying mid-critical-section.
///
/// # Safety
///
/// `mutex` must have been initialized by [`init`] and still be mapped.
pub(crate) unsafe fn lock(mutex: *mut libc::pthread_mutex_t) -> io::Result<()> {
    unsafe {
        let rc = libc::pthread_mutex_lock(mutex);
        if rc == 0 {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        if rc == libc::EOWNERDEAD {
            tracing::warn!("recovering shared-memory lock: previous holder died mid-critical-section");
            check(libc::pthread_mutex_consistent(mutex))?;
            return Ok(());
        }
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Unlocks `mutex`.
///
/// # Safety
///
/// `mutex` must currently be held by this thread via [`lock`].
pub(crate) unsafe fn unlock(mutex: *mut libc::pthread_mutex_t) -> io::Result<()> {
    unsafe { check(libc::pthread_mutex_unlock(mutex)) }
}

fn check(rc: i32) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}
