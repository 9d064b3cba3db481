//! Opening, attaching to, and locking a named shared-memory region.
//!
//! Follows the raw-`libc`-call-then-`io::Error::last_os_error()` idiom of
//! `maestro-os-maestro/inttest/src/util.rs` throughout: no `memmap2`
//! wrapper, because the mapping must be `MAP_SHARED` with a fixed,
//! versioned layout reinterpreted in place, and a thin abstraction would
//! only hide the flags that matter.

use std::{ffi::CString, io, ptr::NonNull};

use crate::{
    error::ShmemError,
    layout::{Header, MAX_PROCESSES, VERSION},
};

/// An attached, memory-mapped shared region.
///
/// Owns the mapping (`munmap`s it on drop) but not the name: unlinking the
/// underlying OS object is a separate, explicit call made by whichever
/// layer decides the last participant has left (`cpulend_core`'s
/// `Finalize`), since `Drop` here only ever represents *this process*
/// detaching, not the segment's last attacher leaving.
pub struct SharedRegion {
    ptr: NonNull<Header>,
    name: CString,
}

// The region is a plain-old-data struct behind a process-shared, robust
// mutex; every access to its contents goes through `critical_section`.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Opens the region named by `key`, creating it (and its process-shared
    /// robust mutex) if it does not yet exist.
    ///
    /// `size_multiplier` together with the number of CPUs on this machine
    /// determines the live process-row capacity; an existing region must
    /// have been created with the same capacity, or this fails with
    /// [`ShmemError::Init`].
    ///
    /// # Errors
    ///
    /// Returns [`ShmemError::Os`] for OS-level failures, [`ShmemError::Init`]
    /// on version or capacity mismatch, and [`ShmemError::NoMemory`] if the
    /// OS refuses to back a newly created segment.
    pub fn attach(key: &str, size_multiplier: u32) -> Result<Self, ShmemError> {
        let name = CString::new(format!("/cpulend-{key}"))
            .map_err(|e| ShmemError::Init(e.to_string()))?;
        let capacity = live_capacity(size_multiplier);

        let (fd, created) = open_or_create(&name)?;
        let ptr = if created {
            create_region(fd, capacity)
        } else {
            attach_region(fd, capacity)
        };
        // The mapping keeps the object alive; the descriptor is redundant
        // once mapped.
        unsafe {
            libc::close(fd);
        }
        // Only unlink on failure if this call created the segment: an
        // attach failure (version/capacity mismatch) must leave another
        // process's live segment alone.
        let ptr = ptr.inspect_err(|_| {
            if created {
                unsafe {
                    libc::shm_unlink(name.as_ptr());
                }
            }
        })?;

        let region = Self { ptr, name };
        region.scan_for_stale_pids()?;
        Ok(region)
    }

    /// Runs `f` with exclusive access to the region's header, holding the
    /// cross-process lock for the whole call.
    ///
    /// The lock is never held across `f`'s return: callers build their
    /// full mutation plan and any outgoing notifications are dispatched
    /// only after this returns and the guard has dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ShmemError::Os`] if the underlying `pthread_mutex_lock`/
    /// `pthread_mutex_unlock` calls fail for a reason other than a
    /// recoverable dead owner.
    pub fn critical_section<R>(
        &self,
        f: impl FnOnce(&mut Header) -> R,
    ) -> Result<R, ShmemError> {
        unsafe {
            let mutex_ptr = &raw mut (*self.ptr.as_ptr()).mutex;
            crate::lock::lock(mutex_ptr)?;
            let result = f(&mut *self.ptr.as_ptr());
            crate::lock::unlock(mutex_ptr)?;
            Ok(result)
        }
    }

    /// Re-scans registered pids for ones that no longer exist on this
    /// machine, zeroing their rows and decrementing `attached_nprocs`.
    ///
    /// Run once automatically on every [`Self::attach`]; exposed so a long
    /// running process can also re-run it periodically.
    ///
    /// # Errors
    ///
    /// Returns [`ShmemError::Os`] if the lock cannot be taken.
    pub fn scan_for_stale_pids(&self) -> Result<usize, ShmemError> {
        self.critical_section(|header| {
            let mut cleaned = 0;
            for row in header.processes_mut() {
                if row.is_empty() {
                    continue;
                }
                if !pid_exists(row.pid) {
                    tracing::warn!(pid = row.pid, "cleaning up stale process row");
                    *row = crate::layout::ProcessRow::EMPTY;
                    header.attached_nprocs = header.attached_nprocs.saturating_sub(1);
                    cleaned += 1;
                }
            }
            cleaned
        })
    }

    /// Unlinks the underlying OS object so no future `attach` can find it.
    ///
    /// Existing mappings (including this one) remain valid until unmapped;
    /// callers are expected to call this only once `attached_nprocs`
    /// reaches zero.
    ///
    /// # Errors
    ///
    /// Returns [`ShmemError::Os`] if `shm_unlink` fails for a reason other
    /// than the object already being gone.
    pub fn unlink(&self) -> Result<(), ShmemError> {
        let rc = unsafe { libc::shm_unlink(self.name.as_ptr()) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(());
        }
        Err(ShmemError::Os(err))
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), std::mem::size_of::<Header>());
        }
    }
}

fn live_capacity(size_multiplier: u32) -> u32 {
    let ncpus = std::thread::available_parallelism().map_or(1, |n| n.get()) as u32;
    (ncpus * size_multiplier.max(1)).min(MAX_PROCESSES as u32)
}

fn pid_exists(pid: u32) -> bool {
    #[allow(clippy::cast_possible_wrap)]
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Opens the named segment, creating it if absent. Returns whether *this*
/// call created it (`O_EXCL` succeeded), racing other attachers safely.
fn open_or_create(name: &CString) -> Result<(i32, bool), ShmemError> {
    unsafe {
        let fd = libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        );
        if fd >= 0 {
            return Ok((fd, true));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(ShmemError::Os(err));
        }
        let fd = libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o600);
        if fd < 0 {
            return Err(ShmemError::Os(io::Error::last_os_error()));
        }
        Ok((fd, false))
    }
}

fn create_region(fd: i32, capacity: u32) -> Result<NonNull<Header>, ShmemError> {
    unsafe {
        let len = std::mem::size_of::<Header>();
        #[allow(clippy::cast_possible_wrap)]
        if libc::ftruncate(fd, len as libc::off_t) != 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::ENOSPC) {
                ShmemError::NoMemory
            } else {
                ShmemError::Os(err)
            });
        }
        let ptr = map(fd, len)?;
        Header::init_in_place(ptr.as_ptr(), capacity);
        crate::lock::init(&raw mut (*ptr.as_ptr()).mutex).map_err(ShmemError::Os)?;
        Ok(ptr)
    }
}

fn attach_region(fd: i32, capacity: u32) -> Result<NonNull<Header>, ShmemError> {
    unsafe {
        let len = std::mem::size_of::<Header>();
        let mut stat: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &raw mut stat) != 0 {
            return Err(ShmemError::Os(io::Error::last_os_error()));
        }
        #[allow(clippy::cast_sign_loss)]
        if (stat.st_size as usize) < len {
            return Err(ShmemError::Init(format!(
                "existing segment is {} bytes, expected at least {len}",
                stat.st_size
            )));
        }
        let ptr = map(fd, len)?;
        let header = ptr.as_ref();
        if header.version != VERSION {
            return Err(ShmemError::Init(format!(
                "version mismatch: segment has {}, this build expects {VERSION}",
                header.version
            )));
        }
        if header.capacity != capacity {
            return Err(ShmemError::Init(format!(
                "capacity mismatch: segment has {}, this process computed {capacity} \
                 (differing CPU count or shm-size-multiplier across attachers)",
                header.capacity
            )));
        }
        Ok(ptr)
    }
}

fn map(fd: i32, len: usize) -> Result<NonNull<Header>, ShmemError> {
    unsafe {
        let addr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::ENOMEM) {
                ShmemError::NoMemory
            } else {
                ShmemError::Os(err)
            });
        }
        Ok(NonNull::new(addr.cast()).expect("mmap returned null without MAP_FAILED"))
    }
}
