//! The persistent, memory-mapped layout of a shared region.
//!
//! Mirrors the teacher's `#[repr(C)]` + [`dataview::Pod`] pattern for
//! on-disk filesystem structures (`ov6_fs_types::SuperBlock`): a struct
//! whose byte layout *is* its wire format, reinterpreted in place from
//! mapped memory with no serialization step.

use cpulend_queue::RequestQueue;
use dataview::Pod;

/// Layout version. Bumping this invalidates every existing segment;
/// attaching to a segment with a different version fails with
/// [`crate::ShmemError::Init`].
pub const VERSION: u32 = 1;

/// Compile-time upper bound on live participants, sized generously above
/// any real node's core count. The *live* capacity (`Header::capacity`,
/// `system CPU count × shm-size-multiplier`) is a runtime-computed prefix
/// of this fixed array, clamped to this bound.
pub const MAX_PROCESSES: usize = 1024;

/// One process's slot in the shared region.
///
/// Cache-line aligned so that two processes mutating their own (adjacent)
/// rows under the same lock do not false-share a cache line on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Default)]
#[repr(C, align(64))]
pub struct ProcessRow {
    /// 0 means this slot is empty.
    pub pid: u32,
    pub initial_ncpus: u32,
    pub current_ncpus: u32,
}

impl ProcessRow {
    /// A zeroed, unoccupied slot.
    pub const EMPTY: Self = Self {
        pid: 0,
        initial_ncpus: 0,
        current_ncpus: 0,
    };

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pid == 0
    }
}

/// The fixed-size header of a shared region, followed in the same struct
/// by the (fixed-capacity, runtime-bounded) process array.
///
/// Not `Pod`-derived itself: it embeds a `libc::pthread_mutex_t`, an FFI
/// type opaque to `dataview`. Reinterpreting the mapped bytes as `&mut
/// Header` is instead done with a single raw pointer cast in
/// [`crate::region::SharedRegion`], the same "pointer-cast onto a mapped
/// region" idiom `maestro-os-maestro`'s host tooling uses for raw `libc`
/// structs.
#[repr(C)]
pub struct Header {
    /// Must be the first field: every attacher checks this before
    /// touching anything else in the region.
    pub version: u32,
    /// Live prefix length of `processes`, fixed at first creation.
    pub capacity: u32,
    /// CPUs not currently possessed by any process.
    pub idle_cpus: u32,
    /// Count of rows with `pid != 0`.
    pub attached_nprocs: u32,
    /// Highest used index + 1.
    pub proc_list_head: u32,
    pub requests: RequestQueue<{ cpulend_queue::DEFAULT_CAPACITY }>,
    pub(crate) mutex: libc::pthread_mutex_t,
    pub processes: [ProcessRow; MAX_PROCESSES],
}

impl Header {
    /// Initializes a freshly created (zeroed) region in place.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `size_of::<Header>()` bytes of
    /// writable, otherwise-untouched, properly aligned memory (as
    /// returned by `mmap`), and no other reference to it may exist.
    pub(crate) unsafe fn init_in_place(ptr: *mut Self, capacity: u32) {
        unsafe {
            ptr.write(Self {
                version: VERSION,
                capacity,
                idle_cpus: 0,
                attached_nprocs: 0,
                proc_list_head: 0,
                requests: RequestQueue::new(),
                mutex: std::mem::zeroed(),
                processes: [ProcessRow::EMPTY; MAX_PROCESSES],
            });
        }
    }

    /// Live process rows, per `capacity`.
    #[must_use]
    pub fn processes(&self) -> &[ProcessRow] {
        &self.processes[..self.capacity as usize]
    }

    /// Live process rows, mutably, per `capacity`.
    pub fn processes_mut(&mut self) -> &mut [ProcessRow] {
        &mut self.processes[..self.capacity as usize]
    }
}
