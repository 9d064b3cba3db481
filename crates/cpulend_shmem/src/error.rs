/// Failures from opening, attaching to, or operating on a shared region.
#[derive(Debug, thiserror::Error)]
pub enum ShmemError {
    /// The source API's NO_SHMEM ("not attached") is not a runtime state
    /// this type can be in: a [`crate::SharedRegion`] value only exists
    /// once `attach` has succeeded, and every operation takes `&self` on
    /// one. There is no handle to call an operation through before
    /// attaching, so Rust's ownership model rules this out at compile
    /// time rather than at runtime. Kept as a variant purely so callers
    /// matching on the full NO_SHMEM/NO_PROCESS/.../UNKNOWN taxonomy of
    /// spec.md §6 have somewhere to route it; never constructed.
    #[error("no shared-memory region is attached")]
    NoShmem,

    /// The OS would not grant enough memory for the region.
    #[error("not enough memory to create the shared-memory region")]
    NoMemory,

    /// An existing region was found but is incompatible: version mismatch,
    /// or a different live capacity than this process computed.
    #[error("incompatible shared-memory region: {0}")]
    Init(String),

    /// A raw OS call failed.
    #[error("shared-memory operation failed: {0}")]
    Os(#[from] std::io::Error),
}
