/// Failures from a coordinator operation.
///
/// `NoUpdate` and `Noted` are not here: spec.md §7 requires callers to
/// treat both as (different flavors of) success, so they live as
/// [`crate::Outcome`] variants instead of errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// `pid` has no row in the shared region.
    #[error("process {0} is not registered")]
    NoProcess(u32),

    /// The requested count is invalid for this operation (e.g. a
    /// `LendKeep` target above the caller's current total).
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// No empty row is available to register a new process, or a
    /// fulfilment list grew past its caller-supplied capacity.
    #[error("capacity exceeded")]
    Capacity,

    #[error(transparent)]
    Shmem(#[from] cpulend_shmem::ShmemError),
}
