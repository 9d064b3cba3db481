//! The flattened public error taxonomy of spec.md §6/§7.
//!
//! `Success` is not a variant here: operations return `Ok(())`/`Ok(Outcome)`.
//! Every other named code in spec.md §6's table (`NO_SHMEM`, `NO_PROCESS`,
//! `NOT_PERMITTED`, `CAPACITY`, `NO_MEMORY`, `INIT`, `UNKNOWN`) is reachable
//! through one of the three wrapped error types; `NOTED` is
//! [`cpulend_core::Outcome::Noted`], a success value, not an error.

use cpulend_core::CoreError;
use cpulend_notify::NotifyError;
use cpulend_shmem::ShmemError;

use crate::config::ConfigError;

/// Everything a [`crate::Node`] or [`crate::Subprocess`] call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Shmem(#[from] ShmemError),

    #[error("failed to notify a peer process: {0}")]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
