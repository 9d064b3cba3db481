//! Named, process-shared memory regions with a single cross-process lock.
//!
//! A [`SharedRegion`] is a versioned [`layout::Header`] mapped with
//! `MAP_SHARED`, guarded end-to-end by one `pthread_mutex_t` that is both
//! process-shared and (where the platform supports it) robust: if a
//! process dies while holding the lock, the next locker recovers instead
//! of deadlocking. Every mutation of the region's contents happens inside
//! [`SharedRegion::critical_section`].

mod error;
mod layout;
mod lock;
mod mailbox_registry;
mod pid;
mod region;

pub use error::ShmemError;
pub use layout::{Header, MAX_PROCESSES, ProcessRow, VERSION};
pub use mailbox_registry::MailboxRegistry;
pub use pid::Pid;
pub use region::SharedRegion;
