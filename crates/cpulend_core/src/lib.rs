//! The coordinator state machine: shared-memory operations implementing
//! `Lend`, `LendKeep`, `Reclaim`, `Acquire`, `Borrow`, `Reset`, and the
//! `Init`/`Finalize` row lifecycle, atop [`cpulend_shmem`]'s locked
//! region and [`cpulend_queue`]'s FIFO request queue.
//!
//! This crate has no notion of a subprocess, a policy, or a blocking
//! call; it is the pure state-transition layer a facade (e.g. `cpulend`)
//! builds a process-facing API on top of.

mod error;
mod invariants;
mod ops;
mod outcome;
mod steal;

pub use error::CoreError;
pub use ops::{DELETE_REQUESTS, MAX_REQUEST, acquire, borrow, finalize, lend, lend_keep, reclaim, register, reset};
pub use outcome::{Fulfilment, OpResult, Outcome};
