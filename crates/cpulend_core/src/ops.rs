//! The coordinator operations: `Lend`, `LendKeep`, `Reclaim`, `Acquire`,
//! `Borrow`, `Reset`, plus the row lifecycle `Init`/`Finalize`.
//!
//! Every operation is all-or-nothing with respect to the shared region:
//! on error, nothing has been mutated (spec.md §7's "atomic per
//! operation" propagation policy). Each takes the lock for its entire
//! body via [`SharedRegion::critical_section`] and runs the invariant
//! checks of `I1`-`I6` before returning.

use cpulend_queue::{DEFAULT_CAPACITY, Entry};
use cpulend_shmem::{Header, Pid, ProcessRow, SharedRegion};

use crate::{
    error::CoreError,
    invariants,
    outcome::{Fulfilment, OpResult, Outcome},
    steal,
};

/// Sentinel meaning "insatiable greed": acquire everything idle right
/// now and queue the (effectively unbounded) rest.
pub const MAX_REQUEST: u32 = u32::MAX;

/// Sentinel meaning "drop my outstanding queue entry".
pub const DELETE_REQUESTS: u32 = u32::MAX - 1;

fn row_index(header: &Header, pid: u32) -> Result<usize, CoreError> {
    let capacity = header.capacity as usize;
    header.processes()[..capacity]
        .iter()
        .position(|r| r.pid == pid)
        .ok_or(CoreError::NoProcess(pid))
}

/// Registers a newly attached process, filling the first empty row.
///
/// # Errors
///
/// [`CoreError::Capacity`] if every row is occupied.
pub fn register(region: &SharedRegion, pid: Pid, initial_ncpus: u32) -> Result<OpResult, CoreError> {
    region.critical_section(|header| register_locked(header, pid.get(), initial_ncpus))?
}

fn register_locked(header: &mut Header, pid: u32, initial_ncpus: u32) -> Result<OpResult, CoreError> {
    let capacity = header.capacity as usize;
    if header.processes()[..capacity].iter().any(|r| r.pid == pid) {
        return Err(CoreError::NotPermitted(format!(
            "pid {pid} is already registered"
        )));
    }
    let idx = header.processes()[..capacity]
        .iter()
        .position(ProcessRow::is_empty)
        .ok_or(CoreError::Capacity)?;
    header.processes_mut()[idx] = ProcessRow {
        pid,
        initial_ncpus,
        current_ncpus: initial_ncpus,
    };
    header.attached_nprocs += 1;
    if idx + 1 > header.proc_list_head as usize {
        header.proc_list_head = u32::try_from(idx + 1).expect("idx bounded by MAX_PROCESSES");
    }
    invariants::check_all(header);
    Ok(OpResult::new(Outcome::Registered, Vec::new()))
}

/// Reduces the caller's `current_ncpus` by `n`, fulfilling queued
/// requests from the released capacity before parking any remainder as
/// `idle_cpus`.
///
/// # Errors
///
/// [`CoreError::NoProcess`] if `pid` is not registered;
/// [`CoreError::NotPermitted`] if `n > current_ncpus`.
pub fn lend(region: &SharedRegion, pid: Pid, n: u32) -> Result<OpResult, CoreError> {
    region.critical_section(|header| lend_locked(header, pid.get(), n))?
}

fn lend_locked(header: &mut Header, pid: u32, n: u32) -> Result<OpResult, CoreError> {
    let idx = row_index(header, pid)?;
    let row = header.processes()[idx];
    if n > row.current_ncpus {
        return Err(CoreError::NotPermitted(format!(
            "cannot lend {n}, only holding {}",
            row.current_ncpus
        )));
    }

    let excess_lent = n.min(row.current_ncpus.saturating_sub(row.initial_ncpus));
    let removed = header.requests.remove(pid);
    let prev_requested = excess_lent + removed;

    header.processes_mut()[idx].current_ncpus = row.current_ncpus - n;

    let fulfilments = fulfil_from_shared_queue(header, n);

    let new_total = header.processes()[idx].current_ncpus;
    invariants::check_all(header);
    Ok(OpResult::new(
        Outcome::Lent {
            new_total,
            prev_requested,
        },
        fulfilments,
    ))
}

/// As [`lend`], but `target_count` is the amount the caller wishes to
/// *retain* rather than the amount to release.
///
/// # Errors
///
/// [`CoreError::NoProcess`] if `pid` is not registered;
/// [`CoreError::NotPermitted`] if `target_count > current_ncpus`.
pub fn lend_keep(region: &SharedRegion, pid: Pid, target_count: u32) -> Result<OpResult, CoreError> {
    region.critical_section(|header| lend_keep_locked(header, pid.get(), target_count))?
}

fn lend_keep_locked(header: &mut Header, pid: u32, target_count: u32) -> Result<OpResult, CoreError> {
    let idx = row_index(header, pid)?;
    let current = header.processes()[idx].current_ncpus;
    if target_count > current {
        return Err(CoreError::NotPermitted(format!(
            "cannot keep {target_count}, only holding {current}"
        )));
    }
    if target_count == current {
        return Ok(OpResult::new(Outcome::NoUpdate, Vec::new()));
    }
    lend_locked(header, pid, current - target_count)
}

/// Restores the caller toward `current_ncpus`'s deficit below
/// `initial_ncpus` (idle first, then even-stealing), then opportunistically
/// tries to satisfy `prev_requested` from idle, queuing any remainder.
///
/// The deficit-restore is what `Reclaim` is for and always succeeds (the
/// node's total surplus elsewhere can never fall short of the caller's own
/// historical deficit — see `I1`); `prev_requested`'s top-up is a bonus
/// attempt on top of that and, if idle can't cover it, queuing the
/// remainder does not downgrade an otherwise-successful reclaim: `Success`
/// reflects the caller's own row being made whole, not whether every
/// queued entry on the node happens to be empty afterward.
///
/// # Errors
///
/// [`CoreError::NoProcess`] if `pid` is not registered;
/// [`CoreError::Capacity`] if the deficit cannot be fully covered by
/// idle CPUs plus stealing (nothing is mutated in that case).
pub fn reclaim(region: &SharedRegion, pid: Pid, prev_requested: u32) -> Result<OpResult, CoreError> {
    region.critical_section(|header| reclaim_locked(header, pid.get(), prev_requested))?
}

fn reclaim_locked(header: &mut Header, pid: u32, prev_requested: u32) -> Result<OpResult, CoreError> {
    let idx = row_index(header, pid)?;
    let row = header.processes()[idx];
    let deficit = row.initial_ncpus.saturating_sub(row.current_ncpus);

    let mut fulfilments = Vec::new();
    let mut recovered = 0u32;
    if deficit > 0 {
        let from_idle = header.idle_cpus.min(deficit);
        let shortfall = deficit - from_idle;
        let steal_fulfilments = if shortfall > 0 {
            steal::even_steal(header, pid, shortfall)?
        } else {
            Vec::new()
        };
        header.idle_cpus -= from_idle;
        header.processes_mut()[idx].current_ncpus += from_idle + shortfall;
        recovered = from_idle + shortfall;
        fulfilments.extend(steal_fulfilments);
    }

    if prev_requested > 0 {
        let from_idle = header.idle_cpus.min(prev_requested);
        header.idle_cpus -= from_idle;
        header.processes_mut()[idx].current_ncpus += from_idle;
        recovered += from_idle;
        let queued = prev_requested - from_idle;
        if queued > 0 && header.requests.push(pid, queued).is_err() {
            tracing::warn!(pid, queued, "request queue full; reclaimed prev_requested remainder dropped");
        }
    }

    let new_total = header.processes()[idx].current_ncpus;
    invariants::check_all(header);
    let outcome = if recovered > 0 {
        Outcome::Success { new_total }
    } else {
        Outcome::NoUpdate
    };
    Ok(OpResult::new(outcome, fulfilments))
}

/// Acquires `n` CPUs beyond whatever the caller currently holds: idle
/// first; then, if the caller is still below its initial share, an
/// even-steal for exactly the amount of `n` still unmet (not a restore of
/// the caller all the way back to `initial_ncpus`); any of `n` that
/// stealing could not cover either — because the caller wasn't below its
/// initial share, or because the node's total surplus fell short — is
/// queued under the caller's pid instead.
///
/// `n == 0` is a no-op. `n == `[`DELETE_REQUESTS`] drops the caller's
/// queue entry. `n == `[`MAX_REQUEST`] takes everything idle and queues
/// the (effectively unbounded) remainder.
///
/// # Errors
///
/// [`CoreError::NoProcess`] if `pid` is not registered. A shortfall in
/// stealing never surfaces as an error here: it degrades to queuing, per
/// the above.
pub fn acquire(region: &SharedRegion, pid: Pid, n: u32) -> Result<OpResult, CoreError> {
    region.critical_section(|header| acquire_locked(header, pid.get(), n))?
}

fn acquire_locked(header: &mut Header, pid: u32, n: u32) -> Result<OpResult, CoreError> {
    if n == 0 {
        row_index(header, pid)?;
        return Ok(OpResult::new(Outcome::NoUpdate, Vec::new()));
    }
    if n == DELETE_REQUESTS {
        let idx = row_index(header, pid)?;
        header.requests.remove(pid);
        let new_total = header.processes()[idx].current_ncpus;
        invariants::check_all(header);
        return Ok(OpResult::new(Outcome::Success { new_total }, Vec::new()));
    }

    let idx = row_index(header, pid)?;
    let granted_idle = header.idle_cpus.min(n);
    header.idle_cpus -= granted_idle;
    header.processes_mut()[idx].current_ncpus += granted_idle;
    let mut remaining = n - granted_idle;

    let current = header.processes()[idx].current_ncpus;
    let initial = header.processes()[idx].initial_ncpus;
    let mut fulfilments = Vec::new();
    if remaining > 0 && current < initial {
        // Only attempt to steal the portion of `n` idle couldn't cover; a
        // process already at or above its initial share gets no help here
        // and the rest of `n` falls straight through to the queue below.
        // Stealing targets satisfying this request, not restoring the
        // caller all the way back to `initial_ncpus` regardless of `n`.
        match steal::even_steal(header, pid, remaining) {
            Ok(steal_fulfilments) => {
                header.processes_mut()[idx].current_ncpus += remaining;
                remaining = 0;
                fulfilments = steal_fulfilments;
            }
            Err(CoreError::Capacity) => {
                // Not enough surplus anywhere to help; queue the shortfall
                // like any other unmet request instead of failing outright.
            }
            Err(err) => return Err(err),
        }
    }

    if remaining > 0 && header.requests.push(pid, remaining).is_err() {
        tracing::warn!(pid, remaining, "request queue full; acquire remainder dropped");
    }

    let new_total = header.processes()[idx].current_ncpus;
    invariants::check_all(header);
    let outcome = if remaining > 0 {
        Outcome::Noted {
            granted: granted_idle,
            queued: remaining,
        }
    } else {
        Outcome::Success { new_total }
    };
    Ok(OpResult::new(outcome, fulfilments))
}

/// Takes up to `min(idle_cpus, n)` from the idle pool only. Never steals,
/// never queues.
///
/// # Errors
///
/// [`CoreError::NoProcess`] if `pid` is not registered.
pub fn borrow(region: &SharedRegion, pid: Pid, n: u32) -> Result<OpResult, CoreError> {
    region.critical_section(|header| borrow_locked(header, pid.get(), n))?
}

fn borrow_locked(header: &mut Header, pid: u32, n: u32) -> Result<OpResult, CoreError> {
    let idx = row_index(header, pid)?;
    let granted = header.idle_cpus.min(n);
    if granted == 0 {
        return Ok(OpResult::new(Outcome::NoUpdate, Vec::new()));
    }
    header.idle_cpus -= granted;
    header.processes_mut()[idx].current_ncpus += granted;
    let new_total = header.processes()[idx].current_ncpus;
    invariants::check_all(header);
    Ok(OpResult::new(Outcome::Success { new_total }, Vec::new()))
}

/// Idempotently restores the caller to `initial_ncpus`: lends any excess
/// (fulfilling queued requests from it) or reclaims any deficit (idle
/// then even-stealing), and drops the caller's own queue entry either
/// way.
///
/// # Errors
///
/// [`CoreError::NoProcess`] if `pid` is not registered;
/// [`CoreError::Capacity`] if a deficit exists and cannot be fully
/// covered (mirrors [`reclaim`]'s failure mode).
pub fn reset(region: &SharedRegion, pid: Pid) -> Result<OpResult, CoreError> {
    region.critical_section(|header| {
        reset_locked(header, pid.get()).map(|(outcome, fulfilments)| OpResult::new(outcome, fulfilments))
    })?
}

fn reset_locked(header: &mut Header, pid: u32) -> Result<(Outcome, Vec<Fulfilment>), CoreError> {
    let idx = row_index(header, pid)?;
    let row = header.processes()[idx];
    let removed = header.requests.remove(pid);

    if row.current_ncpus > row.initial_ncpus {
        let excess = row.current_ncpus - row.initial_ncpus;
        header.processes_mut()[idx].current_ncpus = row.initial_ncpus;
        let fulfilments = fulfil_from_shared_queue(header, excess);
        let prev_requested = excess + removed;
        invariants::check_all(header);
        return Ok((
            Outcome::ResetDone {
                new_total: row.initial_ncpus,
                prev_requested,
            },
            fulfilments,
        ));
    }

    if row.current_ncpus < row.initial_ncpus {
        let deficit = row.initial_ncpus - row.current_ncpus;
        let from_idle = header.idle_cpus.min(deficit);
        let shortfall = deficit - from_idle;
        let fulfilments = if shortfall > 0 {
            steal::even_steal(header, pid, shortfall)?
        } else {
            Vec::new()
        };
        header.idle_cpus -= from_idle;
        header.processes_mut()[idx].current_ncpus += from_idle + shortfall;
        invariants::check_all(header);
        return Ok((
            Outcome::ResetDone {
                new_total: row.initial_ncpus,
                prev_requested: removed,
            },
            fulfilments,
        ));
    }

    invariants::check_all(header);
    if removed == 0 {
        Ok((Outcome::NoUpdate, Vec::new()))
    } else {
        Ok((
            Outcome::ResetDone {
                new_total: row.current_ncpus,
                prev_requested: removed,
            },
            Vec::new(),
        ))
    }
}

/// Resets the caller (see [`reset`], ignoring its `prev_requested`
/// — this process is leaving), then zeroes its row and decrements
/// `attached_nprocs`.
///
/// If the fulfilment list produced by the internal reset exceeds
/// `max_fulfilments` (the caller's output buffer), the remainder is
/// silently dropped: the departing process's peers will be made whole by
/// their own subsequent `Reset`, per spec.md §7's documented trade-off.
///
/// # Errors
///
/// [`CoreError::NoProcess`] if `pid` is not registered;
/// [`CoreError::Capacity`] if the internal reset's deficit cannot be
/// fully covered.
pub fn finalize(region: &SharedRegion, pid: Pid, max_fulfilments: usize) -> Result<OpResult, CoreError> {
    region.critical_section(|header| finalize_locked(header, pid.get(), max_fulfilments))?
}

fn finalize_locked(
    header: &mut Header,
    pid: u32,
    max_fulfilments: usize,
) -> Result<OpResult, CoreError> {
    let idx = row_index(header, pid)?;
    let (_outcome, mut fulfilments) = reset_locked(header, pid)?;

    header.processes_mut()[idx] = ProcessRow::EMPTY;
    header.attached_nprocs -= 1;

    if fulfilments.len() > max_fulfilments {
        tracing::debug!(
            dropped = fulfilments.len() - max_fulfilments,
            "finalize: fulfilment buffer too small, remainder silently forgiven"
        );
        fulfilments.truncate(max_fulfilments);
    }

    invariants::check_all(header);
    Ok(OpResult::new(Outcome::Finalized, fulfilments))
}

/// Distributes `n` CPUs across the head of the shared request queue,
/// applying each fulfilment to its target's row and parking whatever is
/// left over as `idle_cpus`.
fn fulfil_from_shared_queue(header: &mut Header, n: u32) -> Vec<Fulfilment> {
    let mut out = [Entry::EMPTY; DEFAULT_CAPACITY];
    let (written, leftover) = header.requests.pop_ncpus(n, &mut out);

    let capacity = header.capacity as usize;
    let mut fulfilments = Vec::with_capacity(written);
    for entry in &out[..written] {
        let Some(tidx) = header.processes()[..capacity]
            .iter()
            .position(|r| r.pid == entry.pid)
        else {
            tracing::warn!(pid = entry.pid, "queued pid has no live row; fulfilment dropped");
            continue;
        };
        header.processes_mut()[tidx].current_ncpus += entry.howmany;
        let new_total = header.processes()[tidx].current_ncpus;
        fulfilments.push(Fulfilment {
            target: Pid::new(entry.pid).expect("row pid is always non-zero"),
            new_total,
        });
    }

    header.idle_cpus += leftover;
    fulfilments
}
