//! The even-stealing algorithm used by `Reclaim` and `Acquire`'s shortfall
//! path.
//!
//! Mirrors the teacher source's `reclaim_from_shmem`: build a throwaway
//! victim table of every other live process holding more than its initial
//! share, run the same fairness routine the request queue uses
//! (`pop_ncpus`), and commit the result back into the real rows only if
//! the full deficit can be covered.

use cpulend_queue::{Entry, RequestQueue};
use cpulend_shmem::{Header, MAX_PROCESSES, Pid};

use crate::{error::CoreError, outcome::Fulfilment};

/// Steals `k` CPUs of surplus from processes other than `requester`,
/// distributing the loss evenly across victims (per `pop_ncpus`'s
/// fairness rule) and re-queuing a recovery request for each victim under
/// its own pid, so it can get the CPUs back on a later `Reclaim`.
///
/// All-or-nothing: if the node's total surplus is less than `k`, nothing
/// is committed and this returns [`CoreError::Capacity`], per spec.md
/// §4.C's even-stealing step 4.
///
/// # Errors
///
/// [`CoreError::Capacity`] if fewer than `k` CPUs of surplus exist.
pub(crate) fn even_steal(
    header: &mut Header,
    requester: u32,
    k: u32,
) -> Result<Vec<Fulfilment>, CoreError> {
    if k == 0 {
        return Ok(Vec::new());
    }

    let capacity = header.capacity as usize;
    let mut candidates: Vec<(u32, u32)> = header.processes()[..capacity]
        .iter()
        .filter(|row| row.pid != 0 && row.pid != requester && row.current_ncpus > row.initial_ncpus)
        .map(|row| (row.pid, row.current_ncpus - row.initial_ncpus))
        .collect();
    // Smallest surplus first: `pop_ncpus`'s round-robin share grows as the
    // queue drains, so whoever is queued last absorbs the largest part of
    // `k`. Ordering by ascending surplus means the biggest holders give up
    // proportionally more, rather than every victim losing an equal slice
    // regardless of how much they hold.
    candidates.sort_by_key(|&(_, surplus)| surplus);

    let mut victims: RequestQueue<MAX_PROCESSES> = RequestQueue::new();
    for (pid, surplus) in candidates {
        victims
            .push(pid, surplus)
            .expect("victim count is bounded by the region's live capacity");
    }

    let mut out = [Entry::EMPTY; MAX_PROCESSES];
    let (written, leftover) = victims.pop_ncpus(k, &mut out);
    if leftover != 0 {
        return Err(CoreError::Capacity);
    }

    let mut fulfilments = Vec::with_capacity(written);
    for entry in &out[..written] {
        let idx = header.processes()[..capacity]
            .iter()
            .position(|r| r.pid == entry.pid)
            .expect("pop_ncpus only returns pids that were pushed from live rows");
        let row = &mut header.processes_mut()[idx];
        row.current_ncpus -= entry.howmany;
        let new_total = row.current_ncpus;

        if header.requests.push(entry.pid, entry.howmany).is_err() {
            tracing::warn!(
                pid = entry.pid,
                amount = entry.howmany,
                "request queue full; stolen CPUs could not be re-queued for the victim to reclaim"
            );
        }

        fulfilments.push(Fulfilment {
            target: Pid::new(entry.pid).expect("row pid is always non-zero"),
            new_total,
        });
    }

    Ok(fulfilments)
}
