//! Debug-only checks for invariants I1-I6.
//!
//! Run at the end of every public operation. Compiled out in release
//! builds, per spec.md §7: internal invariants are asserted only at
//! debug-time, and release failures simply return an error code.

use cpulend_shmem::Header;

pub(crate) fn check_all(header: &Header) {
    check_i1_conservation(header);
    check_i2_idle_implies_empty_queue(header);
    check_i3_unique_pids(header);
    check_i5_attached_count(header);
    check_i6_proc_list_head(header);
}

/// I1: sum(current_ncpus) + idle_cpus == sum(initial_ncpus), over live rows.
fn check_i1_conservation(header: &Header) {
    let capacity = header.capacity as usize;
    let (sum_current, sum_initial) = header.processes()[..capacity]
        .iter()
        .filter(|r| !r.is_empty())
        .fold((0u64, 0u64), |(cur, init), r| {
            (cur + u64::from(r.current_ncpus), init + u64::from(r.initial_ncpus))
        });
    debug_assert_eq!(
        sum_current + u64::from(header.idle_cpus),
        sum_initial,
        "I1 violated: current totals + idle != initial totals"
    );
}

/// I2: idle_cpus > 0 implies the request queue is empty.
fn check_i2_idle_implies_empty_queue(header: &Header) {
    debug_assert!(
        header.idle_cpus == 0 || header.requests.is_empty(),
        "I2 violated: idle CPUs exist alongside a non-empty request queue"
    );
}

/// I3: a pid appears at most once in the request queue.
fn check_i3_unique_pids(header: &Header) {
    let mut pids: Vec<u32> = header.requests.iter().map(|e| e.pid).collect();
    let before = pids.len();
    pids.sort_unstable();
    pids.dedup();
    debug_assert_eq!(pids.len(), before, "I3 violated: duplicate pid in request queue");
}

/// I5: attached_nprocs equals the count of non-empty rows.
fn check_i5_attached_count(header: &Header) {
    let capacity = header.capacity as usize;
    let live = header.processes()[..capacity]
        .iter()
        .filter(|r| !r.is_empty())
        .count();
    debug_assert_eq!(
        header.attached_nprocs as usize, live,
        "I5 violated: attached_nprocs does not match live row count"
    );
}

/// I6: proc_list_head <= capacity and every row at or beyond it is empty.
fn check_i6_proc_list_head(header: &Header) {
    let capacity = header.capacity as usize;
    debug_assert!(
        header.proc_list_head as usize <= capacity,
        "I6 violated: proc_list_head beyond capacity"
    );
    debug_assert!(
        header.processes()[header.proc_list_head as usize..capacity]
            .iter()
            .all(cpulend_shmem::ProcessRow::is_empty),
        "I6 violated: a row at or beyond proc_list_head is occupied"
    );
}
