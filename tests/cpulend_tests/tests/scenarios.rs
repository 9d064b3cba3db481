//! Integration tests for the worked scenarios, driven through the public
//! `cpulend` facade (and, for the queue-capacity scenario, `cpulend_core`
//! directly against a shared `cpulend_shmem::SharedRegion`). Co-located
//! processes are simulated as distinct `Pid`s sharing one region, the
//! way the facade's own in-process tests do.

use cpulend::{Config, MAX_REQUEST, Mode, Node, Outcome, Pid};

fn unique_key(tag: &str) -> String {
    format!("scenario-{tag}-{}-{:?}", std::process::id(), std::thread::current().id())
}

fn pid(raw: u32) -> Pid {
    Pid::new(raw).unwrap()
}

/// Single process round-trips an acquire that can't be satisfied yet, a
/// lend that fulfils it, and a reclaim that gets it back — with nothing
/// ever dispatched to another process.
#[test]
fn s1_single_process_acquire_lend_reclaim_round_trip() {
    let node = Node::attach(Config::builder().shm_key(unique_key("s1")).build()).unwrap();
    let sp = node.init(pid(1), 4, |_| panic!("single process never receives a fulfilment")).unwrap();

    let pending = sp.acquire_cpus(1).unwrap();
    assert!(matches!(pending, Outcome::Noted { granted: 0, queued: 1 }));
    assert_eq!(sp.current_ncpus().unwrap(), 4);

    let after_lend = sp.lend_cpus(1).unwrap();
    assert_eq!(after_lend, 3);

    let outcome = sp.reclaim().unwrap();
    assert!(matches!(outcome, Outcome::Success { new_total: 4 }));
    assert_eq!(sp.current_ncpus().unwrap(), 4);

    sp.finalize().unwrap();
    node.detach();
}

/// Two processes ping-ponging a single CPU: P2 lends, P1 acquires what P2
/// lent, P2 reclaims it back, all satisfied without ever touching idle
/// beyond the one CPU in flight.
#[test]
fn s2_two_process_ping_pong() {
    let node = Node::attach(Config::builder().shm_key(unique_key("s2")).build()).unwrap();
    let p1 = node.init(pid(1), 4, |_| {}).unwrap();
    let peer_node = node.share();
    let p2 = peer_node.init(pid(2), 4, |_| {}).unwrap();

    let after_lend = p2.lend_cpus(1).unwrap();
    assert_eq!(after_lend, 3);

    let acquired = p1.acquire_cpus(1).unwrap();
    assert!(matches!(acquired, Outcome::Success { new_total: 5 }));

    let reclaimed = p2.reclaim().unwrap();
    assert!(matches!(reclaimed, Outcome::Success { new_total: 4 }));
    assert_eq!(p1.current_ncpus().unwrap(), 4);

    p1.finalize().unwrap();
    p2.finalize().unwrap();
    peer_node.detach();
    node.detach();
}

/// Four processes, initial share 16 each. P3 lends all 16; P1 and P2 take
/// it from idle, P4 gets partly queued. P3's own acquire then steals back
/// from all three surplus holders, smallest surplus first, so the one
/// holding the most surplus (P2) gives up the most.
#[test]
fn s3_four_process_partial_reclaim_with_ordered_fulfilments() {
    let node = Node::attach(Config::builder().shm_key(unique_key("s3")).build()).unwrap();
    let p1 = node.init(pid(1), 16, |_| {}).unwrap();
    let n2 = node.share();
    let p2 = n2.init(pid(2), 16, |_| {}).unwrap();
    let n3 = node.share();
    let p3 = n3.init(pid(3), 16, |_| {}).unwrap();
    let n4 = node.share();
    let p4 = n4.init(pid(4), 16, |_| {}).unwrap();

    p3.lend_cpus(16).unwrap();

    let r1 = p1.acquire_cpus(3).unwrap();
    assert!(matches!(r1, Outcome::Success { new_total: 19 }));

    let r2 = p2.acquire_cpus(8).unwrap();
    assert!(matches!(r2, Outcome::Success { new_total: 24 }));

    let r4 = p4.acquire_cpus(20).unwrap();
    assert!(matches!(r4, Outcome::Noted { granted: 5, queued: 15 }));

    let r3 = p3.acquire_cpus(4).unwrap();
    assert!(matches!(r3, Outcome::Success { new_total: 4 }));

    assert_eq!(p1.current_ncpus().unwrap(), 18);
    assert_eq!(p4.current_ncpus().unwrap(), 20);
    assert_eq!(p2.current_ncpus().unwrap(), 22);

    p1.finalize().unwrap();
    p2.finalize().unwrap();
    p3.finalize().unwrap();
    p4.finalize().unwrap();
    n2.detach();
    n3.detach();
    n4.detach();
    node.detach();
}

/// Finalize with an outstanding acquisition still in effect: P2 lent 1 to
/// P1, never reclaimed. P2's finalize runs a reclaim-as-victim on its way
/// out and takes its CPU back from whoever is holding the surplus (P1).
#[test]
fn s4_finalize_reclaims_an_outstanding_acquisition() {
    let node = Node::attach(Config::builder().shm_key(unique_key("s4")).build()).unwrap();
    let p1 = node.init(pid(1), 2, |_| {}).unwrap();
    let peer_node = node.share();
    let p2 = peer_node.init(pid(2), 2, |_| {}).unwrap();

    p2.lend_cpus(1).unwrap();
    let acquired = p1.acquire_cpus(1).unwrap();
    assert!(matches!(acquired, Outcome::Success { new_total: 3 }));

    p2.finalize().unwrap();
    assert_eq!(p1.current_ncpus().unwrap(), 2);

    p1.finalize().unwrap();
    peer_node.detach();
    node.detach();
}

/// Insatiable greed: every process asks for `MAX_REQUEST` and gets
/// queued, not granted, since nobody is below their initial share yet.
/// When one of them blocks (lending everything it holds), the queued
/// requests absorb the redistribution; when it comes back, it takes the
/// surplus back from the other three and they settle at exactly their
/// initial share again.
#[test]
fn s5_insatiable_greed_survives_a_blocking_call_round_trip() {
    let node = Node::attach(
        Config::builder()
            .shm_key(unique_key("s5"))
            .lewi_keep_cpu_on_blocking_call(false)
            .build(),
    )
    .unwrap();
    let p1 = node.init(pid(1), 16, |_| {}).unwrap();
    let n2 = node.share();
    let p2 = n2.init(pid(2), 16, |_| {}).unwrap();
    let n3 = node.share();
    let p3 = n3.init(pid(3), 16, |_| {}).unwrap();
    let n4 = node.share();
    let p4 = n4.init(pid(4), 16, |_| {}).unwrap();

    for sp in [&p1, &p2, &p3, &p4] {
        let outcome = sp.acquire_cpus(MAX_REQUEST).unwrap();
        assert!(matches!(outcome, Outcome::Noted { granted: 0, .. }));
    }
    assert_eq!(p1.current_ncpus().unwrap(), 16);
    assert_eq!(p2.current_ncpus().unwrap(), 16);
    assert_eq!(p3.current_ncpus().unwrap(), 16);
    assert_eq!(p4.current_ncpus().unwrap(), 16);

    let kept = p1.into_blocking_call().unwrap();
    assert_eq!(kept, 0);
    assert_eq!(p1.current_ncpus().unwrap(), 0);

    let c2 = p2.current_ncpus().unwrap();
    let c3 = p3.current_ncpus().unwrap();
    let c4 = p4.current_ncpus().unwrap();
    assert_eq!(c2 + c3 + c4, 64);
    assert!(c2 > 16 && c3 > 16 && c4 > 16);

    let outcome = p1.out_of_blocking_call().unwrap();
    assert!(matches!(outcome, Outcome::Success { new_total: 16 }));
    assert_eq!(p2.current_ncpus().unwrap(), 16);
    assert_eq!(p3.current_ncpus().unwrap(), 16);
    assert_eq!(p4.current_ncpus().unwrap(), 16);

    p1.finalize().unwrap();
    p2.finalize().unwrap();
    p3.finalize().unwrap();
    p4.finalize().unwrap();
    n2.detach();
    n3.detach();
    n4.detach();
    node.detach();
}

/// The request queue is bounded at 256 distinct pids; the 257th distinct
/// acquire that can't be granted from idle is dropped rather than
/// accepted, and the call still returns cleanly instead of corrupting
/// the region's invariants.
#[test]
fn s6_request_queue_capacity_is_bounded() {
    let node = Node::attach(
        Config::builder()
            .shm_key(unique_key("s6"))
            .shm_size_multiplier(300)
            .mode(Mode::Polling)
            .build(),
    )
    .unwrap();

    let mut subs = Vec::with_capacity(257);
    let mut nodes = Vec::with_capacity(257);
    for i in 1..=257u32 {
        let n = node.share();
        let sp = n.init(pid(i), 1, |_| {}).unwrap();
        let outcome = sp.acquire_cpus(1).unwrap();
        assert!(matches!(outcome, Outcome::Noted { granted: 0, queued: 1 }));
        assert_eq!(sp.current_ncpus().unwrap(), 1);
        nodes.push(n);
        subs.push(sp);
    }

    for sp in subs {
        sp.finalize().unwrap();
    }
    for n in nodes {
        n.detach();
    }
    node.detach();
}
