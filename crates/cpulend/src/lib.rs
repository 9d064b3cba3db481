//! Node-local dynamic CPU balancer: the public facade over [`cpulend_core`]'s
//! coordinator state machine, [`cpulend_shmem`]'s shared region, and
//! [`cpulend_notify`]'s async mailboxes.
//!
//! A process attaches to a node with [`Node::attach`], registers itself
//! with [`Node::init`] to get back a [`Subprocess`], and drives the usual
//! lend/reclaim/acquire/borrow lifecycle through that handle. This crate
//! has no notion of CPU masks, MPI, or a profiler: it is the counting
//! policy alone, per spec.md's stated scope.

mod config;
mod error;
mod node;
mod subprocess;

pub use config::{Config, ConfigBuilder, ConfigError, Mode};
pub use cpulend_core::{DELETE_REQUESTS, MAX_REQUEST, Fulfilment, Outcome};
pub use cpulend_shmem::Pid;
pub use error::Error;
pub use node::Node;
pub use subprocess::Subprocess;

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use proptest::prelude::*;

    use super::*;

    fn unique_key(tag: &str) -> String {
        format!("facade-test-{tag}-{}-{:?}", std::process::id(), std::thread::current().id())
    }

    fn pid(raw: u32) -> Pid {
        Pid::new(raw).unwrap()
    }

    #[test]
    fn lend_then_reclaim_round_trips_through_the_facade() {
        let node = Node::attach(Config::builder().shm_key(unique_key("roundtrip")).build()).unwrap();
        let sp = node.init(pid(1), 4, |_| {}).unwrap();

        let after_lend = sp.lend_cpus(2).unwrap();
        assert_eq!(after_lend, 2);

        let outcome = sp.reclaim().unwrap();
        assert!(matches!(outcome, Outcome::Success { new_total: 4 }));
        assert_eq!(sp.current_ncpus().unwrap(), 4);

        sp.finalize().unwrap();
        node.detach();
    }

    #[test]
    fn lend_fulfils_a_peer_waiting_on_acquire_via_the_notifier() {
        let node = Node::attach(Config::builder().shm_key(unique_key("notify")).build()).unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_for_cb = Arc::clone(&seen);

        let lender = node.init(pid(1), 4, |_| {}).unwrap();
        let peer_node = node.share();
        let peer = peer_node
            .init(pid(2), 0, move |n| seen_for_cb.store(n, Ordering::SeqCst))
            .unwrap();

        let pending = peer.acquire_cpus(2).unwrap();
        assert!(matches!(pending, Outcome::Noted { granted: 0, queued: 2 }));

        lender.lend_cpus(2).unwrap();

        // Poll briefly: the helper thread delivers asynchronously.
        for _ in 0..200 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        lender.finalize().unwrap();
        peer.finalize().unwrap();
        peer_node.detach();
        node.detach();
    }

    #[test]
    fn lend_fulfilling_a_polling_peer_does_not_report_a_notify_error() {
        // A polling-mode peer never subscribes to the notifier, so posting
        // to it always fails with `NotSubscribed` — that must not surface
        // as `Error::Notify` from the op that fulfilled it, or every op
        // near a polling peer would spuriously fail. The peer attaches
        // through its own `Node` handle (not `share`, which would inherit
        // the lender's `Mode::Async`) so it can pick `Mode::Polling` while
        // still joining the same shared region by `shm_key`.
        let key = unique_key("notify-polling");
        let node = Node::attach(Config::builder().shm_key(key.clone()).build()).unwrap();
        let lender = node.init(pid(1), 4, |_| {}).unwrap();
        let peer_node = Node::attach(Config::builder().shm_key(key).mode(Mode::Polling).build()).unwrap();
        let peer = peer_node
            .init(pid(2), 0, |_| panic!("polling mode must never invoke a callback"))
            .unwrap();

        let pending = peer.acquire_cpus(2).unwrap();
        assert!(matches!(pending, Outcome::Noted { granted: 0, queued: 2 }));

        let new_total = lender.lend_cpus(2).unwrap();
        assert_eq!(new_total, 2);
        assert_eq!(peer.current_ncpus().unwrap(), 2);

        lender.finalize().unwrap();
        peer.finalize().unwrap();
        peer_node.detach();
        node.detach();
    }

    #[test]
    fn into_blocking_call_lends_and_out_of_blocking_call_restores() {
        let node = Node::attach(
            Config::builder()
                .shm_key(unique_key("blocking"))
                .lewi_keep_cpu_on_blocking_call(false)
                .build(),
        )
        .unwrap();
        let sp = node.init(pid(1), 4, |_| {}).unwrap();

        let kept = sp.into_blocking_call().unwrap();
        assert_eq!(kept, 0);
        assert_eq!(sp.current_ncpus().unwrap(), 0);

        let outcome = sp.out_of_blocking_call().unwrap();
        assert!(matches!(outcome, Outcome::Success { new_total: 4 }));

        sp.finalize().unwrap();
        node.detach();
    }

    #[test]
    fn disable_then_enable_round_trips_an_acquired_excess() {
        let node = Node::attach(Config::builder().shm_key(unique_key("enable-disable")).build()).unwrap();
        let lender = node.init(pid(1), 4, |_| {}).unwrap();
        let peer_node = node.share();
        let sp = peer_node.init(pid(2), 4, |_| {}).unwrap();

        lender.lend_cpus(2).unwrap();
        let outcome = sp.acquire_cpus(2).unwrap();
        assert!(matches!(outcome, Outcome::Success { new_total: 6 }));

        sp.disable().unwrap();
        assert_eq!(sp.current_ncpus().unwrap(), 4);

        sp.enable().unwrap();
        assert_eq!(sp.current_ncpus().unwrap(), 6);

        sp.finalize().unwrap();
        lender.finalize().unwrap();
        peer_node.detach();
        node.detach();
    }

    #[test]
    fn polling_mode_never_spawns_a_helper_thread() {
        let node = Node::attach(
            Config::builder()
                .shm_key(unique_key("polling"))
                .mode(Mode::Polling)
                .build(),
        )
        .unwrap();
        let sp = node.init(pid(1), 2, |_| panic!("polling mode must never invoke a callback")).unwrap();
        assert_eq!(sp.current_ncpus().unwrap(), 2);
        sp.finalize().unwrap();
        node.detach();
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Lend(u32),
        Acquire(u32),
        Borrow(u32),
        Reclaim,
        Disable,
        Enable,
    }

    fn apply(sp: &Subprocess, op: Op) {
        let _ = match op {
            Op::Lend(n) => sp.lend_cpus(n).map(|_| ()),
            Op::Acquire(n) => sp.acquire_cpus(n).map(|_| ()),
            Op::Borrow(n) => sp.borrow_cpus(n).map(|_| ()),
            Op::Reclaim => sp.reclaim().map(|_| ()),
            Op::Disable => sp.disable(),
            Op::Enable => sp.enable(),
        };
    }

    proptest! {
        /// Arbitrary interleavings of every public per-subprocess
        /// operation across three processes never panic and never make
        /// `current_ncpus` fail to read back, regardless of whether any
        /// individual call succeeds.
        #[test]
        fn facade_survives_arbitrary_operation_sequences(
            ops in prop::collection::vec(
                (0u32..3, prop_oneof![
                    (0u32..6).prop_map(Op::Lend),
                    (0u32..6).prop_map(Op::Acquire),
                    (0u32..6).prop_map(Op::Borrow),
                    Just(Op::Reclaim),
                    Just(Op::Disable),
                    Just(Op::Enable),
                ]),
                0..40,
            )
        ) {
            let node = Node::attach(Config::builder().shm_key(unique_key("proptest-facade")).build()).unwrap();
            let sps: Vec<Subprocess> = (1..=3)
                .map(|i| node.init(pid(i), 4, |_| {}).unwrap())
                .collect();
            for (who, op) in ops {
                apply(&sps[who as usize], op);
            }
            for sp in sps {
                prop_assert!(sp.current_ncpus().is_ok());
                sp.finalize().unwrap();
            }
            node.detach();
        }
    }
}
