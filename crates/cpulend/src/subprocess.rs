//! Per-subprocess state and the public per-subprocess operations of
//! spec.md §4.E, grounded in the real DLB policy's `lewi_async.c`.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use cpulend_core::{CoreError, DELETE_REQUESTS, Fulfilment, MAX_REQUEST, OpResult, Outcome};
use cpulend_notify::{Message, NotifyError, Notifier, Subscription};
use cpulend_shmem::{Pid, SharedRegion};

use crate::Error;

/// How a subprocess is told about CPU counts changed by other processes.
pub(crate) enum Dispatch {
    /// A helper thread (see [`cpulend_notify`]) invokes the registered
    /// callback whenever a peer's operation grants or restores CPUs here.
    Async(Subscription),
    /// No helper thread; the caller is expected to poll
    /// [`Subprocess::current_ncpus`] itself.
    Polling,
}

/// One registered process's handle to the node it joined via [`crate::Node::init`].
///
/// Owns a clone of the node's shared-region mapping and notifier, plus the
/// bookkeeping `lewi_async.c` keeps per subprocess: `prev_requested`, the
/// amount a `Lend`/`Reset` reported as still outstanding, merged back into
/// the next `Reclaim`/`Acquire`/`Enable`.
pub struct Subprocess {
    pid: Pid,
    region: Arc<SharedRegion>,
    notifier: Notifier,
    dispatch: Dispatch,
    lewi_keep_cpu_on_blocking_call: bool,
    prev_requested: AtomicU32,
}

impl Subprocess {
    pub(crate) fn new(
        pid: Pid,
        region: Arc<SharedRegion>,
        notifier: Notifier,
        dispatch: Dispatch,
        lewi_keep_cpu_on_blocking_call: bool,
    ) -> Self {
        Self {
            pid,
            region,
            notifier,
            dispatch,
            lewi_keep_cpu_on_blocking_call,
            prev_requested: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Reads this process's current CPU count directly from the shared
    /// region, without going through the notifier. The only way to learn
    /// it in [`crate::Mode::Polling`]; also safe to call in
    /// [`crate::Mode::Async`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shmem`] if the lock cannot be taken, or
    /// [`Error::Core`] if this pid's row is gone (e.g. already finalized).
    pub fn current_ncpus(&self) -> Result<u32, Error> {
        let found = self.region.critical_section(|h| {
            h.processes()
                .iter()
                .find(|row| row.pid == self.pid.get())
                .map(|row| row.current_ncpus)
        })?;
        found
            .ok_or(CoreError::NoProcess(self.pid.get()))
            .map_err(Error::from)
    }

    /// Posts every fulfilment to its target's mailbox.
    ///
    /// The shared-memory mutation behind each fulfilment has already
    /// committed by the time this runs; a failed post does not undo that,
    /// but it does mean the target never learns about it. Per
    /// `lewi_async.c`'s async-notify contract, a full mailbox is reported
    /// to the originating operation rather than swallowed: the first such
    /// error seen is returned after every fulfilment has been attempted,
    /// so one full mailbox does not stop the rest of the peers from being
    /// told. A target with no live subscription is not an error here: that
    /// is the normal, expected state of a [`crate::Mode::Polling`] peer,
    /// which never subscribes and is expected to read
    /// [`Subprocess::current_ncpus`] itself.
    fn deliver(&self, fulfilments: &[Fulfilment]) -> Result<(), Error> {
        let mut first_err = None;
        for f in fulfilments {
            match self.notifier.post(f.target, Message::SetNumCpus(f.new_total)) {
                Ok(()) => {}
                Err(NotifyError::NotSubscribed) => {
                    tracing::debug!(
                        target = f.target.get(),
                        new_total = f.new_total,
                        "fulfilled peer has no live subscription, likely polling mode",
                    );
                }
                Err(err @ NotifyError::MailboxFull) => {
                    tracing::error!(
                        target = f.target.get(),
                        new_total = f.new_total,
                        error = %err,
                        "failed to notify peer of its new CPU total",
                    );
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(Error::from(err)),
            None => Ok(()),
        }
    }

    /// Stores `prev_requested` only if it is nonzero, mirroring
    /// `lewi_async_Lend_keep_cpus`'s "the stored value is never reset to 0
    /// by a plain lend" rule: a lend that did not itself have anything
    /// outstanding must not clobber a value left by an earlier call.
    fn note_prev_requested(&self, prev_requested: u32) {
        if prev_requested > 0 {
            self.prev_requested.store(prev_requested, Ordering::SeqCst);
        }
    }

    /// Lends exactly one CPU below the current count, keeping the rest.
    /// Equivalent to `lend_cpus(1)` as far as this process's own count is
    /// concerned, but named separately (as `lewi_async_Lend` is) since it
    /// is the operation `IntoBlockingCall` is built from.
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn lend(&self) -> Result<u32, Error> {
        self.lend_keep_cpus(1)
    }

    fn lend_keep_cpus(&self, keep: u32) -> Result<u32, Error> {
        let OpResult { outcome, fulfilments } = cpulend_core::lend_keep(&self.region, self.pid, keep)?;
        let result = match outcome {
            Outcome::NoUpdate => self.current_ncpus()?,
            Outcome::Lent { new_total, prev_requested } => {
                self.note_prev_requested(prev_requested);
                new_total
            }
            other => unreachable!("lend_keep only returns NoUpdate or Lent, got {other:?}"),
        };
        self.deliver(&fulfilments)?;
        Ok(result)
    }

    /// Lends exactly `n` CPUs, queuing or fulfilling other processes'
    /// outstanding requests with what this frees up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] (`NotPermitted` if `n` exceeds this
    /// process's current count) or [`Error::Notify`] if a peer fulfilled
    /// by this lend could not be told (its row has already changed either
    /// way; the caller decides whether to retry the notify or abort).
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn lend_cpus(&self, n: u32) -> Result<u32, Error> {
        if n == 0 {
            return self.current_ncpus();
        }
        let OpResult { outcome, fulfilments } = cpulend_core::lend(&self.region, self.pid, n)?;
        let Outcome::Lent { new_total, prev_requested } = outcome else {
            unreachable!("lend always returns Lent, got {outcome:?}");
        };
        self.note_prev_requested(prev_requested);
        self.deliver(&fulfilments)?;
        Ok(new_total)
    }

    /// Restores this process's baseline allocation, consuming whatever
    /// `prev_requested` a prior `Lend`/`Reset` left outstanding.
    ///
    /// Corresponds to `lewi_async_Reclaim`/`OutOfBlockingCall`: the stored
    /// value is cleared to 0 once `cpulend_core::reclaim` has committed
    /// (whether or not it fully restores it; a shortfall is re-queued
    /// under this pid by that call itself, not by this wrapper). It is
    /// read, not swapped, beforehand: if the call below errors, the
    /// outstanding amount it would have consumed must still be there for
    /// a retried `reclaim`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`]/[`Error::Shmem`], or [`Error::Notify`] if
    /// a victim stolen from could not be told its new total.
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn reclaim(&self) -> Result<Outcome, Error> {
        let prev_requested = self.prev_requested.load(Ordering::SeqCst);
        let OpResult { outcome, fulfilments } = cpulend_core::reclaim(&self.region, self.pid, prev_requested)?;
        self.prev_requested.store(0, Ordering::SeqCst);
        self.deliver(&fulfilments)?;
        Ok(outcome)
    }

    /// Asks for every CPU this process could possibly use; unmet demand is
    /// queued. Equivalent to `acquire_cpus(MAX_REQUEST)`.
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn acquire(&self) -> Result<Outcome, Error> {
        self.acquire_cpus(MAX_REQUEST)
    }

    /// Asks for `n` more CPUs, merging in whatever `prev_requested` is
    /// still outstanding (unless `n` is one of the `MAX_REQUEST`/
    /// `DELETE_REQUESTS` sentinels, which `cpulend_core` handles itself).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`], or [`Error::Notify`] if a process stolen
    /// from to satisfy this acquire could not be told its new total.
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn acquire_cpus(&self, n: u32) -> Result<Outcome, Error> {
        if n == DELETE_REQUESTS {
            self.prev_requested.store(0, Ordering::SeqCst);
        }
        let merged = if n > 0 && n != MAX_REQUEST && n != DELETE_REQUESTS {
            n.saturating_add(self.prev_requested.swap(0, Ordering::SeqCst))
        } else {
            n
        };
        self.acquire_raw(merged)
    }

    fn acquire_raw(&self, n: u32) -> Result<Outcome, Error> {
        let OpResult { outcome, fulfilments } = cpulend_core::acquire(&self.region, self.pid, n)?;
        self.deliver(&fulfilments)?;
        Ok(outcome)
    }

    /// Takes whatever idle CPUs are available right now, up to `u32::MAX`,
    /// never queuing. Equivalent to `borrow_cpus(u32::MAX)`.
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn borrow(&self) -> Result<Outcome, Error> {
        self.borrow_cpus(u32::MAX)
    }

    /// Takes up to `n` idle CPUs, never queuing a shortfall.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`]. `borrow` never fulfils a queued peer (it
    /// only ever takes from idle), so [`Error::Notify`] cannot surface
    /// from here.
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn borrow_cpus(&self, n: u32) -> Result<Outcome, Error> {
        let OpResult { outcome, fulfilments } = cpulend_core::borrow(&self.region, self.pid, n)?;
        self.deliver(&fulfilments)?;
        Ok(outcome)
    }

    /// Re-acquires whatever this process asked for and never got, if
    /// anything is still outstanding. A `NOUPDT` from the underlying
    /// acquire is folded into success here, matching `lewi_async_Enable`'s
    /// "nothing to do" case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`], or [`Error::Notify`] if a process stolen
    /// from to satisfy the re-acquire could not be told its new total.
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn enable(&self) -> Result<(), Error> {
        let stored = self.prev_requested.swap(0, Ordering::SeqCst);
        if stored > 0 {
            self.acquire_raw(stored)?;
        }
        Ok(())
    }

    /// Gives back everything above this process's initial share. A
    /// `NOUPDT` (already at baseline) is folded into success, matching
    /// `lewi_async_Disable`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`], or [`Error::Notify`] if a queued peer
    /// fulfilled by this reset could not be told its new total.
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn disable(&self) -> Result<(), Error> {
        let OpResult { outcome, fulfilments } = cpulend_core::reset(&self.region, self.pid)?;
        if let Outcome::ResetDone { prev_requested, .. } = outcome {
            self.note_prev_requested(prev_requested);
        }
        self.deliver(&fulfilments)?;
        Ok(())
    }

    /// Called before a blocking call (e.g. MPI collective, I/O wait): lends
    /// this process's CPU(s) so a peer with pending work can use them
    /// while this one is blocked. Whether 0 or 1 CPU is kept is the
    /// `lewi-keep-cpu-on-blocking-call` configuration option.
    ///
    /// Unlike the original `lewi_async_IntoBlockingCall`, which swallows
    /// every error and always reports success, this propagates failures:
    /// a caller that cannot tell the two apart cannot react to e.g. a
    /// poisoned lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`]/[`Error::Shmem`], or [`Error::Notify`] if
    /// a peer fulfilled by the lend this performs could not be told.
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn into_blocking_call(&self) -> Result<u32, Error> {
        let keep = u32::from(self.lewi_keep_cpu_on_blocking_call);
        self.lend_keep_cpus(keep)
    }

    /// Called on return from a blocking call: reclaims whatever was lent
    /// away by the matching `into_blocking_call`. Equivalent to `reclaim`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`]/[`Error::Shmem`], or [`Error::Notify`] (see
    /// [`Subprocess::reclaim`]).
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn out_of_blocking_call(&self) -> Result<Outcome, Error> {
        self.reclaim()
    }

    /// Tears this process's row down and stops its notifier subscription,
    /// if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`]/[`Error::Shmem`], or [`Error::Notify`] if a
    /// victim reclaimed from on the way out could not be told its new
    /// total. The row is torn down either way; a `Notify` failure here
    /// only means the delivery, not the teardown, needs attention.
    #[tracing::instrument(skip(self), fields(pid = self.pid.get()))]
    pub fn finalize(self) -> Result<(), Error> {
        let OpResult { fulfilments, .. } =
            cpulend_core::finalize(&self.region, self.pid, cpulend_shmem::MAX_PROCESSES)?;
        self.deliver(&fulfilments)?;
        if let Dispatch::Async(sub) = self.dispatch {
            sub.finalize();
        }
        Ok(())
    }
}
