//! Per-process helper thread and mailbox for delivering "your new CPU
//! count is N" notifications.
//!
//! Each subscriber owns a dedicated thread draining a bounded
//! [`std::sync::mpsc::sync_channel`] and invoking a user callback. Posting
//! never blocks the poster (`SyncSender::try_send`); a full mailbox is
//! surfaced as [`NotifyError::MailboxFull`] so the caller can decide how
//! to react, per the documented "source aborts" policy.

use std::sync::{
    Arc,
    mpsc::{Receiver, SyncSender, TrySendError, sync_channel},
};

use cpulend_shmem::{MailboxRegistry, Pid};

/// Default mailbox capacity when a caller does not configure one.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// A message posted to another process's mailbox.
///
/// `EnableCpu`/`DisableCpu` are placeholders for the mask-based pinning
/// policy this crate does not implement; they exist so the mailbox's wire
/// type is stable even though only `SetNumCpus` currently does anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    SetNumCpus(u32),
    EnableCpu(u32),
    DisableCpu(u32),
}

/// Failures from posting to, or waiting on, a process's mailbox.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("target process is not subscribed")]
    NotSubscribed,
    #[error("target process's mailbox is full")]
    MailboxFull,
}

/// Internal transport: wraps `Message` plus the rendezvous sentinel used
/// by `wait_for_completion`. Riding the same channel as real messages is
/// what gives the sentinel FIFO-per-target ordering relative to them.
enum Envelope {
    Msg(Message),
    Ping(SyncSender<()>),
}

/// Shared registry of subscribers' mailbox senders.
///
/// One `Notifier` is shared (via `Clone`, cheaply — it is an `Arc`
/// wrapper) by every subsystem in a process that needs to post to, or
/// subscribe on behalf of, a pid.
#[derive(Clone)]
pub struct Notifier {
    registry: Arc<MailboxRegistry<Envelope>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MailboxRegistry::new()),
        }
    }

    /// Starts `pid`'s helper thread, subscribing it to its mailbox.
    ///
    /// `on_set_ncpus` is invoked on the helper thread for every
    /// `Message::SetNumCpus` addressed to `pid`; it must not block for
    /// long or take the shared-region lock itself, since posters may be
    /// waiting on `wait_for_completion` behind it.
    pub fn subscribe(
        &self,
        pid: Pid,
        capacity: usize,
        mut on_set_ncpus: impl FnMut(u32) + Send + 'static,
    ) -> Subscription {
        let (tx, rx): (SyncSender<Envelope>, Receiver<Envelope>) = sync_channel(capacity);
        self.registry.register(pid.get(), tx.clone());

        let helper = std::thread::Builder::new()
            .name(format!("cpulend-notify-{pid}"))
            .spawn(move || run_helper(&rx, &mut on_set_ncpus))
            .expect("failed to spawn notifier helper thread");

        Subscription {
            pid,
            registry: Arc::clone(&self.registry),
            sender: tx,
            helper: Some(helper),
        }
    }

    /// Posts `message` to `target`'s mailbox without blocking.
    ///
    /// # Errors
    ///
    /// [`NotifyError::NotSubscribed`] if `target` has no live subscription
    /// in this process; [`NotifyError::MailboxFull`] if its mailbox is at
    /// capacity.
    pub fn post(&self, target: Pid, message: Message) -> Result<(), NotifyError> {
        let sender = self
            .registry
            .sender_for(target.get())
            .ok_or(NotifyError::NotSubscribed)?;
        match sender.try_send(Envelope::Msg(message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(NotifyError::MailboxFull),
            Err(TrySendError::Disconnected(_)) => Err(NotifyError::NotSubscribed),
        }
    }

    /// Blocks until `target`'s mailbox has drained everything posted to
    /// it before this call, and its helper is idle again.
    ///
    /// Used by tests to synchronize with asynchronous delivery; not
    /// needed by production callers since posting is fire-and-forget.
    ///
    /// # Errors
    ///
    /// [`NotifyError::NotSubscribed`] if `target` has no live subscription.
    pub fn wait_for_completion(&self, target: Pid) -> Result<(), NotifyError> {
        let sender = self
            .registry
            .sender_for(target.get())
            .ok_or(NotifyError::NotSubscribed)?;
        let (ack_tx, ack_rx) = sync_channel(0);
        sender
            .send(Envelope::Ping(ack_tx))
            .map_err(|_| NotifyError::NotSubscribed)?;
        ack_rx.recv().map_err(|_| NotifyError::NotSubscribed)
    }
}

fn run_helper(rx: &Receiver<Envelope>, on_set_ncpus: &mut (impl FnMut(u32) + Send)) {
    for envelope in rx {
        match envelope {
            Envelope::Msg(Message::SetNumCpus(n)) => on_set_ncpus(n),
            Envelope::Msg(Message::EnableCpu(_) | Message::DisableCpu(_)) => {}
            Envelope::Ping(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// A live subscription: the helper thread and its registry entry.
///
/// Dropping this without calling [`Self::finalize`] still shuts the
/// helper thread down (closing the channel unblocks its `for` loop) but
/// skips the documented drain-before-detach step; `finalize` is the
/// lifecycle-correct teardown path and should always be preferred.
pub struct Subscription {
    pid: Pid,
    registry: Arc<MailboxRegistry<Envelope>>,
    sender: SyncSender<Envelope>,
    helper: Option<std::thread::JoinHandle<()>>,
}

impl Subscription {
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Drains messages already addressed to this pid, unregisters it, and
    /// joins the helper thread.
    pub fn finalize(mut self) {
        let (ack_tx, ack_rx) = sync_channel(0);
        if self.sender.send(Envelope::Ping(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
        self.registry.unregister(self.pid.get());
        self.close_and_join();
    }

    fn close_and_join(&mut self) {
        let (dummy, _) = sync_channel(0);
        if let Some(helper) = self.helper.take() {
            self.sender = dummy;
            let _ = helper.join();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.helper.is_some() {
            self.registry.unregister(self.pid.get());
            self.close_and_join();
        }
    }
}
