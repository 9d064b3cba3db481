//! Process-local side table of per-pid mailbox senders.
//!
//! Lives outside the mapped region: a `std::sync::mpsc::SyncSender` is not
//! `Pod` and has no business being reinterpreted from shared bytes — spec
//! mailboxes are process-local by design. Generic over the message type so
//! this crate does not need to know about `cpulend_notify::Message`.

use std::{collections::HashMap, sync::Mutex};

/// A pid-keyed table of outgoing mailbox senders, one per locally
/// subscribed peer process.
pub struct MailboxRegistry<T> {
    senders: Mutex<HashMap<u32, std::sync::mpsc::SyncSender<T>>>,
}

impl<T> Default for MailboxRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MailboxRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, pid: u32, sender: std::sync::mpsc::SyncSender<T>) {
        self.senders
            .lock()
            .expect("mailbox registry mutex poisoned")
            .insert(pid, sender);
    }

    pub fn unregister(&self, pid: u32) {
        self.senders
            .lock()
            .expect("mailbox registry mutex poisoned")
            .remove(&pid);
    }

    /// Returns a clone of `pid`'s sender, if locally registered.
    #[must_use]
    pub fn sender_for(&self, pid: u32) -> Option<std::sync::mpsc::SyncSender<T>> {
        self.senders
            .lock()
            .expect("mailbox registry mutex poisoned")
            .get(&pid)
            .cloned()
    }
}
