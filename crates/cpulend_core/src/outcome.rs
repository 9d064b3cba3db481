use cpulend_shmem::Pid;

/// The target of a request fulfilment, and its new CPU total.
///
/// Reported as a new total rather than a delta: both the producing
/// operation and the caller delivering it to the target's mailbox only
/// ever need to know "what should this process have now", which also
/// makes the value idempotent to re-deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fulfilment {
    pub target: Pid,
    pub new_total: u32,
}

/// The per-operation result, distinct from the [`Vec<Fulfilment>`] side
/// effects every operation may also produce for *other* processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation changed the caller's own `current_ncpus`.
    Success { new_total: u32 },

    /// Nothing changed: `n == 0`, a `Borrow` found no idle CPUs, a
    /// `LendKeep` target equal to the current total, or a `Reset` that
    /// was already at the initial count.
    NoUpdate,

    /// A `Lend`/`LendKeep` succeeded; `prev_requested` is what the caller
    /// should pass to a later `Reclaim` to restore its outstanding
    /// petitions.
    Lent { new_total: u32, prev_requested: u32 },

    /// A `Reset` changed something (lent excess, reclaimed a deficit, or
    /// simply dropped a stale queue entry); `prev_requested` mirrors
    /// `Lent`'s field and is meaningful to a caller about to `Finalize`
    /// (which ignores it) or a caller that wants to restore it later.
    ResetDone { new_total: u32, prev_requested: u32 },

    /// Part of an `Acquire` could not be granted immediately and was
    /// queued; `granted` is what was handed over now (0 if none),
    /// `queued` is the amount still outstanding in the request queue.
    Noted { granted: u32, queued: u32 },

    /// A process row was created (`Init`).
    Registered,

    /// A process row was torn down (`Finalize`).
    Finalized,
}

/// The full return of a coordinator operation: the caller's own outcome
/// plus whatever other processes must be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpResult {
    pub outcome: Outcome,
    pub fulfilments: Vec<Fulfilment>,
}

impl OpResult {
    pub(crate) fn new(outcome: Outcome, fulfilments: Vec<Fulfilment>) -> Self {
        Self {
            outcome,
            fulfilments,
        }
    }
}
