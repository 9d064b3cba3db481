//! A node's shared coordination resources: the attached region and the
//! notifier every subprocess on it posts through.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use cpulend_notify::Notifier;
use cpulend_once::OnceHandle;
use cpulend_shmem::{Pid, SharedRegion};

use crate::{Config, Error, Subprocess, subprocess::Dispatch};

/// One process-wide slot per distinct `shm-key`, so that two [`Node::attach`]
/// calls for the same key within a process share a single [`SharedRegion`]
/// mapping instead of each mapping it independently. Mirrors the teacher's
/// own `static X: OnceLock<Mutex<T>>` pattern for a lazily-created,
/// process-wide singleton, generalized to a registry because a process may
/// legitimately coordinate on more than one node.
static REGIONS: OnceLock<Mutex<HashMap<String, Arc<OnceHandle<SharedRegion>>>>> = OnceLock::new();

fn once_handle_for(shm_key: &str) -> Arc<OnceHandle<SharedRegion>> {
    let registry = REGIONS.get_or_init(|| Mutex::new(HashMap::new()));
    registry
        .lock()
        .expect("shared-region registry mutex poisoned")
        .entry(shm_key.to_owned())
        .or_insert_with(|| Arc::new(OnceHandle::new()))
        .clone()
}

/// A process's handle to one node's shared coordination state.
///
/// Cheap to keep around for the process's whole lifetime: [`Node::attach`]
/// is the only call that maps the region, and [`Node::share`]/[`Node::detach`]
/// bump and drop a local refcount around that single mapping, same as the
/// `cpulend_once::OnceHandle` it is built on.
pub struct Node {
    region: Arc<SharedRegion>,
    once: Arc<OnceHandle<SharedRegion>>,
    notifier: Notifier,
    config: Config,
}

impl Node {
    /// Attaches to (creating if necessary) the shared region named by
    /// `config.shm_key`, reusing an already-attached mapping from this
    /// same process if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shmem`] if the underlying region cannot be opened
    /// or mapped.
    #[tracing::instrument(skip(config), fields(shm_key = config.shm_key()))]
    pub fn attach(config: Config) -> Result<Self, Error> {
        let once = once_handle_for(&config.shm_key);
        let key = config.shm_key.clone();
        let multiplier = config.shm_size_multiplier;
        let region = once.acquire(|| SharedRegion::attach(&key, multiplier))?;
        Ok(Self {
            region,
            once,
            notifier: Notifier::new(),
            config,
        })
    }

    /// Produces a second, independent handle to the same node, bumping the
    /// local refcount so neither handle's [`Node::detach`] tears the region
    /// down while the other is still live.
    #[must_use]
    pub fn share(&self) -> Self {
        let region = self
            .once
            .acquire::<_, ()>(|| unreachable!("a live Node already holds this region attached"))
            .expect("init closure is never invoked while this Node's handle is live");
        Self {
            region,
            once: Arc::clone(&self.once),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers `pid` with `initial_ncpus` and returns its subprocess
    /// handle, starting a notifier helper thread unless `config.mode` is
    /// [`crate::Mode::Polling`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] (typically [`cpulend_core::CoreError::NotPermitted`]
    /// if `pid` is already registered, or [`cpulend_core::CoreError::Capacity`]
    /// if the node's process table is full).
    #[tracing::instrument(skip(self, on_set_ncpus), fields(pid = pid.get()))]
    pub fn init(
        &self,
        pid: Pid,
        initial_ncpus: u32,
        on_set_ncpus: impl FnMut(u32) + Send + 'static,
    ) -> Result<Subprocess, Error> {
        cpulend_core::register(&self.region, pid, initial_ncpus)?;
        let dispatch = match self.config.mode {
            crate::Mode::Async => Dispatch::Async(self.notifier.subscribe(
                pid,
                self.config.mailbox_capacity,
                on_set_ncpus,
            )),
            crate::Mode::Polling => Dispatch::Polling,
        };
        Ok(Subprocess::new(
            pid,
            Arc::clone(&self.region),
            self.notifier.clone(),
            dispatch,
            self.config.lewi_keep_cpu_on_blocking_call,
        ))
    }

    /// Releases this handle, unlinking the underlying shared-memory object
    /// once every handle sharing it (via [`Node::share`]) in this process
    /// has also detached.
    ///
    /// Callers should [`Subprocess::finalize`] every subprocess attached
    /// through this node before detaching it: the node's own `Arc` clone
    /// of the region is dropped here, but a `Subprocess` still holding one
    /// keeps the underlying region alive (and the unlink skipped) until it
    /// too is dropped, per [`cpulend_once::OnceHandle::release`]'s
    /// last-clone-wins contract.
    pub fn detach(self) {
        let Self { region, once, .. } = self;
        drop(region);
        once.release(|region| {
            if let Err(err) = region.unlink() {
                tracing::warn!(error = %err, "failed to unlink shared region on last detach");
            }
        });
    }
}
