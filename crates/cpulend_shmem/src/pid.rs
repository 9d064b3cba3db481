use std::{fmt, num::NonZeroU32};

/// A process id, guaranteed non-zero.
///
/// Zero is reserved as the "empty slot" sentinel in [`crate::layout::ProcessRow`]
/// and in [`cpulend_queue::Entry`]; keeping it out of this type means a slot's
/// emptiness can be checked with a plain field comparison without risking a
/// live pid being mistaken for one, mirroring the teacher's `BlockNo`/`InodeNo`
/// newtypes around raw on-disk indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(NonZeroU32);

impl Pid {
    /// Wraps a raw pid, returning `None` if it is zero.
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// The current process's pid.
    #[must_use]
    pub fn current() -> Self {
        #[allow(clippy::cast_sign_loss)]
        let raw = std::process::id();
        Self::new(raw).expect("operating system pid is never 0")
    }

    /// Returns the raw `u32` value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Pid> for u32 {
    fn from(pid: Pid) -> Self {
        pid.get()
    }
}
