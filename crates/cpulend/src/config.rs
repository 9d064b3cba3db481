//! Node-wide configuration: how to find the shared region, how a
//! subprocess should be notified of CPU changes, and the blocking-call
//! policy.
//!
//! Loadable two ways, per spec.md §6's configuration table: built up by
//! hand with [`Config::builder`], or read from `CPULEND_*` environment
//! variables with [`Config::from_env`]. There is no environment-parsing
//! crate in this workspace, so `from_env` does the same small amount of
//! `std::env::var` plus `str::parse` work a hand-rolled `envy` substitute
//! would.

use std::{env, num::ParseIntError, str::FromStr};

/// Default shared-memory key suffix used when none is configured.
pub const DEFAULT_SHM_KEY: &str = "default";

/// Default `shm-size-multiplier`: one process row per system CPU.
pub const DEFAULT_SHM_SIZE_MULTIPLIER: u32 = 1;

/// Default mailbox capacity for an [`Mode::Async`] subscription.
pub const DEFAULT_MAILBOX_CAPACITY: usize = cpulend_notify::DEFAULT_MAILBOX_CAPACITY;

/// Whether a subprocess is notified of CPU changes by a helper thread, or
/// expected to poll [`crate::Subprocess::current_ncpus`] itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// A helper thread drains a mailbox and invokes the registered
    /// callback, per [`cpulend_notify`].
    #[default]
    Async,
    /// No helper thread is started; the caller polls for its current
    /// count instead.
    Polling,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "async" => Ok(Self::Async),
            "polling" => Ok(Self::Polling),
            other => Err(ConfigError::InvalidMode(other.to_owned())),
        }
    }
}

/// Failures building a [`Config`] from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("CPULEND_MODE must be \"polling\" or \"async\", got {0:?}")]
    InvalidMode(String),
    #[error("{var} must be an integer: {source}")]
    InvalidInt {
        var: &'static str,
        #[source]
        source: ParseIntError,
    },
}

/// Node-wide configuration, shared by every subprocess attached through
/// the same [`crate::Node`].
///
/// Mirrors spec.md §6's configuration table one-for-one: `shm-key` and
/// `shm-size-multiplier` govern which shared region is attached and at
/// what capacity, `mode` selects [`Mode::Polling`] vs [`Mode::Async`]
/// dispatch, and `lewi_keep_cpu_on_blocking_call` is the lend-keep target
/// `IntoBlockingCall` uses. `verbose`/`verbose-fmt` are deliberately not
/// represented here: they are a `tracing_subscriber::EnvFilter` concern
/// for the caller's own binary, not this library (see module docs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub(crate) shm_key: String,
    pub(crate) shm_size_multiplier: u32,
    pub(crate) mode: Mode,
    pub(crate) lewi_keep_cpu_on_blocking_call: bool,
    pub(crate) mailbox_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shm_key: DEFAULT_SHM_KEY.to_owned(),
            shm_size_multiplier: DEFAULT_SHM_SIZE_MULTIPLIER,
            mode: Mode::default(),
            lewi_keep_cpu_on_blocking_call: false,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

impl Config {
    /// Starts a builder seeded with defaults.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reads configuration from `CPULEND_SHM_KEY`, `CPULEND_SHM_SIZE_MULTIPLIER`,
    /// `CPULEND_MODE`, `CPULEND_LEWI_KEEP_CPU_ON_BLOCKING_CALL`, and
    /// `CPULEND_MAILBOX_CAPACITY`. Any variable not set falls back to its
    /// default; an unset `shm-key` is unusual in production (attachers must
    /// agree on it) but harmless for a single-process test run.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a set variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        if let Ok(key) = env::var("CPULEND_SHM_KEY") {
            builder = builder.shm_key(key);
        }
        if let Some(v) = parse_env("CPULEND_SHM_SIZE_MULTIPLIER")? {
            builder = builder.shm_size_multiplier(v);
        }
        if let Ok(mode) = env::var("CPULEND_MODE") {
            builder = builder.mode(mode.parse()?);
        }
        if let Some(v) = parse_env::<u8>("CPULEND_LEWI_KEEP_CPU_ON_BLOCKING_CALL")? {
            builder = builder.lewi_keep_cpu_on_blocking_call(v != 0);
        }
        if let Some(v) = parse_env("CPULEND_MAILBOX_CAPACITY")? {
            builder = builder.mailbox_capacity(v);
        }
        Ok(builder.build())
    }

    #[must_use]
    pub fn shm_key(&self) -> &str {
        &self.shm_key
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }
}

fn parse_env<T: FromStr<Err = ParseIntError>>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|source| ConfigError::InvalidInt { var, source }),
        Err(_) => Ok(None),
    }
}

/// Builder for [`Config`]; every setter takes `self` by value so calls
/// chain, following the teacher's own builder idiom.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    #[must_use]
    pub fn shm_key(mut self, key: impl Into<String>) -> Self {
        self.config.shm_key = key.into();
        self
    }

    #[must_use]
    pub fn shm_size_multiplier(mut self, multiplier: u32) -> Self {
        self.config.shm_size_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    #[must_use]
    pub fn lewi_keep_cpu_on_blocking_call(mut self, keep: bool) -> Self {
        self.config.lewi_keep_cpu_on_blocking_call = keep;
        self
    }

    #[must_use]
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity;
        self
    }

    #[must_use]
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::builder()
            .shm_key("test")
            .mode(Mode::Polling)
            .lewi_keep_cpu_on_blocking_call(true)
            .mailbox_capacity(8)
            .build();
        assert_eq!(config.shm_key(), "test");
        assert_eq!(config.mode(), Mode::Polling);
        assert!(config.lewi_keep_cpu_on_blocking_call);
        assert_eq!(config.mailbox_capacity, 8);
    }

    #[test]
    fn mode_parses_known_strings_only() {
        assert_eq!("async".parse::<Mode>().unwrap(), Mode::Async);
        assert_eq!("polling".parse::<Mode>().unwrap(), Mode::Polling);
        assert!(matches!("both".parse::<Mode>(), Err(ConfigError::InvalidMode(_))));
    }
}
