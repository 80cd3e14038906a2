//! Broker configuration.
//!
//! Plain structs with `Default`, overridable from the environment through
//! [`BrokerConfig::from_env`]. Every field has a working default, so most
//! callers only ever write `BrokerConfig::default()`.

use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Maximum number of commands waiting for the worker.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// How long shutdown waits for the in-flight command.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Environment variable overriding [`BrokerConfig::queue_capacity`].
pub const ENV_QUEUE_CAPACITY: &str = "TXBROKER_QUEUE_CAPACITY";

/// Environment variable overriding [`BrokerConfig::shutdown_grace`], in milliseconds.
pub const ENV_SHUTDOWN_GRACE_MS: &str = "TXBROKER_SHUTDOWN_GRACE_MS";

/// Environment variable overriding [`BrokerConfig::bind_mode`] (`text` or `typed`).
pub const ENV_BIND_MODE: &str = "TXBROKER_BIND_MODE";

// =============================================================================
// Bind Mode
// =============================================================================

/// How JSON bind parameters reach the engine.
///
/// # Known Fidelity Loss
///
/// [`BindMode::Text`] converts every non-null scalar to its text form before
/// binding. SQLite's column affinity converts `'42'` back to an integer when it
/// is stored in or compared against an INTEGER column, which is what existing
/// script callers rely on. Values landing in untyped columns stay text.
/// [`BindMode::Typed`] binds numbers and booleans natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMode {
    #[default]
    Text,
    Typed,
}

impl BindMode {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(BindMode::Text),
            "typed" => Ok(BindMode::Typed),
            other => Err(Error::Config(format!(
                "{ENV_BIND_MODE} must be 'text' or 'typed', got '{other}'"
            ))),
        }
    }
}

// =============================================================================
// Callback Names
// =============================================================================

/// Function names used when formatting results for the script side.
///
/// The formatted result is a call expression, e.g.
/// `__txbStmtResult("g1",3,2,"{\"rowsAffected\":1}")`, which the transport
/// evaluates in the page that issued the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackNames {
    pub stmt: String,
    pub commit: String,
    pub rollback: String,
    pub init: String,
}

impl Default for CallbackNames {
    fn default() -> Self {
        Self {
            stmt: "__txbStmtResult".to_string(),
            commit: "__txbCommitResult".to_string(),
            rollback: "__txbRollbackResult".to_string(),
            init: "__txbInitResult".to_string(),
        }
    }
}

// =============================================================================
// Broker Configuration
// =============================================================================

/// Configuration for a [`Broker`](crate::Broker).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Pending commands accepted before `enqueue` fails with `QueueFull`.
    pub queue_capacity: usize,

    /// Time the in-flight command gets to finish during shutdown.
    pub shutdown_grace: Duration,

    /// How bind parameters are converted before binding.
    pub bind_mode: BindMode,

    /// Names of the script-side result functions.
    pub callback_names: CallbackNames,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            bind_mode: BindMode::default(),
            callback_names: CallbackNames::default(),
        }
    }
}

impl BrokerConfig {
    /// Builds a configuration from defaults plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a variable is set but unparseable, or if
    /// the result fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_QUEUE_CAPACITY) {
            config.queue_capacity = raw.trim().parse().map_err(|_| {
                Error::Config(format!("{ENV_QUEUE_CAPACITY} must be an integer, got '{raw}'"))
            })?;
        }

        if let Some(raw) = lookup(ENV_SHUTDOWN_GRACE_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "{ENV_SHUTDOWN_GRACE_MS} must be an integer, got '{raw}'"
                ))
            })?;
            config.shutdown_grace = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup(ENV_BIND_MODE) {
            config.bind_mode = BindMode::parse(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks invariants the broker relies on.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
