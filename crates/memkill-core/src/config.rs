//! Watchdog configuration.
//!
//! Process-wide settings loaded once at startup and immutable afterwards:
//! memory limits, watchdog pacing, the escalation signal sequence and the
//! per-worker-type allowance whitelist. Parsed from TOML with fail-closed
//! validation; unknown keys are rejected.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default soft RSS limit in kilobytes (2 GB).
pub const DEFAULT_SOFT_LIMIT_KB: u64 = 2_000_000;

/// Default hard RSS limit in kilobytes (3 GB).
pub const DEFAULT_HARD_LIMIT_KB: u64 = 3_000_000;

/// Default RSS sampling interval in seconds.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 3;

/// Default grace-balloon window in seconds: how long a soft-limit breach is
/// tolerated before escalation.
pub const DEFAULT_GRACE_BALLOON_SECS: u64 = 300;

/// Default wait after the stop-intake signal, in seconds.
pub const DEFAULT_GRACE_TIME_SECS: u64 = 900;

/// Default wait after the graceful-shutdown signal, in seconds.
pub const DEFAULT_SHUTDOWN_WAIT_SECS: u64 = 30;

/// Default unconditional wait before the forced kill, in seconds
/// (the worker framework's own shutdown timeout plus two).
pub const DEFAULT_KILL_WAIT_SECS: u64 = 27;

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the TOML content.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize the configuration.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value failed validation.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level watchdog configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Memory limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Watchdog pacing.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Escalation signal sequence.
    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Whitelisted worker types and their declared allowance in kilobytes.
    /// Worker types absent from this table contribute no allowance.
    #[serde(default)]
    pub allowances: HashMap<String, u64>,
}

impl Config {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validates limit and pacing values, fail-closed.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.soft_limit_kb == 0 {
            return Err(ConfigError::Validation(
                "limits.soft_limit_kb must be greater than zero".to_owned(),
            ));
        }
        if self.limits.hard_limit_kb < self.limits.soft_limit_kb {
            return Err(ConfigError::Validation(
                "limits.hard_limit_kb must not be below limits.soft_limit_kb".to_owned(),
            ));
        }
        if self.watchdog.check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "watchdog.check_interval_secs must be greater than zero".to_owned(),
            ));
        }
        for (field, value) in [
            ("escalation.stop_signal", &self.escalation.stop_signal),
            ("escalation.term_signal", &self.escalation.term_signal),
            ("escalation.kill_signal", &self.escalation.kill_signal),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }
}

/// Resident-memory limits in kilobytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Soft limit: breaches are tolerated for the grace-balloon window.
    #[serde(default = "default_soft_limit_kb")]
    pub soft_limit_kb: u64,

    /// Hard limit: breaches escalate immediately. Not adjusted by job
    /// allowances.
    #[serde(default = "default_hard_limit_kb")]
    pub hard_limit_kb: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            soft_limit_kb: default_soft_limit_kb(),
            hard_limit_kb: default_hard_limit_kb(),
        }
    }
}

/// Watchdog pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchdogConfig {
    /// Seconds between RSS samples.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Seconds a soft-limit breach may persist before escalation.
    #[serde(default = "default_grace_balloon_secs")]
    pub grace_balloon_secs: u64,
}

impl WatchdogConfig {
    /// Sampling interval as a [`Duration`].
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Grace-balloon window as a [`Duration`].
    #[must_use]
    pub const fn grace_balloon(&self) -> Duration {
        Duration::from_secs(self.grace_balloon_secs)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            grace_balloon_secs: default_grace_balloon_secs(),
        }
    }
}

/// Escalation signal sequence.
///
/// Signal names use the conventional `SIG*` spelling and are resolved when
/// the daemon builds its escalation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationConfig {
    /// Seconds to wait for drain after the stop-intake signal.
    #[serde(default = "default_grace_time_secs")]
    pub grace_time_secs: u64,

    /// Seconds to wait for drain after the graceful-shutdown signal.
    #[serde(default = "default_shutdown_wait_secs")]
    pub shutdown_wait_secs: u64,

    /// Seconds to wait, unconditionally, before the forced kill.
    #[serde(default = "default_kill_wait_secs")]
    pub kill_wait_secs: u64,

    /// Signal telling the process to stop accepting new work.
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Signal requesting graceful termination.
    #[serde(default = "default_term_signal")]
    pub term_signal: String,

    /// Signal delivered to the process group as the forced kill.
    #[serde(default = "default_kill_signal")]
    pub kill_signal: String,
}

impl EscalationConfig {
    /// Stop-intake drain window as a [`Duration`].
    #[must_use]
    pub const fn grace_time(&self) -> Duration {
        Duration::from_secs(self.grace_time_secs)
    }

    /// Graceful-shutdown drain window as a [`Duration`].
    #[must_use]
    pub const fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }

    /// Forced-kill wait as a [`Duration`].
    #[must_use]
    pub const fn kill_wait(&self) -> Duration {
        Duration::from_secs(self.kill_wait_secs)
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            grace_time_secs: default_grace_time_secs(),
            shutdown_wait_secs: default_shutdown_wait_secs(),
            kill_wait_secs: default_kill_wait_secs(),
            stop_signal: default_stop_signal(),
            term_signal: default_term_signal(),
            kill_signal: default_kill_signal(),
        }
    }
}

fn default_soft_limit_kb() -> u64 {
    DEFAULT_SOFT_LIMIT_KB
}

fn default_hard_limit_kb() -> u64 {
    DEFAULT_HARD_LIMIT_KB
}

fn default_check_interval_secs() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECS
}

fn default_grace_balloon_secs() -> u64 {
    DEFAULT_GRACE_BALLOON_SECS
}

fn default_grace_time_secs() -> u64 {
    DEFAULT_GRACE_TIME_SECS
}

fn default_shutdown_wait_secs() -> u64 {
    DEFAULT_SHUTDOWN_WAIT_SECS
}

fn default_kill_wait_secs() -> u64 {
    DEFAULT_KILL_WAIT_SECS
}

fn default_stop_signal() -> String {
    "SIGTSTP".to_owned()
}

fn default_term_signal() -> String {
    "SIGTERM".to_owned()
}

fn default_kill_signal() -> String {
    "SIGKILL".to_owned()
}
