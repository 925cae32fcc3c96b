//! Runtime configuration.
//!
//! All knobs are plain values with sensible defaults. Loading from a JSON
//! file is a convenience for binaries; library users usually build the
//! struct directly.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime configuration for the session store and dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Idle time after which a session may be evicted.
    pub idle_threshold_secs: u64,
    /// Run an eviction sweep every N inbound events. `0` disables
    /// event-driven sweeps.
    pub sweep_every: u64,
    /// Callback tokens older than this are swept.
    pub callback_max_age_secs: u64,
    /// Drop events produced before the process started.
    pub drop_pre_start: bool,
    /// Prefix that marks a command.
    pub command_prefix: String,
    /// Serialize turns of the same conversation end to end.
    pub serialize_turns: bool,
    /// Refuse callback tokens presented from a conversation other than the
    /// one that subscribed them.
    pub verify_callback_owner: bool,
    /// Period of the background maintenance sweep.
    pub maintenance_interval_secs: u64,
    /// How long shutdown waits for in-flight turns.
    pub drain_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: 3600,
            sweep_every: 100,
            callback_max_age_secs: 86_400,
            drop_pre_start: true,
            command_prefix: "/".to_string(),
            serialize_turns: true,
            verify_callback_owner: false,
            maintenance_interval_secs: 300,
            drain_timeout_secs: 10,
        }
    }
}

/// Severity of a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueLevel {
    /// The configuration is unusable.
    Error,
    /// The configuration works but is probably not what was meant.
    Warning,
}

/// A problem found by [`RuntimeConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Severity.
    pub level: IssueLevel,
    /// Offending field.
    pub field: &'static str,
    /// Human-readable explanation.
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Error,
            field,
            message: message.into(),
        }
    }

    fn warning(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Warning,
            field,
            message: message.into(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&content)
    }

    /// Idle eviction threshold.
    #[must_use]
    pub const fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    /// Maximum callback token age.
    #[must_use]
    pub const fn callback_max_age(&self) -> Duration {
        Duration::from_secs(self.callback_max_age_secs)
    }

    /// Background maintenance period.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Shutdown drain timeout.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Check the configuration for problems.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.idle_threshold_secs == 0 {
            issues.push(ConfigIssue::error(
                "idle_threshold_secs",
                "must be greater than zero",
            ));
        }
        if self.command_prefix.is_empty() {
            issues.push(ConfigIssue::error("command_prefix", "must not be empty"));
        } else if self.command_prefix.chars().any(char::is_whitespace) {
            issues.push(ConfigIssue::error(
                "command_prefix",
                "must not contain whitespace",
            ));
        }
        if self.maintenance_interval_secs == 0 {
            issues.push(ConfigIssue::error(
                "maintenance_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.sweep_every == 0 {
            issues.push(ConfigIssue::warning(
                "sweep_every",
                "event-driven sweeps disabled; only maintenance will evict",
            ));
        }
        if self.callback_max_age_secs < self.idle_threshold_secs {
            issues.push(ConfigIssue::warning(
                "callback_max_age_secs",
                "buttons expire before their session goes idle",
            ));
        }

        issues
    }

    /// Fail on the first error-level issue.
    pub fn ensure_valid(&self) -> ConfigResult<()> {
        match self
            .validate()
            .into_iter()
            .find(|i| i.level == IssueLevel::Error)
        {
            Some(issue) => Err(ConfigError::invalid(format!(
                "{}: {}",
                issue.field, issue.message
            ))),
            None => Ok(()),
        }
    }
}
