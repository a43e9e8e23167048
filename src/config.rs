//! Engine configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::lifecycle::LifecycleSettings;
use crate::retry::RetryPolicy;

/// Worker pool, fan-out and timing settings derived from defaults,
/// configuration files, environment variables and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PROVISIO",
    discovery(
        app_name = "provisio",
        env_var = "PROVISIO_CONFIG_PATH",
        config_file_name = "provisio.toml",
        dotfile_name = ".provisio.toml",
        project_file_name = "provisio.toml"
    )
)]
pub struct EngineConfig {
    /// Tasks processed concurrently.
    #[ortho_config(default = 4)]
    pub workers: usize,
    /// Accepted tasks waiting for a worker before submitters block.
    #[ortho_config(default = 256)]
    pub queue_capacity: usize,
    /// Instances of one task handled concurrently.
    #[ortho_config(default = 8)]
    pub max_fanout: usize,
    /// Deadline for a single provider call.
    #[ortho_config(default = 60)]
    pub call_timeout_secs: u64,
    /// Attempts for retryable provider calls, including the first.
    #[ortho_config(default = 3)]
    pub retry_attempts: u32,
    /// Delay before the first retry; doubled on each further retry.
    #[ortho_config(default = 1000)]
    pub retry_base_delay_ms: u64,
    /// Ceiling on a single retry delay.
    #[ortho_config(default = 30_000)]
    pub retry_max_delay_ms: u64,
    /// Interval between readiness polls.
    #[ortho_config(default = 5000)]
    pub poll_interval_ms: u64,
    /// How long a new server may take to become ready before it is torn
    /// down.
    #[ortho_config(default = 900)]
    pub ready_timeout_secs: u64,
}

impl EngineConfig {
    /// Built-in defaults, matching what the loader applies when no other
    /// source sets a value.
    #[must_use]
    pub const fn with_defaults() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            max_fanout: 8,
            call_timeout_secs: 60,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            poll_interval_ms: 5000,
            ready_timeout_secs: 900,
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
pub(crate) struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    pub(crate) const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in provisio.toml",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }

    pub(crate) fn require(&self, value: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(self.missing());
        }
        Ok(())
    }

    pub(crate) fn require_positive(&self, value: u64) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: set {} or {} in [{}]",
                self.description, self.env_var, self.toml_key, self.section
            )));
        }
        Ok(())
    }

    pub(crate) fn require_url(&self, value: &str) -> Result<(), ConfigError> {
        match Url::parse(value.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            Ok(_) | Err(_) => Err(ConfigError::Invalid(format!(
                "{} must be an http(s) URL: check {} or {} in [{}]",
                self.description, self.env_var, self.toml_key, self.section
            ))),
        }
    }
}

impl EngineConfig {
    /// Loads configuration using the default argument iterator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("provisio")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Rejects zero-sized pools and timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("worker count", "PROVISIO_WORKERS", "workers", widen(self.workers)),
            (
                "task queue capacity",
                "PROVISIO_QUEUE_CAPACITY",
                "queue_capacity",
                widen(self.queue_capacity),
            ),
            (
                "batch fan-out",
                "PROVISIO_MAX_FANOUT",
                "max_fanout",
                widen(self.max_fanout),
            ),
            (
                "provider call timeout",
                "PROVISIO_CALL_TIMEOUT_SECS",
                "call_timeout_secs",
                self.call_timeout_secs,
            ),
            (
                "retry attempts",
                "PROVISIO_RETRY_ATTEMPTS",
                "retry_attempts",
                u64::from(self.retry_attempts),
            ),
            (
                "readiness timeout",
                "PROVISIO_READY_TIMEOUT_SECS",
                "ready_timeout_secs",
                self.ready_timeout_secs,
            ),
        ];
        for (description, env_var, toml_key, value) in checks {
            FieldMetadata::new(description, env_var, toml_key, "engine").require_positive(value)?;
        }
        Ok(())
    }

    /// Retry policy for provider calls.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    /// Controller settings derived from this configuration.
    #[must_use]
    pub const fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            retry: self.retry_policy(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            max_fanout: self.max_fanout,
        }
    }
}

fn widen(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
