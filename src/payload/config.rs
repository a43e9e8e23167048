//! SSH settings for payload deployment, loaded via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use super::error::PayloadError;
use super::util::resolve_home;
use crate::retry::RetryPolicy;

/// Default directory that receives uploaded payloads.
pub const DEFAULT_REMOTE_DIR: &str = "/opt/provisio";

/// SSH and retry settings used by [`super::PayloadDeployer`].
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PROVISIO_PAYLOAD",
    discovery(
        app_name = "provisio",
        env_var = "PROVISIO_CONFIG_PATH",
        config_file_name = "provisio.toml",
        dotfile_name = ".provisio.toml",
        project_file_name = "provisio.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "user-facing SSH toggles are naturally expressed as booleans"
)]
pub struct PayloadConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Remote SSH port.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Directory that receives uploaded payloads.
    #[ortho_config(default = DEFAULT_REMOTE_DIR.to_owned())]
    pub remote_dir: String,
    /// Whether to force batch mode so SSH never prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; fresh servers have unknown keys.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Private key used for every instance. Supports `~/` expansion.
    pub ssh_identity_file: Option<String>,
    /// Directory of private keys named after the registered key names. Takes
    /// precedence over `ssh_identity_file`.
    pub ssh_identity_dir: Option<String>,
    /// SSH `ConnectTimeout` in seconds.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Attempts for copy and connection failures, including the first.
    #[ortho_config(default = 3)]
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on each further retry.
    #[ortho_config(default = 2000)]
    pub retry_base_delay_ms: u64,
    /// Deadline for a single `ssh` or `scp` invocation.
    #[ortho_config(default = 600)]
    pub command_timeout_secs: u64,
}

impl PayloadConfig {
    /// Built-in defaults, matching what the loader applies when no other
    /// source sets a value.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            ssh_bin: "ssh".to_owned(),
            scp_bin: "scp".to_owned(),
            ssh_user: "root".to_owned(),
            ssh_port: 22,
            remote_dir: DEFAULT_REMOTE_DIR.to_owned(),
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: "/dev/null".to_owned(),
            ssh_identity_file: None,
            ssh_identity_dir: None,
            connect_timeout_secs: 10,
            max_attempts: 3,
            retry_base_delay_ms: 2000,
            command_timeout_secs: 600,
        }
    }

    /// Loads configuration from defaults, files and environment without
    /// parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidConfig`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, PayloadError> {
        Self::load_from_iter([std::ffi::OsString::from("provisio")]).map_err(|err| {
            PayloadError::InvalidConfig {
                field: err.to_string(),
            }
        })
    }

    /// Ensures binaries, user and directory are present after trimming, and
    /// that optional key locations are not blank.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), PayloadError> {
        for (value, field) in [
            (Some(self.ssh_bin.as_str()), "ssh_bin"),
            (Some(self.scp_bin.as_str()), "scp_bin"),
            (Some(self.ssh_user.as_str()), "ssh_user"),
            (Some(self.remote_dir.as_str()), "remote_dir"),
            (self.ssh_identity_file.as_deref(), "ssh_identity_file"),
            (self.ssh_identity_dir.as_deref(), "ssh_identity_dir"),
        ] {
            if value.is_some_and(|text| text.trim().is_empty()) {
                return Err(PayloadError::InvalidConfig {
                    field: field.to_owned(),
                });
            }
        }
        if !self.remote_dir.starts_with('/') {
            return Err(PayloadError::InvalidConfig {
                field: "remote_dir".to_owned(),
            });
        }
        if self.ssh_port == 0 {
            return Err(PayloadError::InvalidConfig {
                field: "ssh_port".to_owned(),
            });
        }
        Ok(())
    }

    /// Retry policy for copy and connection failures.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_secs(60),
            call_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }

    /// Private key for `ssh_key_name`: a file of that name under the
    /// identity directory, else the shared identity file.
    #[must_use]
    pub fn identity_for(&self, ssh_key_name: &str) -> Option<String> {
        if let Some(dir) = self.ssh_identity_dir.as_deref() {
            return Some(resolve_home(dir).join(ssh_key_name).into_string());
        }
        self.ssh_identity_file
            .as_deref()
            .map(|file| resolve_home(file).into_string())
    }
}
