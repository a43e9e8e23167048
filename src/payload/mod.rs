//! Payload deployment over SSH: upload with `scp`, run with `ssh`.
//!
//! Copy and execution are separate calls so a caller that recorded a
//! successful copy never repeats it. Transport failures are retried with
//! backoff; the payload's own exit status is reported as-is.

use std::ffi::OsString;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use tracing::{debug, info};

use crate::model::{Instance, PayloadSpec};
use crate::retry::RetryPolicy;

mod config;
mod error;
mod runner;
mod util;

pub use config::{DEFAULT_REMOTE_DIR, PayloadConfig};
pub use error::PayloadError;
pub use runner::{CommandFuture, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use util::resolve_home;

/// Exit status the OpenSSH client uses for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// Where a payload goes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeployTarget {
    /// Instance the host belongs to, for diagnostics.
    pub instance_id: String,
    /// Public address.
    pub host: IpAddr,
    /// Registered key name used to pick the private key.
    pub ssh_key_name: String,
}

impl DeployTarget {
    /// Builds a target from a ready instance.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::MissingAddress`] when the instance has no
    /// parseable public address.
    pub fn for_instance(instance: &Instance) -> Result<Self, PayloadError> {
        let host = instance
            .public_ip
            .as_deref()
            .and_then(|ip| ip.parse().ok())
            .ok_or_else(|| PayloadError::MissingAddress {
                instance_id: instance.id.to_string(),
            })?;
        Ok(Self {
            instance_id: instance.id.to_string(),
            host,
            ssh_key_name: instance.ssh_key_name.clone(),
        })
    }

    fn scp_host(&self) -> String {
        match self.host {
            IpAddr::V4(addr) => addr.to_string(),
            IpAddr::V6(addr) => format!("[{addr}]"),
        }
    }
}

/// Copies payloads to instances and runs them.
#[derive(Clone)]
pub struct PayloadDeployer {
    config: PayloadConfig,
    runner: Arc<dyn CommandRunner>,
    retry: RetryPolicy,
}

impl fmt::Debug for PayloadDeployer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadDeployer")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl PayloadDeployer {
    /// Creates a deployer using `runner` for every command.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidConfig`] when validation fails.
    pub fn new(config: PayloadConfig, runner: Arc<dyn CommandRunner>) -> Result<Self, PayloadError> {
        config.validate()?;
        let retry = config.retry_policy();
        Ok(Self {
            config,
            runner,
            retry,
        })
    }

    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: PayloadConfig) -> Result<Self, PayloadError> {
        Self::new(config, Arc::new(ProcessCommandRunner))
    }

    /// Replaces the retry policy derived from configuration.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &PayloadConfig {
        &self.config
    }

    /// Remote location of `payload` under the configured directory.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::MissingSource`] when no file name can be
    /// derived from the source.
    pub fn remote_path(&self, payload: &PayloadSpec) -> Result<String, PayloadError> {
        let name = match payload.remote_name.as_deref() {
            Some(name) => name.trim().to_owned(),
            None => Utf8Path::new(payload.source.trim().trim_end_matches('/'))
                .file_name()
                .map(str::to_owned)
                .ok_or_else(|| PayloadError::MissingSource {
                    path: Utf8PathBuf::from(payload.source.as_str()),
                })?,
        };
        Ok(format!(
            "{}/{name}",
            self.config.remote_dir.trim_end_matches('/')
        ))
    }

    /// Uploads `payload` to `target` and returns the remote path.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::MissingSource`] for a missing local file, or
    /// the last transport error once retries are spent.
    pub async fn copy(
        &self,
        target: &DeployTarget,
        payload: &PayloadSpec,
    ) -> Result<String, PayloadError> {
        let source = resolve_home(payload.source.trim());
        if !source.exists() {
            return Err(PayloadError::MissingSource { path: source });
        }
        let remote = self.remote_path(payload)?;
        let recursive = source.is_dir();
        self.retry
            .run("payload copy", || {
                self.copy_once(target, &source, &remote, recursive)
            })
            .await?;
        info!(instance_id = %target.instance_id, %remote, "payload copied");
        Ok(remote)
    }

    /// Runs an uploaded payload on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::ExecutionFailed`] when the payload exits
    /// non-zero, or the last connection error once retries are spent.
    pub async fn execute(
        &self,
        target: &DeployTarget,
        payload: &PayloadSpec,
    ) -> Result<CommandOutput, PayloadError> {
        let remote = self.remote_path(payload)?;
        let command = self.execution_command(payload, &remote);
        let output = self
            .retry
            .run("payload execution", || self.execute_once(target, &command))
            .await?;
        info!(instance_id = %target.instance_id, "payload executed");
        Ok(output)
    }

    /// Deletes `remote_path` on `target`.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::UnsafePath`] for relative paths or the root,
    /// or the last transport error once retries are spent.
    pub async fn remove(&self, target: &DeployTarget, remote_path: &str) -> Result<(), PayloadError> {
        let trimmed = remote_path.trim().trim_end_matches('/');
        if trimmed.is_empty() || !trimmed.starts_with('/') {
            return Err(PayloadError::UnsafePath {
                path: remote_path.to_owned(),
            });
        }
        let command = format!("rm -rf -- {}", escape(trimmed.into()));
        self.retry
            .run("payload removal", || self.ssh_checked(target, &command))
            .await?;
        info!(instance_id = %target.instance_id, path = trimmed, "payload removed");
        Ok(())
    }

    async fn copy_once(
        &self,
        target: &DeployTarget,
        source: &Utf8Path,
        remote: &str,
        recursive: bool,
    ) -> Result<(), PayloadError> {
        let mkdir = format!(
            "mkdir -p {}",
            escape(self.config.remote_dir.as_str().into())
        );
        self.ssh_checked(target, &mkdir).await?;

        let args = self.scp_args(target, source, remote, recursive);
        debug!(instance_id = %target.instance_id, %source, remote, "uploading payload");
        let output = self.runner.run(&self.config.scp_bin, &args).await?;
        self.check(&self.config.scp_bin, target, output)
    }

    async fn execute_once(
        &self,
        target: &DeployTarget,
        command: &str,
    ) -> Result<CommandOutput, PayloadError> {
        let args = self.ssh_args(target, command);
        let output = self.runner.run(&self.config.ssh_bin, &args).await?;
        match output.code {
            Some(0) => Ok(output),
            Some(SSH_CLIENT_FAILURE) => Err(PayloadError::Connection {
                host: target.host.to_string(),
                stderr: output.stderr,
            }),
            Some(exit_code) => Err(PayloadError::ExecutionFailed {
                exit_code,
                stderr: output.stderr,
            }),
            None => Err(PayloadError::MissingExitCode {
                program: self.config.ssh_bin.clone(),
            }),
        }
    }

    async fn ssh_checked(&self, target: &DeployTarget, command: &str) -> Result<(), PayloadError> {
        let args = self.ssh_args(target, command);
        let output = self.runner.run(&self.config.ssh_bin, &args).await?;
        self.check(&self.config.ssh_bin, target, output)
    }

    fn check(
        &self,
        program: &str,
        target: &DeployTarget,
        output: CommandOutput,
    ) -> Result<(), PayloadError> {
        match output.code {
            Some(0) => Ok(()),
            Some(SSH_CLIENT_FAILURE) if program == self.config.ssh_bin => {
                Err(PayloadError::Connection {
                    host: target.host.to_string(),
                    stderr: output.stderr,
                })
            }
            Some(code) => Err(PayloadError::CommandFailure {
                program: program.to_owned(),
                status: Some(code),
                status_text: code.to_string(),
                stderr: output.stderr,
            }),
            None => Err(PayloadError::MissingExitCode {
                program: program.to_owned(),
            }),
        }
    }

    fn execution_command(&self, payload: &PayloadSpec, remote: &str) -> String {
        match payload.command.as_deref() {
            Some(command) => format!(
                "cd {} && {command}",
                escape(self.config.remote_dir.as_str().into())
            ),
            None => {
                let escaped = escape(remote.into());
                format!("chmod +x {escaped} && {escaped}")
            }
        }
    }

    fn ssh_args(&self, target: &DeployTarget, command: &str) -> Vec<OsString> {
        let mut args = self.common_options("-p", &target.ssh_key_name);
        args.push(OsString::from(format!(
            "{}@{}",
            self.config.ssh_user, target.host
        )));
        args.push(OsString::from(command));
        args
    }

    fn scp_args(
        &self,
        target: &DeployTarget,
        source: &Utf8Path,
        remote: &str,
        recursive: bool,
    ) -> Vec<OsString> {
        let mut args = self.common_options("-P", &target.ssh_key_name);
        if recursive {
            args.push(OsString::from("-r"));
        }
        args.push(OsString::from(source.as_str()));
        args.push(OsString::from(format!(
            "{}@{}:{remote}",
            self.config.ssh_user,
            target.scp_host()
        )));
        args
    }

    fn common_options(&self, port_flag: &str, ssh_key_name: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag),
            OsString::from(self.config.ssh_port.to_string()),
        ];

        if let Some(identity) = self.config.identity_for(ssh_key_name) {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity));
        }

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.config.connect_timeout_secs
        )));
        args
    }
}

#[cfg(test)]
mod tests;
