//! Errors surfaced while copying or running payloads.

use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::retry::{Retryable, millis};

/// Errors raised by [`super::PayloadDeployer`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PayloadError {
    /// Configuration is missing a required value.
    #[error("missing {field}: set PROVISIO_PAYLOAD_{env_suffix} or add {field} to [payload] in provisio.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// The local payload does not exist.
    #[error("payload source missing: {path}")]
    MissingSource {
        /// Path that was expected to be uploaded.
        path: Utf8PathBuf,
    },
    /// The instance has no usable public address.
    #[error("instance {instance_id} has no public address")]
    MissingAddress {
        /// Instance without an address.
        instance_id: String,
    },
    /// A removal target is relative or the filesystem root.
    #[error("refusing to remove '{path}'")]
    UnsafePath {
        /// Rejected path.
        path: String,
    },
    /// A command could not be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// SSH could not reach or authenticate against the host.
    #[error("ssh connection to {host} failed: {stderr}")]
    Connection {
        /// Target host.
        host: String,
        /// Stderr captured from the client.
        stderr: String,
    },
    /// A transfer or housekeeping command exited non-zero.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// The payload itself exited non-zero.
    #[error("payload exited with status {exit_code}: {stderr}")]
    ExecutionFailed {
        /// Remote exit code.
        exit_code: i32,
        /// Stderr captured from the remote command.
        stderr: String,
    },
    /// A command terminated without an exit status.
    #[error("{program} terminated without an exit status")]
    MissingExitCode {
        /// Command name.
        program: String,
    },
    /// A single command outlived its deadline.
    #[error("timeout after {after_ms}ms waiting for {operation}")]
    Timeout {
        /// Operation being waited on.
        operation: String,
        /// Deadline in milliseconds.
        after_ms: u64,
    },
    /// The retry budget ran out.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Operation attempted.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Final error.
        last: Box<PayloadError>,
    },
}

impl Retryable for PayloadError {
    // Copies and directory housekeeping are idempotent, so any transport
    // failure may be retried. A payload's own exit status never is.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::CommandFailure { .. } | Self::Timeout { .. }
        )
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.to_owned(),
            after_ms: millis(after),
        }
    }

    fn exhausted(self, operation: &str, attempts: u32) -> Self {
        if attempts <= 1 {
            return self;
        }
        Self::RetriesExhausted {
            operation: operation.to_owned(),
            attempts,
            last: Box::new(self),
        }
    }
}
