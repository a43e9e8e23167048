//! Error taxonomy shared by every provider adapter.

use std::time::Duration;

use thiserror::Error;

use crate::retry::{Retryable, millis};

/// Errors raised by provider adapters.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Adapter configuration is incomplete.
    #[error("provider configuration error: {0}")]
    Config(String),
    /// Credentials were rejected.
    #[error("authentication failed for {provider}: {message}")]
    Auth {
        /// Provider name.
        provider: String,
        /// Provider response.
        message: String,
    },
    /// The provider rejected the request shape.
    #[error("invalid server request: {0}")]
    Validation(String),
    /// The server does not exist.
    #[error("server {id} not found")]
    NotFound {
        /// Provider identifier that was looked up.
        id: String,
    },
    /// Placement could not be resolved.
    #[error("missing {resource}: {message}")]
    Provisioning {
        /// Resource kind, for example `network` or `hypervisor`.
        resource: String,
        /// What was missing.
        message: String,
    },
    /// Network failure, throttling or a provider-side error.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// A single call outlived its deadline.
    #[error("timeout after {after_ms}ms waiting for {operation}")]
    Timeout {
        /// Operation being waited on.
        operation: String,
        /// Deadline in milliseconds.
        after_ms: u64,
    },
    /// Any other failure that a retry will not fix.
    #[error("provider error: {0}")]
    Permanent(String),
    /// The retry budget ran out.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Operation attempted.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Final error.
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Returns `true` when the server is already gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::RetriesExhausted { last, .. } => last.is_not_found(),
            _ => false,
        }
    }
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
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
