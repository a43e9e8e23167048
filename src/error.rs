//! Engine-level error taxonomy.
//!
//! Module errors convert into [`EngineError`], whose variants map onto the
//! status classes an external transport reports.

use thiserror::Error;

use crate::config::ConfigError;
use crate::model::{RequestError, TransitionError};
use crate::payload::PayloadError;
use crate::provider::ProviderError;
use crate::repository::RepositoryError;

/// Errors returned by the engine's public operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EngineError {
    /// The request is malformed. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The record does not exist or belongs to another owner.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Requested key.
        id: String,
    },
    /// Duplicate name, busy instance or lost concurrent update.
    #[error("conflict: {0}")]
    Conflict(String),
    /// A provider call failed.
    #[error(transparent)]
    Provider(ProviderError),
    /// A placement resource is missing.
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    /// Internal failure.
    #[error("internal error: {0}")]
    Server(String),
}

impl EngineError {
    /// Builds a [`EngineError::NotFound`].
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// HTTP status class for the external transport.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::Provider(_) => 502,
            Self::Provisioning(_) => 422,
            Self::Server(_) => 500,
        }
    }
}

impl From<RequestError> for EngineError {
    fn from(value: RequestError) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<TransitionError> for EngineError {
    fn from(value: TransitionError) -> Self {
        Self::Conflict(value.to_string())
    }
}

impl From<RepositoryError> for EngineError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepositoryError::Duplicate { .. } | RepositoryError::Stale { .. } => {
                Self::Conflict(value.to_string())
            }
            RepositoryError::Unavailable(message) => Self::Server(message),
        }
    }
}

impl From<ProviderError> for EngineError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Provisioning { .. } => Self::Provisioning(value.to_string()),
            ProviderError::Validation(message) => Self::Validation(message),
            other => Self::Provider(other),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(value: ConfigError) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<PayloadError> for EngineError {
    fn from(value: PayloadError) -> Self {
        match value {
            PayloadError::InvalidConfig { .. } | PayloadError::UnsafePath { .. } => {
                Self::Validation(value.to_string())
            }
            other => Self::Server(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(EngineError::Validation("x".to_owned()), 400)]
    #[case(EngineError::not_found("task", "t1"), 404)]
    #[case(EngineError::Conflict("x".to_owned()), 409)]
    #[case(EngineError::Provider(ProviderError::Transient("x".to_owned())), 502)]
    #[case(EngineError::Provisioning("x".to_owned()), 422)]
    #[case(EngineError::Server("x".to_owned()), 500)]
    fn variants_map_to_status_classes(#[case] error: EngineError, #[case] status: u16) {
        assert_eq!(error.http_status(), status);
    }

    #[test]
    fn provisioning_errors_keep_the_missing_resource() {
        let error = EngineError::from(ProviderError::Provisioning {
            resource: "network".to_owned(),
            message: "hypervisor hv-1 has no primary network profile".to_owned(),
        });
        assert!(matches!(error, EngineError::Provisioning(ref text) if text.contains("network")));
    }

    #[test]
    fn stale_writes_are_conflicts() {
        let error = EngineError::from(RepositoryError::Stale {
            entity: "task",
            id: "t1".to_owned(),
            expected: 1,
            actual: 2,
        });
        assert_eq!(error.http_status(), 409);
    }
}
