//! Request documents accepted by the task API and their validation.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::status::TaskAction;

/// Upper bound on instances a single task may create.
pub const MAX_BATCH_SIZE: u32 = 64;

/// Explicit CPU, memory and disk sizing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Virtual CPU count.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Disk in GiB.
    pub disk_gb: u64,
}

/// Description of one group of identical instances to create.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceRequest {
    /// Base name; generated from the project name when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Registered provider name.
    #[serde(default)]
    pub provider: String,
    /// Provider region.
    #[serde(default)]
    pub region: String,
    /// Provider size or package.
    #[serde(default)]
    pub size: String,
    /// Provider image or OS template.
    #[serde(default)]
    pub image: String,
    /// Name of a registered key for the owner.
    #[serde(default, alias = "sshKeyName")]
    pub ssh_key_name: String,
    /// Number of copies; defaults to one.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Explicit hypervisor placement.
    #[serde(default)]
    pub hypervisor: Option<String>,
    /// Explicit network profile.
    #[serde(default, alias = "networkProfile")]
    pub network_profile: Option<String>,
    /// Explicit sizing that overrides the size preset.
    #[serde(default)]
    pub resources: Option<Resources>,
    /// Provider tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Volumes to attach.
    #[serde(default, alias = "volumeIds")]
    pub volume_ids: Vec<String>,
    /// Opaque per-volume settings.
    #[serde(default, alias = "volumeDetails")]
    pub volume_details: Option<Value>,
}

const fn default_count() -> u32 {
    1
}

impl InstanceRequest {
    /// Creates a request for a single instance with the required fields.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        region: impl Into<String>,
        size: impl Into<String>,
        image: impl Into<String>,
        ssh_key_name: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            provider: provider.into(),
            region: region.into(),
            size: size.into(),
            image: image.into(),
            ssh_key_name: ssh_key_name.into(),
            count: 1,
            hypervisor: None,
            network_profile: None,
            resources: None,
            tags: Vec::new(),
            volume_ids: Vec::new(),
            volume_details: None,
        }
    }

    /// Sets the base name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the number of copies.
    #[must_use]
    pub const fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Sets an explicit network profile.
    #[must_use]
    pub fn with_network_profile(mut self, profile: impl Into<String>) -> Self {
        self.network_profile = Some(profile.into());
        self
    }

    /// Checks required fields and bounds. `index` locates the entry in the
    /// error message.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] describing the first problem found.
    pub fn validate(&self, index: usize) -> Result<(), RequestError> {
        let required = [
            ("provider", &self.provider),
            ("region", &self.region),
            ("size", &self.size),
            ("image", &self.image),
            ("ssh_key_name", &self.ssh_key_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(RequestError::MissingField { index, field });
            }
        }
        if let Some(name) = self.name.as_deref()
            && name.trim().is_empty()
        {
            return Err(RequestError::MissingField {
                index,
                field: "name",
            });
        }
        if self.count == 0 || self.count > MAX_BATCH_SIZE {
            return Err(RequestError::InvalidCount {
                index,
                count: self.count,
            });
        }
        if let Some(resources) = self.resources
            && (resources.cpu == 0 || resources.memory_mb == 0 || resources.disk_gb == 0)
        {
            return Err(RequestError::InvalidResources { index });
        }
        Ok(())
    }
}

/// Optional artefact copied to and run on each ready instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PayloadSpec {
    /// Local file or directory to upload.
    pub source: String,
    /// Name under the remote directory; defaults to the source file name.
    #[serde(default)]
    pub remote_name: Option<String>,
    /// Command run from the remote directory. When absent the uploaded file
    /// itself is made executable and run.
    #[serde(default)]
    pub command: Option<String>,
}

impl PayloadSpec {
    /// Creates a payload that uploads and runs `source`.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            remote_name: None,
            command: None,
        }
    }

    /// Sets the command to run after upload.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    fn validate(&self) -> Result<(), RequestError> {
        if self.source.trim().is_empty() {
            return Err(RequestError::Invalid("payload.source must not be empty".to_owned()));
        }
        if self.command.as_deref().is_some_and(|cmd| cmd.trim().is_empty()) {
            return Err(RequestError::Invalid("payload.command must not be empty".to_owned()));
        }
        if self
            .remote_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty() || name.contains('/'))
        {
            return Err(RequestError::Invalid(
                "payload.remote_name must be a plain file name".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Body of a `create_instances` task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateInstancesRequest {
    /// Instance groups to create.
    pub instances: Vec<InstanceRequest>,
    /// Optional artefact deployed once each instance is ready.
    #[serde(default)]
    pub payload: Option<PayloadSpec>,
    /// Endpoint notified once the task is terminal.
    #[serde(default, alias = "webhookUrl")]
    pub webhook_url: Option<String>,
}

/// Body of a `terminate_instances` task.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TerminateInstancesRequest {
    /// Instance ids or names within the project.
    pub instances: Vec<String>,
    /// Endpoint notified once the task is terminal.
    #[serde(default, alias = "webhookUrl")]
    pub webhook_url: Option<String>,
}

/// Body of a `delete_upload` task.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeleteUploadRequest {
    /// Instance ids or names within the project.
    pub instances: Vec<String>,
    /// Remote path to remove; defaults to the configured payload directory.
    #[serde(default, alias = "remotePath")]
    pub remote_path: Option<String>,
    /// Endpoint notified once the task is terminal.
    #[serde(default, alias = "webhookUrl")]
    pub webhook_url: Option<String>,
}

/// A parsed and validated task body.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskRequest {
    /// Provision instances.
    CreateInstances(CreateInstancesRequest),
    /// Tear instances down.
    TerminateInstances(TerminateInstancesRequest),
    /// Remove uploaded payloads.
    DeleteUpload(DeleteUploadRequest),
}

impl TaskRequest {
    /// Parses `payload` according to `action` and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when the document is malformed or fails
    /// validation.
    pub fn parse(action: TaskAction, payload: &Value) -> Result<Self, RequestError> {
        let request = match action {
            TaskAction::CreateInstances => Self::CreateInstances(decode(action, payload)?),
            TaskAction::TerminateInstances => Self::TerminateInstances(decode(action, payload)?),
            TaskAction::DeleteUpload => Self::DeleteUpload(decode(action, payload)?),
        };
        request.validate()?;
        Ok(request)
    }

    /// Webhook URL carried by the request.
    #[must_use]
    pub fn webhook_url(&self) -> Option<&str> {
        match self {
            Self::CreateInstances(request) => request.webhook_url.as_deref(),
            Self::TerminateInstances(request) => request.webhook_url.as_deref(),
            Self::DeleteUpload(request) => request.webhook_url.as_deref(),
        }
    }

    fn validate(&self) -> Result<(), RequestError> {
        match self {
            Self::CreateInstances(request) => {
                if request.instances.is_empty() {
                    return Err(RequestError::EmptyInstances);
                }
                for (index, instance) in request.instances.iter().enumerate() {
                    instance.validate(index)?;
                }
                let total: u32 = request
                    .instances
                    .iter()
                    .fold(0_u32, |sum, instance| sum.saturating_add(instance.count));
                if total > MAX_BATCH_SIZE {
                    return Err(RequestError::Invalid(format!(
                        "a task may create at most {MAX_BATCH_SIZE} instances, got {total}"
                    )));
                }
                if let Some(payload) = &request.payload {
                    payload.validate()?;
                }
            }
            Self::TerminateInstances(TerminateInstancesRequest { instances, .. })
            | Self::DeleteUpload(DeleteUploadRequest { instances, .. }) => {
                if instances.is_empty() {
                    return Err(RequestError::EmptyInstances);
                }
                if instances.iter().any(|entry| entry.trim().is_empty()) {
                    return Err(RequestError::Invalid(
                        "instance identifiers must not be empty".to_owned(),
                    ));
                }
            }
        }
        if let Self::DeleteUpload(DeleteUploadRequest {
            remote_path: Some(path),
            ..
        }) = self
            && !path.starts_with('/')
        {
            return Err(RequestError::Invalid(
                "remote_path must be an absolute path".to_owned(),
            ));
        }
        if let Some(url) = self.webhook_url() {
            validate_webhook_url(url)?;
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    action: TaskAction,
    payload: &Value,
) -> Result<T, RequestError> {
    T::deserialize(payload).map_err(|err| RequestError::Malformed {
        action,
        message: err.to_string(),
    })
}

fn validate_webhook_url(raw: &str) -> Result<(), RequestError> {
    let url = Url::parse(raw).map_err(|err| RequestError::InvalidWebhookUrl {
        url: raw.to_owned(),
        message: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RequestError::InvalidWebhookUrl {
            url: raw.to_owned(),
            message: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}

/// Problems found in a task request document.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    /// The document does not match the action's shape.
    #[error("malformed {action} request: {message}")]
    Malformed {
        /// Action the document was parsed for.
        action: TaskAction,
        /// Deserializer message.
        message: String,
    },
    /// The request names no instances.
    #[error("request must name at least one instance")]
    EmptyInstances,
    /// A required instance field is empty.
    #[error("instances[{index}].{field} is required")]
    MissingField {
        /// Position in the request.
        index: usize,
        /// Field name.
        field: &'static str,
    },
    /// Count outside `1..=MAX_BATCH_SIZE`.
    #[error("instances[{index}].count must be between 1 and {MAX_BATCH_SIZE}, got {count}")]
    InvalidCount {
        /// Position in the request.
        index: usize,
        /// Rejected count.
        count: u32,
    },
    /// Resources with a zero dimension.
    #[error("instances[{index}].resources must be non-zero")]
    InvalidResources {
        /// Position in the request.
        index: usize,
    },
    /// Webhook URL did not parse or uses an unsupported scheme.
    #[error("invalid webhook url '{url}': {message}")]
    InvalidWebhookUrl {
        /// Rejected URL.
        url: String,
        /// Parser message.
        message: String,
    },
    /// Any other rule violation.
    #[error("{0}")]
    Invalid(String),
}
