//! Instance records and their guarded status updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{InstanceId, OwnerId, ProjectId, TaskId};
use super::request::{InstanceRequest, Resources};
use super::status::{InstanceStatus, PayloadStatus, TransitionError};

/// A provider-backed server tracked by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier.
    pub id: InstanceId,
    /// Owning user.
    pub owner_id: OwnerId,
    /// Project the instance belongs to.
    pub project_id: ProjectId,
    /// Most recent task that targeted this instance.
    pub last_task_id: Option<TaskId>,
    /// Name, unique among active instances of the project.
    pub name: String,
    /// Registered provider name.
    pub provider: String,
    /// Identifier assigned by the provider once created.
    pub provider_instance_id: Option<String>,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Payload progress.
    pub payload_status: PayloadStatus,
    /// Public address once ready.
    pub public_ip: Option<String>,
    /// Provider region.
    pub region: String,
    /// Provider size or package.
    pub size: String,
    /// Provider image.
    pub image: String,
    /// Requested hypervisor.
    pub hypervisor: Option<String>,
    /// Requested network profile.
    pub network_profile: Option<String>,
    /// Explicit sizing that overrides the size preset.
    #[serde(default)]
    pub resources: Option<Resources>,
    /// Key installed on the server.
    pub ssh_key_name: String,
    /// Provider tags.
    pub tags: Vec<String>,
    /// Attached volume ids.
    pub volume_ids: Vec<String>,
    /// Opaque per-volume settings.
    pub volume_details: Option<Value>,
    /// Last failure, if any.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter.
    pub revision: u64,
}

impl Instance {
    /// Creates a pending instance row for one copy of `request`.
    #[must_use]
    pub fn pending(
        owner_id: OwnerId,
        project_id: ProjectId,
        task_id: TaskId,
        name: String,
        request: &InstanceRequest,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::generate(),
            owner_id,
            project_id,
            last_task_id: Some(task_id),
            name,
            provider: request.provider.trim().to_owned(),
            provider_instance_id: None,
            status: InstanceStatus::Pending,
            payload_status: PayloadStatus::None,
            public_ip: None,
            region: request.region.trim().to_owned(),
            size: request.size.trim().to_owned(),
            image: request.image.trim().to_owned(),
            hypervisor: request.hypervisor.clone(),
            network_profile: request.network_profile.clone(),
            resources: request.resources,
            ssh_key_name: request.ssh_key_name.trim().to_owned(),
            tags: request.tags.clone(),
            volume_ids: request.volume_ids.clone(),
            volume_details: request.volume_details.clone(),
            error: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Returns `true` while the instance has not been torn down.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Moves the lifecycle status forward. Repeating the current status is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Instance`] for backward moves or moves out
    /// of `terminated`.
    pub fn transition(&mut self, next: InstanceStatus) -> Result<(), TransitionError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Instance {
                instance_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Updates payload progress. Anything past `none` needs a ready
    /// instance.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::NotReady`] or [`TransitionError::Payload`].
    pub fn set_payload_status(&mut self, next: PayloadStatus) -> Result<(), TransitionError> {
        if self.payload_status == next {
            return Ok(());
        }
        if next != PayloadStatus::None && self.status != InstanceStatus::Ready {
            return Err(TransitionError::NotReady {
                instance_id: self.id.clone(),
                status: self.status,
            });
        }
        if !self.payload_status.can_transition_to(next) {
            return Err(TransitionError::Payload {
                instance_id: self.id.clone(),
                from: self.payload_status,
                to: next,
            });
        }
        self.payload_status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
