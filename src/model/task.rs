//! Task records: one asynchronous unit of lifecycle work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{InstanceId, OwnerId, ProjectId, TaskId};
use super::status::{TaskAction, TaskStatus, TransitionError};

/// A unit of asynchronous work against a batch of instances.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// Owner copied from the project at creation.
    pub owner_id: OwnerId,
    /// Project the task belongs to.
    pub project_id: ProjectId,
    /// Work kind.
    pub action: TaskAction,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Request document supplied by the caller.
    pub payload: Value,
    /// Per-instance summary written on completion.
    pub result: Option<Value>,
    /// Failure summary, if any.
    pub error: Option<String>,
    /// Endpoint notified once the task is terminal.
    pub webhook_url: Option<String>,
    /// Set after the webhook was delivered.
    pub webhook_sent: bool,
    /// Instances the task operates on, in request order.
    pub instance_ids: Vec<InstanceId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// When a worker picked the task up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task became terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, bumped by the repository on every
    /// write.
    pub revision: u64,
}

impl Task {
    /// Creates a pending task.
    #[must_use]
    pub fn new(
        owner_id: OwnerId,
        project_id: ProjectId,
        action: TaskAction,
        payload: Value,
        webhook_url: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            owner_id,
            project_id,
            action,
            status: TaskStatus::Pending,
            payload,
            result: None,
            error: None,
            webhook_url,
            webhook_sent: false,
            instance_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            revision: 0,
        }
    }

    /// Moves the task to `next`, stamping start and finish times.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::Task`] when the move is not allowed.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Task {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Returns `true` when the task operates on `instance_id`.
    #[must_use]
    pub fn targets(&self, instance_id: &InstanceId) -> bool {
        self.instance_ids.contains(instance_id)
    }
}
