//! Executes one queued task from `pending` to a terminal status.

use std::sync::Arc;

use tracing::{Instrument, debug, info, info_span, warn};

use super::aggregate::{TaskSummary, summarise};
use super::notify::WebhookDispatcher;
use crate::error::EngineError;
use crate::lifecycle::{BatchOutcome, InstanceLifecycleController};
use crate::model::{Task, TaskId, TaskRequest, TaskStatus};
use crate::repository::Repository;

const FINISH_ATTEMPTS: u32 = 5;

/// Claims a pending task, runs its batch and records the aggregate result.
#[derive(Clone)]
pub(crate) struct TaskRunner {
    pub(super) repo: Arc<dyn Repository>,
    controller: InstanceLifecycleController,
    pub(super) webhooks: WebhookDispatcher,
}

impl TaskRunner {
    pub(crate) fn new(
        repo: Arc<dyn Repository>,
        controller: InstanceLifecycleController,
        webhooks: WebhookDispatcher,
    ) -> Self {
        Self {
            repo,
            controller,
            webhooks,
        }
    }

    pub(crate) async fn run(&self, task_id: &TaskId) {
        let span = info_span!("task", %task_id);
        async {
            if let Err(err) = self.execute(task_id).await {
                warn!(error = %err, "task run aborted");
            }
        }
        .instrument(span)
        .await;
    }

    async fn execute(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let mut task = self.repo.get_task(task_id).await?;
        if task.status != TaskStatus::Pending {
            debug!(status = %task.status, "task is no longer pending");
            return Ok(());
        }
        task.transition(TaskStatus::Running)?;
        let task = match self.repo.update_task(task).await {
            Ok(task) => task,
            Err(err) if err.is_stale() => {
                debug!("task changed before it could be claimed");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        info!(action = %task.action, instances = task.instance_ids.len(), "task started");

        let summary = match self.dispatch(&task).await {
            Ok(outcome) => summarise(&outcome),
            Err(err) => TaskSummary::aborted(err.to_string()),
        };
        self.finish(task_id, summary).await
    }

    async fn dispatch(&self, task: &Task) -> Result<BatchOutcome, EngineError> {
        match TaskRequest::parse(task.action, &task.payload)? {
            TaskRequest::CreateInstances(request) => {
                self.controller
                    .create_instances(task, request.payload.as_ref())
                    .await
            }
            TaskRequest::TerminateInstances(_) => self.controller.terminate_instances(task).await,
            TaskRequest::DeleteUpload(request) => {
                let remote_path = request
                    .remote_path
                    .unwrap_or_else(|| self.controller.default_remote_dir().to_owned());
                self.controller.delete_uploads(task, &remote_path).await
            }
        }
    }

    /// Records `summary` unless the task reached a terminal status while the
    /// batch ran.
    async fn finish(&self, task_id: &TaskId, summary: TaskSummary) -> Result<(), EngineError> {
        for _ in 0..FINISH_ATTEMPTS {
            let mut task = self.repo.get_task(task_id).await?;
            if task.status.is_terminal() {
                info!(status = %task.status, "task finished elsewhere; batch result discarded");
                return Ok(());
            }
            task.transition(summary.status)?;
            task.error.clone_from(&summary.error);
            task.result = Some(summary.result.clone());
            match self.repo.update_task(task).await {
                Ok(saved) => {
                    match &saved.error {
                        Some(error) => warn!(status = %saved.status, %error, "task finished"),
                        None => info!(status = %saved.status, "task finished"),
                    }
                    self.webhooks.deliver(saved).await;
                    return Ok(());
                }
                Err(err) if err.is_stale() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Conflict(format!(
            "task {task_id} kept changing while its result was recorded"
        )))
    }
}
