//! Task intake, queries and cancellation.
//!
//! A request becomes a `pending` task synchronously: the body is validated,
//! instance rows are allocated or claimed, and the task id is queued for the
//! worker pool. Everything that talks to a provider happens later on a
//! worker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::model::{
    CreateInstancesRequest, DeleteUploadRequest, Instance, InstanceId, OwnerId, Project,
    ProjectId, Task, TaskAction, TaskId, TaskRequest, TaskStatus, TerminateInstancesRequest,
};
use crate::provider::ProviderRegistry;
use crate::repository::{InstanceFilter, ListOptions, Repository, RepositoryError, TaskFilter};
use crate::retry::millis;

mod aggregate;
mod naming;
mod notify;
mod runner;
mod worker;

pub use aggregate::{TaskSummary, summarise};
pub(crate) use notify::WebhookDispatcher;
pub(crate) use runner::TaskRunner;
pub use worker::{Recovery, WorkerPool};
pub(crate) use worker::recover;

use naming::NameAllocator;

const TERMINATE_ATTEMPTS: u32 = 5;
const CLAIM_ATTEMPTS: u32 = 5;

/// Owns task records: accepts requests, answers queries and terminates.
#[derive(Clone)]
pub struct TaskManager {
    repo: Arc<dyn Repository>,
    providers: Arc<ProviderRegistry>,
    queue: mpsc::Sender<TaskId>,
    webhooks: WebhookDispatcher,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    pub(crate) fn new(
        repo: Arc<dyn Repository>,
        providers: Arc<ProviderRegistry>,
        queue: mpsc::Sender<TaskId>,
        webhooks: WebhookDispatcher,
    ) -> Self {
        Self {
            repo,
            providers,
            queue,
            webhooks,
        }
    }

    /// Validates `payload` for `action`, persists a `pending` task and queues
    /// it.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] when the project is missing or belongs to
    ///   another owner, or a targeted instance does not exist.
    /// - [`EngineError::Validation`] for a malformed body, an unknown
    ///   provider or an unregistered SSH key.
    /// - [`EngineError::Conflict`] for a name clash or an instance already
    ///   claimed by another active task.
    pub async fn create_task(
        &self,
        owner: OwnerId,
        project_id: &ProjectId,
        action: TaskAction,
        payload: Value,
    ) -> Result<Task, EngineError> {
        let project = self.project(owner, project_id).await?;
        let request = TaskRequest::parse(action, &payload)?;
        let webhook_url = request.webhook_url().map(str::to_owned);
        let mut task = Task::new(
            project.owner_id,
            project.id.clone(),
            action,
            payload,
            webhook_url,
        );

        match &request {
            TaskRequest::CreateInstances(body) => {
                let instances = self.allocate(&project, &task, body).await?;
                task.instance_ids = instances.iter().map(|instance| instance.id.clone()).collect();
                self.repo.insert_instances(instances).await?;
            }
            TaskRequest::TerminateInstances(TerminateInstancesRequest { instances, .. })
            | TaskRequest::DeleteUpload(DeleteUploadRequest { instances, .. }) => {
                task.instance_ids = self.claim(&project, &task, instances).await?;
            }
        }

        let task = self.repo.insert_task(task).await?;
        info!(
            task_id = %task.id,
            project_id = %task.project_id,
            action = %task.action,
            instances = task.instance_ids.len(),
            "task accepted"
        );
        self.enqueue(&task.id);
        Ok(task)
    }

    /// Accepts a create request.
    ///
    /// # Errors
    ///
    /// See [`TaskManager::create_task`].
    pub async fn create_instances(
        &self,
        owner: OwnerId,
        project_id: &ProjectId,
        request: &CreateInstancesRequest,
    ) -> Result<Task, EngineError> {
        self.create_task(owner, project_id, TaskAction::CreateInstances, encode(request)?)
            .await
    }

    /// Accepts a terminate request naming instances by id or name.
    ///
    /// # Errors
    ///
    /// See [`TaskManager::create_task`].
    pub async fn terminate_instances(
        &self,
        owner: OwnerId,
        project_id: &ProjectId,
        request: &TerminateInstancesRequest,
    ) -> Result<Task, EngineError> {
        self.create_task(owner, project_id, TaskAction::TerminateInstances, encode(request)?)
            .await
    }

    /// Accepts a request to remove uploaded payloads.
    ///
    /// # Errors
    ///
    /// See [`TaskManager::create_task`].
    pub async fn delete_upload(
        &self,
        owner: OwnerId,
        project_id: &ProjectId,
        request: &DeleteUploadRequest,
    ) -> Result<Task, EngineError> {
        self.create_task(owner, project_id, TaskAction::DeleteUpload, encode(request)?)
            .await
    }

    /// Fetches a task visible to `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for a missing task or one owned by
    /// someone else.
    pub async fn get(&self, owner: OwnerId, task_id: &TaskId) -> Result<Task, EngineError> {
        let task = self.repo.get_task(task_id).await?;
        if !owner.can_access(task.owner_id) {
            return Err(EngineError::not_found("task", task_id));
        }
        Ok(task)
    }

    /// Lists a project's tasks, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the project is not visible.
    pub async fn list_by_project(
        &self,
        owner: OwnerId,
        project_id: &ProjectId,
        options: ListOptions,
    ) -> Result<Vec<Task>, EngineError> {
        let project = self.project(owner, project_id).await?;
        let filter = TaskFilter {
            project_id: Some(project.id),
            options,
            ..TaskFilter::default()
        };
        Ok(self.repo.list_tasks(&filter).await?)
    }

    /// Lists the tasks that targeted one instance, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the instance is not visible.
    pub async fn list_by_instance(
        &self,
        owner: OwnerId,
        instance_id: &InstanceId,
        options: ListOptions,
    ) -> Result<Vec<Task>, EngineError> {
        let instance = self.repo.get_instance(instance_id).await?;
        if !owner.can_access(instance.owner_id) {
            return Err(EngineError::not_found("instance", instance_id));
        }
        let filter = TaskFilter {
            instance_id: Some(instance.id),
            options,
            ..TaskFilter::default()
        };
        Ok(self.repo.list_tasks(&filter).await?)
    }

    /// Moves a task to `status`. Moving to `terminated` behaves like
    /// [`TaskManager::terminate`].
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] when the task is not visible.
    /// - [`EngineError::Conflict`] for a transition the status machine
    ///   forbids or a concurrent update.
    pub async fn update_status(
        &self,
        owner: OwnerId,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<Task, EngineError> {
        if status == TaskStatus::Terminated {
            return self.terminate(owner, task_id).await;
        }
        let mut task = self.get(owner, task_id).await?;
        if task.status == status {
            return Ok(task);
        }
        task.transition(status)?;
        let saved = self.repo.update_task(task).await?;
        if saved.status.is_terminal() {
            self.spawn_webhook(&saved);
        }
        Ok(saved)
    }

    /// Terminates a task. Already-terminal tasks are returned unchanged.
    ///
    /// A running worker observes the persisted status before dispatching
    /// each remaining instance; provider calls already issued complete.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] when the task is not visible.
    /// - [`EngineError::Conflict`] when concurrent updates keep winning.
    pub async fn terminate(&self, owner: OwnerId, task_id: &TaskId) -> Result<Task, EngineError> {
        for _ in 0..TERMINATE_ATTEMPTS {
            let mut task = self.get(owner, task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            task.transition(TaskStatus::Terminated)?;
            match self.repo.update_task(task).await {
                Ok(saved) => {
                    info!(task_id = %saved.id, "task terminated");
                    self.spawn_webhook(&saved);
                    return Ok(saved);
                }
                Err(err) if err.is_stale() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Conflict(format!(
            "task {task_id} kept changing while it was terminated"
        )))
    }

    /// Polls until the task is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Server`] when `timeout` elapses first, or any
    /// error from [`TaskManager::get`].
    pub async fn wait_until_terminal(
        &self,
        owner: OwnerId,
        task_id: &TaskId,
        poll: Duration,
        timeout: Duration,
    ) -> Result<Task, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self.get(owner, task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Server(format!(
                    "task {task_id} still {} after {}ms",
                    task.status,
                    millis(timeout)
                )));
            }
            sleep(poll).await;
        }
    }

    async fn project(&self, owner: OwnerId, project_id: &ProjectId) -> Result<Project, EngineError> {
        let project = self.repo.get_project(project_id).await?;
        if !owner.can_access(project.owner_id) {
            return Err(EngineError::not_found("project", project_id));
        }
        Ok(project)
    }

    async fn allocate(
        &self,
        project: &Project,
        task: &Task,
        body: &CreateInstancesRequest,
    ) -> Result<Vec<Instance>, EngineError> {
        let active = self
            .repo
            .list_instances(&InstanceFilter {
                project_id: Some(project.id.clone()),
                active_only: true,
                ..InstanceFilter::default()
            })
            .await?;
        let mut names = NameAllocator::new(
            &project.name,
            active.into_iter().map(|instance| instance.name),
        );

        let mut instances = Vec::new();
        for request in &body.instances {
            let provider = request.provider.trim();
            if !self.providers.contains(provider) {
                return Err(EngineError::Validation(format!(
                    "unknown provider '{provider}'; registered providers: {}",
                    self.providers.names().join(", ")
                )));
            }
            let key_name = request.ssh_key_name.trim();
            match self.repo.get_ssh_key(project.owner_id, key_name).await {
                Ok(_) => {}
                Err(RepositoryError::NotFound { .. }) => {
                    return Err(EngineError::Validation(format!(
                        "ssh key '{key_name}' is not registered"
                    )));
                }
                Err(err) => return Err(err.into()),
            }
            for name in names.allocate(request)? {
                instances.push(Instance::pending(
                    project.owner_id,
                    project.id.clone(),
                    task.id.clone(),
                    name,
                    request,
                ));
            }
        }
        Ok(instances)
    }

    /// Resolves `identifiers` to instances of `project` and marks each as
    /// claimed by `task`.
    async fn claim(
        &self,
        project: &Project,
        task: &Task,
        identifiers: &[String],
    ) -> Result<Vec<InstanceId>, EngineError> {
        let known = self
            .repo
            .list_instances(&InstanceFilter {
                project_id: Some(project.id.clone()),
                ..InstanceFilter::default()
            })
            .await?;

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for identifier in identifiers {
            let wanted = identifier.trim();
            let instance = known
                .iter()
                .find(|instance| instance.id.as_str() == wanted)
                .or_else(|| {
                    known
                        .iter()
                        .filter(|instance| instance.name == wanted)
                        .max_by_key(|instance| (instance.is_active(), instance.created_at))
                })
                .ok_or_else(|| EngineError::not_found("instance", wanted))?;
            if seen.insert(instance.id.clone()) {
                targets.push(instance.clone());
            }
        }

        for instance in &targets {
            self.ensure_idle(instance).await?;
        }
        let mut ids = Vec::with_capacity(targets.len());
        for instance in targets {
            ids.push(self.claim_one(task, instance).await?);
        }
        Ok(ids)
    }

    /// Points the row at `task`, re-reading and re-checking it when a
    /// running controller wrote it first.
    async fn claim_one(&self, task: &Task, instance: Instance) -> Result<InstanceId, EngineError> {
        let mut candidate = instance;
        for _ in 0..CLAIM_ATTEMPTS {
            candidate.last_task_id = Some(task.id.clone());
            match self.repo.update_instance(candidate.clone()).await {
                Ok(claimed) => return Ok(claimed.id),
                Err(err) if err.is_stale() => {
                    candidate = self.repo.get_instance(&candidate.id).await?;
                    self.ensure_idle(&candidate).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Conflict(format!(
            "instance {} kept changing while task {} claimed it",
            candidate.id, task.id
        )))
    }

    async fn ensure_idle(&self, instance: &Instance) -> Result<(), EngineError> {
        let Some(last_task_id) = &instance.last_task_id else {
            return Ok(());
        };
        match self.repo.get_task(last_task_id).await {
            Ok(task) if task.status.is_active() => Err(EngineError::Conflict(format!(
                "instance {} is in use by {} task {}",
                instance.id, task.status, task.id
            ))),
            Ok(_) | Err(RepositoryError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn enqueue(&self, task_id: &TaskId) {
        match self.queue.try_send(task_id.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(queued)) => {
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    if queue.send(queued).await.is_err() {
                        warn!("task queue closed; task stays pending until restart");
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {
                warn!(%task_id, "task queue closed; task stays pending until restart");
            }
        }
    }

    fn spawn_webhook(&self, task: &Task) {
        if task.webhook_url.is_none() {
            return;
        }
        let webhooks = self.webhooks.clone();
        let snapshot = task.clone();
        tokio::spawn(async move { webhooks.deliver(snapshot).await });
    }
}

fn encode<T: Serialize>(request: &T) -> Result<Value, EngineError> {
    serde_json::to_value(request).map_err(|err| EngineError::Validation(err.to_string()))
}

#[cfg(test)]
mod tests;
