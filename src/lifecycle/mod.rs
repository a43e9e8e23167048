//! Instance lifecycle controller.
//!
//! The controller executes one task's batch: it fans per-instance work out
//! under a concurrency bound, serialises work on each instance with a lock,
//! and checks the persisted task status before every dispatch so a
//! terminated task stops issuing new provider calls. Calls already in flight
//! are allowed to finish.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::EngineError;
use crate::model::{Instance, InstanceId, InstanceStatus, PayloadSpec, Task, TaskId, TaskStatus};
use crate::payload::PayloadDeployer;
use crate::provider::{ProviderAdapter, ProviderRegistry};
use crate::repository::Repository;
use crate::retry::RetryPolicy;

mod create;
mod locks;
mod payload;
mod terminate;

pub use locks::InstanceLocks;

const SAVE_ATTEMPTS: u32 = 5;

/// Timing and concurrency knobs for the controller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LifecycleSettings {
    /// Retry policy for provider calls.
    pub retry: RetryPolicy,
    /// Interval between readiness polls.
    pub poll_interval: Duration,
    /// Deadline for a created server to become ready.
    pub ready_timeout: Duration,
    /// Instances of one batch handled concurrently.
    pub max_fanout: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        crate::config::EngineConfig::with_defaults().lifecycle_settings()
    }
}

/// How one instance of a batch ended.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum InstanceOutcome {
    /// The operation reached its target state.
    Succeeded,
    /// The instance is ready but its payload failed.
    PayloadFailed(String),
    /// The operation failed.
    Failed(String),
    /// Not dispatched because the task was terminated.
    Skipped,
}

/// Per-instance entry of a batch result.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InstanceReport {
    /// Instance the entry describes.
    pub instance_id: InstanceId,
    /// Instance name, when it could be loaded.
    pub name: String,
    /// Final outcome.
    #[serde(flatten)]
    pub outcome: InstanceOutcome,
}

impl InstanceReport {
    fn new(instance: &Instance, outcome: InstanceOutcome) -> Self {
        Self {
            instance_id: instance.id.clone(),
            name: instance.name.clone(),
            outcome,
        }
    }

    fn unloaded(instance_id: &InstanceId, error: &EngineError) -> Self {
        Self {
            instance_id: instance_id.clone(),
            name: String::new(),
            outcome: InstanceOutcome::Failed(error.to_string()),
        }
    }
}

/// Result of running one batch.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BatchOutcome {
    /// Reports in the task's instance order.
    pub reports: Vec<InstanceReport>,
    /// Set when the task was terminated before every instance was
    /// dispatched.
    pub cancelled: bool,
}

#[derive(Clone, Debug)]
enum Step {
    Create(Option<PayloadSpec>),
    Terminate,
    DeleteUpload(String),
}

enum Slot {
    Dispatched(InstanceId, JoinHandle<InstanceReport>),
    Skipped(InstanceId),
}

/// Drives instances through provisioning, payload deployment and teardown.
#[derive(Clone)]
pub struct InstanceLifecycleController {
    repo: Arc<dyn Repository>,
    providers: Arc<ProviderRegistry>,
    deployer: Arc<PayloadDeployer>,
    locks: InstanceLocks,
    settings: LifecycleSettings,
}

impl std::fmt::Debug for InstanceLifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLifecycleController")
            .field("providers", &self.providers)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl InstanceLifecycleController {
    /// Creates a controller over the injected collaborators.
    #[must_use]
    pub fn new(
        repo: Arc<dyn Repository>,
        providers: Arc<ProviderRegistry>,
        deployer: Arc<PayloadDeployer>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            repo,
            providers,
            deployer,
            locks: InstanceLocks::default(),
            settings,
        }
    }

    /// Provisions every instance of `task` and deploys `payload` on each
    /// one that becomes ready.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] only when the batch itself cannot run;
    /// per-instance failures are reported in the [`BatchOutcome`].
    pub async fn create_instances(
        &self,
        task: &Task,
        payload: Option<&PayloadSpec>,
    ) -> Result<BatchOutcome, EngineError> {
        self.run_batch(task, Step::Create(payload.cloned())).await
    }

    /// Deletes the provider server behind every instance of `task`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] only when the batch itself cannot run.
    pub async fn terminate_instances(&self, task: &Task) -> Result<BatchOutcome, EngineError> {
        self.run_batch(task, Step::Terminate).await
    }

    /// Removes `remote_path` from every instance of `task`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] only when the batch itself cannot run.
    pub async fn delete_uploads(
        &self,
        task: &Task,
        remote_path: &str,
    ) -> Result<BatchOutcome, EngineError> {
        self.run_batch(task, Step::DeleteUpload(remote_path.to_owned()))
            .await
    }

    /// Configured remote payload directory.
    #[must_use]
    pub fn default_remote_dir(&self) -> &str {
        &self.deployer.config().remote_dir
    }

    async fn run_batch(&self, task: &Task, step: Step) -> Result<BatchOutcome, EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_fanout.max(1)));
        let mut slots = Vec::with_capacity(task.instance_ids.len());
        let mut cancelled = false;

        for instance_id in &task.instance_ids {
            if cancelled {
                slots.push(Slot::Skipped(instance_id.clone()));
                continue;
            }
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|err| EngineError::Server(err.to_string()))?;
            if self.is_cancelled(&task.id).await? {
                info!(task_id = %task.id, "task terminated; skipping remaining instances");
                cancelled = true;
                slots.push(Slot::Skipped(instance_id.clone()));
                continue;
            }

            let controller = self.clone();
            let task_id = task.id.clone();
            let id = instance_id.clone();
            let instance_step = step.clone();
            let span = info_span!("instance", task_id = %task.id, instance_id = %instance_id);
            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    controller.run_step(&task_id, &id, &instance_step).await
                }
                .instrument(span),
            );
            slots.push(Slot::Dispatched(instance_id.clone(), handle));
        }

        let mut reports = Vec::with_capacity(slots.len());
        for slot in slots {
            let report = match slot {
                Slot::Dispatched(instance_id, handle) => match handle.await {
                    Ok(report) => report,
                    Err(err) => InstanceReport::unloaded(
                        &instance_id,
                        &EngineError::Server(format!("instance worker aborted: {err}")),
                    ),
                },
                Slot::Skipped(instance_id) => self.skip(&instance_id, &step).await,
            };
            reports.push(report);
        }
        Ok(BatchOutcome { reports, cancelled })
    }

    async fn is_cancelled(&self, task_id: &TaskId) -> Result<bool, EngineError> {
        let task = self.repo.get_task(task_id).await?;
        Ok(task.status == TaskStatus::Terminated)
    }

    async fn run_step(&self, task_id: &TaskId, instance_id: &InstanceId, step: &Step) -> InstanceReport {
        let _guard = self.locks.acquire(instance_id).await;
        let instance = match self.repo.get_instance(instance_id).await {
            Ok(instance) => instance,
            Err(err) => return InstanceReport::unloaded(instance_id, &err.into()),
        };
        match step {
            Step::Create(payload) => self.provision(task_id, instance, payload.as_ref()).await,
            Step::Terminate => self.terminate(instance).await,
            Step::DeleteUpload(remote_path) => self.delete_upload(instance, remote_path).await,
        }
    }

    async fn skip(&self, instance_id: &InstanceId, step: &Step) -> InstanceReport {
        let Ok(mut instance) = self.repo.get_instance(instance_id).await else {
            return InstanceReport {
                instance_id: instance_id.clone(),
                name: String::new(),
                outcome: InstanceOutcome::Skipped,
            };
        };
        // Rows allocated for a create that never reached the provider are
        // closed so their names become reusable.
        if matches!(step, Step::Create(_)) && instance.status == InstanceStatus::Pending {
            instance.error = Some("task terminated before dispatch".to_owned());
            if instance.transition(InstanceStatus::Terminated).is_ok()
                && let Err(err) = self.repo.update_instance(instance.clone()).await
            {
                warn!(instance_id = %instance.id, error = %err, "failed to close skipped instance");
            }
        }
        InstanceReport::new(&instance, InstanceOutcome::Skipped)
    }

    fn adapter(&self, instance: &Instance) -> Result<Arc<dyn ProviderAdapter>, EngineError> {
        self.providers.get(&instance.provider).ok_or_else(|| {
            EngineError::Validation(format!(
                "provider '{}' is not registered",
                instance.provider
            ))
        })
    }

    /// Writes the fields the controller owns. A claim by another task may
    /// bump the row while the lock is held; such races are merged onto the
    /// fresh row, keeping its `last_task_id`.
    async fn save(&self, instance: Instance) -> Result<Instance, EngineError> {
        let mut pending = instance;
        for _ in 1..SAVE_ATTEMPTS {
            match self.repo.update_instance(pending.clone()).await {
                Err(err) if err.is_stale() => {
                    let current = self.repo.get_instance(&pending.id).await?;
                    debug!(
                        instance_id = %pending.id,
                        revision = current.revision,
                        "instance changed concurrently; merging"
                    );
                    pending = merge_owned_fields(current, pending);
                }
                other => return Ok(other?),
            }
        }
        Ok(self.repo.update_instance(pending).await?)
    }

    /// Records `message` on the row and reports the failure without touching
    /// its status.
    async fn report_failure(&self, mut instance: Instance, message: String) -> InstanceReport {
        warn!(instance_id = %instance.id, error = %message, "instance operation failed");
        instance.error = Some(message.clone());
        let report = InstanceReport::new(&instance, InstanceOutcome::Failed(message));
        if let Err(err) = self.save(instance).await {
            warn!(instance_id = %report.instance_id, error = %err, "failed to persist instance failure");
        }
        report
    }

    /// Records `message`, terminates the row and reports the failure.
    async fn abandon(&self, mut instance: Instance, message: String) -> InstanceReport {
        warn!(instance_id = %instance.id, error = %message, "instance operation failed");
        instance.error = Some(message.clone());
        if let Err(err) = instance.transition(InstanceStatus::Terminated) {
            warn!(instance_id = %instance.id, error = %err, "instance left in place");
        }
        let report = InstanceReport::new(&instance, InstanceOutcome::Failed(message));
        if let Err(err) = self.save(instance).await {
            warn!(instance_id = %report.instance_id, error = %err, "failed to persist instance failure");
        }
        report
    }
}

fn merge_owned_fields(mut current: Instance, ours: Instance) -> Instance {
    current.status = ours.status;
    current.provider_instance_id = ours.provider_instance_id;
    current.public_ip = ours.public_ip;
    current.payload_status = ours.payload_status;
    current.error = ours.error;
    current
}
