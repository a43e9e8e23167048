//! Wires the repository, providers, payload deployer and worker pool into a
//! running engine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::EngineConfig;
use crate::directory::{ProjectService, SshKeyService, UserService};
use crate::error::EngineError;
use crate::lifecycle::InstanceLifecycleController;
use crate::payload::PayloadDeployer;
use crate::provider::ProviderRegistry;
use crate::repository::Repository;
use crate::task::{Recovery, TaskManager, TaskRunner, WebhookDispatcher, WorkerPool, recover};
use crate::webhook::WebhookNotifier;

/// Collaborators injected into [`Engine::start`].
pub struct EngineParts {
    /// Storage for every record.
    pub repo: Arc<dyn Repository>,
    /// Provider adapters by name.
    pub providers: ProviderRegistry,
    /// SSH payload deployer.
    pub deployer: PayloadDeployer,
    /// Task completion callbacks.
    pub notifier: Arc<dyn WebhookNotifier>,
}

/// A started engine: services plus the worker pool draining the queue.
#[derive(Debug)]
pub struct Engine {
    tasks: TaskManager,
    projects: ProjectService,
    ssh_keys: SshKeyService,
    users: UserService,
    workers: WorkerPool,
    recovery: Recovery,
}

impl Engine {
    /// Validates `config`, spawns the workers and recovers tasks left over by
    /// a previous process.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for an invalid configuration and
    /// propagates repository failures raised during recovery.
    pub async fn start(config: &EngineConfig, parts: EngineParts) -> Result<Self, EngineError> {
        config.validate()?;
        let EngineParts {
            repo,
            providers,
            deployer,
            notifier,
        } = parts;

        let providers = Arc::new(providers);
        let retry = config.retry_policy();
        let controller = InstanceLifecycleController::new(
            Arc::clone(&repo),
            Arc::clone(&providers),
            Arc::new(deployer),
            config.lifecycle_settings(),
        );
        let webhooks = WebhookDispatcher::new(Arc::clone(&repo), notifier, retry);
        let runner = TaskRunner::new(Arc::clone(&repo), controller, webhooks.clone());

        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let workers = WorkerPool::spawn(&runner, receiver, config.workers);
        let recovery = recover(&runner, &sender).await?;
        let tasks = TaskManager::new(Arc::clone(&repo), Arc::clone(&providers), sender, webhooks);

        info!(
            workers = config.workers,
            providers = ?providers.names(),
            "engine started"
        );
        Ok(Self {
            tasks,
            projects: ProjectService::new(Arc::clone(&repo)),
            ssh_keys: SshKeyService::new(Arc::clone(&repo)),
            users: UserService::new(repo),
            workers,
            recovery,
        })
    }

    /// Task intake and queries.
    #[must_use]
    pub const fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Project management.
    #[must_use]
    pub const fn projects(&self) -> &ProjectService {
        &self.projects
    }

    /// SSH key registry.
    #[must_use]
    pub const fn ssh_keys(&self) -> &SshKeyService {
        &self.ssh_keys
    }

    /// User accounts.
    #[must_use]
    pub const fn users(&self) -> &UserService {
        &self.users
    }

    /// What start-up recovery did.
    #[must_use]
    pub const fn recovery(&self) -> Recovery {
        self.recovery
    }

    /// Stops the workers after their current tasks and waits for them.
    pub async fn shutdown(self) {
        self.workers.shutdown();
        self.workers.join().await;
        info!("engine stopped");
    }
}
