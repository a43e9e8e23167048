//! Core library for the provisio instance lifecycle engine.
//!
//! Requests against a project become durable tasks. Workers hand each task's
//! batch to the lifecycle controller, which drives instances through a
//! pluggable provider adapter (`pending → provisioning → created → ready`,
//! or `terminated`) and then deploys an optional payload over SSH. The task
//! manager folds per-instance outcomes into the task's final status.

pub mod config;
pub mod delete_file;
pub mod directory;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod payload;
pub mod provider;
pub mod repository;
pub mod retry;
pub mod task;
pub mod test_support;
pub mod webhook;

pub use config::{ConfigError, EngineConfig};
pub use delete_file::{DeleteFile, DeleteFileEntry, DeleteFileError};
pub use directory::{ProjectService, SshKeyService, UserService};
pub use engine::{Engine, EngineParts};
pub use error::EngineError;
pub use lifecycle::{
    BatchOutcome, InstanceLifecycleController, InstanceOutcome, InstanceReport, LifecycleSettings,
};
pub use model::{
    ADMIN_ID, CreateInstancesRequest, DeleteUploadRequest, Instance, InstanceId, InstanceRequest,
    InstanceStatus, OwnerId, PayloadSpec, PayloadStatus, Project, ProjectId, SshKey, Task,
    TaskAction, TaskId, TaskStatus, TerminateInstancesRequest,
};
pub use payload::{PayloadConfig, PayloadDeployer, PayloadError};
pub use provider::{ProviderAdapter, ProviderError, ProviderRegistry};
pub use repository::{
    InMemoryRepository, InstanceFilter, ListOptions, Repository, RepositoryError, TaskFilter,
};
pub use retry::RetryPolicy;
pub use task::{Recovery, TaskManager, TaskSummary, WorkerPool};
pub use webhook::{HttpWebhookNotifier, WebhookError, WebhookNotifier};
