//! Storage contract for projects, tasks, instances, keys and users.
//!
//! Updates are optimistic: a write succeeds only when the caller's copy
//! carries the stored `revision`, and the repository bumps it. Callers that
//! lose the race receive [`RepositoryError::Stale`] and re-read.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::model::{
    Instance, InstanceId, InstanceStatus, NewUser, OwnerId, Project, ProjectId, SshKey, Task,
    TaskAction, TaskId, TaskStatus, User,
};

mod memory;

pub use memory::InMemoryRepository;

/// Future returned by repository operations.
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// Paging and attribute filters shared by list queries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ListOptions {
    /// Only tasks with this action.
    pub action: Option<TaskAction>,
    /// Only tasks with this status.
    pub status: Option<TaskStatus>,
    /// Maximum rows returned.
    pub limit: Option<usize>,
    /// Rows skipped before the first returned row.
    pub offset: usize,
}

/// Task list query. Results are ordered newest first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskFilter {
    /// Restrict to one owner.
    pub owner_id: Option<OwnerId>,
    /// Restrict to one project.
    pub project_id: Option<ProjectId>,
    /// Restrict to tasks targeting this instance.
    pub instance_id: Option<InstanceId>,
    /// Paging and attribute filters.
    pub options: ListOptions,
}

/// Instance list query. Results are ordered oldest first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceFilter {
    /// Restrict to one owner.
    pub owner_id: Option<OwnerId>,
    /// Restrict to one project.
    pub project_id: Option<ProjectId>,
    /// Restrict to one status.
    pub status: Option<InstanceStatus>,
    /// Exclude terminated instances.
    pub active_only: bool,
}

/// Storage operations used by the engine.
pub trait Repository: Send + Sync {
    /// Stores a new project.
    fn insert_project(&self, project: Project) -> RepoFuture<'_, Project>;
    /// Fetches a project by id.
    fn get_project<'a>(&'a self, id: &'a ProjectId) -> RepoFuture<'a, Project>;
    /// Lists projects, optionally for one owner.
    fn list_projects(&self, owner_id: Option<OwnerId>) -> RepoFuture<'_, Vec<Project>>;
    /// Removes a project.
    fn delete_project<'a>(&'a self, id: &'a ProjectId) -> RepoFuture<'a, ()>;

    /// Stores a new task.
    fn insert_task(&self, task: Task) -> RepoFuture<'_, Task>;
    /// Fetches a task by id.
    fn get_task<'a>(&'a self, id: &'a TaskId) -> RepoFuture<'a, Task>;
    /// Writes a task if its revision is current.
    fn update_task(&self, task: Task) -> RepoFuture<'_, Task>;
    /// Lists tasks matching `filter`.
    fn list_tasks<'a>(&'a self, filter: &'a TaskFilter) -> RepoFuture<'a, Vec<Task>>;

    /// Stores a batch of new instances atomically.
    fn insert_instances(&self, instances: Vec<Instance>) -> RepoFuture<'_, Vec<Instance>>;
    /// Fetches an instance by id.
    fn get_instance<'a>(&'a self, id: &'a InstanceId) -> RepoFuture<'a, Instance>;
    /// Writes an instance if its revision is current.
    fn update_instance(&self, instance: Instance) -> RepoFuture<'_, Instance>;
    /// Lists instances matching `filter`.
    fn list_instances<'a>(&'a self, filter: &'a InstanceFilter) -> RepoFuture<'a, Vec<Instance>>;

    /// Stores a new key.
    fn insert_ssh_key(&self, key: SshKey) -> RepoFuture<'_, SshKey>;
    /// Fetches a key by owner and name.
    fn get_ssh_key<'a>(&'a self, owner_id: OwnerId, name: &'a str) -> RepoFuture<'a, SshKey>;
    /// Lists keys, optionally for one owner.
    fn list_ssh_keys(&self, owner_id: Option<OwnerId>) -> RepoFuture<'_, Vec<SshKey>>;
    /// Removes a key by owner and name.
    fn delete_ssh_key<'a>(&'a self, owner_id: OwnerId, name: &'a str) -> RepoFuture<'a, ()>;

    /// Registers a user and assigns its id.
    fn create_user(&self, user: NewUser) -> RepoFuture<'_, User>;
    /// Fetches a user by id.
    fn get_user(&self, id: OwnerId) -> RepoFuture<'_, User>;
    /// Lists all users.
    fn list_users(&self) -> RepoFuture<'_, Vec<User>>;
    /// Removes a user.
    fn delete_user(&self, id: OwnerId) -> RepoFuture<'_, ()>;
}

/// Errors raised by repositories.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RepositoryError {
    /// No row with the given key.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Looked-up key.
        id: String,
    },
    /// A uniqueness constraint was violated.
    #[error("{entity} '{key}' already exists")]
    Duplicate {
        /// Entity kind.
        entity: &'static str,
        /// Conflicting key.
        key: String,
    },
    /// The row changed since the caller read it.
    #[error("{entity} {id} was modified concurrently (expected revision {expected}, found {actual})")]
    Stale {
        /// Entity kind.
        entity: &'static str,
        /// Row key.
        id: String,
        /// Revision the caller held.
        expected: u64,
        /// Revision in storage.
        actual: u64,
    },
    /// The backing store failed.
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// Returns `true` for lost optimistic races.
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}
