//! Process-local repository backed by `tokio` locks.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use super::{InstanceFilter, RepoFuture, Repository, RepositoryError, TaskFilter};
use crate::model::{
    Instance, InstanceId, NewUser, OwnerId, Project, ProjectId, SshKey, Task, TaskId, User,
};

#[derive(Debug, Default)]
struct Tables {
    projects: Vec<Project>,
    tasks: Vec<Task>,
    instances: Vec<Instance>,
    ssh_keys: Vec<SshKey>,
    users: Vec<User>,
    next_user_id: u64,
}

/// Repository that keeps every table in memory. Rows keep insertion order.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRepository {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(entity: &'static str, id: impl ToString) -> RepositoryError {
    RepositoryError::NotFound {
        entity,
        id: id.to_string(),
    }
}

fn check_revision(
    entity: &'static str,
    id: &str,
    stored: u64,
    expected: u64,
) -> Result<(), RepositoryError> {
    if stored != expected {
        return Err(RepositoryError::Stale {
            entity,
            id: id.to_owned(),
            expected,
            actual: stored,
        });
    }
    Ok(())
}

fn page<T>(rows: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    let skipped = rows.into_iter().skip(offset);
    match limit {
        Some(count) => skipped.take(count).collect(),
        None => skipped.collect(),
    }
}

impl Repository for InMemoryRepository {
    fn insert_project(&self, project: Project) -> RepoFuture<'_, Project> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            if tables
                .projects
                .iter()
                .any(|row| row.owner_id == project.owner_id && row.name == project.name)
            {
                return Err(RepositoryError::Duplicate {
                    entity: "project",
                    key: project.name,
                });
            }
            tables.projects.push(project.clone());
            Ok(project)
        })
    }

    fn get_project<'a>(&'a self, id: &'a ProjectId) -> RepoFuture<'a, Project> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            tables
                .projects
                .iter()
                .find(|row| &row.id == id)
                .cloned()
                .ok_or_else(|| not_found("project", id))
        })
    }

    fn list_projects(&self, owner_id: Option<OwnerId>) -> RepoFuture<'_, Vec<Project>> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            Ok(tables
                .projects
                .iter()
                .filter(|row| owner_id.is_none_or(|owner| row.owner_id == owner))
                .cloned()
                .collect())
        })
    }

    fn delete_project<'a>(&'a self, id: &'a ProjectId) -> RepoFuture<'a, ()> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            let before = tables.projects.len();
            tables.projects.retain(|row| &row.id != id);
            if tables.projects.len() == before {
                return Err(not_found("project", id));
            }
            Ok(())
        })
    }

    fn insert_task(&self, task: Task) -> RepoFuture<'_, Task> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            if tables.tasks.iter().any(|row| row.id == task.id) {
                return Err(RepositoryError::Duplicate {
                    entity: "task",
                    key: task.id.to_string(),
                });
            }
            tables.tasks.push(task.clone());
            Ok(task)
        })
    }

    fn get_task<'a>(&'a self, id: &'a TaskId) -> RepoFuture<'a, Task> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            tables
                .tasks
                .iter()
                .find(|row| &row.id == id)
                .cloned()
                .ok_or_else(|| not_found("task", id))
        })
    }

    fn update_task(&self, mut task: Task) -> RepoFuture<'_, Task> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            let stored = tables
                .tasks
                .iter_mut()
                .find(|row| row.id == task.id)
                .ok_or_else(|| not_found("task", &task.id))?;
            check_revision("task", &task.id, stored.revision, task.revision)?;
            task.revision = stored.revision.saturating_add(1);
            task.updated_at = Utc::now();
            *stored = task.clone();
            Ok(task)
        })
    }

    fn list_tasks<'a>(&'a self, filter: &'a TaskFilter) -> RepoFuture<'a, Vec<Task>> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            let options = filter.options;
            let rows = tables
                .tasks
                .iter()
                .rev()
                .filter(|row| filter.owner_id.is_none_or(|owner| row.owner_id == owner))
                .filter(|row| {
                    filter
                        .project_id
                        .as_ref()
                        .is_none_or(|project| &row.project_id == project)
                })
                .filter(|row| {
                    filter
                        .instance_id
                        .as_ref()
                        .is_none_or(|instance| row.targets(instance))
                })
                .filter(|row| options.action.is_none_or(|action| row.action == action))
                .filter(|row| options.status.is_none_or(|status| row.status == status))
                .cloned()
                .collect();
            Ok(page(rows, options.offset, options.limit))
        })
    }

    fn insert_instances(&self, instances: Vec<Instance>) -> RepoFuture<'_, Vec<Instance>> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            for (index, instance) in instances.iter().enumerate() {
                let clashes_with_stored = tables.instances.iter().any(|row| {
                    row.id == instance.id
                        || (row.project_id == instance.project_id
                            && row.name == instance.name
                            && row.is_active())
                });
                let clashes_in_batch = instances
                    .iter()
                    .take(index)
                    .any(|earlier| earlier.name == instance.name);
                if clashes_with_stored || clashes_in_batch {
                    return Err(RepositoryError::Duplicate {
                        entity: "instance",
                        key: instance.name.clone(),
                    });
                }
            }
            tables.instances.extend(instances.iter().cloned());
            Ok(instances)
        })
    }

    fn get_instance<'a>(&'a self, id: &'a InstanceId) -> RepoFuture<'a, Instance> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            tables
                .instances
                .iter()
                .find(|row| &row.id == id)
                .cloned()
                .ok_or_else(|| not_found("instance", id))
        })
    }

    fn update_instance(&self, mut instance: Instance) -> RepoFuture<'_, Instance> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            let stored = tables
                .instances
                .iter_mut()
                .find(|row| row.id == instance.id)
                .ok_or_else(|| not_found("instance", &instance.id))?;
            check_revision("instance", &instance.id, stored.revision, instance.revision)?;
            instance.revision = stored.revision.saturating_add(1);
            instance.updated_at = Utc::now();
            *stored = instance.clone();
            Ok(instance)
        })
    }

    fn list_instances<'a>(&'a self, filter: &'a InstanceFilter) -> RepoFuture<'a, Vec<Instance>> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            Ok(tables
                .instances
                .iter()
                .filter(|row| filter.owner_id.is_none_or(|owner| row.owner_id == owner))
                .filter(|row| {
                    filter
                        .project_id
                        .as_ref()
                        .is_none_or(|project| &row.project_id == project)
                })
                .filter(|row| filter.status.is_none_or(|status| row.status == status))
                .filter(|row| !filter.active_only || row.is_active())
                .cloned()
                .collect())
        })
    }

    fn insert_ssh_key(&self, key: SshKey) -> RepoFuture<'_, SshKey> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            if tables
                .ssh_keys
                .iter()
                .any(|row| row.owner_id == key.owner_id && row.name == key.name)
            {
                return Err(RepositoryError::Duplicate {
                    entity: "ssh key",
                    key: key.name,
                });
            }
            tables.ssh_keys.push(key.clone());
            Ok(key)
        })
    }

    fn get_ssh_key<'a>(&'a self, owner_id: OwnerId, name: &'a str) -> RepoFuture<'a, SshKey> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            tables
                .ssh_keys
                .iter()
                .find(|row| row.owner_id == owner_id && row.name == name)
                .cloned()
                .ok_or_else(|| not_found("ssh key", name))
        })
    }

    fn list_ssh_keys(&self, owner_id: Option<OwnerId>) -> RepoFuture<'_, Vec<SshKey>> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            Ok(tables
                .ssh_keys
                .iter()
                .filter(|row| owner_id.is_none_or(|owner| row.owner_id == owner))
                .cloned()
                .collect())
        })
    }

    fn delete_ssh_key<'a>(&'a self, owner_id: OwnerId, name: &'a str) -> RepoFuture<'a, ()> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            let before = tables.ssh_keys.len();
            tables
                .ssh_keys
                .retain(|row| !(row.owner_id == owner_id && row.name == name));
            if tables.ssh_keys.len() == before {
                return Err(not_found("ssh key", name));
            }
            Ok(())
        })
    }

    fn create_user(&self, user: NewUser) -> RepoFuture<'_, User> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            if tables.users.iter().any(|row| row.username == user.username) {
                return Err(RepositoryError::Duplicate {
                    entity: "user",
                    key: user.username,
                });
            }
            tables.next_user_id = tables.next_user_id.saturating_add(1);
            let created = User {
                id: OwnerId::new(tables.next_user_id),
                username: user.username,
                email: user.email,
                role: user.role,
                public_ssh_key: user.public_ssh_key,
                created_at: Utc::now(),
                revision: 0,
            };
            tables.users.push(created.clone());
            Ok(created)
        })
    }

    fn get_user(&self, id: OwnerId) -> RepoFuture<'_, User> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            tables
                .users
                .iter()
                .find(|row| row.id == id)
                .cloned()
                .ok_or_else(|| not_found("user", id))
        })
    }

    fn list_users(&self) -> RepoFuture<'_, Vec<User>> {
        Box::pin(async move { Ok(self.tables.read().await.users.clone()) })
    }

    fn delete_user(&self, id: OwnerId) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            let before = tables.users.len();
            tables.users.retain(|row| row.id != id);
            if tables.users.len() == before {
                return Err(not_found("user", id));
            }
            Ok(())
        })
    }
}
