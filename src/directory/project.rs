//! Project management.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::error::EngineError;
use crate::model::{OwnerId, Project, ProjectId};
use crate::repository::{InstanceFilter, Repository};

/// Creates, reads and deletes projects on behalf of an owner.
#[derive(Clone)]
pub struct ProjectService {
    repo: Arc<dyn Repository>,
}

impl std::fmt::Debug for ProjectService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectService").finish_non_exhaustive()
    }
}

impl ProjectService {
    /// Creates a service over `repo`.
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Creates a project named `name` for `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a blank name and
    /// [`EngineError::Conflict`] when the owner already has a project with
    /// that name.
    pub async fn create(
        &self,
        owner: OwnerId,
        name: &str,
        description: &str,
        config: Value,
    ) -> Result<Project, EngineError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Validation("project name must not be empty".to_owned()));
        }
        let project = self
            .repo
            .insert_project(Project::new(owner, trimmed, description.trim(), config))
            .await?;
        info!(project_id = %project.id, name = %project.name, owner = %owner, "project created");
        Ok(project)
    }

    /// Fetches a project visible to `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for a missing or foreign project.
    pub async fn get(&self, owner: OwnerId, id: &ProjectId) -> Result<Project, EngineError> {
        let project = self.repo.get_project(id).await?;
        if !owner.can_access(project.owner_id) {
            return Err(EngineError::not_found("project", id));
        }
        Ok(project)
    }

    /// Lists the owner's projects, or every project for the admin.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn list(&self, owner: OwnerId) -> Result<Vec<Project>, EngineError> {
        let scope = (!owner.is_admin()).then_some(owner);
        Ok(self.repo.list_projects(scope).await?)
    }

    /// Deletes a project that has no active instances.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for a missing or foreign project and
    /// [`EngineError::Conflict`] while instances are not terminated.
    pub async fn delete(&self, owner: OwnerId, id: &ProjectId) -> Result<(), EngineError> {
        let project = self.get(owner, id).await?;
        let active = self
            .repo
            .list_instances(&InstanceFilter {
                project_id: Some(project.id.clone()),
                active_only: true,
                ..InstanceFilter::default()
            })
            .await?;
        if !active.is_empty() {
            return Err(EngineError::Conflict(format!(
                "project {} still has {} active instance(s)",
                project.name,
                active.len()
            )));
        }
        self.repo.delete_project(&project.id).await?;
        info!(project_id = %project.id, "project deleted");
        Ok(())
    }
}
