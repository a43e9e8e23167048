//! User accounts.

use std::sync::Arc;

use tracing::info;

use crate::error::EngineError;
use crate::model::{NewUser, OwnerId, User};
use crate::repository::Repository;

/// Registers, reads and removes users.
#[derive(Clone)]
pub struct UserService {
    repo: Arc<dyn Repository>,
}

impl std::fmt::Debug for UserService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserService").finish_non_exhaustive()
    }
}

impl UserService {
    /// Creates a service over `repo`.
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Registers a user.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a blank username or an email
    /// without a local part and domain, and [`EngineError::Conflict`] for a
    /// taken username.
    pub async fn create(&self, user: NewUser) -> Result<User, EngineError> {
        let username = user.username.trim().to_owned();
        if username.is_empty() || username.chars().any(char::is_whitespace) {
            return Err(EngineError::Validation(
                "username must be non-empty and contain no whitespace".to_owned(),
            ));
        }
        let email = user.email.trim().to_owned();
        if !plausible_email(&email) {
            return Err(EngineError::Validation(format!("invalid email address '{email}'")));
        }
        let created = self
            .repo
            .create_user(NewUser {
                username,
                email,
                ..user
            })
            .await?;
        info!(user_id = %created.id, username = %created.username, "user created");
        Ok(created)
    }

    /// Fetches a user.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub async fn get(&self, id: OwnerId) -> Result<User, EngineError> {
        Ok(self.repo.get_user(id).await?)
    }

    /// Lists every user.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn list(&self) -> Result<Vec<User>, EngineError> {
        Ok(self.repo.list_users().await?)
    }

    /// Removes a user. The admin sentinel cannot be removed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for the admin sentinel and
    /// [`EngineError::NotFound`] for an unknown id.
    pub async fn delete(&self, id: OwnerId) -> Result<(), EngineError> {
        if id.is_admin() {
            return Err(EngineError::Validation(
                "the admin account cannot be deleted".to_owned(),
            ));
        }
        self.repo.delete_user(id).await?;
        info!(user_id = %id, "user deleted");
        Ok(())
    }
}

fn plausible_email(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain
            .split('.')
            .filter(|label| !label.is_empty())
            .count()
            >= 2
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !address.chars().any(char::is_whitespace)
}
