//! SSH key registry.

use std::sync::Arc;

use tracing::info;

use crate::error::EngineError;
use crate::model::{OwnerId, SshKey};
use crate::repository::Repository;

const KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// Registers and looks up public keys by `(owner, name)`.
#[derive(Clone)]
pub struct SshKeyService {
    repo: Arc<dyn Repository>,
}

impl std::fmt::Debug for SshKeyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshKeyService").finish_non_exhaustive()
    }
}

impl SshKeyService {
    /// Creates a service over `repo`.
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Registers `public_key` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a blank name or a line that
    /// is not an OpenSSH public key, and [`EngineError::Conflict`] when the
    /// name is taken.
    pub async fn create(
        &self,
        owner: OwnerId,
        name: &str,
        public_key: &str,
    ) -> Result<SshKey, EngineError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Validation("ssh key name must not be empty".to_owned()));
        }
        let key = validate_public_key(public_key)?;
        let stored = self.repo.insert_ssh_key(SshKey::new(owner, trimmed, key)).await?;
        info!(owner = %owner, name = %stored.name, "ssh key registered");
        Ok(stored)
    }

    /// Fetches the owner's key called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when no such key exists.
    pub async fn get(&self, owner: OwnerId, name: &str) -> Result<SshKey, EngineError> {
        Ok(self.repo.get_ssh_key(owner, name.trim()).await?)
    }

    /// Lists the owner's keys, or every key for the admin.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn list(&self, owner: OwnerId) -> Result<Vec<SshKey>, EngineError> {
        let scope = (!owner.is_admin()).then_some(owner);
        Ok(self.repo.list_ssh_keys(scope).await?)
    }

    /// Removes the owner's key called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when no such key exists.
    pub async fn delete(&self, owner: OwnerId, name: &str) -> Result<(), EngineError> {
        self.repo.delete_ssh_key(owner, name.trim()).await?;
        info!(owner = %owner, name, "ssh key deleted");
        Ok(())
    }
}

/// Accepts `<type> <base64 body> [comment]` with a known key type.
fn validate_public_key(line: &str) -> Result<&str, EngineError> {
    let trimmed = line.trim();
    let mut fields = trimmed.split_whitespace();
    let (Some(kind), Some(body)) = (fields.next(), fields.next()) else {
        return Err(EngineError::Validation(
            "public key must have the form '<type> <key> [comment]'".to_owned(),
        ));
    };
    if !KEY_TYPES.contains(&kind) {
        return Err(EngineError::Validation(format!(
            "unsupported public key type '{kind}'"
        )));
    }
    let base64 = |ch: char| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '/' | '=');
    if !body.chars().all(base64) {
        return Err(EngineError::Validation("public key body is not base64".to_owned()));
    }
    Ok(trimmed)
}
