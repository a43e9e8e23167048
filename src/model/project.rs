//! Projects and the account records that scope them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{OwnerId, ProjectId, SshKeyId};
use super::status::Role;

/// Grouping of instances and tasks owned by a single user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Unique identifier.
    pub id: ProjectId,
    /// Owning user.
    pub owner_id: OwnerId,
    /// Name, unique per owner.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Opaque settings document.
    pub config: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter.
    pub revision: u64,
}

impl Project {
    /// Creates a project owned by `owner_id`.
    #[must_use]
    pub fn new(
        owner_id: OwnerId,
        name: impl Into<String>,
        description: impl Into<String>,
        config: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::generate(),
            owner_id,
            name: name.into(),
            description: description.into(),
            config,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }
}

/// Public key registered under a name for an owner.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SshKey {
    /// Unique identifier.
    pub id: SshKeyId,
    /// Owning user.
    pub owner_id: OwnerId,
    /// Name referenced by instance requests, unique per owner.
    pub name: String,
    /// OpenSSH public key line.
    pub public_key: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency counter.
    pub revision: u64,
}

impl SshKey {
    /// Creates a key record.
    #[must_use]
    pub fn new(owner_id: OwnerId, name: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            id: SshKeyId::generate(),
            owner_id,
            name: name.into(),
            public_key: public_key.into(),
            created_at: Utc::now(),
            revision: 0,
        }
    }
}

/// Fields supplied when registering a user; the repository assigns the id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewUser {
    /// Login name, unique.
    pub username: String,
    /// Contact address.
    pub email: String,
    /// Granted role.
    pub role: Role,
    /// Optional key installed on instances the user creates.
    pub public_ssh_key: Option<String>,
}

/// A registered account.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Numeric identity, never [`super::ADMIN_ID`].
    pub id: OwnerId,
    /// Login name.
    pub username: String,
    /// Contact address.
    pub email: String,
    /// Granted role.
    pub role: Role,
    /// Optional key installed on instances the user creates.
    pub public_ssh_key: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency counter.
    pub revision: u64,
}

impl User {
    /// Identity to present when this user calls the engine. Administrators
    /// act through the reserved sentinel.
    #[must_use]
    pub const fn acting_id(&self) -> OwnerId {
        match self.role {
            Role::Admin => super::ADMIN_ID,
            Role::User => self.id,
        }
    }
}
