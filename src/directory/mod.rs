//! Owner-scoped management of projects, SSH keys and users.

mod project;
mod ssh_key;
mod user;

pub use project::ProjectService;
pub use ssh_key::SshKeyService;
pub use user::UserService;
