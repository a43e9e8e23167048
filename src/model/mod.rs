//! Persistent records, their identifiers and the status machines that guard
//! them.

mod ids;
mod instance;
mod project;
mod request;
mod status;
mod task;

pub use ids::{ADMIN_ID, InstanceId, OwnerId, ProjectId, SshKeyId, TaskId};
pub use instance::Instance;
pub use project::{NewUser, Project, SshKey, User};
pub use request::{
    CreateInstancesRequest, DeleteUploadRequest, InstanceRequest, MAX_BATCH_SIZE, PayloadSpec,
    RequestError, Resources, TaskRequest, TerminateInstancesRequest,
};
pub use status::{
    InstanceStatus, ParseEnumError, PayloadStatus, Role, TaskAction, TaskStatus, TransitionError,
};
pub use task::Task;

#[cfg(test)]
mod tests;
