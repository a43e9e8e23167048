//! Status enums and the transition rules between their values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{InstanceId, TaskId};

/// Raised when a string does not name a known enum value.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    /// Name of the enum being parsed.
    pub kind: &'static str,
    /// Rejected input.
    pub value: String,
}

macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Returns the persisted string form.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: stringify!($name),
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

/// Lifecycle of a [`crate::model::Task`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted but not yet picked up by a worker.
    #[default]
    Pending,
    /// A worker is executing the task.
    Running,
    /// Finished with at least one successful instance.
    Completed,
    /// Finished without any successful instance.
    Failed,
    /// Cancelled by a caller.
    Terminated,
}

wire_enum!(TaskStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Terminated => "terminated",
});

impl TaskStatus {
    /// Terminal statuses never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    /// Pending and running tasks hold their target instances.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Returns `true` when `next` is a legal successor.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed | Self::Terminated)
                | (Self::Running, Self::Completed | Self::Failed | Self::Terminated)
        )
    }
}

/// Lifecycle of a provisioned [`crate::model::Instance`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// State could not be determined.
    #[default]
    Unknown,
    /// Row exists; provider not contacted yet.
    Pending,
    /// Provider accepted the create call.
    Provisioning,
    /// Provider reports the server as built.
    Created,
    /// Reachable with a public address.
    Ready,
    /// Torn down or discarded.
    Terminated,
}

wire_enum!(InstanceStatus {
    Unknown => "unknown",
    Pending => "pending",
    Provisioning => "provisioning",
    Created => "created",
    Ready => "ready",
    Terminated => "terminated",
});

impl InstanceStatus {
    const fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Pending => 1,
            Self::Provisioning => 2,
            Self::Created => 3,
            Self::Ready => 4,
            Self::Terminated => 5,
        }
    }

    /// Returns `true` once the instance has been torn down.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Statuses only move forward; `terminated` is reachable from anywhere
    /// and absorbs everything after it.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(next, Self::Terminated) || next.rank() > self.rank()
    }
}

/// Progress of the optional payload on an instance.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadStatus {
    /// No payload on the instance.
    #[default]
    None,
    /// Copy in flight.
    PendingCopy,
    /// Copy finished.
    Copied,
    /// Copy gave up.
    CopyFailed,
    /// Execution in flight.
    PendingExecution,
    /// Execution exited zero.
    Executed,
    /// Execution exited non-zero or could not run.
    ExecutionFailed,
}

wire_enum!(PayloadStatus {
    None => "none",
    PendingCopy => "pending_copy",
    Copied => "copied",
    CopyFailed => "copy_failed",
    PendingExecution => "pending_execution",
    Executed => "executed",
    ExecutionFailed => "execution_failed",
});

impl PayloadStatus {
    /// Returns `true` for either failure state.
    #[must_use]
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::CopyFailed | Self::ExecutionFailed)
    }

    /// Returns `true` when `next` is a legal successor. Failed steps may be
    /// retried, and settled states may be cleared back to `none` when the
    /// upload is deleted.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::None | Self::CopyFailed, Self::PendingCopy)
                | (Self::PendingCopy, Self::Copied | Self::CopyFailed)
                | (Self::Copied | Self::ExecutionFailed, Self::PendingExecution)
                | (Self::PendingExecution, Self::Executed | Self::ExecutionFailed)
                | (
                    Self::Copied | Self::CopyFailed | Self::Executed | Self::ExecutionFailed,
                    Self::None
                )
        )
    }
}

/// Kind of work a [`crate::model::Task`] performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// Provision a batch of instances.
    CreateInstances,
    /// Tear down existing instances.
    TerminateInstances,
    /// Remove an uploaded payload from ready instances.
    DeleteUpload,
}

wire_enum!(TaskAction {
    CreateInstances => "create_instances",
    TerminateInstances => "terminate_instances",
    DeleteUpload => "delete_upload",
});

/// Role carried by a [`crate::model::User`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Scoped to owned records.
    #[default]
    User,
    /// Sees every record.
    Admin,
}

wire_enum!(Role {
    User => "user",
    Admin => "admin",
});

/// Raised when a record is asked to make an illegal status move.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransitionError {
    /// Illegal task status move.
    #[error("task {task_id} cannot move from {from} to {to}")]
    Task {
        /// Task being updated.
        task_id: TaskId,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },
    /// Illegal instance status move.
    #[error("instance {instance_id} cannot move from {from} to {to}")]
    Instance {
        /// Instance being updated.
        instance_id: InstanceId,
        /// Current status.
        from: InstanceStatus,
        /// Requested status.
        to: InstanceStatus,
    },
    /// Illegal payload status move.
    #[error("instance {instance_id} payload cannot move from {from} to {to}")]
    Payload {
        /// Instance being updated.
        instance_id: InstanceId,
        /// Current payload status.
        from: PayloadStatus,
        /// Requested payload status.
        to: PayloadStatus,
    },
    /// Payload work attempted before the instance was reachable.
    #[error("instance {instance_id} is {status}; payload steps need a ready instance")]
    NotReady {
        /// Instance being updated.
        instance_id: InstanceId,
        /// Current instance status.
        status: InstanceStatus,
    },
}
