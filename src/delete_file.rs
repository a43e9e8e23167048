//! Delete files: the record a provisioning run leaves behind so a later
//! teardown can find its instances again.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{
    Instance, InstanceId, InstanceRequest, InstanceStatus, OwnerId, Project, ProjectId, Task,
    TaskId,
};

const DELETE_FILE_SUFFIX: &str = "delete.json";

/// Errors raised while reading or writing a delete file.
#[derive(Debug, Error)]
pub enum DeleteFileError {
    /// File system access failed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// The file is not a valid delete file.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// The path has no file name component.
    #[error("delete file path {path} is missing a filename")]
    MissingFileName {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

/// Project identity stored in a delete file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeleteFileProject {
    /// Project id.
    pub id: ProjectId,
    /// Project name.
    pub name: String,
}

/// One provisioned instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeleteFileEntry {
    /// Instance id.
    pub id: InstanceId,
    /// Instance name.
    pub name: String,
    /// Provider the server lives on.
    pub provider: String,
    /// Server id at the provider, if one was assigned.
    pub provider_instance_id: Option<String>,
    /// Region.
    pub region: String,
    /// Size or package.
    pub size: String,
    /// Image or OS template.
    pub image: String,
    /// Key the instance was created with.
    pub ssh_key_name: String,
    /// Status when the file was written.
    pub status: InstanceStatus,
}

/// Contents of a delete file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeleteFile {
    /// Owning project.
    pub project: DeleteFileProject,
    /// Create task that produced the instances.
    pub task_id: TaskId,
    /// Instances created by the task.
    pub instances: Vec<DeleteFileEntry>,
}

impl DeleteFile {
    /// Builds a delete file from a finished create task.
    #[must_use]
    pub fn from_task(project: &Project, task: &Task, instances: &[Instance]) -> Self {
        Self {
            project: DeleteFileProject {
                id: project.id.clone(),
                name: project.name.clone(),
            },
            task_id: task.id.clone(),
            instances: instances
                .iter()
                .map(|instance| DeleteFileEntry {
                    id: instance.id.clone(),
                    name: instance.name.clone(),
                    provider: instance.provider.clone(),
                    provider_instance_id: instance.provider_instance_id.clone(),
                    region: instance.region.clone(),
                    size: instance.size.clone(),
                    image: instance.image.clone(),
                    ssh_key_name: instance.ssh_key_name.clone(),
                    status: instance.status,
                })
                .collect(),
        }
    }

    /// Delete file location next to `request`: `<stem>.delete.json`.
    #[must_use]
    pub fn default_path(request: &Utf8Path) -> Utf8PathBuf {
        let stem = request.file_stem().unwrap_or("provisio");
        request.with_file_name(format!("{stem}.{DELETE_FILE_SUFFIX}"))
    }

    /// Rebuilds the project and instance rows under `owner` so a fresh
    /// repository can tear them down. Instances with a provider id come back
    /// `ready`; the rest stay `pending`.
    #[must_use]
    pub fn restore(&self, owner: OwnerId) -> (Project, Vec<Instance>) {
        let mut project = Project::new(owner, self.project.name.clone(), "", Value::Null);
        project.id = self.project.id.clone();

        let instances = self
            .instances
            .iter()
            .map(|entry| {
                let request = InstanceRequest::new(
                    entry.provider.clone(),
                    entry.region.clone(),
                    entry.size.clone(),
                    entry.image.clone(),
                    entry.ssh_key_name.clone(),
                );
                let mut instance = Instance::pending(
                    owner,
                    project.id.clone(),
                    self.task_id.clone(),
                    entry.name.clone(),
                    &request,
                );
                instance.id = entry.id.clone();
                instance.last_task_id = None;
                instance.provider_instance_id = entry.provider_instance_id.clone();
                instance.status = if entry.status == InstanceStatus::Terminated {
                    InstanceStatus::Terminated
                } else if instance.provider_instance_id.is_some() {
                    InstanceStatus::Ready
                } else {
                    InstanceStatus::Pending
                };
                instance
            })
            .collect();
        (project, instances)
    }

    /// Ids and names of instances still worth tearing down.
    #[must_use]
    pub fn live_instance_ids(&self) -> Vec<String> {
        self.instances
            .iter()
            .filter(|entry| entry.status != InstanceStatus::Terminated)
            .map(|entry| entry.id.to_string())
            .collect()
    }

    /// Writes the file to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`DeleteFileError`] when the directory or file cannot be
    /// written.
    pub fn write(&self, path: &Utf8Path) -> Result<(), DeleteFileError> {
        let (parent, file_name) = split(path)?;
        Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| {
            DeleteFileError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        let dir = open_dir(parent)?;
        let rendered =
            serde_json::to_string_pretty(self).map_err(|err| DeleteFileError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        dir.write(file_name, format!("{rendered}\n"))
            .map_err(|err| DeleteFileError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
    }

    /// Reads the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DeleteFileError`] when the file is missing or malformed.
    pub fn read(path: &Utf8Path) -> Result<Self, DeleteFileError> {
        let (parent, file_name) = split(path)?;
        let contents = open_dir(parent)?
            .read_to_string(file_name)
            .map_err(|err| DeleteFileError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        serde_json::from_str(&contents).map_err(|err| DeleteFileError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), DeleteFileError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| DeleteFileError::MissingFileName {
            path: path.to_path_buf(),
        })?;
    Ok((parent, file_name))
}

fn open_dir(parent: &Utf8Path) -> Result<Dir, DeleteFileError> {
    Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| DeleteFileError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })
}
