use crate::oci::Spec;
use crate::RuntimeError;
use berth_schema::Labels;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// What the supervisor persists for each container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub image: String,
    pub labels: Labels,
    pub spec: Spec,
    pub created_at: DateTime<Utc>,
    /// Snapshot key of the writable layer, empty for `--rootfs` containers.
    #[serde(default)]
    pub snapshot: String,
}

#[derive(Debug, Clone)]
pub struct NewContainer {
    pub id: String,
    pub image: String,
    pub labels: Labels,
    pub spec: Spec,
    /// Use `spec.root.path` as-is instead of preparing a snapshot.
    pub rootfs_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Unknown,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl TaskStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub status: TaskStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

/// Process defaults carried by an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub user: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            entrypoint: Vec::new(),
            cmd: vec!["/bin/sh".to_owned()],
            env: vec![crate::oci::DEFAULT_PATH_ENV.to_owned()],
            working_dir: String::new(),
            user: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub name: String,
    pub rootfs: PathBuf,
    pub digest: String,
    #[serde(default)]
    pub config: ImageConfig,
}

/// Where task output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskIo {
    /// Share the caller's stdio; the caller waits for exit.
    Foreground { tty: bool, stdin: bool },
    /// Pipe stdout and stderr into a logging process started per stream:
    /// `argv... --stream stdout|stderr`.
    Logger { argv: Vec<String> },
    Null,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub interactive: bool,
    pub detach: bool,
}

/// Container filter for [`Supervisor::containers`]. All conditions must hold.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub labels: Labels,
    pub id_prefix: Option<String>,
}

impl ContainerFilter {
    pub fn label(key: &str, value: &str) -> Self {
        let mut labels = Labels::new();
        labels.insert(key.to_owned(), value.to_owned());
        Self {
            labels,
            id_prefix: None,
        }
    }

    pub fn matches(&self, rec: &ContainerRecord) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !rec.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| rec.labels.get(k).is_some_and(|have| have == v))
    }
}

/// Client interface to the container supervisor.
///
/// Every task method addresses the task by its container id. A container
/// without a task reports [`RuntimeError::NotFound`] from the task methods.
pub trait Supervisor: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerRecord>, RuntimeError>;

    fn create_container(&self, new: NewContainer) -> Result<ContainerRecord, RuntimeError>;

    fn get_container(&self, id: &str) -> Result<ContainerRecord, RuntimeError>;

    fn update_labels(&self, id: &str, labels: &Labels) -> Result<(), RuntimeError>;

    /// Delete the record and its snapshot. The task must already be gone.
    fn delete_container(&self, id: &str) -> Result<(), RuntimeError>;

    fn image(&self, reference: &str) -> Result<ImageInfo, RuntimeError>;

    fn pull(&self, reference: &str) -> Result<ImageInfo, RuntimeError>;

    /// Download image content without unpacking it.
    fn fetch(&self, reference: &str) -> Result<(), RuntimeError>;

    fn images(&self) -> Result<Vec<ImageInfo>, RuntimeError>;

    fn remove_image(&self, reference: &str) -> Result<(), RuntimeError>;

    fn task_status(&self, id: &str) -> Result<TaskInfo, RuntimeError>;

    /// Create and start the task. Returns the init pid.
    fn start_task(&self, id: &str, io: &TaskIo) -> Result<u32, RuntimeError>;

    fn kill_task(&self, id: &str, signal: i32) -> Result<(), RuntimeError>;

    /// Wait for the task to exit. `None` timeout waits forever; a timeout
    /// that elapses returns `Ok(None)`.
    fn wait_task(&self, id: &str, timeout: Option<Duration>)
        -> Result<Option<i32>, RuntimeError>;

    /// Delete the task, running poststop hooks. `force` kills a live process first.
    fn delete_task(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    fn pause_task(&self, id: &str) -> Result<(), RuntimeError>;

    fn resume_task(&self, id: &str) -> Result<(), RuntimeError>;

    fn exec(&self, id: &str, req: &ExecRequest) -> Result<i32, RuntimeError>;
}

/// Construction parameters shared by every supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub data_root: PathBuf,
    pub namespace: String,
    pub runtime: String,
    pub rootless: bool,
    pub systemd_cgroup: bool,
    /// CA directories handed to the image fetcher.
    pub hosts_dir: Vec<PathBuf>,
}

pub fn select_supervisor(
    name: &str,
    config: &SupervisorConfig,
) -> Result<Box<dyn Supervisor>, RuntimeError> {
    match name {
        "runc" => Ok(Box::new(crate::runc::RuncSupervisor::new(config.clone()))),
        "mock" => Ok(Box::new(crate::mock::MockSupervisor::persistent(
            config
                .data_root
                .join("supervisor")
                .join(&config.namespace)
                .join("mock.json"),
        ))),
        other => Err(RuntimeError::SupervisorUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            data_root: PathBuf::from("/tmp/berth-test"),
            namespace: "default".to_owned(),
            runtime: "runc".to_owned(),
            rootless: false,
            systemd_cgroup: false,
            hosts_dir: Vec::new(),
        }
    }

    #[test]
    fn select_valid_supervisors() {
        assert!(select_supervisor("runc", &config()).is_ok());
        assert!(select_supervisor("mock", &config()).is_ok());
    }

    #[test]
    fn select_invalid_supervisor_fails() {
        assert!(select_supervisor("containerd", &config()).is_err());
    }

    #[test]
    fn filter_matches_labels_and_prefix() {
        let mut labels = Labels::new();
        labels.insert("p".to_owned(), "x".to_owned());
        let rec = ContainerRecord {
            id: "abcdef".to_owned(),
            image: "alpine".to_owned(),
            labels,
            spec: Spec::default(),
            created_at: Utc::now(),
            snapshot: String::new(),
        };
        assert!(ContainerFilter::label("p", "x").matches(&rec));
        assert!(!ContainerFilter::label("p", "y").matches(&rec));
        let f = ContainerFilter {
            id_prefix: Some("abc".to_owned()),
            ..ContainerFilter::default()
        };
        assert!(f.matches(&rec));
        let f = ContainerFilter {
            id_prefix: Some("zzz".to_owned()),
            ..ContainerFilter::default()
        };
        assert!(!f.matches(&rec));
    }

    #[test]
    fn status_parse_display() {
        for s in ["created", "running", "paused", "stopped"] {
            assert_eq!(TaskStatus::parse(s).to_string(), s);
        }
        assert_eq!(TaskStatus::parse("weird"), TaskStatus::Unknown);
    }
}
