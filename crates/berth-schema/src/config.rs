//! `berth.toml` loading and setting resolution.
//!
//! Settings are layered: built-in defaults, then the TOML file, then
//! environment variables. Command-line flags are applied last by the CLI.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid argument: invalid config {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid argument: {0}")]
    Invalid(String),
}

/// The on-disk `berth.toml`. Every key is optional; unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub debug: Option<bool>,
    pub namespace: Option<String>,
    pub data_root: Option<PathBuf>,
    pub cni_path: Option<PathBuf>,
    pub cni_netconfpath: Option<PathBuf>,
    pub cgroup_manager: Option<String>,
    pub runtime: Option<String>,
    pub supervisor: Option<String>,
    pub builder: Option<String>,
    pub hosts_dir: Option<Vec<PathBuf>>,
    pub experimental: Option<bool>,
}

impl ConfigFile {
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Load a config file; a missing file is not an error.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content, path).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BerthConfig {
    pub debug: bool,
    pub namespace: String,
    pub data_root: PathBuf,
    pub cni_path: PathBuf,
    pub cni_netconfpath: PathBuf,
    pub cgroup_manager: String,
    pub runtime: String,
    pub supervisor: String,
    pub builder: String,
    pub hosts_dir: Vec<PathBuf>,
    pub experimental: bool,
}

/// Host facts that influence the defaults.
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    pub rootless: bool,
    /// cgroup v2 with systemd as PID 1.
    pub systemd_cgroup: bool,
    pub home: Option<PathBuf>,
    pub xdg_data_home: Option<PathBuf>,
    pub xdg_config_home: Option<PathBuf>,
}

impl HostFacts {
    fn data_home(&self) -> PathBuf {
        self.xdg_data_home.clone().unwrap_or_else(|| {
            self.home
                .clone()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        })
    }

    fn config_home(&self) -> PathBuf {
        self.xdg_config_home.clone().unwrap_or_else(|| {
            self.home
                .clone()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
    }

    /// Where `berth.toml` is looked up when `BERTH_TOML` is unset.
    pub fn default_config_path(&self) -> PathBuf {
        if self.rootless {
            self.config_home().join("berth/berth.toml")
        } else {
            PathBuf::from("/etc/berth/berth.toml")
        }
    }
}

pub const CONFIG_ENV: &str = "BERTH_TOML";

impl BerthConfig {
    pub fn defaults(facts: &HostFacts) -> Self {
        let (data_root, netconf) = if facts.rootless {
            (
                facts.data_home().join("berth"),
                facts.config_home().join("cni/net.d"),
            )
        } else {
            (
                PathBuf::from("/var/lib/berth"),
                PathBuf::from("/etc/cni/net.d"),
            )
        };
        Self {
            debug: false,
            namespace: "default".to_owned(),
            data_root,
            cni_path: PathBuf::from("/opt/cni/bin"),
            cni_netconfpath: netconf,
            cgroup_manager: if facts.systemd_cgroup {
                "systemd".to_owned()
            } else {
                "cgroupfs".to_owned()
            },
            runtime: "runc".to_owned(),
            supervisor: "runc".to_owned(),
            builder: "buildctl".to_owned(),
            hosts_dir: vec![
                PathBuf::from("/etc/containerd/certs.d"),
                PathBuf::from("/etc/docker/certs.d"),
            ],
            experimental: true,
        }
    }

    /// Overlay file values onto `self`.
    #[must_use]
    pub fn with_file(mut self, file: ConfigFile) -> Self {
        if let Some(v) = file.debug {
            self.debug = v;
        }
        if let Some(v) = file.namespace {
            self.namespace = v;
        }
        if let Some(v) = file.data_root {
            self.data_root = v;
        }
        if let Some(v) = file.cni_path {
            self.cni_path = v;
        }
        if let Some(v) = file.cni_netconfpath {
            self.cni_netconfpath = v;
        }
        if let Some(v) = file.cgroup_manager {
            self.cgroup_manager = v;
        }
        if let Some(v) = file.runtime {
            self.runtime = v;
        }
        if let Some(v) = file.supervisor {
            self.supervisor = v;
        }
        if let Some(v) = file.builder {
            self.builder = v;
        }
        if let Some(v) = file.hosts_dir {
            self.hosts_dir = v;
        }
        if let Some(v) = file.experimental {
            self.experimental = v;
        }
        self
    }

    /// Overlay environment variables onto `self`.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |k: &str| lookup(k).filter(|v| !v.is_empty());
        if let Some(v) = get("BERTH_NAMESPACE") {
            self.namespace = v;
        }
        if let Some(v) = get("BERTH_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = get("CNI_PATH") {
            self.cni_path = PathBuf::from(v);
        }
        if let Some(v) = get("NETCONFPATH") {
            self.cni_netconfpath = PathBuf::from(v);
        }
        if let Some(v) = get("BERTH_CGROUP_MANAGER") {
            self.cgroup_manager = v;
        }
        if let Some(v) = get("BERTH_SUPERVISOR") {
            self.supervisor = v;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !crate::types::is_valid_object_name(&self.namespace) {
            return Err(ConfigError::Invalid(format!(
                "invalid namespace '{}'",
                self.namespace
            )));
        }
        if !matches!(self.cgroup_manager.as_str(), "systemd" | "cgroupfs" | "none") {
            return Err(ConfigError::Invalid(format!(
                "unknown cgroup manager '{}' (expected systemd, cgroupfs, none)",
                self.cgroup_manager
            )));
        }
        if !self.data_root.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "data root must be absolute: {}",
                self.data_root.display()
            )));
        }
        Ok(())
    }
}
