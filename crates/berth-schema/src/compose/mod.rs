//! Compose project model.
//!
//! The YAML grammar accepts both the short and long syntax for most fields,
//! so many of these types are untagged enums. Fields the model does not know
//! are kept in `extra` so they can be reported and ignored.

mod graph;
mod load;

pub use graph::{dependency_order, reverse_dependency_order};
pub use load::{
    find_compose_file, interpolate, normalize_project_name, parse_dotenv, LoadOptions,
    COMPOSE_FILE_NAMES,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("compose file error: failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("compose file error: {path}: {message}")]
    Yaml { path: String, message: String },
    #[error("compose file error: {0}")]
    Interpolation(String),
    #[error("compose file error: {0}")]
    Invalid(String),
    #[error("compose file error: dependency cycle involving service '{0}'")]
    Cycle(String),
    #[error("compose file error: unsupported: {0}")]
    Unsupported(String),
    #[error("no such service: {0}")]
    NoSuchService(String),
    #[error("compose file error: no compose file found in {0}")]
    NoFile(String),
}

/// A scalar that may be written as a number or a string (`cpus: 0.5`, `cpus: "0.5"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }
}

/// `KEY: value` mapping or `["KEY=value"]` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MapOrList {
    Map(BTreeMap<String, Option<Scalar>>),
    List(Vec<String>),
}

impl Default for MapOrList {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl MapOrList {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Map(m) => m.is_empty(),
            Self::List(l) => l.is_empty(),
        }
    }

    /// Entries in `KEY=value` form. Map entries with a null value become a bare `KEY`.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            Self::Map(m) => m
                .iter()
                .map(|(k, v)| match v {
                    Some(v) => format!("{k}={v}"),
                    None => k.clone(),
                })
                .collect(),
            Self::List(l) => l.clone(),
        }
    }

    /// Entries split on the given separator (`=` for env and labels, `:` for extra_hosts lists).
    pub fn to_pairs(&self, sep: char) -> Vec<(String, Option<String>)> {
        match self {
            Self::Map(m) => m
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().map(ToString::to_string)))
                .collect(),
            Self::List(l) => l
                .iter()
                .map(|e| match e.split_once(sep) {
                    Some((k, v)) => (k.to_owned(), Some(v.to_owned())),
                    None => (e.clone(), None),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    Context(String),
    Full {
        #[serde(default)]
        context: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dockerfile: Option<String>,
        #[serde(default, skip_serializing_if = "MapOrList::is_empty")]
        args: MapOrList,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

impl BuildConfig {
    pub fn context(&self) -> &str {
        match self {
            Self::Context(c) => c,
            Self::Full { context, .. } => context.as_deref().unwrap_or("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    Number(u32),
    Short(String),
    Long {
        target: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        published: Option<Scalar>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_ip: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    Bind,
    Volume,
    Tmpfs,
    Npipe,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_host_path: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TmpfsOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Scalar>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceVolume {
    Short(String),
    Long {
        #[serde(rename = "type")]
        kind: VolumeType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        target: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        read_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<BindOptions>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tmpfs: Option<TmpfsOptions>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceNetworks {
    List(Vec<String>),
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

impl ServiceNetworks {
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::List(l) => l.clone(),
            Self::Map(m) => m.keys().cloned().collect(),
        }
    }

    pub fn config(&self, name: &str) -> Option<&ServiceNetworkConfig> {
        match self {
            Self::List(_) => None,
            Self::Map(m) => m.get(name).and_then(Option::as_ref),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependsOnConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, DependsOnConfig>),
}

impl DependsOn {
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::List(l) => l.clone(),
            Self::Map(m) => m.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservations: Option<ResourceSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicyConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UlimitConfig {
    Single(i64),
    Pair { soft: i64, hard: i64 },
}

/// Reference from a service to a top-level secret or config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileReference {
    Short(String),
    Long {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
}

impl FileReference {
    pub fn source(&self) -> &str {
        match self {
            Self::Short(s) | Self::Long { source: s, .. } => s,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Short(_) => None,
            Self::Long { target, .. } => target.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "MapOrList::is_empty")]
    pub environment: MapOrList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "MapOrList::is_empty")]
    pub labels: MapOrList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<ServiceVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpfs: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<ServiceNetworks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,

    // Deprecated spellings, folded into their replacements while parsing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_limit: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_period: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpuset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_reservation: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memswap_limit: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub oom_kill_disable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_size: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_drop: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,
    #[serde(default, skip_serializing_if = "MapOrList::is_empty")]
    pub sysctls: MapOrList,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ulimits: BTreeMap<String, UlimitConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_search: Option<StringOrList>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_opt: Vec<String>,
    #[serde(default, skip_serializing_if = "MapOrList::is_empty")]
    pub extra_hosts: MapOrList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domainname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tty: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stdin_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_add: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<FileReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<FileReference>,

    #[serde(flatten, skip_serializing)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ServiceConfig {
    pub fn dependencies(&self) -> Vec<String> {
        self.depends_on
            .as_ref()
            .map(DependsOn::names)
            .unwrap_or_default()
    }

    /// Replica count after deprecated `scale` is folded in; defaults to 1.
    pub fn replicas(&self) -> u32 {
        self.deploy
            .as_ref()
            .and_then(|d| d.replicas)
            .or(self.scale)
            .unwrap_or(1)
    }

    pub fn network_names(&self) -> Vec<String> {
        self.networks
            .as_ref()
            .map(ServiceNetworks::names)
            .unwrap_or_default()
    }
}

/// Explicit `external: true`, or the legacy `external: {name: ...}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum External {
    Flag(bool),
    Named { name: String },
}

impl External {
    pub fn is_external(&self) -> bool {
        !matches!(self, Self::Flag(false))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamPool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_range: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<IpamPool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub driver_opts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<External>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,
    #[serde(default, skip_serializing_if = "MapOrList::is_empty")]
    pub labels: MapOrList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub driver_opts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<External>,
    #[serde(default, skip_serializing_if = "MapOrList::is_empty")]
    pub labels: MapOrList,
}

/// Top-level secret or config definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileObjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<External>,
}

fn is_external(e: Option<&External>) -> bool {
    e.is_some_and(External::is_external)
}

impl NetworkConfig {
    pub fn is_external(&self) -> bool {
        is_external(self.external.as_ref())
    }
}

impl VolumeConfig {
    pub fn is_external(&self) -> bool {
        is_external(self.external.as_ref())
    }
}

impl FileObjectConfig {
    pub fn is_external(&self) -> bool {
        is_external(self.external.as_ref())
    }
}

/// The raw document shape of a compose file.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ComposeFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
    #[serde(default)]
    pub secrets: BTreeMap<String, FileObjectConfig>,
    #[serde(default)]
    pub configs: BTreeMap<String, FileObjectConfig>,
}

/// A loaded, interpolated, and validated compose project.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Project {
    pub name: String,
    #[serde(skip)]
    pub working_dir: PathBuf,
    /// Services sorted by name.
    #[serde(serialize_with = "serialize_services")]
    pub services: Vec<ServiceConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, FileObjectConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, FileObjectConfig>,
    /// Variables referenced but not set, in first-seen order.
    #[serde(skip)]
    pub unset_variables: Vec<String>,
}

fn serialize_services<S: serde::Serializer>(
    services: &[ServiceConfig],
    ser: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = ser.serialize_map(Some(services.len()))?;
    for svc in services {
        map.serialize_entry(&svc.name, svc)?;
    }
    map.end()
}

pub const DEFAULT_NETWORK_KEY: &str = "default";

impl Project {
    pub fn service(&self, name: &str) -> Result<&ServiceConfig, ComposeError> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ComposeError::NoSuchService(name.to_owned()))
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// Full supervisor-level name of a project network key.
    /// External networks keep their key unless renamed.
    pub fn network_full_name(&self, key: &str) -> String {
        let cfg = self.networks.get(key);
        self.full_name(
            key,
            cfg.and_then(|n| n.name.as_deref()),
            cfg.and_then(|n| n.external.as_ref()),
        )
    }

    /// Full name of a project volume key.
    pub fn volume_full_name(&self, key: &str) -> String {
        let cfg = self.volumes.get(key);
        self.full_name(
            key,
            cfg.and_then(|v| v.name.as_deref()),
            cfg.and_then(|v| v.external.as_ref()),
        )
    }

    fn full_name(&self, key: &str, name: Option<&str>, external: Option<&External>) -> String {
        match (name, external) {
            (Some(name), _) => name.to_owned(),
            (None, Some(External::Named { name })) => name.clone(),
            (None, Some(e)) if e.is_external() => key.to_owned(),
            _ => format!("{}_{key}", self.name),
        }
    }

    /// Services in `depends_on` order.
    pub fn services_in_order(&self) -> Result<Vec<&ServiceConfig>, ComposeError> {
        let order = dependency_order(&self.services)?;
        Ok(order
            .iter()
            .filter_map(|n| self.services.iter().find(|s| &s.name == n))
            .collect())
    }

    /// Keep only the named services (and, when `with_deps`, everything they depend on).
    pub fn select_services(&mut self, names: &[String], with_deps: bool) -> Result<(), ComposeError> {
        if names.is_empty() {
            return Ok(());
        }
        let mut keep: Vec<String> = Vec::new();
        let mut stack: Vec<String> = names.to_vec();
        while let Some(name) = stack.pop() {
            if keep.contains(&name) {
                continue;
            }
            let svc = self.service(&name)?;
            if with_deps {
                stack.extend(svc.dependencies());
            }
            keep.push(name);
        }
        self.services.retain(|s| keep.contains(&s.name));
        Ok(())
    }

    /// Override replica counts (`--scale svc=N`).
    pub fn set_scale(&mut self, service: &str, replicas: u32) -> Result<(), ComposeError> {
        let svc = self
            .services
            .iter_mut()
            .find(|s| s.name == service)
            .ok_or_else(|| ComposeError::NoSuchService(service.to_owned()))?;
        svc.deploy.get_or_insert_with(DeployConfig::default).replicas = Some(replicas);
        svc.scale = None;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, ComposeError> {
        serde_yaml::to_string(self).map_err(|e| ComposeError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ComposeFile {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn short_and_long_syntax() {
        let f = parse(
            r#"
services:
  web:
    image: nginx
    ports:
      - "8080:80"
      - 9000
      - target: 443
        published: "8443"
        protocol: tcp
    volumes:
      - ./html:/usr/share/nginx/html:ro
      - type: volume
        source: data
        target: /data
    environment:
      A: 1
      B:
    depends_on: [db]
    networks:
      front:
        aliases: [www]
  db:
    image: postgres
    environment: ["X=y"]
    depends_on:
      cache:
        condition: service_started
  cache:
    image: redis
"#,
        );
        let web = &f.services["web"];
        assert_eq!(web.ports.len(), 3);
        assert!(matches!(web.ports[1], PortConfig::Number(9000)));
        assert!(matches!(web.ports[2], PortConfig::Long { target: 443, .. }));
        assert!(matches!(
            web.volumes[1],
            ServiceVolume::Long {
                kind: VolumeType::Volume,
                ..
            }
        ));
        assert_eq!(web.environment.to_list(), vec!["A=1", "B"]);
        assert_eq!(web.dependencies(), vec!["db"]);
        assert_eq!(
            web.networks.as_ref().unwrap().config("front").unwrap().aliases,
            vec!["www"]
        );
        assert_eq!(f.services["db"].dependencies(), vec!["cache"]);
        assert_eq!(f.services["db"].environment.to_list(), vec!["X=y"]);
    }

    #[test]
    fn unknown_fields_are_collected() {
        let f = parse("services:\n  a:\n    image: x\n    healthcheck: {test: [CMD, true]}\n");
        assert!(f.services["a"].extra.contains_key("healthcheck"));
    }

    #[test]
    fn replicas_prefer_deploy_over_scale() {
        let f = parse("services:\n  a:\n    image: x\n    scale: 2\n  b:\n    image: x\n    scale: 2\n    deploy: {replicas: 3}\n");
        assert_eq!(f.services["a"].replicas(), 2);
        assert_eq!(f.services["b"].replicas(), 3);
    }

    #[test]
    fn external_forms() {
        let f = parse("networks:\n  a:\n    external: true\n  b:\n    external: {name: real}\n  c: {}\n  d:\n");
        assert!(f.networks["a"].as_ref().unwrap().is_external());
        assert!(f.networks["b"].as_ref().unwrap().is_external());
        assert!(!f.networks["c"].as_ref().unwrap().is_external());
        assert!(f.networks["d"].is_none());
    }

    #[test]
    fn extra_hosts_pairs() {
        let list = MapOrList::List(vec!["db:10.0.0.2".to_owned()]);
        assert_eq!(
            list.to_pairs(':'),
            vec![("db".to_owned(), Some("10.0.0.2".to_owned()))]
        );
    }

    #[test]
    fn external_objects_keep_their_names() {
        let f = parse("networks:\n  ext:\n    external: true\n  legacy:\n    external: {name: real}\n  own: {}\nvolumes:\n  named:\n    name: fixed\n");
        let project = Project {
            name: "demo".to_owned(),
            networks: f.networks.into_iter().map(|(k, v)| (k, v.unwrap_or_default())).collect(),
            volumes: f.volumes.into_iter().map(|(k, v)| (k, v.unwrap_or_default())).collect(),
            ..Project::default()
        };
        assert_eq!(project.network_full_name("ext"), "ext");
        assert_eq!(project.network_full_name("legacy"), "real");
        assert_eq!(project.network_full_name("own"), "demo_own");
        assert_eq!(project.volume_full_name("named"), "fixed");
        assert_eq!(project.volume_full_name("other"), "demo_other");
    }
}
