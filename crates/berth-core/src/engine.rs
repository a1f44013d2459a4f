use crate::hook::HookCommand;
use crate::lookup;
use crate::spec::resources::CgroupEnv;
use crate::spec::{ContainerResolver, ResolvedContainer};
use crate::CoreError;
use berth_runtime::portalloc::PortAllocator;
use berth_runtime::{
    apparmor, cgroup, prereq, rootless, select_supervisor, ContainerRecord, NetworkStore,
    Supervisor, SupervisorConfig, TaskStatus,
};
use berth_schema::{BerthConfig, OptionsError, DEFAULT_NETWORK_NAME};
use berth_store::{DataLayout, HostsStore, NameStore, VolumeStore};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Variables passed through to hook processes.
const HOOK_ENV_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "XDG_RUNTIME_DIR",
    "ROOTLESSKIT_STATE_DIR",
    "ROOTLESSKIT_PARENT_EUID",
    "ROOTLESSKIT_PARENT_EGID",
    "BERTH_LOG",
];

/// Host facts and resolved configuration the engine runs with.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub config: BerthConfig,
    pub rootless: bool,
    /// The `berth` binary the runtime calls back for hooks and logging.
    pub self_exe: PathBuf,
    pub cgroup_v2: bool,
    pub apparmor: bool,
    pub proc_root: PathBuf,
    pub dev_dir: PathBuf,
    pub host_resolv_conf: PathBuf,
    /// tini on the host, for `--init`.
    pub init_binary: Option<PathBuf>,
    pub hook_env: Vec<String>,
}

impl EngineOptions {
    /// Options that assume nothing about the host.
    pub fn new(config: BerthConfig) -> Self {
        Self {
            config,
            rootless: false,
            self_exe: PathBuf::from("berth"),
            cgroup_v2: true,
            apparmor: false,
            proc_root: PathBuf::from("/proc"),
            dev_dir: PathBuf::from("/dev"),
            host_resolv_conf: PathBuf::from("/etc/resolv.conf"),
            init_binary: None,
            hook_env: Vec::new(),
        }
    }

    /// Probe the running host.
    pub fn detect(config: BerthConfig) -> Result<Self, CoreError> {
        let self_exe = std::env::current_exe()?;
        let hook_env = HOOK_ENV_KEYS
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| format!("{k}={v}")))
            .collect();
        Ok(Self {
            rootless: rootless::is_rootless(),
            self_exe,
            cgroup_v2: cgroup::is_v2(),
            apparmor: apparmor::can_load_new_profile(),
            init_binary: prereq::find_in_path("tini"),
            hook_env,
            ..Self::new(config)
        })
    }
}

/// Entry point for every container operation.
///
/// Owns the supervisor client and hands out the per-namespace stores.
/// Operations live in [`crate::runner`].
pub struct Engine {
    opts: EngineOptions,
    layout: DataLayout,
    supervisor: Arc<dyn Supervisor>,
    ports: PortAllocator,
}

impl Engine {
    /// Build an engine with the supervisor named in the configuration.
    pub fn new(opts: EngineOptions) -> Result<Self, CoreError> {
        let config = SupervisorConfig {
            data_root: opts.config.data_root.clone(),
            namespace: opts.config.namespace.clone(),
            runtime: opts.config.runtime.clone(),
            rootless: opts.rootless,
            systemd_cgroup: opts.config.cgroup_manager == "systemd",
            hosts_dir: opts.config.hosts_dir.clone(),
        };
        let supervisor = select_supervisor(&opts.config.supervisor, &config)?;
        Ok(Self::with_supervisor(opts, Arc::from(supervisor)))
    }

    pub fn with_supervisor(opts: EngineOptions, supervisor: Arc<dyn Supervisor>) -> Self {
        let layout = DataLayout::new(&opts.config.data_root);
        let ports = PortAllocator::new(&opts.proc_root);
        debug!(
            "engine: namespace={} data_root={} supervisor={}",
            opts.config.namespace,
            opts.config.data_root.display(),
            supervisor.name()
        );
        Self {
            opts,
            layout,
            supervisor,
            ports,
        }
    }

    pub fn initialize(&self) -> Result<(), CoreError> {
        self.layout.initialize(self.namespace())?;
        Ok(())
    }

    pub fn options(&self) -> &EngineOptions {
        &self.opts
    }

    pub fn config(&self) -> &BerthConfig {
        &self.opts.config
    }

    pub fn namespace(&self) -> &str {
        &self.opts.config.namespace
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn supervisor(&self) -> &dyn Supervisor {
        self.supervisor.as_ref()
    }

    pub fn names(&self) -> NameStore {
        NameStore::new(self.layout.names_dir(self.namespace()))
    }

    pub fn hosts(&self) -> HostsStore {
        HostsStore::new(self.layout.etchosts_dir(self.namespace()))
    }

    pub fn volumes(&self) -> VolumeStore {
        VolumeStore::new(self.layout.volumes_dir(self.namespace()))
    }

    pub fn networks(&self) -> NetworkStore {
        NetworkStore::new(&self.opts.config.cni_netconfpath)
    }

    pub fn state_dir(&self, id: &str) -> PathBuf {
        self.layout.container_state_dir(self.namespace(), id)
    }

    /// Gateway of the default network, used for `host-gateway`.
    pub fn bridge_ip(&self) -> Option<String> {
        self.networks()
            .get(DEFAULT_NETWORK_NAME)
            .ok()
            .and_then(|n| n.gateway())
    }

    pub fn hook_command(&self) -> HookCommand {
        HookCommand {
            binary: self.opts.self_exe.clone(),
            data_root: self.opts.config.data_root.clone(),
            cni_path: self.opts.config.cni_path.clone(),
            netconf: self.opts.config.cni_netconfpath.clone(),
            bridge_ip: self.bridge_ip(),
            env: self.opts.hook_env.clone(),
        }
    }

    pub fn cgroup_env(&self) -> CgroupEnv {
        CgroupEnv {
            v2: self.opts.cgroup_v2,
            manager: self.opts.config.cgroup_manager.clone(),
            rootless: self.opts.rootless,
            oom_score_adj_floor: if self.opts.rootless {
                cgroup::current_oom_score_adj()
            } else {
                None
            },
        }
    }

    /// First port of a free run of `count` host ports, skipping `exclude`.
    pub fn allocate_port(
        &self,
        protocol: &str,
        host_ip: &str,
        count: u16,
        exclude: &BTreeSet<u16>,
    ) -> Result<u16, OptionsError> {
        self.ports
            .allocate(protocol, host_ip, count, exclude)
            .map_err(|e| OptionsError::InvalidPort(e.to_string()))
    }

    pub fn host_resolv_conf(&self) -> String {
        std::fs::read_to_string(&self.opts.host_resolv_conf).unwrap_or_default()
    }

    pub fn find(&self, reference: &str) -> Result<ContainerRecord, CoreError> {
        lookup::find_container(self.supervisor(), self.namespace(), reference)
    }

    pub fn containers(&self) -> Result<Vec<ContainerRecord>, CoreError> {
        lookup::list_containers(self.supervisor(), self.namespace())
    }

    pub fn data_root(&self) -> &Path {
        self.layout.root()
    }
}

impl ContainerResolver for Engine {
    fn resolve_container(&self, reference: &str) -> Result<ResolvedContainer, CoreError> {
        let rec = self.find(reference)?;
        let pid = match self.supervisor.task_status(&rec.id) {
            Ok(t) if matches!(t.status, TaskStatus::Running | TaskStatus::Paused) => t.pid,
            Ok(_) => None,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let hosts_path = self
            .hosts()
            .hosts_path(&rec.id)
            .ok()
            .filter(|p| p.exists());
        Ok(ResolvedContainer {
            id: rec.id,
            pid,
            labels: rec.labels,
            hosts_path,
        })
    }
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fresh 64-hex-digit container id.
pub fn new_container_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let seed = format!(
        "{nanos}:{}:{}",
        std::process::id(),
        ID_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    blake3::hash(seed.as_bytes()).to_hex().to_string()
}
