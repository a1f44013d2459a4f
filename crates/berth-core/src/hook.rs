//! The createRuntime and postStop OCI hooks.
//!
//! The runtime spawns `berth internal oci-hook <event> ...` with the OCI
//! state on stdin. Everything the handler needs is rebuilt from the state
//! annotations, so [`handle`] is a function of the state, the labels it
//! carries, the data root and the CNI client. All CNI work for a netconf
//! directory runs under one file lock because plugins and their IPAM
//! backends are not safe to run concurrently.

use crate::network::NetworkMode;
use crate::CoreError;
use berth_runtime::cni::{self, NamespaceOpts};
use berth_runtime::iptables::Iptables;
use berth_runtime::oci::{Hook, State};
use berth_runtime::rootless::{
    rewrite_child_ip, Bypass4netnsClient, BypassPortMapping, BypassSpec, PortManagerClient,
    PortSpec,
};
use berth_runtime::{apparmor, Cni, NetworkStore};
use berth_schema::labels::{self, Labels};
use berth_schema::{CniResult, PortMapping};
use berth_store::layout::state_files;
use berth_store::{DataLayout, FileLock, HostsStore, LifecycleStore, NameStore, NetworkMeta};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    CreateRuntime,
    PostStop,
}

impl HookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateRuntime => "createRuntime",
            Self::PostStop => "postStop",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "createRuntime" => Ok(Self::CreateRuntime),
            "postStop" => Ok(Self::PostStop),
            other => Err(CoreError::Precondition(format!("unexpected hook event '{other}'"))),
        }
    }
}

/// How the runtime calls back into berth. Rendered into the spec's hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCommand {
    pub binary: PathBuf,
    pub data_root: PathBuf,
    pub cni_path: PathBuf,
    pub netconf: PathBuf,
    pub bridge_ip: Option<String>,
    /// Environment for the hook process; a non-empty list replaces the
    /// runtime's own environment entirely.
    pub env: Vec<String>,
}

impl HookCommand {
    pub fn hook(&self, event: HookEvent) -> Hook {
        let mut args = vec![
            self.binary.to_string_lossy().into_owned(),
            "internal".to_owned(),
            "oci-hook".to_owned(),
            event.as_str().to_owned(),
            self.data_root.to_string_lossy().into_owned(),
            self.cni_path.to_string_lossy().into_owned(),
            self.netconf.to_string_lossy().into_owned(),
        ];
        if let Some(ip) = &self.bridge_ip {
            args.push(ip.clone());
        }
        Hook {
            path: self.binary.clone(),
            args,
            env: self.env.clone(),
            timeout: None,
        }
    }
}

/// Clients for publishing ports from inside a rootless child.
pub struct RootlessPorts {
    pub port_manager: PortManagerClient,
    pub bypass: Option<Bypass4netnsClient>,
}

/// Host-side collaborators of the hook handler.
pub struct HookEnv<'a> {
    pub layout: DataLayout,
    pub netconf: PathBuf,
    pub cni: &'a dyn Cni,
    pub networks: NetworkStore,
    /// `None` skips the stale-rule sweep.
    pub iptables: Option<Iptables>,
    /// Try to load the default AppArmor profile on createRuntime.
    pub apparmor: bool,
    /// Set when running inside a rootless child.
    pub rootless: Option<RootlessPorts>,
    /// Substituted for `host-gateway` in extra hosts.
    pub bridge_ip: Option<String>,
}

impl<'a> HookEnv<'a> {
    pub fn new(data_root: &Path, netconf: &Path, cni: &'a dyn Cni) -> Self {
        Self {
            layout: DataLayout::new(data_root),
            netconf: netconf.to_path_buf(),
            cni,
            networks: NetworkStore::new(netconf),
            iptables: None,
            apparmor: false,
            rootless: None,
            bridge_ip: None,
        }
    }
}

/// The container as the hook sees it, decoded from the annotations.
struct HookTarget {
    id: String,
    pid: Option<u32>,
    namespace: String,
    state_dir: PathBuf,
    name: String,
    hostname: String,
    domainname: String,
    extra_hosts: BTreeMap<String, String>,
    mode: NetworkMode,
    ports: Vec<PortMapping>,
    ns_opts: NamespaceOpts,
    netns_label: Option<String>,
    pid_file: Option<PathBuf>,
    bypass4netns: bool,
}

fn required<'l>(labels: &'l Labels, key: &str) -> Result<&'l str, CoreError> {
    labels
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CoreError::Precondition(format!("container is missing the {key} label")))
}

impl HookTarget {
    fn from_state(state: &State, bridge_ip: Option<&str>) -> Result<Self, CoreError> {
        let l = &state.annotations;
        let namespace = required(l, labels::NAMESPACE)?.to_owned();
        let state_dir = PathBuf::from(required(l, labels::STATE_DIR)?);
        let mode = NetworkMode::parse(&labels::decode_list(l, labels::NETWORKS)?)?;
        let ports = labels::decode_ports(l)?;

        let mut extra_hosts = BTreeMap::new();
        for entry in labels::decode_list(l, labels::EXTRA_HOSTS)? {
            let Some((host, ip)) = entry.split_once(':') else {
                warn!("ignoring malformed extra host '{entry}'");
                continue;
            };
            let ip = match (ip, bridge_ip) {
                ("host-gateway", Some(gw)) => gw.to_owned(),
                ("host-gateway", None) => {
                    warn!("no bridge address for host-gateway; dropping {host}");
                    continue;
                }
                (ip, _) => ip.to_owned(),
            };
            extra_hosts.insert(host.to_owned(), ip);
        }

        let get = |key: &str| l.get(key).filter(|v| !v.is_empty()).cloned();
        Ok(Self {
            id: state.id.clone(),
            pid: state.pid,
            namespace,
            state_dir,
            name: get(labels::NAME).unwrap_or_default(),
            hostname: get(labels::HOSTNAME).unwrap_or_default(),
            domainname: get(labels::DOMAINNAME).unwrap_or_default(),
            extra_hosts,
            ns_opts: NamespaceOpts {
                port_mappings: ports.clone(),
                ip: get(labels::IP_ADDRESS),
                mac: get(labels::MAC_ADDRESS),
                ip6: get(labels::IP6_ADDRESS),
            },
            mode,
            ports,
            netns_label: get(labels::NETWORK_NAMESPACE),
            pid_file: get(labels::PID_FILE).map(PathBuf::from),
            bypass4netns: labels::decode_bool(l, labels::BYPASS4NETNS),
        })
    }

    fn netns_path(&self) -> Result<String, CoreError> {
        if let Some(path) = &self.netns_label {
            return Ok(path.clone());
        }
        let pid = self.pid.ok_or_else(|| {
            CoreError::Precondition(format!("no pid in the hook state for {}", self.id))
        })?;
        Ok(format!("/proc/{pid}/ns/net"))
    }
}

/// Handle one hook event. Creates the state dir when missing.
pub fn handle(event: HookEvent, state: &State, env: &HookEnv<'_>) -> Result<(), CoreError> {
    let target = HookTarget::from_state(state, env.bridge_ip.as_deref())?;
    let span = info_span!("oci-hook", id = %target.id, event = event.as_str());
    let _enter = span.enter();

    std::fs::create_dir_all(&target.state_dir)?;
    let _cni_lock = FileLock::acquire(&cni::lock_path(&env.netconf))?;
    debug!("acquired CNI lock");

    let networks = target
        .mode
        .cni_networks()
        .iter()
        .map(|n| env.networks.get(n))
        .collect::<Result<Vec<_>, _>>()?;

    match event {
        HookEvent::CreateRuntime => create_runtime(&target, &networks, env),
        HookEvent::PostStop => post_stop(&target, &networks, env),
    }
}

fn load_apparmor() {
    if !apparmor::can_load_new_profile() || apparmor::is_loaded(apparmor::DEFAULT_PROFILE) {
        return;
    }
    if let Err(e) = apparmor::load_default_profile(apparmor::DEFAULT_PROFILE) {
        warn!("failed to load AppArmor profile {}: {e}", apparmor::DEFAULT_PROFILE);
    }
}

fn create_runtime(
    target: &HookTarget,
    networks: &[berth_runtime::NetworkConfList],
    env: &HookEnv<'_>,
) -> Result<(), CoreError> {
    if env.apparmor {
        load_apparmor();
    }
    let lifecycle = LifecycleStore::new(&target.state_dir);

    let mut results: BTreeMap<String, CniResult> = BTreeMap::new();
    if !networks.is_empty() {
        let netns = target.netns_path()?;
        // A supervisor restart can leave a previous attach behind.
        if let Err(e) = env.cni.remove(networks, &target.id, &netns, &target.ns_opts) {
            warn!("pre-emptive CNI remove failed: {e}");
        }
        match env.cni.setup(networks, &target.id, &netns, &target.ns_opts) {
            Ok(r) => results = r,
            Err(e) => {
                if let Err(re) = env.cni.remove(networks, &target.id, &netns, &target.ns_opts) {
                    warn!("CNI remove after failed setup: {re}");
                }
                lifecycle
                    .transform(|st| {
                        st.create_error = true;
                        st.started_at = Some(Utc::now());
                    })
                    .map_err(CoreError::LifecycleStore)?;
                return Err(e.into());
            }
        }
        info!("attached to {} network(s)", networks.len());
    }

    if let Some(path) = &target.pid_file {
        if let Some(pid) = target.pid {
            write_pid_file(path, pid)?;
        }
    }

    if let Some(rootless) = &env.rootless {
        if !target.ports.is_empty() {
            expose_ports(target, networks, rootless)?;
        }
    }

    if !target.name.is_empty() {
        NameStore::new(env.layout.names_dir(&target.namespace))
            .acquire(&target.name, &target.id)
            .map_err(CoreError::NameStore)?;
    }

    if target.mode.owns_namespace() {
        let meta = NetworkMeta {
            id: target.id.clone(),
            name: target.name.clone(),
            hostname: target.hostname.clone(),
            domainname: target.domainname.clone(),
            extra_hosts: target.extra_hosts.clone(),
            networks: results,
        };
        HostsStore::new(env.layout.etchosts_dir(&target.namespace))
            .acquire(&meta)
            .map_err(CoreError::HostsStore)?;
    }

    lifecycle
        .transform(|st| {
            st.create_error = false;
            st.started_at = Some(Utc::now());
        })
        .map_err(CoreError::LifecycleStore)?;
    Ok(())
}

fn post_stop(
    target: &HookTarget,
    networks: &[berth_runtime::NetworkConfList],
    env: &HookEnv<'_>,
) -> Result<(), CoreError> {
    let lifecycle = LifecycleStore::new(&target.state_dir);
    let st = lifecycle.load().map_err(CoreError::LifecycleStore)?;
    if st.create_error {
        lifecycle
            .transform(|st| st.create_error = false)
            .map_err(CoreError::LifecycleStore)?;
        info!("createRuntime had failed; leaving container state in place");
        return Ok(());
    }

    if let Some(rootless) = &env.rootless {
        if !target.ports.is_empty() {
            if let Err(e) = unexpose_ports(target, rootless) {
                warn!("failed to unexpose ports: {e}");
            }
        }
    }

    if !networks.is_empty() {
        // The netns may already be gone; plugins only need the path string.
        let netns = target.netns_path().unwrap_or_default();
        env.cni.remove(networks, &target.id, &netns, &target.ns_opts)?;
        if let Some(ipt) = &env.iptables {
            match ipt.sweep(&target.id) {
                Ok(0) => {}
                Ok(n) => debug!("removed {n} stale iptables rules"),
                Err(e) => warn!("iptables sweep failed: {e}"),
            }
        }
    }

    HostsStore::new(env.layout.etchosts_dir(&target.namespace))
        .release(&target.id)
        .map_err(CoreError::HostsStore)?;

    if !target.name.is_empty() {
        match NameStore::new(env.layout.names_dir(&target.namespace))
            .release(&target.name, &target.id)
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("name {} was already released", target.name),
            Err(e) => return Err(CoreError::NameStore(e)),
        }
    }
    Ok(())
}

/// Write `pid` to `.<name>` next to `path`, then rename over it.
fn write_pid_file(path: &Path, pid: u32) -> Result<(), CoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| CoreError::Precondition(format!("invalid pid file {}", path.display())))?;
    let tmp = dir.join(format!(".{}", file_name.to_string_lossy()));
    std::fs::create_dir_all(dir)?;
    std::fs::write(&tmp, pid.to_string())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn expose_ports(
    target: &HookTarget,
    networks: &[berth_runtime::NetworkConfList],
    rootless: &RootlessPorts,
) -> Result<(), CoreError> {
    if target.bypass4netns {
        if let Some(bypass) = &rootless.bypass {
            let pid = target.pid.ok_or_else(|| {
                CoreError::Precondition("bypass4netns needs the container pid".to_owned())
            })?;
            let spec = BypassSpec {
                id: target.id.clone(),
                pid,
                log_file_path: target
                    .state_dir
                    .join(state_files::BYPASS4NETNS_LOG)
                    .to_string_lossy()
                    .into_owned(),
                port_mapping: target
                    .ports
                    .iter()
                    .map(|p| BypassPortMapping {
                        child_port: p.container_port,
                        parent_port: p.host_port,
                        protocol: p.protocol.clone(),
                        parent_ip: p.host_ip.clone(),
                    })
                    .collect(),
                ignore_subnets: networks.iter().flat_map(|n| n.subnets()).collect(),
            };
            bypass.start_bypass(&spec)?;
            return Ok(());
        }
        warn!("bypass4netns requested but the daemon socket is unknown; using the port manager");
    }

    let info = rootless.port_manager.info()?;
    for p in &target.ports {
        let spec = PortSpec {
            proto: p.protocol.clone(),
            parent_ip: p.host_ip.clone(),
            parent_port: p.host_port,
            child_ip: rewrite_child_ip(&p.host_ip, &info),
            child_port: p.host_port,
        };
        let status = rootless.port_manager.add_port(&spec)?;
        debug!("exposed {p} as port manager entry {}", status.id);
    }
    Ok(())
}

fn unexpose_ports(target: &HookTarget, rootless: &RootlessPorts) -> Result<(), CoreError> {
    if target.bypass4netns {
        if let Some(bypass) = &rootless.bypass {
            bypass.stop_bypass(&target.id)?;
            return Ok(());
        }
    }
    let existing = rootless.port_manager.list_ports()?;
    for p in &target.ports {
        for status in existing.iter().filter(|s| {
            s.spec.parent_port == p.host_port
                && s.spec.proto == p.protocol
                && s.spec.parent_ip == p.host_ip
        }) {
            rootless.port_manager.remove_port(status.id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_runtime::oci::OCI_VERSION;
    use berth_runtime::MockCni;

    const ID: &str = "c0ffee0000000000000000000000000000000000000000000000000000000001";

    struct Fixture {
        dir: tempfile::TempDir,
        cni: MockCni,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                cni: MockCni::new(),
            }
        }

        fn env(&self) -> HookEnv<'_> {
            HookEnv::new(
                &self.dir.path().join("root"),
                &self.dir.path().join("net.d"),
                &self.cni,
            )
        }

        fn state_dir(&self) -> PathBuf {
            self.dir.path().join("root/containers/default").join(ID)
        }

        fn state(&self, networks: &str) -> State {
            let mut annotations = Labels::new();
            annotations.insert(labels::NAMESPACE.to_owned(), "default".to_owned());
            annotations.insert(labels::NAME.to_owned(), "web".to_owned());
            annotations.insert(labels::HOSTNAME.to_owned(), "webhost".to_owned());
            annotations.insert(
                labels::STATE_DIR.to_owned(),
                self.state_dir().to_string_lossy().into_owned(),
            );
            annotations.insert(labels::NETWORKS.to_owned(), networks.to_owned());
            annotations.insert(
                labels::PID_FILE.to_owned(),
                self.dir.path().join("run/web.pid").to_string_lossy().into_owned(),
            );
            State {
                oci_version: OCI_VERSION.to_owned(),
                id: ID.to_owned(),
                status: "creating".to_owned(),
                pid: Some(4321),
                bundle: PathBuf::from("/bundle"),
                annotations,
            }
        }

        fn names(&self) -> NameStore {
            NameStore::new(self.dir.path().join("root/names/default"))
        }

        fn hosts(&self) -> HostsStore {
            HostsStore::new(self.dir.path().join("root/etchosts/default"))
        }
    }

    #[test]
    fn hook_argv_layout() {
        let cmd = HookCommand {
            binary: PathBuf::from("/usr/bin/berth"),
            data_root: PathBuf::from("/var/lib/berth"),
            cni_path: PathBuf::from("/opt/cni/bin"),
            netconf: PathBuf::from("/etc/cni/net.d"),
            bridge_ip: Some("10.4.0.1".to_owned()),
            env: Vec::new(),
        };
        let hook = cmd.hook(HookEvent::PostStop);
        assert_eq!(hook.path, PathBuf::from("/usr/bin/berth"));
        assert_eq!(
            hook.args,
            vec![
                "/usr/bin/berth",
                "internal",
                "oci-hook",
                "postStop",
                "/var/lib/berth",
                "/opt/cni/bin",
                "/etc/cni/net.d",
                "10.4.0.1"
            ]
        );
        assert_eq!("createRuntime".parse::<HookEvent>().unwrap(), HookEvent::CreateRuntime);
        assert!("prestart".parse::<HookEvent>().is_err());
    }

    #[test]
    fn create_then_poststop_round_trip() {
        let f = Fixture::new();
        let env = f.env();
        let state = f.state(r#"["bridge"]"#);

        handle(HookEvent::CreateRuntime, &state, &env).unwrap();
        assert_eq!(
            f.cni.calls(),
            vec![format!("remove:bridge:{ID}"), format!("setup:bridge:{ID}")]
        );
        assert_eq!(f.names().get("web").unwrap().as_deref(), Some(ID));
        let meta = f.hosts().meta(ID).unwrap().unwrap();
        assert_eq!(meta.hostname, "webhost");
        assert_eq!(meta.networks["bridge"].first_ipv4(), Some("10.4.0.2"));
        let pid = std::fs::read_to_string(f.dir.path().join("run/web.pid")).unwrap();
        assert_eq!(pid, "4321");
        let st = LifecycleStore::new(f.state_dir()).load().unwrap();
        assert!(st.started_at.is_some());
        assert!(!st.create_error);

        handle(HookEvent::PostStop, &state, &env).unwrap();
        assert!(f.names().get("web").unwrap().is_none());
        assert!(f.hosts().meta(ID).unwrap().is_none());
        assert!(f.hosts().hosts_path(ID).unwrap().exists());
        assert_eq!(f.cni.calls().last().unwrap(), &format!("remove:bridge:{ID}"));
    }

    #[test]
    fn failed_setup_makes_poststop_a_no_op() {
        let f = Fixture::new();
        let env = f.env();
        let state = f.state(r#"["bridge"]"#);
        f.names().acquire("web", ID).unwrap();
        f.cni.fail_next_setup("failed to set up portmap: address already in use");

        let err = handle(HookEvent::CreateRuntime, &state, &env).unwrap_err();
        assert!(err.is_addr_in_use());
        assert_eq!(f.cni.calls().last().unwrap(), &format!("remove:bridge:{ID}"));
        assert!(LifecycleStore::new(f.state_dir()).load().unwrap().create_error);

        let calls_before = f.cni.calls().len();
        handle(HookEvent::PostStop, &state, &env).unwrap();
        assert_eq!(f.cni.calls().len(), calls_before);
        assert_eq!(f.names().get("web").unwrap().as_deref(), Some(ID));
        assert!(f.state_dir().exists());
        assert!(!LifecycleStore::new(f.state_dir()).load().unwrap().create_error);
    }

    #[test]
    fn host_network_skips_cni_and_hosts() {
        let f = Fixture::new();
        let env = f.env();
        let state = f.state(r#"["host"]"#);
        handle(HookEvent::CreateRuntime, &state, &env).unwrap();
        assert!(f.cni.calls().is_empty());
        assert!(f.hosts().meta(ID).unwrap().is_none());
        assert_eq!(f.names().get("web").unwrap().as_deref(), Some(ID));
        handle(HookEvent::PostStop, &state, &env).unwrap();
        assert!(f.names().get("web").unwrap().is_none());
    }

    #[test]
    fn poststop_tolerates_released_name() {
        let f = Fixture::new();
        let env = f.env();
        let state = f.state(r#"["none"]"#);
        handle(HookEvent::PostStop, &state, &env).unwrap();
    }

    #[test]
    fn missing_labels_are_rejected() {
        let f = Fixture::new();
        let mut state = f.state(r#"["bridge"]"#);
        state.annotations.remove(labels::STATE_DIR);
        assert!(handle(HookEvent::CreateRuntime, &state, &f.env()).is_err());
    }
}
