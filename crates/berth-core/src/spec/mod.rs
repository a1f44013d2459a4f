//! Translate a [`RunOptions`] record into an OCI runtime spec and the
//! container labels the hooks read back.
//!
//! [`build`] is a function of the option record plus [`SpecContext`], which
//! carries every host capability and store the builder consults. The only
//! side effect is creating the volumes that mounts refer to.

pub mod dns;
pub mod mounts;
pub mod process;
pub mod resources;
pub mod security;

use crate::hook::{HookCommand, HookEvent};
use crate::network::NetworkMode;
use crate::signal::parse_signal;
use crate::CoreError;
use berth_runtime::oci::{default_spec, NamespaceType, Spec, User};
use berth_runtime::{ImageInfo, NetworkStore};
use berth_schema::flags::{parse_extra_host, parse_key_value, read_label_file};
use berth_schema::labels::{self, Labels};
use berth_schema::{is_valid_object_name, parse_flag_p, OptionsError, PortMapping, RunOptions};
use berth_store::VolumeStore;
use chrono::Utc;
use resources::CgroupEnv;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A container another one refers to (`--network container:`, `--pid container:`).
#[derive(Debug, Clone)]
pub struct ResolvedContainer {
    pub id: String,
    pub pid: Option<u32>,
    pub labels: Labels,
    pub hosts_path: Option<PathBuf>,
}

pub trait ContainerResolver {
    fn resolve_container(&self, reference: &str) -> Result<ResolvedContainer, CoreError>;
}

/// Log driver settings recorded in the log-config label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub driver: String,
    #[serde(default)]
    pub opts: Labels,
}

impl LogConfig {
    pub fn from_labels(labels: &Labels) -> Self {
        labels
            .get(labels::LOG_CONFIG)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| Self {
                driver: "json-file".to_owned(),
                opts: Labels::new(),
            })
    }
}

fn log_config(opts: &RunOptions) -> Result<LogConfig, OptionsError> {
    let driver = opts.log_driver_or_default().to_owned();
    match driver.as_str() {
        "json-file" | "journald" | "none" => {}
        d if d.starts_with("binary://") => {}
        "fluentd" => {
            return Err(OptionsError::Invalid(
                "log driver fluentd is not supported".to_owned(),
            ))
        }
        other => {
            return Err(OptionsError::Invalid(format!(
                "unknown log driver '{other}' (expected json-file, journald, none, or binary://PATH)"
            )))
        }
    }
    let mut log_opts = Labels::new();
    for raw in &opts.log_opts {
        let (k, v) = parse_key_value(raw)?;
        log_opts.insert(k, v);
    }
    Ok(LogConfig {
        driver,
        opts: log_opts,
    })
}

/// Everything the builder needs from the host and the stores.
pub struct SpecContext<'a> {
    pub id: &'a str,
    pub namespace: &'a str,
    pub state_dir: &'a Path,
    /// Where this container's hosts file will be allocated.
    pub hosts_path: &'a Path,
    pub rootless: bool,
    pub cgroup: CgroupEnv,
    pub hook: &'a HookCommand,
    /// `None` for `--rootfs` containers.
    pub image: Option<&'a ImageInfo>,
    pub host_resolv_conf: String,
    pub host_gateway: Option<String>,
    pub default_network: &'a str,
    pub volumes: &'a VolumeStore,
    pub networks: &'a NetworkStore,
    pub containers: &'a dyn ContainerResolver,
    /// `(protocol, host_ip, count, exclude)` to the first port of a free run
    /// that avoids the ports in `exclude`.
    pub allocate_port: &'a dyn Fn(&str, &str, u16, &BTreeSet<u16>) -> Result<u16, OptionsError>,
    pub apparmor_available: bool,
    pub environ: &'a dyn Fn(&str) -> Option<String>,
    pub init_binary: Option<PathBuf>,
    pub dev_dir: PathBuf,
    pub cwd: PathBuf,
    pub home: Option<PathBuf>,
}

#[derive(Debug)]
pub struct BuiltSpec {
    pub spec: Spec,
    pub labels: Labels,
    pub name: String,
    pub hostname: String,
    pub network_mode: NetworkMode,
    pub port_mappings: Vec<PortMapping>,
    pub anonymous_volumes: Vec<String>,
    /// Contents for `<state-dir>/resolv.conf`; `None` when another file is mounted.
    pub resolv_conf: Option<String>,
    /// Seed for the hosts file; `None` when the container uses someone else's.
    pub hosts_seed: Option<String>,
}

/// `<image-base>-<id prefix>`, e.g. `alpine-0a1b2`.
pub fn generate_name(image: &str, id: &str) -> String {
    let base = image
        .rsplit('/')
        .next()
        .unwrap_or(image)
        .split([':', '@'])
        .next()
        .unwrap_or("container");
    let base: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
        .collect();
    let base = base.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    let base = if base.is_empty() { "container" } else { base };
    format!("{base}-{}", &id[..5.min(id.len())])
}

fn user_labels(opts: &RunOptions) -> Result<Labels, OptionsError> {
    let mut out = Labels::new();
    for file in &opts.label_files {
        out.extend(read_label_file(file)?);
    }
    for raw in &opts.labels {
        match raw.split_once('=') {
            Some((k, v)) if !k.is_empty() => {
                out.insert(k.to_owned(), v.to_owned());
            }
            Some(_) => return Err(OptionsError::Invalid(format!("invalid label '{raw}'"))),
            None => {
                out.insert(raw.clone(), String::new());
            }
        }
    }
    labels::check_user_labels(&out)?;
    Ok(out)
}

fn extra_hosts(opts: &RunOptions, gateway: Option<&str>) -> Result<Vec<String>, OptionsError> {
    opts.add_host
        .iter()
        .map(|raw| {
            let (host, ip) = parse_extra_host(raw)?;
            let ip = if ip == "host-gateway" {
                gateway
                    .ok_or_else(|| {
                        OptionsError::Invalid(
                            "host-gateway requested but no gateway address is known".to_owned(),
                        )
                    })?
                    .to_owned()
            } else {
                ip
            };
            Ok(format!("{host}:{ip}"))
        })
        .collect()
}

fn host_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_owned())
        .unwrap_or_default()
}

fn set_label(labels: &mut Labels, key: &str, value: impl Into<String>) {
    labels.insert(key.to_owned(), value.into());
}

fn network_label(mode: &NetworkMode, target_id: Option<&str>) -> Vec<String> {
    match mode {
        NetworkMode::Host => vec!["host".to_owned()],
        NetworkMode::None => vec!["none".to_owned()],
        NetworkMode::Container(r) => vec![format!("container:{}", target_id.unwrap_or(r))],
        NetworkMode::Namespace(p) => vec![format!("ns:{p}")],
        NetworkMode::Cni(names) => names.clone(),
    }
}

fn require_pid(target: &ResolvedContainer, what: &str) -> Result<u32, CoreError> {
    target.pid.ok_or_else(|| {
        CoreError::Precondition(format!(
            "container {} must be running to share its {what} namespace",
            target.id
        ))
    })
}

/// Parse every `--publish` value. Host ports are allocated only on CNI
/// networks; elsewhere the values are validated and then dropped.
fn publish_ports(
    opts: &RunOptions,
    mode: &NetworkMode,
    ctx: &SpecContext<'_>,
) -> Result<Vec<PortMapping>, OptionsError> {
    let cni = !mode.cni_networks().is_empty();
    // Ports handed out to earlier values, per protocol.
    let mut taken: BTreeMap<String, BTreeSet<u16>> = BTreeMap::new();
    let mut mappings = Vec::new();
    for raw in &opts.publish {
        let parsed = parse_flag_p(raw, |proto, ip, count| {
            if !cni {
                return Ok(0);
            }
            let exclude = taken.get(proto).cloned().unwrap_or_default();
            (ctx.allocate_port)(proto, ip, count, &exclude)
        })?;
        for m in &parsed {
            taken
                .entry(m.protocol.clone())
                .or_default()
                .insert(m.host_port);
        }
        mappings.extend(parsed);
    }
    if !cni && !mappings.is_empty() {
        warn!("ports are only published on CNI networks; ignoring --publish");
        mappings.clear();
    }
    Ok(mappings)
}

/// Build the spec and labels for a new container.
#[allow(clippy::too_many_lines)]
pub fn build(opts: &RunOptions, ctx: &SpecContext<'_>) -> Result<BuiltSpec, CoreError> {
    let id = ctx.id;
    let mut spec = default_spec(ctx.rootless);
    let mut labels = user_labels(opts)?;

    // Networking.
    let mut mode = NetworkMode::parse(&opts.networks_or_default(ctx.default_network))?;
    if let NetworkMode::Cni(names) = &mode {
        let mut canonical = Vec::with_capacity(names.len());
        for n in names {
            canonical.push(ctx.networks.get(n)?.name);
        }
        mode = NetworkMode::Cni(canonical);
    }
    if opts.mac_address.is_some()
        && matches!(mode, NetworkMode::Host | NetworkMode::Container(_))
    {
        return Err(OptionsError::Conflict(
            "mac-address cannot be combined with network host or container".to_owned(),
        )
        .into());
    }
    if (opts.ip.is_some() || opts.ip6.is_some()) && mode.cni_networks().is_empty() {
        return Err(OptionsError::Conflict(
            "ip and ip6 require a CNI network".to_owned(),
        )
        .into());
    }

    let port_mappings = publish_ports(opts, &mode, ctx)?;

    let net_target = match &mode {
        NetworkMode::Container(r) => Some(ctx.containers.resolve_container(r)?),
        _ => None,
    };

    // Hostname and UTS.
    let uts_host = match opts.uts.as_deref() {
        None | Some("" | "private") => false,
        Some("host") => true,
        Some(other) => {
            return Err(OptionsError::Invalid(format!("invalid uts mode '{other}'")).into())
        }
    };
    if uts_host && opts.hostname.is_some() {
        return Err(OptionsError::Conflict(
            "hostname cannot be set together with uts=host".to_owned(),
        )
        .into());
    }
    let hostname = if let Some(h) = opts.hostname.clone().filter(|h| !h.is_empty()) {
        if !dns::validate_hostname(&h) {
            return Err(OptionsError::Invalid(format!("invalid hostname '{h}'")).into());
        }
        h
    } else if let Some(target) = &net_target {
        target
            .labels
            .get(labels::HOSTNAME)
            .cloned()
            .unwrap_or_default()
    } else if mode == NetworkMode::Host || uts_host {
        host_hostname()
    } else {
        id[..12.min(id.len())].to_owned()
    };
    let domainname = opts.domainname.clone().unwrap_or_default();
    if mode == NetworkMode::Host || uts_host {
        spec.set_namespace(NamespaceType::Uts, None, false);
    } else {
        spec.hostname.clone_from(&hostname);
        spec.domainname.clone_from(&domainname);
    }

    // Process.
    let default_config = berth_runtime::supervisor::ImageConfig::default();
    let image_config = ctx.image.map_or(&default_config, |i| &i.config);
    let rootfs: Option<PathBuf> = if opts.rootfs {
        Some(std::path::absolute(&opts.image)?)
    } else {
        ctx.image.map(|i| i.rootfs.clone())
    };
    let user = opts
        .user
        .clone()
        .or_else(|| Some(image_config.user.clone()).filter(|u| !u.is_empty()));
    let identity = process::resolve_identity(user.as_deref(), &opts.group_add, rootfs.as_deref())?;
    {
        let args = process::process_args(opts, image_config)?;
        let env = process::process_env(opts, image_config, &hostname, ctx.environ)?;
        let cwd = process::working_dir(opts, image_config)?;
        let umask = opts.umask.as_deref().map(process::parse_umask).transpose()?;
        let p = spec.process_mut();
        p.args = args;
        p.env = env;
        p.cwd = cwd;
        p.terminal = opts.tty;
        p.user = User {
            uid: identity.uid,
            gid: identity.gid,
            umask,
            additional_gids: identity.additional_gids,
        };
    }

    // Namespaces.
    match &mode {
        NetworkMode::Host => spec.set_namespace(NamespaceType::Network, None, false),
        NetworkMode::Container(_) => {
            if let Some(target) = &net_target {
                let pid = require_pid(target, "network")?;
                spec.set_namespace(
                    NamespaceType::Network,
                    Some(format!("/proc/{pid}/ns/net")),
                    true,
                );
            }
        }
        NetworkMode::Namespace(path) => {
            spec.set_namespace(NamespaceType::Network, Some(path.clone()), true);
        }
        NetworkMode::None | NetworkMode::Cni(_) => {}
    }

    let ipc_host = match opts.ipc.as_deref() {
        None | Some("" | "private" | "shareable") => false,
        Some("host") => true,
        Some(other) => {
            return Err(OptionsError::Invalid(format!("invalid ipc mode '{other}'")).into())
        }
    };

    let mut pid_host = false;
    match opts.pid.as_deref() {
        None | Some("") => {}
        Some("host") => pid_host = true,
        Some(other) => match other.strip_prefix("container:") {
            Some(r) if !r.is_empty() => {
                let target = ctx.containers.resolve_container(r)?;
                let pid = require_pid(&target, "pid")?;
                spec.set_namespace(NamespaceType::Pid, Some(format!("/proc/{pid}/ns/pid")), true);
                set_label(&mut labels, labels::PID_CONTAINER, target.id);
            }
            _ => {
                return Err(OptionsError::Invalid(format!("invalid pid mode '{other}'")).into())
            }
        },
    }

    match opts.cgroupns.as_deref() {
        Some("host") => spec.set_namespace(NamespaceType::Cgroup, None, false),
        Some("private") => spec.set_namespace(NamespaceType::Cgroup, None, true),
        None | Some("") => {
            if ctx.cgroup.v2 {
                spec.set_namespace(NamespaceType::Cgroup, None, true);
            }
        }
        Some(other) => {
            return Err(OptionsError::Invalid(format!("invalid cgroupns mode '{other}'")).into())
        }
    }
    match opts.userns.as_deref() {
        None | Some("" | "host") => {}
        Some(other) => {
            return Err(OptionsError::Invalid(format!(
                "userns mode '{other}' is not supported"
            ))
            .into())
        }
    }

    // Resources.
    resources::apply_resources(&mut spec, opts, &ctx.cgroup)?;
    resources::apply_oom_score_adj(&mut spec, opts, &ctx.cgroup)?;
    resources::apply_ulimits(&mut spec, &opts.ulimits)?;
    resources::apply_rdt_class(&mut spec, opts.rdt_class.as_deref());
    spec.linux_mut().cgroups_path = resources::cgroups_path(
        &ctx.cgroup,
        opts.cgroup_parent.as_deref(),
        ctx.namespace,
        id,
    );

    // Security.
    security::apply_capabilities(&mut spec, opts.privileged, &opts.cap_add, &opts.cap_drop)?;
    let outcome = security::apply_security_opts(
        &mut spec,
        &opts.security_opt,
        opts.privileged,
        ctx.apparmor_available,
    )?;
    if opts.privileged {
        security::apply_privileged(&mut spec);
        if !outcome.privileged_without_host_devices {
            resources::add_host_devices(&mut spec, &ctx.dev_dir);
        }
    }
    resources::apply_devices(&mut spec, &opts.devices)?;
    resources::apply_gpus(&mut spec, &opts.gpus, &ctx.dev_dir)?;
    security::apply_sysctls(&mut spec, &opts.sysctl)?;

    // Filesystem.
    let root = spec.root.get_or_insert_with(Default::default);
    if let Some(path) = &rootfs {
        if opts.rootfs {
            root.path.clone_from(path);
        }
    }
    root.readonly = opts.read_only;

    let user_mounts = mounts::user_mounts(opts, id, ctx.volumes, &ctx.cwd, ctx.home.clone())?;
    mounts::apply_user_mounts(&mut spec, &user_mounts);
    mounts::apply_shm_size(&mut spec, opts.shm_size.as_deref())?;

    let resolv_path = ctx.state_dir.join(berth_store::layout::state_files::RESOLV_CONF);
    let hostname_path = ctx.state_dir.join(berth_store::layout::state_files::HOSTNAME);
    let (resolv_conf, hosts_seed) = match (&mode, &net_target) {
        (NetworkMode::Container(_), Some(target)) => {
            let target_state = target.labels.get(labels::STATE_DIR).map(PathBuf::from);
            let hosts = target.hosts_path.clone().ok_or_else(|| {
                CoreError::Precondition(format!("container {} has no hosts file", target.id))
            })?;
            let resolv = target_state
                .as_ref()
                .map(|d| d.join(berth_store::layout::state_files::RESOLV_CONF))
                .ok_or_else(|| {
                    CoreError::Precondition(format!("container {} has no state dir", target.id))
                })?;
            for m in mounts::etc_mounts(&hosts, &resolv, None) {
                spec.upsert_mount(m);
            }
            (None, None)
        }
        (NetworkMode::Host, _) => {
            for m in mounts::etc_mounts(Path::new("/etc/hosts"), &resolv_path, None) {
                spec.upsert_mount(m);
            }
            (Some(ctx.host_resolv_conf.clone()), None)
        }
        _ => {
            for m in mounts::etc_mounts(ctx.hosts_path, &resolv_path, Some(&hostname_path)) {
                spec.upsert_mount(m);
            }
            let resolv = dns::container_resolv_conf(
                &ctx.host_resolv_conf,
                &opts.dns,
                &opts.dns_search,
                &opts.dns_opt,
            );
            (Some(resolv), Some(dns::hosts_seed(&hostname)))
        }
    };

    if ipc_host {
        mounts::apply_ipc_host(&mut spec);
        set_label(&mut labels, labels::IPC, "host");
    }
    if pid_host {
        mounts::apply_pid_host(&mut spec, ctx.rootless);
    }
    if opts.init {
        let tini = ctx.init_binary.as_ref().ok_or_else(|| {
            CoreError::Precondition("--init requires tini to be installed on the host".to_owned())
        })?;
        spec.upsert_mount(mounts::init_mount(tini));
    }

    // Hooks.
    let hooks = spec.hooks_mut();
    hooks.create_runtime.push(ctx.hook.hook(HookEvent::CreateRuntime));
    hooks.poststop.push(ctx.hook.hook(HookEvent::PostStop));

    // Identity and labels.
    let name = match opts.name.clone().filter(|n| !n.is_empty()) {
        Some(n) => {
            if !is_valid_object_name(&n) {
                return Err(OptionsError::Invalid(format!(
                    "invalid container name '{n}': must match [a-zA-Z0-9][a-zA-Z0-9_.-]*"
                ))
                .into());
            }
            n
        }
        None => generate_name(&opts.image, id),
    };
    let restart = opts.restart_policy()?;
    let stop_signal = opts.stop_signal_or_default();
    parse_signal(stop_signal)?;
    let log = log_config(opts)?;
    opts.verify_mode()?;
    opts.pull_mode()?;

    set_label(&mut labels, labels::NAMESPACE, ctx.namespace);
    set_label(&mut labels, labels::NAME, name.clone());
    set_label(&mut labels, labels::HOSTNAME, hostname.clone());
    if !domainname.is_empty() {
        set_label(&mut labels, labels::DOMAINNAME, domainname);
    }
    set_label(&mut labels, labels::STATE_DIR, ctx.state_dir.to_string_lossy());
    let target_id = net_target.as_ref().map(|t| t.id.as_str());
    set_label(
        &mut labels,
        labels::NETWORKS,
        labels::encode_list(&network_label(&mode, target_id))?,
    );
    set_label(
        &mut labels,
        labels::DEFAULT_NETWORK,
        opts.networks.is_empty().to_string(),
    );
    set_label(
        &mut labels,
        labels::EXTRA_HOSTS,
        labels::encode_list(&extra_hosts(opts, ctx.host_gateway.as_deref())?)?,
    );
    set_label(
        &mut labels,
        labels::PORTS,
        serde_json::to_string(&port_mappings).map_err(OptionsError::from)?,
    );
    if let Some(ip) = &opts.ip {
        set_label(&mut labels, labels::IP_ADDRESS, ip.clone());
    }
    if let Some(ip6) = &opts.ip6 {
        set_label(&mut labels, labels::IP6_ADDRESS, ip6.clone());
    }
    if let Some(mac) = &opts.mac_address {
        set_label(&mut labels, labels::MAC_ADDRESS, mac.clone());
    }
    if let Some(pidfile) = &opts.pidfile {
        set_label(
            &mut labels,
            labels::PID_FILE,
            std::path::absolute(pidfile)?.to_string_lossy(),
        );
    }
    set_label(&mut labels, labels::STOP_SIGNAL, stop_signal);
    if let Some(t) = opts.stop_timeout {
        set_label(&mut labels, labels::STOP_TIMEOUT, t.to_string());
    }
    set_label(&mut labels, labels::RESTART, restart.to_string());
    set_label(&mut labels, labels::IMAGE, opts.image.clone());
    if let Some(p) = &opts.platform {
        set_label(&mut labels, labels::PLATFORM, p.clone());
    }
    set_label(&mut labels, labels::CREATED_AT, Utc::now().to_rfc3339());
    set_label(
        &mut labels,
        labels::LOG_CONFIG,
        serde_json::to_string(&log).map_err(OptionsError::from)?,
    );
    set_label(
        &mut labels,
        labels::MOUNTS,
        labels::encode_list(&user_mounts.descriptions)?,
    );
    set_label(
        &mut labels,
        labels::ANONYMOUS_VOLUMES,
        labels::encode_list(&user_mounts.anonymous_volumes)?,
    );
    let bypass = labels.get("bypass4netns").is_some_and(|v| v == "true");
    set_label(&mut labels, labels::BYPASS4NETNS, bypass.to_string());

    spec.annotations.extend(labels.clone());
    debug!("built spec for {id} ({name})");

    Ok(BuiltSpec {
        spec,
        labels,
        name,
        hostname,
        network_mode: mode,
        port_mappings,
        anonymous_volumes: user_mounts.anonymous_volumes,
        resolv_conf,
        hosts_seed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_runtime::cni::CreateNetworkOptions;
    use std::collections::BTreeMap;

    struct Peers(BTreeMap<String, ResolvedContainer>);

    impl ContainerResolver for Peers {
        fn resolve_container(&self, reference: &str) -> Result<ResolvedContainer, CoreError> {
            self.0
                .get(reference)
                .cloned()
                .ok_or_else(|| CoreError::NoSuchContainer(reference.to_owned()))
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        volumes: VolumeStore,
        networks: NetworkStore,
        hook: HookCommand,
        peers: Peers,
    }

    const ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let volumes = VolumeStore::new(dir.path().join("volumes"));
            let networks = NetworkStore::new(dir.path().join("net.d"));
            let hook = HookCommand {
                binary: PathBuf::from("/usr/bin/berth"),
                data_root: dir.path().join("root"),
                cni_path: PathBuf::from("/opt/cni/bin"),
                netconf: dir.path().join("net.d"),
                bridge_ip: None,
                env: vec!["PATH=/usr/bin:/bin".to_owned()],
            };
            Self {
                dir,
                volumes,
                networks,
                hook,
                peers: Peers(BTreeMap::new()),
            }
        }

        fn build(&self, opts: &RunOptions) -> Result<BuiltSpec, CoreError> {
            let state_dir = self.dir.path().join("state");
            let hosts = self.dir.path().join("hosts");
            let alloc = |_: &str, _: &str, _: u16, exclude: &BTreeSet<u16>| -> Result<u16, OptionsError> {
                Ok((49153..).find(|p| !exclude.contains(p)).unwrap_or(49153))
            };
            let environ = |k: &str| (k == "HOME_VAR").then(|| "x".to_owned());
            let ctx = SpecContext {
                id: ID,
                namespace: "default",
                state_dir: &state_dir,
                hosts_path: &hosts,
                rootless: false,
                cgroup: CgroupEnv {
                    v2: true,
                    manager: "cgroupfs".to_owned(),
                    rootless: false,
                    oom_score_adj_floor: None,
                },
                hook: &self.hook,
                image: None,
                host_resolv_conf: "nameserver 127.0.0.53\n".to_owned(),
                host_gateway: Some("10.4.0.1".to_owned()),
                default_network: "bridge",
                volumes: &self.volumes,
                networks: &self.networks,
                containers: &self.peers,
                allocate_port: &alloc,
                apparmor_available: false,
                environ: &environ,
                init_binary: None,
                dev_dir: self.dir.path().join("dev"),
                cwd: self.dir.path().to_path_buf(),
                home: None,
            };
            build(opts, &ctx)
        }
    }

    fn run(image: &str, args: &[&str]) -> RunOptions {
        RunOptions {
            image: image.to_owned(),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
            ..RunOptions::default()
        }
    }

    #[test]
    fn default_container_labels_and_hooks() {
        let f = Fixture::new();
        let built = f.build(&run("docker.io/library/alpine:3.19", &["sleep", "1"])).unwrap();
        assert_eq!(built.name, "alpine-01234");
        assert_eq!(built.hostname, "0123456789ab");
        assert_eq!(built.labels[labels::NETWORKS], r#"["bridge"]"#);
        assert_eq!(built.labels[labels::DEFAULT_NETWORK], "true");
        assert_eq!(built.labels[labels::STOP_SIGNAL], "SIGTERM");
        assert_eq!(built.spec.annotations, built.labels);
        let hooks = built.spec.hooks.as_ref().unwrap();
        assert_eq!(hooks.create_runtime[0].args[3], "createRuntime");
        assert_eq!(hooks.poststop[0].args[3], "postStop");
        assert!(built.resolv_conf.unwrap().contains("nameserver 8.8.8.8"));
        assert!(built.hosts_seed.unwrap().contains("0123456789ab"));
        let etc_hosts = built
            .spec
            .mounts
            .iter()
            .find(|m| m.destination == "/etc/hosts")
            .unwrap();
        assert_eq!(
            etc_hosts.source.as_deref(),
            Some(f.dir.path().join("hosts").to_str().unwrap())
        );
    }

    #[test]
    fn publish_and_user_labels() {
        let f = Fixture::new();
        f.networks
            .create(&CreateNetworkOptions {
                name: "n1".to_owned(),
                ..CreateNetworkOptions::default()
            })
            .unwrap();
        let opts = RunOptions {
            networks: vec!["n1".to_owned()],
            publish: vec!["127.0.0.1:8080:80".to_owned(), "3000-3001:8080-8081/tcp".to_owned(), "53/udp".to_owned()],
            labels: vec!["app=web".to_owned(), "bypass4netns=true".to_owned()],
            add_host: vec!["gw:host-gateway".to_owned()],
            name: Some("foo".to_owned()),
            hostname: Some("bar".to_owned()),
            ..run("alpine", &["true"])
        };
        let built = f.build(&opts).unwrap();
        assert_eq!(built.port_mappings.len(), 4);
        assert_eq!(built.port_mappings[1].host_port, 3000);
        assert_eq!(built.port_mappings[2].container_port, 8081);
        assert_eq!(built.port_mappings[3].host_port, 49153);
        assert_eq!(built.labels["app"], "web");
        assert_eq!(built.labels[labels::BYPASS4NETNS], "true");
        assert_eq!(built.labels[labels::DEFAULT_NETWORK], "false");
        assert_eq!(built.labels[labels::EXTRA_HOSTS], r#"["gw:10.4.0.1"]"#);
        assert_eq!(built.spec.hostname, "bar");
        assert_eq!(
            labels::decode_ports(&built.labels).unwrap(),
            built.port_mappings
        );
    }

    #[test]
    fn allocated_host_ports_are_distinct() {
        let f = Fixture::new();
        f.networks
            .create(&CreateNetworkOptions {
                name: "n1".to_owned(),
                ..CreateNetworkOptions::default()
            })
            .unwrap();
        let opts = RunOptions {
            networks: vec!["n1".to_owned()],
            publish: vec!["80".to_owned(), "443".to_owned(), "53/udp".to_owned()],
            ..run("alpine", &["true"])
        };
        let built = f.build(&opts).unwrap();
        let hosts: Vec<u16> = built.port_mappings.iter().map(|m| m.host_port).collect();
        assert_eq!(hosts, vec![49153, 49154, 49153]);
    }

    #[test]
    fn invalid_publish_rejected_off_cni() {
        let f = Fixture::new();
        for network in ["none", "host"] {
            let opts = RunOptions {
                networks: vec![network.to_owned()],
                publish: vec!["notaport".to_owned()],
                ..run("alpine", &["true"])
            };
            let err = f.build(&opts).unwrap_err();
            assert!(err.to_string().starts_with("invalid argument:"), "{err}");
        }
    }

    #[test]
    fn unknown_network_and_conflicts() {
        let f = Fixture::new();
        let opts = RunOptions {
            networks: vec!["missing".to_owned()],
            ..run("alpine", &["true"])
        };
        assert!(f.build(&opts).unwrap_err().is_not_found());

        let opts = RunOptions {
            networks: vec!["host".to_owned()],
            mac_address: Some("02:42:ac:11:00:02".to_owned()),
            ..run("alpine", &["true"])
        };
        let err = f.build(&opts).unwrap_err();
        assert!(err.to_string().starts_with("options error:"));

        let opts = RunOptions {
            labels: vec!["berth/name=x".to_owned()],
            ..run("alpine", &["true"])
        };
        assert!(f.build(&opts).is_err());

        let opts = RunOptions {
            log_driver: "fluentd".to_owned(),
            ..run("alpine", &["true"])
        };
        assert!(f.build(&opts).is_err());
    }

    #[test]
    fn host_network_drops_ports_and_namespaces() {
        let f = Fixture::new();
        let opts = RunOptions {
            networks: vec!["host".to_owned()],
            publish: vec!["80:80".to_owned()],
            ..run("alpine", &["true"])
        };
        let built = f.build(&opts).unwrap();
        assert!(built.port_mappings.is_empty());
        assert!(!built.spec.has_namespace(NamespaceType::Network));
        assert!(!built.spec.has_namespace(NamespaceType::Uts));
        assert!(built.hosts_seed.is_none());
        assert_eq!(built.labels[labels::NETWORKS], r#"["host"]"#);
    }

    #[test]
    fn container_network_joins_peer() {
        let mut f = Fixture::new();
        let mut peer_labels = Labels::new();
        peer_labels.insert(labels::HOSTNAME.to_owned(), "peerhost".to_owned());
        peer_labels.insert(labels::STATE_DIR.to_owned(), "/state/peer".to_owned());
        f.peers.0.insert(
            "peer".to_owned(),
            ResolvedContainer {
                id: "peerid".to_owned(),
                pid: Some(4242),
                labels: peer_labels,
                hosts_path: Some(PathBuf::from("/etchosts/peer/hosts")),
            },
        );
        let opts = RunOptions {
            networks: vec!["container:peer".to_owned()],
            ..run("alpine", &["true"])
        };
        let built = f.build(&opts).unwrap();
        let ns = built
            .spec
            .linux
            .as_ref()
            .unwrap()
            .namespaces
            .iter()
            .find(|n| n.kind == NamespaceType::Network)
            .unwrap();
        assert_eq!(ns.path.as_deref(), Some("/proc/4242/ns/net"));
        assert_eq!(built.hostname, "peerhost");
        assert_eq!(built.labels[labels::NETWORKS], r#"["container:peerid"]"#);
        assert!(built.resolv_conf.is_none());
        let hosts = built
            .spec
            .mounts
            .iter()
            .find(|m| m.destination == "/etc/hosts")
            .unwrap();
        assert_eq!(hosts.source.as_deref(), Some("/etchosts/peer/hosts"));
    }

    #[test]
    fn init_requires_binary() {
        let f = Fixture::new();
        let opts = RunOptions {
            init: true,
            ..run("alpine", &["true"])
        };
        assert!(f.build(&opts).is_err());
    }

    #[test]
    fn generated_names() {
        assert_eq!(generate_name("registry.example.com/team/app:1.0", "abcdef"), "app-abcde");
        assert_eq!(generate_name("alpine@sha256:00", "abcdef"), "alpine-abcde");
    }
}
