//! Service parser: one compose service to an image plus per-replica `run`
//! arguments.

use berth_schema::compose::{
    BuildConfig, ComposeError, DeviceRequest, FileReference, PortConfig, Project, ResourceSpec,
    Scalar, ServiceConfig, ServiceVolume, StringOrList, UlimitConfig, VolumeType,
};
use berth_schema::PullMode;
use std::path::{Path, PathBuf};
use tracing::warn;

/// What `compose build` hands to the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub args: Vec<String>,
    pub target: Option<String>,
    /// `pull_policy: build`: rebuild even when the image exists.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedContainer {
    pub name: String,
    /// Arguments after `run`, ending with the image and command.
    pub run_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedService {
    pub name: String,
    pub image: String,
    pub pull_mode: PullMode,
    pub build: Option<BuildSpec>,
    pub containers: Vec<ParsedContainer>,
    /// Flags shared by every replica, without name, ports and `-d`.
    pub flags: Vec<String>,
    pub ports: Vec<String>,
    pub command: Vec<String>,
    pub unparsed: Vec<String>,
}

impl ParsedService {
    /// Arguments for a one-off `compose run` container. `extra` flags come
    /// after the service's own so they take precedence.
    pub fn one_off_args(
        &self,
        name: &str,
        command: Option<&[String]>,
        ports: &[String],
        extra: &[String],
        detach: bool,
        rm: bool,
    ) -> Vec<String> {
        let mut args = vec![format!("--name={name}"), "--pull=never".to_owned()];
        if detach {
            args.push("-d".to_owned());
        }
        if rm {
            args.push("--rm".to_owned());
        }
        args.extend(self.flags.iter().cloned());
        args.extend(extra.iter().cloned());
        args.extend(ports.iter().map(|p| format!("-p={p}")));
        args.push(self.image.clone());
        args.extend(command.map_or_else(|| self.command.clone(), <[String]>::to_vec));
        args
    }
}

/// `<project>_<service>_<n>`, 1-based.
pub fn replica_name(project: &str, service: &str, index: u32) -> String {
    format!("{project}_{service}_{index}")
}

/// Replica number from a container name, for sorting `exec --index` targets.
pub fn replica_index(name: &str) -> Option<u32> {
    name.rsplit('_').next().and_then(|n| n.parse().ok())
}

fn unsupported(svc: &ServiceConfig, what: &str) -> ComposeError {
    ComposeError::Unsupported(format!("service '{}': {what}", svc.name))
}

/// Split a command string into words, honoring single and double quotes.
pub fn split_command(s: &str) -> Result<Vec<String>, ComposeError> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(n) = chars.next() {
                    cur.push(n);
                }
            }
            (Some(_), c) => cur.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(n) = chars.next() {
                    cur.push(n);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            (None, c) => {
                cur.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err(ComposeError::Invalid(format!("unterminated quote in '{s}'")));
    }
    if in_word {
        out.push(cur);
    }
    Ok(out)
}

/// `1m30s`, `10s`, `500ms`, or a bare number of seconds, rounded down to seconds.
pub fn parse_duration_secs(s: &str) -> Result<u64, ComposeError> {
    if let Ok(n) = s.parse::<u64>() {
        return Ok(n);
    }
    humantime::parse_duration(s)
        .map(|d| d.as_secs())
        .map_err(|e| ComposeError::Invalid(format!("invalid duration '{s}': {e}")))
}

fn host_path(project: &Project, raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        project.working_dir.join(p)
    }
}

fn is_path_like(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}

fn volume_source(project: &Project, svc: &ServiceConfig, source: &str) -> Result<String, ComposeError> {
    if !project.volumes.contains_key(source) {
        return Err(ComposeError::Invalid(format!(
            "service '{}' refers to undefined volume '{source}'",
            svc.name
        )));
    }
    Ok(project.volume_full_name(source))
}

fn volume_flags(project: &Project, svc: &ServiceConfig) -> Result<Vec<String>, ComposeError> {
    let mut out = Vec::new();
    for v in &svc.volumes {
        match v {
            ServiceVolume::Short(raw) => {
                let mut parts = raw.splitn(3, ':');
                let first = parts.next().unwrap_or_default();
                match (parts.next(), parts.next()) {
                    (None, _) => out.push(format!("-v={first}")),
                    (Some(target), mode) => {
                        let source = if is_path_like(first) {
                            host_path(project, first).display().to_string()
                        } else {
                            volume_source(project, svc, first)?
                        };
                        let mut flag = format!("-v={source}:{target}");
                        if let Some(mode) = mode {
                            flag.push(':');
                            flag.push_str(mode);
                        }
                        out.push(flag);
                    }
                }
            }
            ServiceVolume::Long {
                kind,
                source,
                target,
                read_only,
                bind,
                tmpfs,
            } => {
                let ro = if *read_only { ",readonly" } else { "" };
                match kind {
                    VolumeType::Bind => {
                        let src = source.as_deref().ok_or_else(|| {
                            ComposeError::Invalid(format!(
                                "service '{}': bind mount of {target} needs a source",
                                svc.name
                            ))
                        })?;
                        let mut flag = format!(
                            "--mount=type=bind,src={},target={target}{ro}",
                            host_path(project, src).display()
                        );
                        if let Some(p) = bind.as_ref().and_then(|b| b.propagation.as_deref()) {
                            flag.push_str(&format!(",bind-propagation={p}"));
                        }
                        out.push(flag);
                    }
                    VolumeType::Volume => match source.as_deref().filter(|s| !s.is_empty()) {
                        Some(src) => out.push(format!(
                            "--mount=type=volume,src={},target={target}{ro}",
                            volume_source(project, svc, src)?
                        )),
                        None => out.push(format!("--mount=type=volume,target={target}{ro}")),
                    },
                    VolumeType::Tmpfs => {
                        let mut flag = format!("--mount=type=tmpfs,target={target}");
                        if let Some(size) = tmpfs.as_ref().and_then(|t| t.size.as_ref()) {
                            flag.push_str(&format!(",tmpfs-size={size}"));
                        }
                        out.push(flag);
                    }
                    VolumeType::Npipe => return Err(unsupported(svc, "npipe volumes")),
                }
            }
        }
    }
    Ok(out)
}

/// Secrets default to `/run/secrets/<name>`, configs to `/<name>`.
fn file_object_flags(
    project: &Project,
    svc: &ServiceConfig,
    refs: &[FileReference],
    secrets: bool,
) -> Result<Vec<String>, ComposeError> {
    let (kind, defs) = if secrets {
        ("secret", &project.secrets)
    } else {
        ("config", &project.configs)
    };
    let mut out = Vec::new();
    for r in refs {
        let def = defs.get(r.source()).ok_or_else(|| {
            ComposeError::Invalid(format!(
                "service '{}' refers to undefined {kind} '{}'",
                svc.name,
                r.source()
            ))
        })?;
        if def.is_external() {
            return Err(unsupported(svc, &format!("external {kind} '{}'", r.source())));
        }
        let file = def.file.as_deref().ok_or_else(|| {
            ComposeError::Invalid(format!("{kind} '{}' has no file", r.source()))
        })?;
        let target = match r.target() {
            Some(t) if t.starts_with('/') => t.to_owned(),
            Some(t) if secrets => format!("/run/secrets/{t}"),
            Some(t) => format!("/{t}"),
            None if secrets => format!("/run/secrets/{}", r.source()),
            None => format!("/{}", r.source()),
        };
        out.push(format!(
            "-v={}:{target}:ro",
            host_path(project, file).display()
        ));
    }
    Ok(out)
}

fn port_flags(ports: &[PortConfig]) -> Vec<String> {
    ports
        .iter()
        .map(|p| match p {
            PortConfig::Number(n) => n.to_string(),
            PortConfig::Short(s) => s.clone(),
            PortConfig::Long {
                target,
                published,
                host_ip,
                protocol,
                ..
            } => {
                let mut s = String::new();
                if let Some(ip) = host_ip {
                    s.push_str(ip);
                    s.push(':');
                }
                if let Some(p) = published {
                    s.push_str(&p.to_string());
                    s.push(':');
                } else if host_ip.is_some() {
                    s.push(':');
                }
                s.push_str(&target.to_string());
                if let Some(proto) = protocol {
                    s.push('/');
                    s.push_str(proto);
                }
                s
            }
        })
        .collect()
}

fn gpu_flag(req: &DeviceRequest) -> Option<String> {
    if !req.capabilities.iter().any(|c| c == "gpu") {
        return None;
    }
    let mut parts = Vec::new();
    match &req.count {
        Some(Scalar::Str(s)) if s == "all" => parts.push("count=all".to_owned()),
        Some(c) => parts.push(format!("count={c}")),
        None if req.device_ids.is_empty() => parts.push("count=all".to_owned()),
        None => {}
    }
    if !req.device_ids.is_empty() {
        parts.push(format!("\"device={}\"", req.device_ids.join(",")));
    }
    let caps: Vec<&str> = req
        .capabilities
        .iter()
        .map(String::as_str)
        .filter(|c| *c != "gpu")
        .collect();
    if !caps.is_empty() {
        parts.push(format!("\"capabilities={}\"", caps.join(",")));
    }
    if let Some(d) = &req.driver {
        parts.push(format!("driver={d}"));
    }
    Some(format!("--gpus={}", parts.join(",")))
}

fn restart_flag(svc: &ServiceConfig) -> Option<String> {
    let policy = svc.deploy.as_ref().and_then(|d| d.restart_policy.as_ref());
    if let Some(cond) = policy.and_then(|p| p.condition.as_deref()) {
        return match cond {
            "any" => Some("--restart=always".to_owned()),
            "none" => Some("--restart=no".to_owned()),
            other => {
                warn!(
                    "service {}: ignoring deploy.restart_policy.condition '{other}'",
                    svc.name
                );
                None
            }
        };
    }
    svc.restart.as_ref().map(|r| format!("--restart={r}"))
}

fn pull_mode(svc: &ServiceConfig) -> Result<(PullMode, bool), ComposeError> {
    match svc.pull_policy.as_deref() {
        None | Some("" | "missing" | "if_not_present") => Ok((PullMode::Missing, false)),
        Some("always") => Ok((PullMode::Always, false)),
        Some("never") => Ok((PullMode::Never, false)),
        Some("build") => Ok((PullMode::Never, true)),
        Some(other) => Err(ComposeError::Invalid(format!(
            "service '{}': unknown pull_policy '{other}'",
            svc.name
        ))),
    }
}

fn network_flags(project: &Project, svc: &ServiceConfig) -> Result<Vec<String>, ComposeError> {
    let mode = svc.network_mode.as_deref().or(svc.net.as_deref());
    if let Some(mode) = mode {
        if svc.networks.is_some() {
            return Err(ComposeError::Invalid(format!(
                "service '{}': network_mode and networks cannot be combined",
                svc.name
            )));
        }
        let value = match mode.split_once(':') {
            Some(("service", other)) => {
                project.service(other)?;
                format!("container:{}", replica_name(&project.name, other, 1))
            }
            _ => mode.to_owned(),
        };
        return Ok(vec![format!("--net={value}")]);
    }
    let mut out = Vec::new();
    let names = svc.network_names();
    for name in &names {
        out.push(format!("--net={}", project.network_full_name(name)));
        let Some(cfg) = svc.networks.as_ref().and_then(|n| n.config(name)) else {
            continue;
        };
        if !cfg.aliases.is_empty() {
            warn!("service {}: network aliases are not supported", svc.name);
        }
        if let Some(ip) = &cfg.ipv4_address {
            out.push(format!("--ip={ip}"));
        }
        if let Some(ip6) = &cfg.ipv6_address {
            out.push(format!("--ip6={ip6}"));
        }
    }
    Ok(out)
}

/// Limits with the deprecated top-level fields folded in.
fn limits(svc: &ServiceConfig) -> ResourceSpec {
    let mut limits = svc
        .deploy
        .as_ref()
        .and_then(|d| d.resources.as_ref())
        .and_then(|r| r.limits.clone())
        .unwrap_or_default();
    if limits.cpus.is_none() {
        limits.cpus.clone_from(&svc.cpus);
    }
    if limits.memory.is_none() {
        limits.memory.clone_from(&svc.mem_limit);
    }
    if limits.pids.is_none() {
        limits.pids = svc.pids_limit;
    }
    limits
}

#[allow(clippy::too_many_lines)]
fn common_flags(project: &Project, svc: &ServiceConfig) -> Result<Vec<String>, ComposeError> {
    let mut f: Vec<String> = Vec::new();
    let mut push = |flag: &str, value: &dyn std::fmt::Display| f.push(format!("--{flag}={value}"));

    let hostname = svc.hostname.clone().unwrap_or_else(|| svc.name.clone());
    push("hostname", &hostname);
    if let Some(v) = &svc.domainname {
        push("domainname", v);
    }
    if let Some(v) = &svc.mac_address {
        push("mac-address", v);
    }
    if let Some(v) = &svc.user {
        push("user", v);
    }
    if let Some(v) = &svc.working_dir {
        push("workdir", v);
    }
    if let Some(v) = &svc.ipc {
        push("ipc", v);
    }
    if let Some(v) = &svc.pid {
        push("pid", v);
    }
    if let Some(v) = &svc.stop_signal {
        push("stop-signal", v);
    }
    if let Some(v) = &svc.stop_grace_period {
        push("stop-timeout", &parse_duration_secs(v)?);
    }
    if let Some(v) = &svc.platform {
        push("platform", v);
    }
    if let Some(v) = svc.cpu_shares {
        push("cpu-shares", &v);
    }
    if let Some(v) = svc.cpu_quota {
        push("cpu-quota", &v);
    }
    if let Some(v) = svc.cpu_period {
        push("cpu-period", &v);
    }
    if let Some(v) = &svc.cpuset {
        push("cpuset-cpus", v);
    }
    if let Some(v) = &svc.mem_reservation {
        push("memory-reservation", v);
    }
    if let Some(v) = &svc.memswap_limit {
        push("memory-swap", v);
    }
    if let Some(v) = svc.oom_score_adj {
        push("oom-score-adj", &v);
    }
    if let Some(v) = &svc.shm_size {
        push("shm-size", v);
    }
    let lim = limits(svc);
    if let Some(v) = &lim.cpus {
        push("cpus", v);
    }
    if let Some(v) = &lim.memory {
        push("memory", v);
    }
    if let Some(v) = lim.pids {
        push("pids-limit", &v);
    }
    for v in &svc.cap_add {
        push("cap-add", v);
    }
    for v in &svc.cap_drop {
        push("cap-drop", v);
    }
    for v in &svc.security_opt {
        push("security-opt", v);
    }
    for v in svc.sysctls.to_list() {
        push("sysctl", &v);
    }
    for v in &svc.group_add {
        push("group-add", v);
    }
    for (name, limit) in &svc.ulimits {
        let value = match limit {
            UlimitConfig::Single(n) => format!("{name}={n}"),
            UlimitConfig::Pair { soft, hard } => format!("{name}={soft}:{hard}"),
        };
        push("ulimit", &value);
    }
    for dev in &svc.devices {
        let mut parts = dev.split(':');
        let host = parts.next().unwrap_or_default();
        if let Some(container) = parts.next() {
            if container != host && !matches!(container, "r" | "w" | "m" | "rw" | "rwm" | "rm" | "wm") {
                return Err(unsupported(
                    svc,
                    &format!("device '{dev}' maps to a different container path"),
                ));
            }
        }
        push("device", dev);
    }
    for v in svc.dns.as_ref().map(|d| d.to_vec()).unwrap_or_default() {
        push("dns", &v);
    }
    for v in svc.dns_search.as_ref().map(|d| d.to_vec()).unwrap_or_default() {
        push("dns-search", &v);
    }
    for v in &svc.dns_opt {
        push("dns-opt", v);
    }
    for (host, ip) in svc.extra_hosts.to_pairs(':') {
        let ip = ip.ok_or_else(|| {
            ComposeError::Invalid(format!("service '{}': extra_hosts entry '{host}' has no address", svc.name))
        })?;
        push("add-host", &format!("{host}:{ip}"));
    }
    for v in svc.environment.to_list() {
        push("env", &v);
    }
    for file in svc.env_file.as_ref().map(|e| e.to_vec()).unwrap_or_default() {
        push("env-file", &host_path(project, &file).display());
    }
    for v in svc.labels.to_list() {
        push("label", &v);
    }
    if let Some(logging) = &svc.logging {
        if let Some(d) = &logging.driver {
            push("log-driver", d);
        }
        for (k, v) in &logging.options {
            push("log-opt", &format!("{k}={v}"));
        }
    }
    if let Some(entrypoint) = &svc.entrypoint {
        let words = entrypoint.to_vec();
        match words.as_slice() {
            [one] => push("entrypoint", one),
            [] => {}
            _ => return Err(unsupported(svc, "multi-element entrypoint")),
        }
    }
    if svc.runtime.is_some() {
        warn!("service {}: ignoring runtime", svc.name);
    }

    if let Some(r) = restart_flag(svc) {
        f.push(r);
    }
    let reservations = svc
        .deploy
        .as_ref()
        .and_then(|d| d.resources.as_ref())
        .and_then(|r| r.reservations.as_ref());
    for req in reservations.map(|r| r.devices.as_slice()).unwrap_or_default() {
        if let Some(flag) = gpu_flag(req) {
            f.push(flag);
        }
    }
    for v in svc.tmpfs.as_ref().map(|t| t.to_vec()).unwrap_or_default() {
        f.push(format!("--tmpfs={v}"));
    }
    if svc.oom_kill_disable {
        f.push("--oom-kill-disable".to_owned());
    }
    if svc.privileged {
        f.push("--privileged".to_owned());
    }
    if svc.read_only {
        f.push("--read-only".to_owned());
    }
    if svc.tty {
        f.push("-t".to_owned());
    }
    if svc.stdin_open {
        f.push("-i".to_owned());
    }
    if svc.init == Some(true) {
        f.push("--init".to_owned());
    }
    f.extend(network_flags(project, svc)?);
    f.extend(volume_flags(project, svc)?);
    f.extend(file_object_flags(project, svc, &svc.secrets, true)?);
    f.extend(file_object_flags(project, svc, &svc.configs, false)?);
    Ok(f)
}

/// Parse one service of `project`.
pub fn parse_service(project: &Project, svc: &ServiceConfig) -> Result<ParsedService, ComposeError> {
    let unparsed: Vec<String> = svc.extra.keys().cloned().collect();
    for key in &unparsed {
        warn!("ignoring: service {}: {key}", svc.name);
    }
    let replicas = svc.replicas();
    if svc.container_name.is_some() && replicas != 1 {
        return Err(ComposeError::Invalid(format!(
            "service '{}': container_name requires exactly one replica, got {replicas}",
            svc.name
        )));
    }
    let (pull_mode, force_build) = pull_mode(svc)?;
    let build = svc.build.as_ref().map(|b| {
        let context = host_path(project, b.context());
        let (dockerfile, args, target) = match b {
            BuildConfig::Context(_) => (None, Vec::new(), None),
            BuildConfig::Full {
                dockerfile,
                args,
                target,
                ..
            } => (dockerfile.clone(), args.to_list(), target.clone()),
        };
        BuildSpec {
            dockerfile: context.join(dockerfile.as_deref().unwrap_or("Dockerfile")),
            context,
            args,
            target,
            force: force_build,
        }
    });
    let image = match (&svc.image, &build) {
        (Some(i), _) => i.clone(),
        (None, Some(_)) => format!("{}-{}", project.name, svc.name),
        (None, None) => {
            return Err(ComposeError::Invalid(format!(
                "service '{}' has neither an image nor a build context",
                svc.name
            )))
        }
    };
    let command = match &svc.command {
        Some(StringOrList::One(s)) => split_command(s)?,
        Some(StringOrList::Many(v)) => v.clone(),
        None => Vec::new(),
    };
    let flags = common_flags(project, svc)?;
    let ports = port_flags(&svc.ports);

    let containers = (1..=replicas)
        .map(|i| {
            let name = svc
                .container_name
                .clone()
                .unwrap_or_else(|| replica_name(&project.name, &svc.name, i));
            let mut run_args = vec![
                format!("--name={name}"),
                "-d".to_owned(),
                "--pull=never".to_owned(),
            ];
            run_args.extend(flags.iter().cloned());
            run_args.extend(ports.iter().map(|p| format!("-p={p}")));
            run_args.push(image.clone());
            run_args.extend(command.iter().cloned());
            ParsedContainer { name, run_args }
        })
        .collect();

    Ok(ParsedService {
        name: svc.name.clone(),
        image,
        pull_mode,
        build,
        containers,
        flags,
        ports,
        command,
        unparsed,
    })
}
