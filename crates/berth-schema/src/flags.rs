//! Typed parsers for individual flag values.

use crate::OptionsError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure { max_retries: Option<u32> },
    UnlessStopped,
}

impl FromStr for RestartPolicy {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" => Ok(Self::No),
            "always" => Ok(Self::Always),
            "unless-stopped" => Ok(Self::UnlessStopped),
            "on-failure" => Ok(Self::OnFailure { max_retries: None }),
            other => match other.strip_prefix("on-failure:") {
                Some(n) => {
                    let n = n.parse::<u32>().map_err(|_| {
                        OptionsError::Invalid(format!("invalid restart retry count '{n}'"))
                    })?;
                    Ok(Self::OnFailure {
                        max_retries: Some(n),
                    })
                }
                None => Err(OptionsError::Invalid(format!(
                    "unsupported restart policy '{other}' (expected no, always, on-failure[:N], unless-stopped)"
                ))),
            },
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::No => write!(f, "no"),
            Self::Always => write!(f, "always"),
            Self::UnlessStopped => write!(f, "unless-stopped"),
            Self::OnFailure { max_retries: None } => write!(f, "on-failure"),
            Self::OnFailure {
                max_retries: Some(n),
            } => write!(f, "on-failure:{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullMode {
    Always,
    Missing,
    Never,
}

impl FromStr for PullMode {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "missing" => Ok(Self::Missing),
            "never" => Ok(Self::Never),
            other => Err(OptionsError::Invalid(format!(
                "invalid pull mode '{other}' (expected always, missing, never)"
            ))),
        }
    }
}

impl fmt::Display for PullMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::Missing => write!(f, "missing"),
            Self::Never => write!(f, "never"),
        }
    }
}

/// `<name|uid>[:<group|gid>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpec {
    pub user: String,
    pub group: Option<String>,
}

pub fn parse_user(s: &str) -> Result<UserSpec, OptionsError> {
    let (user, group) = match s.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (s, None),
    };
    if user.is_empty() || group.is_some_and(str::is_empty) {
        return Err(OptionsError::Invalid(format!("invalid user '{s}'")));
    }
    Ok(UserSpec {
        user: user.to_owned(),
        group: group.map(str::to_owned),
    })
}

/// `host[:container][:mode]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub host_path: String,
    pub container_path: String,
    pub permissions: String,
}

fn is_device_mode(s: &str) -> bool {
    !s.is_empty() && s.len() <= 3 && s.chars().all(|c| matches!(c, 'r' | 'w' | 'm'))
}

pub fn parse_device(s: &str) -> Result<DeviceSpec, OptionsError> {
    let parts: Vec<&str> = s.split(':').collect();
    let (host, container, mode) = match parts.as_slice() {
        [host] => (*host, *host, "rwm"),
        [host, second] if is_device_mode(second) => (*host, *host, *second),
        [host, container] => (*host, *container, "rwm"),
        [host, container, mode] => (*host, *container, *mode),
        _ => return Err(OptionsError::InvalidDevice(s.to_owned())),
    };
    if !host.starts_with('/') {
        return Err(OptionsError::InvalidDevice(format!(
            "{s}: device path must be absolute"
        )));
    }
    if container != host {
        return Err(OptionsError::InvalidDevice(format!(
            "{s}: container path must be equal to the host path"
        )));
    }
    if !is_device_mode(mode) {
        return Err(OptionsError::InvalidDevice(format!(
            "{s}: mode '{mode}' is not a subset of 'rwm'"
        )));
    }
    Ok(DeviceSpec {
        host_path: host.to_owned(),
        container_path: container.to_owned(),
        permissions: mode.to_owned(),
    })
}

/// `name=soft[:hard]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: String,
    pub soft: u64,
    pub hard: u64,
}

impl Ulimit {
    /// OCI rlimit type, e.g. `RLIMIT_NOFILE`.
    pub fn rlimit_type(&self) -> String {
        format!("RLIMIT_{}", self.name.to_uppercase())
    }
}

const ULIMIT_NAMES: &[&str] = &[
    "core", "cpu", "data", "fsize", "locks", "memlock", "msgqueue", "nice", "nofile", "nproc",
    "rss", "rtprio", "rttime", "sigpending", "stack", "as",
];

pub fn parse_ulimit(s: &str) -> Result<Ulimit, OptionsError> {
    let (name, limits) = s
        .split_once('=')
        .ok_or_else(|| OptionsError::Invalid(format!("invalid ulimit '{s}'")))?;
    if !ULIMIT_NAMES.contains(&name) {
        return Err(OptionsError::Invalid(format!("unknown ulimit type '{name}'")));
    }
    let parse = |v: &str| -> Result<u64, OptionsError> {
        if v == "-1" || v == "unlimited" {
            return Ok(u64::MAX);
        }
        v.parse()
            .map_err(|_| OptionsError::Invalid(format!("invalid ulimit value '{v}' in '{s}'")))
    };
    let (soft, hard) = match limits.split_once(':') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let v = parse(limits)?;
            (v, v)
        }
    };
    if soft > hard {
        return Err(OptionsError::Invalid(format!(
            "ulimit soft limit must be less than or equal to hard limit: {s}"
        )));
    }
    Ok(Ulimit {
        name: name.to_owned(),
        soft,
        hard,
    })
}

/// One `--gpus` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuRequest {
    /// `-1` means all devices.
    pub count: i64,
    pub device_ids: Vec<String>,
    pub capabilities: Vec<String>,
    pub driver: String,
}

pub fn parse_gpus(s: &str) -> Result<GpuRequest, OptionsError> {
    let mut req = GpuRequest {
        driver: "nvidia".to_owned(),
        ..GpuRequest::default()
    };
    if s == "all" {
        req.count = -1;
        return Ok(req);
    }
    if let Ok(n) = s.parse::<i64>() {
        req.count = n;
        return Ok(req);
    }
    for field in split_csv(s) {
        let (k, v) = field
            .split_once('=')
            .ok_or_else(|| OptionsError::Invalid(format!("invalid --gpus field '{field}'")))?;
        match k {
            "count" => {
                req.count = if v == "all" {
                    -1
                } else {
                    v.parse()
                        .map_err(|_| OptionsError::Invalid(format!("invalid gpu count '{v}'")))?
                };
            }
            "device" => req.device_ids = v.split(',').map(str::to_owned).collect(),
            "capabilities" => req.capabilities = v.split(',').map(str::to_owned).collect(),
            "driver" => req.driver = v.to_owned(),
            other => {
                return Err(OptionsError::Invalid(format!(
                    "unexpected --gpus field '{other}'"
                )))
            }
        }
    }
    if req.count != 0 && !req.device_ids.is_empty() {
        return Err(OptionsError::Invalid(
            "--gpus: count and device are mutually exclusive".to_owned(),
        ));
    }
    Ok(req)
}

/// Render a request back into the CSV form accepted by [`parse_gpus`].
pub fn format_gpus(req: &GpuRequest) -> String {
    let mut fields = Vec::new();
    if !req.device_ids.is_empty() {
        fields.push(format!("\"device={}\"", req.device_ids.join(",")));
    } else if req.count < 0 {
        fields.push("count=all".to_owned());
    } else {
        fields.push(format!("count={}", req.count));
    }
    if !req.capabilities.is_empty() {
        fields.push(format!("\"capabilities={}\"", req.capabilities.join(",")));
    }
    if !req.driver.is_empty() {
        fields.push(format!("driver={}", req.driver));
    }
    fields.join(",")
}

/// Split a CSV record, honoring double quotes (`"device=0,1",driver=nvidia`).
pub fn split_csv(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    for c in s.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => out.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

/// A normalized `--volume`, `--mount`, or `--tmpfs` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub kind: MountKind,
    /// Host path for binds, volume name for volumes (empty means anonymous).
    pub source: String,
    pub target: String,
    pub read_only: bool,
    pub propagation: Option<String>,
    pub nonrecursive: bool,
    pub tmpfs_size: Option<u64>,
    pub tmpfs_mode: Option<u32>,
    pub extra_options: Vec<String>,
}

impl MountSpec {
    fn new(kind: MountKind, source: &str, target: &str) -> Self {
        Self {
            kind,
            source: source.to_owned(),
            target: target.to_owned(),
            read_only: false,
            propagation: None,
            nonrecursive: false,
            tmpfs_size: None,
            tmpfs_mode: None,
            extra_options: Vec::new(),
        }
    }
}

const PROPAGATIONS: &[&str] = &[
    "rshared", "rslave", "rprivate", "shared", "slave", "private",
];

fn check_target(spec: &str, target: &str) -> Result<(), OptionsError> {
    if !target.starts_with('/') {
        return Err(OptionsError::InvalidMount(format!(
            "{spec}: target must be an absolute path"
        )));
    }
    Ok(())
}

/// `-v [src:]dst[:opts]`
pub fn parse_volume_flag(s: &str) -> Result<MountSpec, OptionsError> {
    let parts: Vec<&str> = s.split(':').collect();
    let (src, dst, opts) = match parts.as_slice() {
        [dst] => ("", *dst, ""),
        [src, dst] => (*src, *dst, ""),
        [src, dst, opts] => (*src, *dst, *opts),
        _ => return Err(OptionsError::InvalidMount(format!("{s}: too many colons"))),
    };
    check_target(s, dst)?;
    let kind = if src.starts_with('/') || src.starts_with('.') || src.starts_with('~') {
        MountKind::Bind
    } else {
        MountKind::Volume
    };
    let mut spec = MountSpec::new(kind, src, dst);
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "ro" => spec.read_only = true,
            "rw" => spec.read_only = false,
            "z" | "Z" => {}
            p if PROPAGATIONS.contains(&p) => spec.propagation = Some(p.to_owned()),
            other => {
                return Err(OptionsError::InvalidMount(format!(
                    "{s}: unsupported volume option '{other}'"
                )))
            }
        }
    }
    Ok(spec)
}

/// `--mount type=bind,src=/a,dst=/b,readonly,...`
pub fn parse_mount_flag(s: &str) -> Result<MountSpec, OptionsError> {
    let mut kind = MountKind::Volume;
    let mut spec = MountSpec::new(MountKind::Volume, "", "");
    for field in split_csv(s) {
        let (key, value) = match field.split_once('=') {
            Some((k, v)) => (k.to_lowercase(), Some(v.to_owned())),
            None => (field.to_lowercase(), None),
        };
        let bool_value = || -> Result<bool, OptionsError> {
            match value.as_deref() {
                None | Some("1" | "true") => Ok(true),
                Some("0" | "false") => Ok(false),
                Some(v) => Err(OptionsError::InvalidMount(format!(
                    "{s}: invalid boolean '{v}' for {key}"
                ))),
            }
        };
        let required = || {
            value
                .clone()
                .ok_or_else(|| OptionsError::InvalidMount(format!("{s}: {key} requires a value")))
        };
        match key.as_str() {
            "type" => {
                kind = match required()?.as_str() {
                    "bind" => MountKind::Bind,
                    "volume" => MountKind::Volume,
                    "tmpfs" => MountKind::Tmpfs,
                    other => {
                        return Err(OptionsError::InvalidMount(format!(
                            "{s}: unsupported mount type '{other}'"
                        )))
                    }
                }
            }
            "source" | "src" => spec.source = required()?,
            "target" | "dst" | "destination" => spec.target = required()?,
            "readonly" | "ro" => spec.read_only = bool_value()?,
            "bind-propagation" => {
                let p = required()?;
                if !PROPAGATIONS.contains(&p.as_str()) && p != "rbind" && p != "bind" {
                    return Err(OptionsError::InvalidMount(format!(
                        "{s}: invalid bind-propagation '{p}'"
                    )));
                }
                spec.propagation = Some(p);
            }
            "bind-nonrecursive" => spec.nonrecursive = bool_value()?,
            "tmpfs-size" => spec.tmpfs_size = Some(parse_size(&required()?)?),
            "tmpfs-mode" => {
                let m = required()?;
                spec.tmpfs_mode = Some(u32::from_str_radix(&m, 8).map_err(|_| {
                    OptionsError::InvalidMount(format!("{s}: invalid tmpfs-mode '{m}'"))
                })?);
            }
            other => {
                return Err(OptionsError::InvalidMount(format!(
                    "{s}: unexpected key '{other}'"
                )))
            }
        }
    }
    spec.kind = kind;
    if spec.target.is_empty() {
        return Err(OptionsError::InvalidMount(format!("{s}: target is required")));
    }
    check_target(s, &spec.target)?;
    if kind == MountKind::Bind && spec.source.is_empty() {
        return Err(OptionsError::InvalidMount(format!(
            "{s}: bind mounts require a source"
        )));
    }
    if kind != MountKind::Bind && (spec.propagation.is_some() || spec.nonrecursive) {
        return Err(OptionsError::InvalidMount(format!(
            "{s}: bind options are only valid for type=bind"
        )));
    }
    if kind != MountKind::Tmpfs && (spec.tmpfs_size.is_some() || spec.tmpfs_mode.is_some()) {
        return Err(OptionsError::InvalidMount(format!(
            "{s}: tmpfs options are only valid for type=tmpfs"
        )));
    }
    Ok(spec)
}

/// `--tmpfs /run[:opt,opt]`
pub fn parse_tmpfs_flag(s: &str) -> Result<MountSpec, OptionsError> {
    let (target, opts) = s.split_once(':').unwrap_or((s, ""));
    check_target(s, target)?;
    let mut spec = MountSpec::new(MountKind::Tmpfs, "tmpfs", target);
    for opt in opts.split(',').filter(|o| !o.is_empty()) {
        if let Some(size) = opt.strip_prefix("size=") {
            spec.tmpfs_size = Some(parse_size(size)?);
        } else if let Some(mode) = opt.strip_prefix("mode=") {
            spec.tmpfs_mode = Some(u32::from_str_radix(mode, 8).map_err(|_| {
                OptionsError::InvalidMount(format!("{s}: invalid mode '{mode}'"))
            })?);
        } else if opt == "ro" {
            spec.read_only = true;
        } else {
            spec.extra_options.push(opt.to_owned());
        }
    }
    Ok(spec)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityOpt {
    Seccomp(String),
    Apparmor(String),
    NoNewPrivileges,
    PrivilegedWithoutHostDevices,
    /// SELinux labels are accepted and ignored.
    Label(String),
}

pub fn parse_security_opt(s: &str) -> Result<SecurityOpt, OptionsError> {
    let (key, value) = match s.split_once('=').or_else(|| s.split_once(':')) {
        Some((k, v)) => (k, Some(v)),
        None => (s, None),
    };
    match (key, value) {
        ("seccomp", Some(v)) => Ok(SecurityOpt::Seccomp(v.to_owned())),
        ("apparmor", Some(v)) => Ok(SecurityOpt::Apparmor(v.to_owned())),
        ("no-new-privileges", None | Some("true")) => Ok(SecurityOpt::NoNewPrivileges),
        ("privileged-without-host-devices", None | Some("true")) => {
            Ok(SecurityOpt::PrivilegedWithoutHostDevices)
        }
        ("label", Some(v)) => Ok(SecurityOpt::Label(v.to_owned())),
        _ => Err(OptionsError::Invalid(format!(
            "unknown security option '{s}'"
        ))),
    }
}

/// Parse a byte size such as `512m`, `1g`, `64MiB` (binary multiples).
pub fn parse_size(s: &str) -> Result<u64, OptionsError> {
    let lower = s.trim().to_lowercase();
    let digits_end = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (num, unit) = lower.split_at(digits_end);
    let value: f64 = num
        .parse()
        .map_err(|_| OptionsError::InvalidSize(s.to_owned()))?;
    let mult: u64 = match unit.trim_end_matches("ib").trim_end_matches('b') {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        "p" => 1 << 50,
        _ => return Err(OptionsError::InvalidSize(s.to_owned())),
    };
    Ok((value * mult as f64) as u64)
}

/// Memory values accept `-1` for unlimited.
pub fn parse_memory(s: &str) -> Result<i64, OptionsError> {
    if s == "-1" {
        return Ok(-1);
    }
    Ok(parse_size(s)? as i64)
}

pub fn parse_key_value(s: &str) -> Result<(String, String), OptionsError> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_owned(), v.to_owned())),
        _ => Err(OptionsError::Invalid(format!("expected KEY=VALUE, got '{s}'"))),
    }
}

/// `host:ip` for `--add-host`.
pub fn parse_extra_host(s: &str) -> Result<(String, String), OptionsError> {
    let (host, ip) = s
        .split_once(':')
        .ok_or_else(|| OptionsError::Invalid(format!("invalid add-host '{s}' (expected host:ip)")))?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(OptionsError::Invalid(format!("invalid add-host '{s}'")));
    }
    if ip != "host-gateway" && ip.parse::<std::net::IpAddr>().is_err() {
        return Err(OptionsError::Invalid(format!("invalid IP address in add-host '{s}'")));
    }
    Ok((host.to_owned(), ip.to_owned()))
}

/// Parse `KEY=VALUE` lines; a bare `KEY` is resolved through `lookup`.
pub fn parse_env_lines(
    content: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<String>, OptionsError> {
    let mut out = Vec::new();
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((k, _)) if k.trim().is_empty() => {
                return Err(OptionsError::Invalid(format!(
                    "line {}: variable name is empty",
                    lineno + 1
                )))
            }
            Some(_) => out.push(line.to_owned()),
            None => {
                let key = line.trim_end();
                if key.contains(char::is_whitespace) {
                    return Err(OptionsError::Invalid(format!(
                        "line {}: variable '{key}' contains whitespace",
                        lineno + 1
                    )));
                }
                if let Some(v) = lookup(key) {
                    out.push(format!("{key}={v}"));
                }
            }
        }
    }
    Ok(out)
}

pub fn read_env_file(path: &Path) -> Result<Vec<String>, OptionsError> {
    let content = std::fs::read_to_string(path).map_err(|source| OptionsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_env_lines(&content, |k| std::env::var(k).ok())
}

/// Label files follow the env-file grammar but never consult the environment.
pub fn read_label_file(path: &Path) -> Result<BTreeMap<String, String>, OptionsError> {
    let content = std::fs::read_to_string(path).map_err(|source| OptionsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut labels = BTreeMap::new();
    for line in parse_env_lines(&content, |_| Some(String::new()))? {
        let (k, v) = line.split_once('=').unwrap_or((&line, ""));
        labels.insert(k.to_owned(), v.to_owned());
    }
    Ok(labels)
}

/// Merge `KEY=VALUE` entries so that later entries win, keeping first-seen order.
pub fn merge_env(entries: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    let mut values: BTreeMap<String, String> = BTreeMap::new();
    for e in entries {
        let key = e.split_once('=').map_or(e.as_str(), |(k, _)| k).to_owned();
        if !values.contains_key(&key) {
            order.push(key.clone());
        }
        values.insert(key, e);
    }
    order.into_iter().filter_map(|k| values.remove(&k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policies() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::No);
        assert_eq!(
            "on-failure:3".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure {
                max_retries: Some(3)
            }
        );
        assert_eq!(
            "on-failure:3".parse::<RestartPolicy>().unwrap().to_string(),
            "on-failure:3"
        );
        assert!("sometimes".parse::<RestartPolicy>().is_err());
        assert!("on-failure:x".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn pull_modes() {
        assert_eq!("never".parse::<PullMode>().unwrap(), PullMode::Never);
        assert!("sometimes".parse::<PullMode>().is_err());
    }

    #[test]
    fn users() {
        assert_eq!(
            parse_user("1000:1000").unwrap(),
            UserSpec {
                user: "1000".to_owned(),
                group: Some("1000".to_owned())
            }
        );
        assert_eq!(parse_user("nobody").unwrap().group, None);
        assert!(parse_user(":1").is_err());
        assert!(parse_user("a:").is_err());
    }

    #[test]
    fn devices() {
        let d = parse_device("/dev/fuse").unwrap();
        assert_eq!(d.permissions, "rwm");
        let d = parse_device("/dev/fuse:rw").unwrap();
        assert_eq!(d.permissions, "rw");
        assert_eq!(d.container_path, "/dev/fuse");
        let d = parse_device("/dev/fuse:/dev/fuse:r").unwrap();
        assert_eq!(d.permissions, "r");
        assert!(parse_device("dev/fuse").is_err());
        assert!(parse_device("/dev/fuse:/dev/other").is_err());
        assert!(parse_device("/dev/fuse:/dev/fuse:rx").is_err());
    }

    #[test]
    fn ulimits() {
        let u = parse_ulimit("nofile=1024:2048").unwrap();
        assert_eq!((u.soft, u.hard), (1024, 2048));
        assert_eq!(u.rlimit_type(), "RLIMIT_NOFILE");
        assert_eq!(parse_ulimit("nproc=10").unwrap().hard, 10);
        assert!(parse_ulimit("nofile=10:5").is_err());
        assert!(parse_ulimit("bogus=1").is_err());
    }

    #[test]
    fn gpus() {
        assert_eq!(parse_gpus("all").unwrap().count, -1);
        assert_eq!(parse_gpus("2").unwrap().count, 2);
        let g = parse_gpus("\"device=0,1\",\"capabilities=compute,utility\"").unwrap();
        assert_eq!(g.device_ids, vec!["0", "1"]);
        assert_eq!(g.capabilities, vec!["compute", "utility"]);
        assert_eq!(g.driver, "nvidia");
        assert!(parse_gpus("count=1,\"device=0\"").is_err());
        assert!(parse_gpus("foo=bar").is_err());
        let rendered = format_gpus(&g);
        assert_eq!(parse_gpus(&rendered).unwrap(), g);
    }

    #[test]
    fn volume_flags() {
        let v = parse_volume_flag("/data").unwrap();
        assert_eq!(v.kind, MountKind::Volume);
        assert!(v.source.is_empty());
        let v = parse_volume_flag("/host:/ctr:ro,rshared").unwrap();
        assert_eq!(v.kind, MountKind::Bind);
        assert!(v.read_only);
        assert_eq!(v.propagation.as_deref(), Some("rshared"));
        let v = parse_volume_flag("named:/ctr").unwrap();
        assert_eq!(v.kind, MountKind::Volume);
        assert_eq!(v.source, "named");
        assert!(parse_volume_flag("a:b:c:d").is_err());
        assert!(parse_volume_flag("/host:relative").is_err());
        assert!(parse_volume_flag("/host:/ctr:bogus").is_err());
    }

    #[test]
    fn mount_flags() {
        let m = parse_mount_flag("type=bind,src=/a,dst=/b,readonly,bind-propagation=rslave")
            .unwrap();
        assert_eq!(m.kind, MountKind::Bind);
        assert!(m.read_only);
        assert_eq!(m.propagation.as_deref(), Some("rslave"));
        let m = parse_mount_flag("type=tmpfs,target=/t,tmpfs-size=64m").unwrap();
        assert_eq!(m.tmpfs_size, Some(64 << 20));
        let m = parse_mount_flag("type=volume,target=/v").unwrap();
        assert!(m.source.is_empty());
        assert!(parse_mount_flag("type=bind,dst=/b").is_err());
        assert!(parse_mount_flag("type=volume,dst=/b,bind-nonrecursive").is_err());
        assert!(parse_mount_flag("type=bind,src=/a,dst=/b,bind-propagation=weird").is_err());
        assert!(parse_mount_flag("type=nfs,dst=/b").is_err());
    }

    #[test]
    fn tmpfs_flags() {
        let t = parse_tmpfs_flag("/run:size=1m,mode=1777,noexec").unwrap();
        assert_eq!(t.tmpfs_size, Some(1 << 20));
        assert_eq!(t.tmpfs_mode, Some(0o1777));
        assert_eq!(t.extra_options, vec!["noexec"]);
    }

    #[test]
    fn security_opts() {
        assert_eq!(
            parse_security_opt("seccomp=unconfined").unwrap(),
            SecurityOpt::Seccomp("unconfined".to_owned())
        );
        assert_eq!(
            parse_security_opt("no-new-privileges").unwrap(),
            SecurityOpt::NoNewPrivileges
        );
        assert_eq!(
            parse_security_opt("apparmor:docker-default").unwrap(),
            SecurityOpt::Apparmor("docker-default".to_owned())
        );
        assert!(parse_security_opt("bogus").is_err());
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64k").unwrap(), 64 << 10);
        assert_eq!(parse_size("1.5g").unwrap(), 3 << 29);
        assert_eq!(parse_size("2MiB").unwrap(), 2 << 20);
        assert_eq!(parse_size("2mb").unwrap(), 2 << 20);
        assert!(parse_size("x").is_err());
        assert!(parse_size("5q").is_err());
        assert_eq!(parse_memory("-1").unwrap(), -1);
    }

    #[test]
    fn extra_hosts() {
        assert_eq!(
            parse_extra_host("db:10.0.0.2").unwrap(),
            ("db".to_owned(), "10.0.0.2".to_owned())
        );
        assert_eq!(parse_extra_host("v6:[::1]").unwrap().1, "::1");
        assert_eq!(parse_extra_host("gw:host-gateway").unwrap().1, "host-gateway");
        assert!(parse_extra_host("nohost").is_err());
        assert!(parse_extra_host("x:notanip").is_err());
    }

    #[test]
    fn env_lines() {
        let content = "# comment\nA=1\n\nB=two words\nHOME\nMISSING\n";
        let env = parse_env_lines(content, |k| (k == "HOME").then(|| "/root".to_owned())).unwrap();
        assert_eq!(env, vec!["A=1", "B=two words", "HOME=/root"]);
        assert!(parse_env_lines("=x", |_| None).is_err());
        assert!(parse_env_lines("BAD KEY", |_| None).is_err());
    }

    #[test]
    fn label_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels");
        std::fs::write(&path, "tier=web\nflag\n").unwrap();
        let labels = read_label_file(&path).unwrap();
        assert_eq!(labels.get("tier").map(String::as_str), Some("web"));
        assert_eq!(labels.get("flag").map(String::as_str), Some(""));
        assert!(read_label_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn env_merge_later_wins() {
        let merged = merge_env(vec![
            "A=1".to_owned(),
            "B=2".to_owned(),
            "A=3".to_owned(),
        ]);
        assert_eq!(merged, vec!["A=3", "B=2"]);
    }
}
