//! User mounts (`-v`, `--mount`, `--tmpfs`) and the mounts berth derives itself.

use berth_runtime::oci::{Mount, NamespaceType, Spec};
use berth_schema::flags::{
    parse_mount_flag, parse_size, parse_tmpfs_flag, parse_volume_flag, MountKind, MountSpec,
};
use berth_schema::{OptionsError, RunOptions};
use berth_store::VolumeStore;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::CoreError;

/// Mounts produced from the user's flags.
#[derive(Debug, Default)]
pub struct UserMounts {
    pub mounts: Vec<Mount>,
    /// Volumes created on the fly for `-v /path` style entries.
    pub anonymous_volumes: Vec<String>,
    /// `source:destination` for the mounts label.
    pub descriptions: Vec<String>,
}

/// Name of the anonymous volume backing `target` in container `id`.
pub fn anonymous_volume_name(id: &str, target: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(b"\0");
    hasher.update(target.as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn expand_source(source: &str, cwd: &Path, home: Option<&Path>) -> PathBuf {
    if let Some(rest) = source.strip_prefix('~') {
        if let Some(home) = home {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    let path = Path::new(source);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

fn bind_options(spec: &MountSpec) -> Vec<String> {
    let mut options = vec![if spec.nonrecursive { "bind" } else { "rbind" }.to_owned()];
    match spec.propagation.as_deref() {
        // `bind-propagation=bind|rbind` only pick recursion.
        Some("bind") => options[0] = "bind".to_owned(),
        Some("rbind") => options[0] = "rbind".to_owned(),
        Some(p) => options.push(p.to_owned()),
        None => options.push("rprivate".to_owned()),
    }
    if spec.read_only {
        options.push("ro".to_owned());
    }
    options
}

fn tmpfs_mount(spec: &MountSpec) -> Mount {
    let mut options = vec!["nosuid".to_owned(), "nodev".to_owned(), "noexec".to_owned()];
    if let Some(size) = spec.tmpfs_size {
        options.push(format!("size={size}"));
    }
    if let Some(mode) = spec.tmpfs_mode {
        options.push(format!("mode={mode:o}"));
    }
    if spec.read_only {
        options.push("ro".to_owned());
    }
    for extra in &spec.extra_options {
        options.retain(|o| {
            let negated = match extra.as_str() {
                "exec" => "noexec",
                "suid" => "nosuid",
                "dev" => "nodev",
                _ => return true,
            };
            o != negated
        });
        if !matches!(extra.as_str(), "exec" | "suid" | "dev") {
            options.push(extra.clone());
        }
    }
    Mount {
        destination: spec.target.clone(),
        kind: Some("tmpfs".to_owned()),
        source: Some("tmpfs".to_owned()),
        options,
    }
}

struct MountResolver<'a> {
    id: &'a str,
    volumes: &'a VolumeStore,
    cwd: &'a Path,
    home: Option<PathBuf>,
    /// `-v` creates a missing bind source; `--mount` rejects it.
    create_missing: bool,
}

impl MountResolver<'_> {
    fn resolve(&self, spec: &MountSpec, out: &mut UserMounts) -> Result<(), CoreError> {
        match spec.kind {
            MountKind::Bind => {
                let source = expand_source(&spec.source, self.cwd, self.home.as_deref());
                if !source.exists() {
                    if self.create_missing {
                        std::fs::create_dir_all(&source)?;
                    } else {
                        return Err(OptionsError::InvalidMount(format!(
                            "bind source path does not exist: {}",
                            source.display()
                        ))
                        .into());
                    }
                }
                let source = source.to_string_lossy().into_owned();
                let opts = bind_options(spec);
                let opts: Vec<&str> = opts.iter().map(String::as_str).collect();
                out.descriptions.push(format!("{source}:{}", spec.target));
                out.mounts.push(Mount::bind(&source, &spec.target, &opts));
            }
            MountKind::Volume => {
                let name = if spec.source.is_empty() {
                    let name = anonymous_volume_name(self.id, &spec.target);
                    out.anonymous_volumes.push(name.clone());
                    name
                } else {
                    spec.source.clone()
                };
                let volume = self
                    .volumes
                    .create(&name, Default::default(), true)
                    .map_err(CoreError::VolumeStore)?;
                debug!("mounting volume {name} at {}", spec.target);
                let source = volume.mountpoint.to_string_lossy().into_owned();
                let mut opts = vec!["rbind".to_owned()];
                opts.push(spec.propagation.clone().unwrap_or_else(|| "rprivate".to_owned()));
                if spec.read_only {
                    opts.push("ro".to_owned());
                }
                let opts: Vec<&str> = opts.iter().map(String::as_str).collect();
                out.descriptions.push(format!("{name}:{}", spec.target));
                out.mounts.push(Mount::bind(&source, &spec.target, &opts));
            }
            MountKind::Tmpfs => {
                out.descriptions.push(format!("tmpfs:{}", spec.target));
                out.mounts.push(tmpfs_mount(spec));
            }
        }
        Ok(())
    }
}

/// Resolve every user mount. Later entries at the same destination win.
pub fn user_mounts(
    opts: &RunOptions,
    id: &str,
    volumes: &VolumeStore,
    cwd: &Path,
    home: Option<PathBuf>,
) -> Result<UserMounts, CoreError> {
    let mut out = UserMounts::default();
    let mut resolver = MountResolver {
        id,
        volumes,
        cwd,
        home,
        create_missing: true,
    };
    for raw in &opts.volumes {
        resolver.resolve(&parse_volume_flag(raw)?, &mut out)?;
    }
    resolver.create_missing = false;
    for raw in &opts.mounts {
        resolver.resolve(&parse_mount_flag(raw)?, &mut out)?;
    }
    for raw in &opts.tmpfs {
        resolver.resolve(&parse_tmpfs_flag(raw)?, &mut out)?;
    }
    Ok(out)
}

/// Apply user mounts over the baseline, replacing same-destination entries.
pub fn apply_user_mounts(spec: &mut Spec, mounts: &UserMounts) {
    for m in &mounts.mounts {
        spec.upsert_mount(m.clone());
    }
}

/// `--shm-size` resizes the private `/dev/shm`.
pub fn apply_shm_size(spec: &mut Spec, shm_size: Option<&str>) -> Result<(), OptionsError> {
    let Some(raw) = shm_size else {
        return Ok(());
    };
    let size = parse_size(raw)?;
    if let Some(m) = spec.mounts.iter_mut().find(|m| m.destination == "/dev/shm") {
        m.options.retain(|o| !o.starts_with("size="));
        m.options.push(format!("size={size}"));
    }
    Ok(())
}

/// `/etc/hosts`, `/etc/resolv.conf`, and `/etc/hostname` from the state dir.
pub fn etc_mounts(hosts: &Path, resolv_conf: &Path, hostname: Option<&Path>) -> Vec<Mount> {
    let mut mounts = vec![
        Mount::bind(&hosts.to_string_lossy(), "/etc/hosts", &["bind", "rprivate"]),
        Mount::bind(
            &resolv_conf.to_string_lossy(),
            "/etc/resolv.conf",
            &["bind", "rprivate", "ro"],
        ),
    ];
    if let Some(hostname) = hostname {
        mounts.push(Mount::bind(
            &hostname.to_string_lossy(),
            "/etc/hostname",
            &["bind", "rprivate", "ro"],
        ));
    }
    mounts
}

/// `--ipc=host`: share the host IPC namespace and its `/dev/shm` and
/// `/dev/mqueue`. The host binds are appended after everything else, so
/// they shadow user mounts at the same paths.
pub fn apply_ipc_host(spec: &mut Spec) {
    spec.set_namespace(NamespaceType::Ipc, None, false);
    spec.mounts
        .retain(|m| m.destination != "/dev/shm" && m.destination != "/dev/mqueue");
    spec.mounts
        .push(Mount::bind("/dev/shm", "/dev/shm", &["rbind", "nosuid", "noexec", "nodev"]));
    spec.mounts.push(Mount::bind(
        "/dev/mqueue",
        "/dev/mqueue",
        &["rbind", "nosuid", "noexec", "nodev"],
    ));
}

/// `--pid=host`. A rootless user cannot mount a fresh procfs for the host
/// pid namespace, so `/proc` is bound from the host and read-only `/proc`
/// paths are dropped.
pub fn apply_pid_host(spec: &mut Spec, rootless: bool) {
    spec.set_namespace(NamespaceType::Pid, None, false);
    if rootless {
        spec.upsert_mount(Mount::bind("/proc", "/proc", &["rbind", "nosuid", "noexec", "nodev"]));
        spec.linux_mut()
            .readonly_paths
            .retain(|p| !p.starts_with("/proc"));
    }
}

/// `--init`: bind the host init binary into the container.
pub fn init_mount(binary: &Path) -> Mount {
    Mount::bind(&binary.to_string_lossy(), "/sbin/tini", &["bind", "ro"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_runtime::oci::default_spec;

    fn opts() -> RunOptions {
        RunOptions::default()
    }

    #[test]
    fn bind_and_named_and_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeStore::new(dir.path().join("volumes"));
        let host = dir.path().join("data");
        let o = RunOptions {
            volumes: vec![
                format!("{}:/data:ro", host.display()),
                "named:/named".to_owned(),
                "/anon".to_owned(),
            ],
            ..opts()
        };
        let out = user_mounts(&o, "cid", &volumes, dir.path(), None).unwrap();
        assert!(host.is_dir(), "-v creates a missing bind source");
        assert_eq!(out.mounts.len(), 3);
        assert_eq!(out.mounts[0].options, vec!["rbind", "rprivate", "ro"]);
        assert!(volumes.get("named").is_ok());
        assert_eq!(out.anonymous_volumes, vec![anonymous_volume_name("cid", "/anon")]);
        assert!(volumes.get(&out.anonymous_volumes[0]).is_ok());
        assert_eq!(out.descriptions[1], "named:/named");
    }

    #[test]
    fn mount_flag_requires_existing_source() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeStore::new(dir.path().join("volumes"));
        let o = RunOptions {
            mounts: vec!["type=bind,src=/definitely/missing,dst=/x".to_owned()],
            ..opts()
        };
        let err = user_mounts(&o, "cid", &volumes, dir.path(), None).unwrap_err();
        assert!(err.to_string().starts_with("invalid argument:"));

        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        let o = RunOptions {
            mounts: vec![format!(
                "type=bind,src={},dst=/x,bind-nonrecursive=true,bind-propagation=rshared",
                src.display()
            )],
            ..opts()
        };
        let out = user_mounts(&o, "cid", &volumes, dir.path(), None).unwrap();
        assert_eq!(out.mounts[0].options, vec!["bind", "rshared"]);
    }

    #[test]
    fn tmpfs_options() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeStore::new(dir.path().join("volumes"));
        let o = RunOptions {
            tmpfs: vec!["/run:size=64m,exec".to_owned()],
            ..opts()
        };
        let out = user_mounts(&o, "cid", &volumes, dir.path(), None).unwrap();
        let m = &out.mounts[0];
        assert_eq!(m.kind.as_deref(), Some("tmpfs"));
        assert!(m.options.contains(&format!("size={}", 64 * 1024 * 1024)));
        assert!(!m.options.contains(&"noexec".to_owned()));
    }

    #[test]
    fn ipc_host_binds_come_last() {
        let mut spec = default_spec(false);
        spec.upsert_mount(Mount::bind("/tmp/x", "/dev/shm", &["rbind"]));
        apply_ipc_host(&mut spec);
        let n = spec.mounts.len();
        assert_eq!(spec.mounts[n - 2].destination, "/dev/shm");
        assert_eq!(spec.mounts[n - 2].source.as_deref(), Some("/dev/shm"));
        assert_eq!(spec.mounts[n - 1].destination, "/dev/mqueue");
        assert!(!spec.has_namespace(NamespaceType::Ipc));
    }

    #[test]
    fn rootless_pid_host_rebinds_proc() {
        let mut spec = default_spec(true);
        apply_pid_host(&mut spec, true);
        let proc = spec.mounts.iter().find(|m| m.destination == "/proc").unwrap();
        assert!(proc.options.contains(&"rbind".to_owned()));
        let linux = spec.linux.as_ref().unwrap();
        assert!(linux.readonly_paths.iter().all(|p| !p.starts_with("/proc")));
        assert!(!spec.has_namespace(NamespaceType::Pid));
    }

    #[test]
    fn shm_size_rewrites_option() {
        let mut spec = default_spec(false);
        apply_shm_size(&mut spec, Some("1m")).unwrap();
        let shm = spec.mounts.iter().find(|m| m.destination == "/dev/shm").unwrap();
        assert!(shm.options.contains(&"size=1048576".to_owned()));
        assert_eq!(shm.options.iter().filter(|o| o.starts_with("size=")).count(), 1);
    }
}
