//! cgroup resources, devices, ulimits, and GPUs.

use berth_runtime::oci::{
    BlockIoResources, CpuResources, DeviceCgroup, IntelRdt, LinuxDevice, MemoryResources,
    PidsResources, Rlimit, Spec,
};
use berth_schema::flags::{parse_device, parse_gpus, parse_memory, parse_ulimit, DeviceSpec};
use berth_schema::{OptionsError, RunOptions};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use tracing::warn;

const DEFAULT_CPU_PERIOD: u64 = 100_000;

/// What the host allows for cgroup settings.
#[derive(Debug, Clone)]
pub struct CgroupEnv {
    pub v2: bool,
    pub manager: String,
    pub rootless: bool,
    /// `oom_score_adj` of the calling process; rootless containers cannot go lower.
    pub oom_score_adj_floor: Option<i32>,
}

/// `cgroupsPath` for the container, or `None` when cgroups are unmanaged.
pub fn cgroups_path(env: &CgroupEnv, parent: Option<&str>, namespace: &str, id: &str) -> Option<String> {
    match env.manager.as_str() {
        "none" => None,
        "systemd" => {
            let slice = parent.unwrap_or(if env.rootless { "user.slice" } else { "system.slice" });
            Some(format!("{slice}:berth-{namespace}:{id}"))
        }
        _ => {
            let parent = parent.unwrap_or("/berth");
            Some(format!("{}/{namespace}/{id}", parent.trim_end_matches('/')))
        }
    }
}

fn memory_option(value: Option<&String>) -> Result<Option<i64>, OptionsError> {
    value.map(|v| parse_memory(v)).transpose()
}

/// Apply cgroup resource options. Returns without touching the spec when
/// the host cannot enforce them (cgroup manager `none` outside rootless,
/// or rootless on cgroup v1), warning instead.
pub fn apply_resources(spec: &mut Spec, opts: &RunOptions, env: &CgroupEnv) -> Result<(), OptionsError> {
    if opts.cpus.is_some() && (opts.cpu_quota.is_some() || opts.cpu_period.is_some()) {
        return Err(OptionsError::Conflict(
            "cpus and cpu-quota/cpu-period cannot both be set".to_owned(),
        ));
    }
    if !opts.cgroup_conf.is_empty() && !env.v2 {
        return Err(OptionsError::Conflict(
            "cgroup-conf requires cgroup v2".to_owned(),
        ));
    }

    let memory = memory_option(opts.memory.as_ref())?;
    let swap = match opts.memory_swap.as_deref() {
        Some("-1") => Some(-1),
        Some(v) => Some(parse_memory(v)?),
        None => memory.map(|m| m * 2),
    };
    if let (Some(m), Some(s)) = (memory, swap) {
        if s != -1 && s < m {
            return Err(OptionsError::Conflict(
                "memory-swap must be larger than or equal to memory".to_owned(),
            ));
        }
    }
    if let Some(sw) = opts.memory_swappiness {
        if !(0..=100).contains(&sw) {
            return Err(OptionsError::Invalid(format!(
                "memory-swappiness must be between 0 and 100, got {sw}"
            )));
        }
    }
    if let Some(w) = opts.blkio_weight {
        if w != 0 && !(10..=1000).contains(&w) {
            return Err(OptionsError::Invalid(format!(
                "blkio-weight must be between 10 and 1000, got {w}"
            )));
        }
    }

    if opts.has_resource_limits() {
        if env.manager == "none" && !env.rootless {
            warn!("cgroup manager is none; discarding resource limits");
            return Ok(());
        }
        if env.rootless && !env.v2 {
            warn!("rootless on cgroup v1 cannot enforce resource limits; discarding them");
            return Ok(());
        }
    }

    let mut cpu = CpuResources::default();
    if let Some(cpus) = opts.cpus {
        if cpus <= 0.0 {
            return Err(OptionsError::Invalid(format!("cpus must be positive, got {cpus}")));
        }
        cpu.period = Some(DEFAULT_CPU_PERIOD);
        cpu.quota = Some((cpus * DEFAULT_CPU_PERIOD as f64) as i64);
    }
    if let Some(q) = opts.cpu_quota {
        cpu.quota = Some(q);
    }
    if let Some(p) = opts.cpu_period {
        cpu.period = Some(p);
    }
    cpu.shares = opts.cpu_shares;
    cpu.cpus.clone_from(&opts.cpuset_cpus);
    cpu.mems.clone_from(&opts.cpuset_mems);

    let mut mem = MemoryResources {
        limit: memory,
        swap: if memory.is_some() || opts.memory_swap.is_some() { swap } else { None },
        reservation: memory_option(opts.memory_reservation.as_ref())?,
        kernel: memory_option(opts.kernel_memory.as_ref())?,
        swappiness: opts.memory_swappiness.map(|s| s as u64),
        disable_oom_killer: opts.oom_kill_disable.then_some(true),
    };
    if env.v2 {
        // Kernel memory accounting does not exist on the unified hierarchy.
        mem.kernel = None;
    }

    let res = spec.resources_mut();
    if cpu != CpuResources::default() {
        res.cpu = Some(cpu);
    }
    if mem != MemoryResources::default() {
        res.memory = Some(mem);
    }
    if let Some(limit) = opts.pids_limit {
        res.pids = Some(PidsResources { limit });
    }
    if let Some(w) = opts.blkio_weight.filter(|w| *w != 0) {
        res.block_io = Some(BlockIoResources { weight: Some(w) });
    }
    for kv in &opts.cgroup_conf {
        let (k, v) = berth_schema::flags::parse_key_value(kv)?;
        res.unified.insert(k, v);
    }
    Ok(())
}

/// Validate and apply `--oom-score-adj`.
pub fn apply_oom_score_adj(spec: &mut Spec, opts: &RunOptions, env: &CgroupEnv) -> Result<(), OptionsError> {
    let Some(mut adj) = opts.oom_score_adj else {
        return Ok(());
    };
    if !(-1000..=1000).contains(&adj) {
        return Err(OptionsError::Invalid(format!(
            "oom-score-adj must be between -1000 and 1000, got {adj}"
        )));
    }
    if env.rootless {
        if let Some(floor) = env.oom_score_adj_floor {
            if adj < floor {
                warn!("oom-score-adj {adj} is below the session minimum {floor}; using {floor}");
                adj = floor;
            }
        }
    }
    spec.process_mut().oom_score_adj = Some(adj);
    Ok(())
}

fn split_dev(rdev: u64) -> (i64, i64) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    (major as i64, minor as i64)
}

/// Device node for a host path, or `None` when it is not a device.
pub fn device_node(host_path: &Path, container_path: &str) -> Result<Option<LinuxDevice>, OptionsError> {
    let meta = std::fs::metadata(host_path).map_err(|e| {
        OptionsError::InvalidDevice(format!("{}: {e}", host_path.display()))
    })?;
    let ft = meta.file_type();
    let kind = if ft.is_char_device() {
        "c"
    } else if ft.is_block_device() {
        "b"
    } else {
        return Ok(None);
    };
    let (major, minor) = split_dev(meta.rdev());
    Ok(Some(LinuxDevice {
        path: container_path.to_owned(),
        kind: kind.to_owned(),
        major,
        minor,
        file_mode: Some(meta.mode() & 0o777),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
    }))
}

fn add_device(spec: &mut Spec, dev: LinuxDevice, access: &str) {
    let rule = DeviceCgroup {
        allow: true,
        kind: Some(dev.kind.clone()),
        major: Some(dev.major),
        minor: Some(dev.minor),
        access: Some(access.to_owned()),
    };
    spec.resources_mut().devices.push(rule);
    let linux = spec.linux_mut();
    linux.devices.retain(|d| d.path != dev.path);
    linux.devices.push(dev);
}

fn apply_device(spec: &mut Spec, dev: &DeviceSpec) -> Result<(), OptionsError> {
    let host = Path::new(&dev.host_path);
    if host.is_dir() {
        for entry in std::fs::read_dir(host).map_err(|e| {
            OptionsError::InvalidDevice(format!("{}: {e}", dev.host_path))
        })? {
            let path = entry
                .map_err(|e| OptionsError::InvalidDevice(format!("{}: {e}", dev.host_path)))?
                .path();
            if let Some(node) = device_node(&path, &path.to_string_lossy())? {
                add_device(spec, node, &dev.permissions);
            }
        }
        return Ok(());
    }
    match device_node(host, &dev.container_path)? {
        Some(node) => {
            add_device(spec, node, &dev.permissions);
            Ok(())
        }
        None => Err(OptionsError::InvalidDevice(format!(
            "{} is not a device node",
            dev.host_path
        ))),
    }
}

/// Apply `--device` entries. A directory adds every device node inside it.
pub fn apply_devices(spec: &mut Spec, devices: &[String]) -> Result<(), OptionsError> {
    for raw in devices {
        apply_device(spec, &parse_device(raw)?)?;
    }
    Ok(())
}

/// Every character and block device directly under `/dev`, for `--privileged`.
pub fn add_host_devices(spec: &mut Spec, dev_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dev_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Ok(Some(node)) = device_node(&path, &path.to_string_lossy()) {
            let linux = spec.linux_mut();
            linux.devices.retain(|d| d.path != node.path);
            linux.devices.push(node);
        }
    }
}

/// `--gpus`: pass the NVIDIA device nodes through.
pub fn apply_gpus(spec: &mut Spec, gpus: &[String], dev_dir: &Path) -> Result<(), OptionsError> {
    if gpus.is_empty() {
        return Ok(());
    }
    let mut indices: Vec<String> = Vec::new();
    for raw in gpus {
        let req = parse_gpus(raw)?;
        if !req.driver.is_empty() && req.driver != "nvidia" {
            return Err(OptionsError::Invalid(format!(
                "unsupported GPU driver '{}'",
                req.driver
            )));
        }
        if req.device_ids.is_empty() {
            let available = (0..64)
                .map(|i| i.to_string())
                .filter(|i| dev_dir.join(format!("nvidia{i}")).exists());
            let all: Vec<String> = available.collect();
            let take = if req.count < 0 { all.len() } else { req.count as usize };
            if take > all.len() {
                return Err(OptionsError::Invalid(format!(
                    "requested {take} GPUs but only {} are present",
                    all.len()
                )));
            }
            indices.extend(all.into_iter().take(take));
        } else {
            indices.extend(req.device_ids);
        }
    }
    let mut nodes: Vec<String> = indices.iter().map(|i| format!("nvidia{i}")).collect();
    nodes.extend(["nvidiactl", "nvidia-uvm", "nvidia-uvm-tools"].map(str::to_owned));
    for node in nodes {
        let path = dev_dir.join(&node);
        if !path.exists() {
            continue;
        }
        if let Some(dev) = device_node(&path, &format!("/dev/{node}"))? {
            add_device(spec, dev, "rwm");
        }
    }
    Ok(())
}

pub fn apply_ulimits(spec: &mut Spec, ulimits: &[String]) -> Result<(), OptionsError> {
    for raw in ulimits {
        let u = parse_ulimit(raw)?;
        let kind = u.rlimit_type();
        let process = spec.process_mut();
        process.rlimits.retain(|r| r.kind != kind);
        process.rlimits.push(Rlimit {
            kind,
            hard: u.hard,
            soft: u.soft,
        });
    }
    Ok(())
}

pub fn apply_rdt_class(spec: &mut Spec, class: Option<&str>) {
    if let Some(clos) = class.filter(|c| !c.is_empty()) {
        spec.linux_mut().intel_rdt = Some(IntelRdt {
            clos_id: clos.to_owned(),
        });
    }
}
