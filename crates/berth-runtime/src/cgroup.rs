//! cgroup hierarchy and manager detection.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

/// Unified hierarchy when `cgroup.controllers` exists at the mount root.
pub fn version_at(root: &Path) -> CgroupVersion {
    if root.join("cgroup.controllers").exists() {
        CgroupVersion::V2
    } else {
        CgroupVersion::V1
    }
}

pub fn version() -> CgroupVersion {
    version_at(Path::new("/sys/fs/cgroup"))
}

pub fn is_v2() -> bool {
    version() == CgroupVersion::V2
}

/// Whether PID 1 is systemd.
pub fn systemd_is_init() -> bool {
    Path::new("/run/systemd/system").is_dir()
        || std::fs::read_to_string("/proc/1/comm").is_ok_and(|c| c.trim() == "systemd")
}

/// `systemd` on a unified hierarchy under systemd, else `cgroupfs`.
pub fn default_manager() -> &'static str {
    if is_v2() && systemd_is_init() {
        "systemd"
    } else {
        "cgroupfs"
    }
}

/// Controllers delegated at `root`, from `cgroup.controllers`.
pub fn controllers_at(root: &Path) -> Vec<String> {
    std::fs::read_to_string(root.join("cgroup.controllers"))
        .map(|c| c.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default()
}

/// `oom_score_adj` of this process; rootless containers cannot go below it.
pub fn current_oom_score_adj() -> Option<i32> {
    std::fs::read_to_string("/proc/self/oom_score_adj")
        .ok()?
        .trim()
        .parse()
        .ok()
}
