//! AppArmor default profile loading.

use crate::RuntimeError;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

pub const DEFAULT_PROFILE: &str = "berth-default";

/// Whether this process may load new profiles into the kernel.
pub fn can_load_new_profile() -> bool {
    let enabled = std::fs::read_to_string("/sys/module/apparmor/parameters/enabled")
        .is_ok_and(|v| v.trim() == "Y");
    enabled
        && crate::current_uid() == 0
        && !crate::rootless::is_rootless_child()
        && Path::new("/sys/kernel/security/apparmor").is_dir()
}

/// Whether `name` is already loaded.
pub fn is_loaded(name: &str) -> bool {
    std::fs::read_to_string("/sys/kernel/security/apparmor/profiles").is_ok_and(|profiles| {
        profiles
            .lines()
            .any(|l| l.split_once(" (").is_some_and(|(n, _)| n == name))
    })
}

/// Text of the default container profile.
pub fn default_profile(name: &str) -> String {
    format!(
        r"#include <tunables/global>

profile {name} flags=(attach_disconnected,mediate_deleted) {{
  #include <abstractions/base>

  network,
  capability,
  file,
  umount,
  signal (receive) peer=unconfined,
  signal (send,receive) peer={name},

  deny @{{PROC}}/* w,
  deny @{{PROC}}/{{[^1-9],[^1-9][^0-9],[^1-9s][^0-9y][^0-9s],[^1-9][^0-9][^0-9][^0-9/]*}}/** w,
  deny @{{PROC}}/sys/[^k]** w,
  deny @{{PROC}}/sys/kernel/{{?,??,[^s][^h][^m]**}} w,
  deny @{{PROC}}/sysrq-trigger rwklx,
  deny @{{PROC}}/kcore rwklx,

  deny mount,

  deny /sys/[^f]*/** wklx,
  deny /sys/f[^s]*/** wklx,
  deny /sys/fs/[^c]*/** wklx,
  deny /sys/fs/c[^g]*/** wklx,
  deny /sys/fs/cg[^r]*/** wklx,
  deny /sys/firmware/** rwklx,
  deny /sys/kernel/security/** rwklx,

  ptrace (trace,read,tracedby,readby) peer={name},
}}
"
    )
}

/// Load (or replace) the default profile through `apparmor_parser`.
pub fn load_default_profile(name: &str) -> Result<(), RuntimeError> {
    let mut child = Command::new("apparmor_parser")
        .arg("-Kr")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| RuntimeError::ExecFailed(format!("failed to run apparmor_parser: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(default_profile(name).as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(RuntimeError::ExecFailed(format!(
            "apparmor_parser -Kr failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    debug!("loaded apparmor profile {name}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_names_itself() {
        let p = default_profile("berth-default");
        assert!(p.contains("profile berth-default flags="));
        assert!(p.contains("peer=berth-default"));
        assert!(p.contains("deny @{PROC}/kcore rwklx,"));
    }
}
