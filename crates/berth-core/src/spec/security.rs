//! Capabilities, seccomp, AppArmor, privileged mode, and sysctls.

use berth_runtime::apparmor::DEFAULT_PROFILE;
use berth_runtime::oci::{Capabilities, DeviceCgroup, Spec, ALL_CAPABILITIES, DEFAULT_CAPABILITIES};
use berth_schema::flags::{parse_key_value, parse_security_opt, SecurityOpt};
use berth_schema::OptionsError;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::warn;

/// `net_admin` / `CAP_NET_ADMIN` / `ALL` to canonical form.
pub fn normalize_cap(cap: &str) -> String {
    let upper = cap.trim().to_ascii_uppercase();
    if upper == "ALL" || upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    }
}

/// Effective capability set. `ALL` in `--cap-add` grants everything,
/// `ALL` in `--cap-drop` starts from nothing before additions.
pub fn capability_set(
    privileged: bool,
    cap_add: &[String],
    cap_drop: &[String],
) -> Result<Vec<String>, OptionsError> {
    let known: BTreeSet<&str> = ALL_CAPABILITIES.iter().copied().collect();
    let add: Vec<String> = cap_add.iter().map(|c| normalize_cap(c)).collect();
    let drop: Vec<String> = cap_drop.iter().map(|c| normalize_cap(c)).collect();
    for cap in add.iter().chain(drop.iter()) {
        if cap != "ALL" && !known.contains(cap.as_str()) {
            return Err(OptionsError::Invalid(format!("unknown capability '{cap}'")));
        }
    }

    if privileged || add.iter().any(|c| c == "ALL") {
        let mut caps: Vec<String> = ALL_CAPABILITIES.iter().map(|c| (*c).to_owned()).collect();
        if !privileged {
            caps.retain(|c| !drop.contains(c));
        }
        return Ok(caps);
    }

    let mut caps: Vec<String> = if drop.iter().any(|c| c == "ALL") {
        Vec::new()
    } else {
        DEFAULT_CAPABILITIES
            .iter()
            .map(|c| (*c).to_owned())
            .filter(|c| !drop.contains(c))
            .collect()
    };
    for cap in add {
        if !caps.contains(&cap) {
            caps.push(cap);
        }
    }
    Ok(caps)
}

pub fn apply_capabilities(
    spec: &mut Spec,
    privileged: bool,
    cap_add: &[String],
    cap_drop: &[String],
) -> Result<(), OptionsError> {
    let caps = capability_set(privileged, cap_add, cap_drop)?;
    spec.process_mut().capabilities = Some(Capabilities::uniform(caps));
    Ok(())
}

/// What `--security-opt` asked for beyond direct spec edits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityOutcome {
    pub privileged_without_host_devices: bool,
}

/// Apply `--security-opt` entries. Without an explicit `apparmor=` the
/// default profile is used when AppArmor can load it and the container is
/// not privileged.
pub fn apply_security_opts(
    spec: &mut Spec,
    opts: &[String],
    privileged: bool,
    apparmor_available: bool,
) -> Result<SecurityOutcome, OptionsError> {
    let mut outcome = SecurityOutcome::default();
    let mut apparmor: Option<String> = None;
    for raw in opts {
        match parse_security_opt(raw)? {
            SecurityOpt::Seccomp(profile) => {
                spec.linux_mut().seccomp = if profile == "unconfined" {
                    None
                } else {
                    Some(load_seccomp_profile(Path::new(&profile))?)
                };
            }
            SecurityOpt::Apparmor(profile) => apparmor = Some(profile),
            SecurityOpt::NoNewPrivileges => spec.process_mut().no_new_privileges = true,
            SecurityOpt::PrivilegedWithoutHostDevices => {
                outcome.privileged_without_host_devices = true;
            }
            SecurityOpt::Label(value) => {
                warn!("security-opt label={value} is not supported; ignoring");
            }
        }
    }

    let profile = match apparmor.as_deref() {
        Some("unconfined") => None,
        Some(name) => {
            if !apparmor_available {
                return Err(OptionsError::Conflict(format!(
                    "apparmor profile '{name}' requested but AppArmor is not available"
                )));
            }
            Some(name.to_owned())
        }
        None if apparmor_available && !privileged => Some(DEFAULT_PROFILE.to_owned()),
        None => None,
    };
    spec.process_mut().apparmor_profile = profile;
    Ok(outcome)
}

fn load_seccomp_profile(path: &Path) -> Result<serde_json::Value, OptionsError> {
    let content = std::fs::read(path).map_err(|source| OptionsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_slice(&content)?)
}

/// `--privileged`: lift path masking, make sysfs and cgroupfs writable,
/// and allow every device.
pub fn apply_privileged(spec: &mut Spec) {
    for m in &mut spec.mounts {
        if m.destination == "/sys" || m.destination == "/sys/fs/cgroup" {
            m.options.retain(|o| o != "ro");
            m.options.push("rw".to_owned());
        }
    }
    let linux = spec.linux_mut();
    linux.masked_paths.clear();
    linux.readonly_paths.clear();
    spec.resources_mut().devices = vec![DeviceCgroup {
        allow: true,
        kind: None,
        major: None,
        minor: None,
        access: Some("rwm".to_owned()),
    }];
    spec.linux_mut().seccomp = None;
}

pub fn apply_sysctls(spec: &mut Spec, sysctls: &[String]) -> Result<(), OptionsError> {
    for raw in sysctls {
        let (k, v) = parse_key_value(raw)?;
        spec.linux_mut().sysctl.insert(k, v);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_runtime::oci::default_spec;

    fn s(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn caps_add_and_drop() {
        let caps = capability_set(false, &s(&["net_admin"]), &s(&["CAP_CHOWN"])).unwrap();
        assert!(caps.contains(&"CAP_NET_ADMIN".to_owned()));
        assert!(!caps.contains(&"CAP_CHOWN".to_owned()));

        let caps = capability_set(false, &s(&["kill"]), &s(&["all"])).unwrap();
        assert_eq!(caps, vec!["CAP_KILL"]);

        let caps = capability_set(false, &s(&["ALL"]), &[]).unwrap();
        assert_eq!(caps.len(), ALL_CAPABILITIES.len());

        assert!(capability_set(false, &s(&["bogus"]), &[]).is_err());
    }

    #[test]
    fn default_apparmor_profile_when_available() {
        let mut spec = default_spec(false);
        apply_security_opts(&mut spec, &[], false, true).unwrap();
        assert_eq!(
            spec.process.as_ref().unwrap().apparmor_profile.as_deref(),
            Some(DEFAULT_PROFILE)
        );

        let mut spec = default_spec(false);
        apply_security_opts(&mut spec, &s(&["apparmor=unconfined"]), false, true).unwrap();
        assert!(spec.process.unwrap().apparmor_profile.is_none());

        let mut spec = default_spec(false);
        assert!(apply_security_opts(&mut spec, &s(&["apparmor=custom"]), false, false).is_err());
    }

    #[test]
    fn seccomp_profile_and_nnp() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("profile.json");
        std::fs::write(&profile, r#"{"defaultAction":"SCMP_ACT_ERRNO"}"#).unwrap();
        let mut spec = default_spec(false);
        let opts = vec![
            format!("seccomp={}", profile.display()),
            "no-new-privileges".to_owned(),
            "privileged-without-host-devices".to_owned(),
        ];
        let outcome = apply_security_opts(&mut spec, &opts, false, false).unwrap();
        assert!(outcome.privileged_without_host_devices);
        assert!(spec.process.as_ref().unwrap().no_new_privileges);
        assert_eq!(
            spec.linux.unwrap().seccomp.unwrap()["defaultAction"],
            "SCMP_ACT_ERRNO"
        );
    }

    #[test]
    fn privileged_lifts_masks() {
        let mut spec = default_spec(false);
        apply_privileged(&mut spec);
        let linux = spec.linux.as_ref().unwrap();
        assert!(linux.masked_paths.is_empty());
        assert!(linux.resources.as_ref().unwrap().devices[0].allow);
        let sys = spec.mounts.iter().find(|m| m.destination == "/sys").unwrap();
        assert!(!sys.options.contains(&"ro".to_owned()));
    }

    #[test]
    fn sysctls_recorded() {
        let mut spec = default_spec(false);
        apply_sysctls(&mut spec, &s(&["net.ipv4.ip_forward=1"])).unwrap();
        assert_eq!(spec.linux.unwrap().sysctl["net.ipv4.ip_forward"], "1");
        let mut spec = default_spec(false);
        assert!(apply_sysctls(&mut spec, &s(&["novalue"])).is_err());
    }
}
