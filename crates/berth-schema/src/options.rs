//! The closed option record for `run`.
//!
//! One field per recognized flag. Empty strings and `None` mean "not given";
//! defaults are applied by the typed accessors below so that the spec builder
//! stays a pure function of this record.

use crate::flags::{PullMode, RestartPolicy};
use crate::OptionsError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    // Image and command.
    pub image: String,
    pub args: Vec<String>,

    // Process.
    pub tty: bool,
    pub interactive: bool,
    pub detach: bool,
    pub user: Option<String>,
    pub workdir: Option<String>,
    /// `Some(vec![])` clears the image entrypoint.
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub umask: Option<String>,
    pub group_add: Vec<String>,
    pub init: bool,

    // Lifecycle.
    pub restart: String,
    pub rm: bool,
    pub stop_signal: String,
    pub stop_timeout: Option<i64>,

    // Image selection.
    pub pull: String,
    pub platform: Option<String>,
    /// Treat `image` as a path to an unpacked root filesystem.
    pub rootfs: bool,

    // Networking.
    pub networks: Vec<String>,
    pub ip: Option<String>,
    pub ip6: Option<String>,
    pub mac_address: Option<String>,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub dns_opt: Vec<String>,
    pub publish: Vec<String>,
    pub add_host: Vec<String>,

    // Namespaces.
    pub ipc: Option<String>,
    pub pid: Option<String>,
    pub uts: Option<String>,
    pub cgroupns: Option<String>,
    pub userns: Option<String>,

    // cgroup and resources.
    pub cpus: Option<f64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub memory: Option<String>,
    pub memory_swap: Option<String>,
    pub memory_reservation: Option<String>,
    pub memory_swappiness: Option<i64>,
    pub kernel_memory: Option<String>,
    pub oom_kill_disable: bool,
    pub oom_score_adj: Option<i32>,
    pub pids_limit: Option<i64>,
    pub cgroup_conf: Vec<String>,
    pub cgroup_parent: Option<String>,
    pub blkio_weight: Option<u16>,
    pub devices: Vec<String>,
    pub ulimits: Vec<String>,
    pub shm_size: Option<String>,
    pub rdt_class: Option<String>,

    // Security.
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub sysctl: Vec<String>,
    pub gpus: Vec<String>,

    // Filesystem.
    pub volumes: Vec<String>,
    pub tmpfs: Vec<String>,
    pub mounts: Vec<String>,
    pub read_only: bool,

    // Logging.
    pub log_driver: String,
    pub log_opts: Vec<String>,

    // Image verification.
    pub verify: String,
    pub cosign_key: Option<String>,
    pub cosign_certificate_identity: Option<String>,
    pub cosign_certificate_identity_regexp: Option<String>,
    pub cosign_certificate_oidc_issuer: Option<String>,
    pub cosign_certificate_oidc_issuer_regexp: Option<String>,

    // Metadata.
    pub name: Option<String>,
    pub labels: Vec<String>,
    pub label_files: Vec<PathBuf>,
    pub cidfile: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyMode {
    None,
    Cosign,
}

impl RunOptions {
    pub fn restart_policy(&self) -> Result<RestartPolicy, OptionsError> {
        if self.restart.is_empty() {
            return Ok(RestartPolicy::No);
        }
        self.restart.parse()
    }

    pub fn pull_mode(&self) -> Result<PullMode, OptionsError> {
        if self.pull.is_empty() {
            return Ok(PullMode::Missing);
        }
        self.pull.parse()
    }

    pub fn stop_signal_or_default(&self) -> &str {
        if self.stop_signal.is_empty() {
            "SIGTERM"
        } else {
            &self.stop_signal
        }
    }

    pub fn log_driver_or_default(&self) -> &str {
        if self.log_driver.is_empty() {
            "json-file"
        } else {
            &self.log_driver
        }
    }

    pub fn verify_mode(&self) -> Result<VerifyMode, OptionsError> {
        match self.verify.as_str() {
            "" | "none" => Ok(VerifyMode::None),
            "cosign" => Ok(VerifyMode::Cosign),
            other => Err(OptionsError::Invalid(format!(
                "unknown --verify mode '{other}' (expected none or cosign)"
            ))),
        }
    }

    /// The requested network list, with the implicit default applied.
    pub fn networks_or_default(&self, default_network: &str) -> Vec<String> {
        if self.networks.is_empty() {
            vec![default_network.to_owned()]
        } else {
            self.networks.clone()
        }
    }

    /// Whether any cgroup resource limit was requested.
    pub fn has_resource_limits(&self) -> bool {
        self.cpus.is_some()
            || self.cpu_quota.is_some()
            || self.cpu_period.is_some()
            || self.cpu_shares.is_some()
            || self.cpuset_cpus.is_some()
            || self.cpuset_mems.is_some()
            || self.memory.is_some()
            || self.memory_swap.is_some()
            || self.memory_reservation.is_some()
            || self.memory_swappiness.is_some()
            || self.pids_limit.is_some()
            || self.blkio_weight.is_some()
            || !self.cgroup_conf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_fields() {
        let opts = RunOptions::default();
        assert_eq!(opts.restart_policy().unwrap(), RestartPolicy::No);
        assert_eq!(opts.pull_mode().unwrap(), PullMode::Missing);
        assert_eq!(opts.stop_signal_or_default(), "SIGTERM");
        assert_eq!(opts.log_driver_or_default(), "json-file");
        assert_eq!(opts.verify_mode().unwrap(), VerifyMode::None);
        assert!(!opts.has_resource_limits());
    }

    #[test]
    fn networks_default() {
        let mut opts = RunOptions::default();
        assert_eq!(opts.networks_or_default("bridge"), vec!["bridge"]);
        opts.networks = vec!["n1".to_owned()];
        assert_eq!(opts.networks_or_default("bridge"), vec!["n1"]);
    }

    #[test]
    fn verify_mode_rejects_unknown() {
        let opts = RunOptions {
            verify: "notation".to_owned(),
            ..RunOptions::default()
        };
        assert!(opts.verify_mode().is_err());
    }

    #[test]
    fn resource_limits_detected() {
        let opts = RunOptions {
            memory: Some("64m".to_owned()),
            ..RunOptions::default()
        };
        assert!(opts.has_resource_limits());
    }
}
