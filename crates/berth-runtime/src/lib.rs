//! Supervisor clients and host integration for berth.
//!
//! This crate is the execution layer underneath the lifecycle coordinator:
//! OCI runtime-spec types and the hook `State`, the pluggable `Supervisor`
//! trait with a runc-backed local supervisor and an in-memory mock, overlay
//! snapshots, the rootfs image cache, the CNI client (plugin execution and a
//! mock) with its network config store, host port allocation, rootless
//! detection with the port-manager and bypass4netns clients, AppArmor,
//! iptables cleanup, cgroup detection, and prerequisite checks.

pub mod apparmor;
pub mod cgroup;
pub mod cni;
pub mod image;
pub mod iptables;
pub mod mock;
pub mod oci;
pub mod portalloc;
pub mod prereq;
pub mod rootless;
pub mod runc;
pub mod snapshot;
pub mod supervisor;

pub use cni::{Cni, ExecCni, MockCni, NamespaceOpts, NetworkConfList, NetworkStore};
pub use mock::MockSupervisor;
pub use oci::{Spec, State};
pub use prereq::{check_prereqs, format_missing, MissingPrereq};
pub use supervisor::{
    select_supervisor, ContainerFilter, ContainerRecord, ExecRequest, ImageInfo, NewContainer,
    Supervisor, SupervisorConfig, TaskInfo, TaskIo, TaskStatus,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] berth_store::StoreError),
    #[error("supervisor '{0}' is not available on this system")]
    SupervisorUnavailable(String),
    #[error("{0}: not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("{0}")]
    Precondition(String),
    #[error("address already in use: {0}")]
    AddrInUse(String),
    #[error("cni error: {0}")]
    Cni(String),
    #[error("invalid argument: {0}")]
    Invalid(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::ImageNotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_addr_in_use(&self) -> bool {
        match self {
            Self::AddrInUse(_) => true,
            Self::Cni(msg) | Self::ExecFailed(msg) => msg.contains("address already in use"),
            _ => false,
        }
    }
}

/// Real uid of this process.
#[allow(unsafe_code)]
pub fn current_uid() -> u32 {
    // SAFETY: getuid() takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}

#[allow(unsafe_code)]
pub fn current_gid() -> u32 {
    // SAFETY: getgid() takes no arguments and cannot fail.
    unsafe { libc::getgid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        assert!(RuntimeError::NotFound("task x".to_owned()).is_not_found());
        assert!(RuntimeError::ImageNotFound("alpine".to_owned()).is_not_found());
        assert!(RuntimeError::Store(berth_store::StoreError::NotFound("n".to_owned())).is_not_found());
        assert!(!RuntimeError::ExecFailed("x".to_owned()).is_not_found());
    }

    #[test]
    fn addr_in_use_classification() {
        assert!(RuntimeError::AddrInUse("x".to_owned()).is_addr_in_use());
        assert!(
            RuntimeError::Cni("failed to set up: listen 0.0.0.0:80: address already in use".to_owned())
                .is_addr_in_use()
        );
        assert!(!RuntimeError::Cni("no such plugin".to_owned()).is_addr_in_use());
    }

    #[test]
    fn invalid_carries_usage_prefix() {
        assert!(RuntimeError::Invalid("x".to_owned())
            .to_string()
            .starts_with("invalid argument:"));
    }
}
