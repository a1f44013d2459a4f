//! Option records, labels, configuration, and the compose project model for berth.
//!
//! This crate is the schema layer: the closed `run` option record
//! (`RunOptions`) with its flag parsers, `--publish` parsing
//! (`parse_flag_p`), the label keys hooks read back from the supervisor,
//! `berth.toml` configuration, and the compose file model with variable
//! interpolation and dependency ordering.

pub mod cni;
pub mod compose;
pub mod config;
pub mod flags;
pub mod labels;
pub mod options;
pub mod ports;
pub mod types;

pub use cni::{CniResult, DEFAULT_NETWORK_NAME};
pub use compose::{ComposeError, Project};
pub use config::{BerthConfig, ConfigError};
pub use flags::{MountKind, MountSpec, PullMode, RestartPolicy};
pub use labels::Labels;
pub use options::{RunOptions, VerifyMode};
pub use ports::{parse_flag_p, PortMapping};
pub use types::{is_valid_object_name, ContainerId, Namespace};

use thiserror::Error;

/// User-input errors. Every message starts with a prefix the CLI maps to
/// exit status 125.
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("invalid argument: {0}")]
    InvalidPort(String),
    #[error("invalid argument: invalid mount: {0}")]
    InvalidMount(String),
    #[error("invalid argument: invalid device: {0}")]
    InvalidDevice(String),
    #[error("invalid argument: invalid size: {0}")]
    InvalidSize(String),
    #[error("options error: {0}")]
    Conflict(String),
    #[error("options error: failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid argument: malformed label value: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_carry_usage_prefix() {
        let errs = [
            OptionsError::Invalid("x".to_owned()),
            OptionsError::InvalidPort("x".to_owned()),
            OptionsError::InvalidMount("x".to_owned()),
            OptionsError::InvalidDevice("x".to_owned()),
            OptionsError::InvalidSize("x".to_owned()),
        ];
        for e in errs {
            assert!(e.to_string().starts_with("invalid argument:"), "{e}");
        }
        let e = OptionsError::Conflict("cpus and cpu-quota".to_owned());
        assert!(e.to_string().starts_with("options error:"));
    }
}
