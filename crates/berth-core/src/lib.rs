//! Container lifecycle coordination for berth.
//!
//! This crate turns a closed option record into an OCI runtime spec
//! ([`spec`]), drives the supervisor through create, start, stop and remove
//! ([`engine`], [`runner`]), handles the createRuntime/postStop hook events
//! that attach containers to CNI networks ([`hook`]), and brings compose
//! projects up and down in dependency order ([`compose`]).

pub mod compose;
pub mod concurrency;
pub mod engine;
pub mod hook;
pub mod logs;
pub mod lookup;
pub mod network;
pub mod objects;
pub mod runner;
pub mod signal;
pub mod spec;

pub use concurrency::{install_signal_handler, shutdown_requested, Cancel};
pub use engine::{Engine, EngineOptions};
pub use hook::{HookEnv, HookEvent};
pub use network::NetworkMode;
pub use runner::{ContainerDetails, ContainerSummary, RunOutcome};

use berth_runtime::RuntimeError;
use berth_schema::{ComposeError, ConfigError, OptionsError};
use berth_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("hosts store: {0}")]
    HostsStore(StoreError),
    #[error("lifecycle store: {0}")]
    LifecycleStore(StoreError),
    #[error("name store: {0}")]
    NameStore(StoreError),
    #[error("volume store: {0}")]
    VolumeStore(StoreError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("no such container: {0}")]
    NoSuchContainer(String),
    #[error("multiple IDs found with provided prefix: {0}")]
    Ambiguous(String),
    #[error("{0}")]
    Precondition(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether this is a not-found condition from any layer.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NoSuchContainer(_) => true,
            Self::Runtime(e) => e.is_not_found(),
            Self::HostsStore(e)
            | Self::LifecycleStore(e)
            | Self::NameStore(e)
            | Self::VolumeStore(e)
            | Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Self::Runtime(e) if e.is_addr_in_use())
    }
}

/// Turn a not-found error into `Ok(())`; used by idempotent cleanup paths.
pub fn ignore_not_found(result: Result<(), CoreError>) -> Result<(), CoreError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
