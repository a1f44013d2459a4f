//! Compose projects on top of the engine.
//!
//! [`service`] turns each service into the `run` arguments of its replicas;
//! [`orchestrator`] creates networks and volumes, then runs the replicas in
//! dependency order through a [`CommandRunner`], and tears them down in
//! reverse.

pub mod orchestrator;
pub mod service;

pub use orchestrator::{
    CommandRunner, Composer, DownOptions, LogStyle, ProcessRunner, Recreate, RunServiceOptions,
    ServiceContainer, UpOptions,
};
pub use service::{parse_service, replica_name, BuildSpec, ParsedContainer, ParsedService};
