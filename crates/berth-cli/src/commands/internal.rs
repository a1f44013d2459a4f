//! Entry points the runtime calls back into: OCI hooks and log forwarding.
//! These run as short-lived children of the runtime, not of a user shell.

use super::EXIT_SUCCESS;
use berth_core::hook::{self, HookEnv, HookEvent, RootlessPorts};
use berth_core::logs;
use berth_runtime::iptables::Iptables;
use berth_runtime::rootless::{self, Bypass4netnsClient, PortManagerClient};
use berth_runtime::{apparmor, ExecCni, State};
use berth_schema::labels;
use berth_store::layout::state_files;
use clap::Subcommand;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Subcommand)]
pub enum InternalCommand {
    /// Handle an OCI hook event; the container state arrives on stdin.
    OciHook {
        /// createRuntime or postStop.
        event: String,
        /// Data root of the engine that created the container.
        root: PathBuf,
        /// Colon-separated CNI plugin directories.
        plugin_dirs: String,
        netconf: PathBuf,
        /// Gateway substituted for host-gateway entries.
        bridge_ip: Option<String>,
    },
    /// Copy one output stream of a container from stdin into its log.
    Logger {
        #[arg(long, default_value = "json-file")]
        driver: String,
        #[arg(long)]
        log_path: Option<PathBuf>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long, default_value = "stdout")]
        stream: String,
    },
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env("BERTH_LOG").unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Log to stderr and, when the state dir is known, to
/// `<state-dir>/oci-hook.<event>.log`.
fn init_hook_logging(state_dir: Option<&Path>, event: HookEvent) {
    let file = state_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(state_files::hook_log(event.as_str())))
            .ok()
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter("info"))
        .with_target(false)
        .with_ansi(false);
    match file {
        Some(f) => builder.with_writer(io::stderr.and(Mutex::new(f))).init(),
        None => builder.with_writer(io::stderr).init(),
    }
}

fn oci_hook(
    event: &str,
    data_root: &Path,
    cni_path: &str,
    netconf: &Path,
    bridge_ip: Option<String>,
) -> Result<u8, String> {
    let event: HookEvent = event.parse().map_err(|e: berth_core::CoreError| e.to_string())?;
    let mut input = Vec::new();
    io::stdin()
        .read_to_end(&mut input)
        .map_err(|e| format!("failed to read hook state: {e}"))?;
    let state: State =
        serde_json::from_slice(&input).map_err(|e| format!("invalid hook state: {e}"))?;

    let state_dir = state.annotations.get(labels::STATE_DIR).map(PathBuf::from);
    init_hook_logging(state_dir.as_deref(), event);

    let cni = ExecCni::new(
        std::env::split_paths(cni_path).collect(),
        data_root.join("cni").join("cache"),
    );
    let mut env = HookEnv::new(data_root, netconf, &cni);
    env.bridge_ip = bridge_ip;
    env.apparmor = apparmor::can_load_new_profile();
    env.iptables = Some(Iptables::default());
    if rootless::is_rootless_child() {
        env.rootless = Some(RootlessPorts {
            port_manager: PortManagerClient::from_env().map_err(|e| e.to_string())?,
            bypass: Bypass4netnsClient::default_socket().map(Bypass4netnsClient::new),
        });
    }

    hook::handle(event, &state, &env).map_err(|e| {
        tracing::error!("{event} failed: {e}");
        e.to_string()
    })?;
    Ok(EXIT_SUCCESS)
}

fn logger(
    driver: &str,
    log_path: Option<&Path>,
    tag: Option<&str>,
    stream: &str,
) -> Result<u8, String> {
    tracing_subscriber::fmt()
        .with_env_filter(filter("warn"))
        .with_target(false)
        .without_time()
        .with_writer(io::stderr)
        .init();
    let input = io::stdin().lock();
    match driver {
        "json-file" => {
            let path = log_path.ok_or_else(|| {
                "invalid argument: --log-path is required with the json-file driver".to_owned()
            })?;
            logs::run_json_logger(path, stream, input).map_err(|e| e.to_string())?;
        }
        "journald" => {
            logs::run_journald_logger(tag.unwrap_or("berth"), stream, input)
                .map_err(|e| e.to_string())?;
        }
        other => return Err(format!("invalid argument: unknown log driver '{other}'")),
    }
    Ok(EXIT_SUCCESS)
}

pub fn run(cmd: InternalCommand) -> Result<u8, String> {
    match cmd {
        InternalCommand::OciHook {
            event,
            root,
            plugin_dirs,
            netconf,
            bridge_ip,
        } => oci_hook(&event, &root, &plugin_dirs, &netconf, bridge_ip),
        InternalCommand::Logger {
            driver,
            log_path,
            tag,
            stream,
        } => logger(&driver, log_path.as_deref(), tag.as_deref(), &stream),
    }
}
