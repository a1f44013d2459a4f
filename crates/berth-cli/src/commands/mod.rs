pub mod completions;
pub mod compose;
pub mod container;
pub mod exec;
pub mod inspect;
pub mod internal;
pub mod logs;
pub mod man_pages;
pub mod network;
pub mod port;
pub mod ps;
pub mod run;
pub mod volume;

use berth_core::{CoreError, Engine, EngineOptions};
use berth_runtime::{cgroup, rootless};
use berth_schema::config::{ConfigFile, HostFacts, CONFIG_ENV};
use berth_schema::{flags, labels, BerthConfig, Labels};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_USAGE: u8 = 125;

/// Flags accepted by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Enable trace logging (more detailed than --debug).
    #[arg(long, global = true)]
    pub trace: bool,

    /// Supervisor namespace [env: BERTH_NAMESPACE].
    #[arg(long, global = true, value_name = "NS")]
    pub namespace: Option<String>,

    /// Root directory of persistent state [env: BERTH_DATA_ROOT].
    #[arg(long, global = true, value_name = "DIR")]
    pub data_root: Option<PathBuf>,

    /// Directory of CNI plugin binaries [env: CNI_PATH].
    #[arg(long, global = true, value_name = "DIR")]
    pub cni_path: Option<PathBuf>,

    /// Directory of CNI network configurations [env: NETCONFPATH].
    #[arg(long = "cni-netconfpath", global = true, value_name = "DIR")]
    pub cni_netconfpath: Option<PathBuf>,

    /// cgroup manager: systemd, cgroupfs or none [env: BERTH_CGROUP_MANAGER].
    #[arg(long, global = true, value_name = "MANAGER")]
    pub cgroup_manager: Option<String>,

    /// Container supervisor: runc or mock.
    #[arg(long, global = true, value_name = "NAME")]
    pub supervisor: Option<String>,

    /// OCI runtime binary driven by the runc supervisor.
    #[arg(long, global = true, value_name = "BINARY")]
    pub runtime: Option<String>,
}

impl GlobalArgs {
    pub fn log_level(&self, config_debug: bool) -> &'static str {
        if self.trace {
            "trace"
        } else if self.debug || config_debug {
            "debug"
        } else {
            "warn"
        }
    }

    fn apply(&self, config: &mut BerthConfig) {
        if self.debug {
            config.debug = true;
        }
        if let Some(v) = &self.namespace {
            config.namespace.clone_from(v);
        }
        if let Some(v) = &self.data_root {
            config.data_root.clone_from(v);
        }
        if let Some(v) = &self.cni_path {
            config.cni_path.clone_from(v);
        }
        if let Some(v) = &self.cni_netconfpath {
            config.cni_netconfpath.clone_from(v);
        }
        if let Some(v) = &self.cgroup_manager {
            config.cgroup_manager.clone_from(v);
        }
        if let Some(v) = &self.supervisor {
            config.supervisor.clone_from(v);
        }
        if let Some(v) = &self.runtime {
            config.runtime.clone_from(v);
        }
    }

    /// Flags that make a child `berth` see the same configuration.
    pub fn child_args(&self, config: &BerthConfig) -> Vec<String> {
        let mut args = vec![
            format!("--namespace={}", config.namespace),
            format!("--data-root={}", config.data_root.display()),
            format!("--cni-path={}", config.cni_path.display()),
            format!("--cni-netconfpath={}", config.cni_netconfpath.display()),
            format!("--cgroup-manager={}", config.cgroup_manager),
            format!("--supervisor={}", config.supervisor),
            format!("--runtime={}", config.runtime),
        ];
        if self.trace {
            args.push("--trace".to_owned());
        } else if self.debug || config.debug {
            args.push("--debug".to_owned());
        }
        args
    }
}

fn host_facts() -> HostFacts {
    let var = |k: &str| std::env::var_os(k).filter(|v| !v.is_empty()).map(PathBuf::from);
    HostFacts {
        rootless: rootless::is_rootless(),
        systemd_cgroup: cgroup::default_manager() == "systemd",
        home: var("HOME"),
        xdg_data_home: var("XDG_DATA_HOME"),
        xdg_config_home: var("XDG_CONFIG_HOME"),
    }
}

/// Resolve the configuration: flags over environment over `berth.toml`
/// over built-in defaults.
pub fn load_config(global: &GlobalArgs) -> Result<BerthConfig, String> {
    let facts = host_facts();
    let path = std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map_or_else(|| facts.default_config_path(), PathBuf::from);
    let mut config = BerthConfig::defaults(&facts);
    if let Some(file) = ConfigFile::load(&path).map_err(|e| e.to_string())? {
        config = config.with_file(file);
    }
    let mut config = config.with_env(|k| std::env::var(k).ok());
    global.apply(&mut config);
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

pub fn open_engine(config: &BerthConfig) -> Result<Engine, String> {
    let opts = EngineOptions::detect(config.clone()).map_err(|e| e.to_string())?;
    let engine = Engine::new(opts).map_err(|e| e.to_string())?;
    engine.initialize().map_err(|e| e.to_string())?;
    Ok(engine)
}

/// Exit status for an error message, chosen by its prefix.
pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("invalid argument:")
        || msg.starts_with("options error:")
        || msg.starts_with("compose file error:")
    {
        EXIT_USAGE
    } else {
        EXIT_FAILURE
    }
}

/// Exit status of a container as a process exit code.
pub fn container_exit_code(code: i32) -> u8 {
    (code & 0xff) as u8
}

/// Apply `op` to each reference, printing the ones that succeeded. Failures
/// do not stop the remaining references.
pub fn each_container(
    refs: &[String],
    op: impl Fn(&str) -> Result<(), CoreError>,
) -> Result<u8, String> {
    let mut errors = Vec::new();
    for r in refs {
        match op(r) {
            Ok(()) => println!("{r}"),
            Err(e) => errors.push(e.to_string()),
        }
    }
    if errors.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Err(errors.join("\n"))
    }
}

/// `--label` values; a bare key gets an empty value.
pub fn label_map(raw: &[String]) -> Result<Labels, String> {
    let mut labels = Labels::new();
    for l in raw {
        let (k, v) = if l.contains('=') {
            flags::parse_key_value(l).map_err(|e| e.to_string())?
        } else {
            (l.clone(), String::new())
        };
        labels.insert(k, v);
    }
    labels::check_user_labels(&labels).map_err(|e| e.to_string())?;
    Ok(labels)
}

pub fn timeout_arg(secs: Option<u64>) -> Option<Duration> {
    secs.map(Duration::from_secs)
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Output format of the listing commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, mark: &str, msg: &str) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(format!("{mark} {msg}"));
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, "✓", msg);
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, "✗", msg);
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    let style = match state.split_whitespace().next().unwrap_or_default() {
        "running" => Style::new().green(),
        "paused" => Style::new().yellow(),
        "created" => Style::new().cyan(),
        "exited" | "stopped" => Style::new().dim(),
        _ => return state.to_owned(),
    };
    style.apply_to(state).to_string()
}

/// First 12 characters of an id.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_exit_125() {
        assert_eq!(exit_code_for("invalid argument: bad port"), EXIT_USAGE);
        assert_eq!(exit_code_for("options error: cpus and cpu-quota"), EXIT_USAGE);
        assert_eq!(exit_code_for("compose file error: no such file"), EXIT_USAGE);
        assert_eq!(exit_code_for("no such container: web"), EXIT_FAILURE);
    }

    #[test]
    fn container_codes_fit_a_byte() {
        assert_eq!(container_exit_code(0), 0);
        assert_eq!(container_exit_code(137), 137);
        assert_eq!(container_exit_code(256 + 3), 3);
    }

    #[test]
    fn child_args_carry_resolved_config() {
        let config = BerthConfig::defaults(&HostFacts::default());
        let global = GlobalArgs {
            debug: true,
            ..GlobalArgs::default()
        };
        let args = global.child_args(&config);
        assert!(args.contains(&"--namespace=default".to_owned()));
        assert!(args.contains(&"--data-root=/var/lib/berth".to_owned()));
        assert_eq!(args.last().map(String::as_str), Some("--debug"));
    }

    #[test]
    fn flags_override_config() {
        let mut config = BerthConfig::defaults(&HostFacts::default());
        let global = GlobalArgs {
            namespace: Some("k8s.io".to_owned()),
            supervisor: Some("mock".to_owned()),
            ..GlobalArgs::default()
        };
        global.apply(&mut config);
        assert_eq!(config.namespace, "k8s.io");
        assert_eq!(config.supervisor, "mock");
        assert_eq!(config.runtime, "runc");
    }

    #[test]
    fn json_pretty_serializes() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
    }

    #[test]
    fn colorize_keeps_text() {
        for state in ["running", "exited (1)", "created", "unknown"] {
            assert!(colorize_state(state).contains(state));
        }
    }

    #[test]
    fn labels_from_flags() {
        let l = label_map(&["tier=web".to_owned(), "debug".to_owned()]).unwrap();
        assert_eq!(l.get("tier").map(String::as_str), Some("web"));
        assert_eq!(l.get("debug").map(String::as_str), Some(""));
        assert!(label_map(&["=x".to_owned()]).unwrap_err().starts_with("invalid argument:"));
        assert!(label_map(&["berth/name=x".to_owned()]).is_err());
    }

    #[test]
    fn short_ids() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
