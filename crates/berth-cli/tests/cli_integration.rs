//! CLI subprocess integration tests.
//!
//! These invoke the `berth` binary against the mock supervisor with a
//! private data root, so no OCI runtime or CNI plugins are needed. Containers
//! use `--network none`.

use std::path::Path;
use std::process::{Command, Output};

struct Sandbox {
    dir: tempfile::TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn berth(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_berth"));
        let root = self.path();
        cmd.env("BERTH_SKIP_PREREQS", "1")
            .env("BERTH_TOML", root.join("absent.toml"))
            .env_remove("BERTH_LOG")
            .env_remove("BERTH_NAMESPACE")
            .env_remove("BERTH_DATA_ROOT")
            .env_remove("COMPOSE_PROJECT_NAME")
            .arg("--supervisor=mock")
            .arg("--cgroup-manager=none")
            .arg(format!("--data-root={}", root.join("data").display()))
            .arg(format!("--cni-netconfpath={}", root.join("netconf").display()))
            .arg(format!("--cni-path={}", root.join("plugins").display()));
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.berth().args(args).output().unwrap()
    }
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[test]
fn version_exits_zero() {
    let out = Command::new(env!("CARGO_BIN_EXE_berth"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(stdout(&out).starts_with("berth "));
}

#[test]
fn help_lists_commands() {
    let out = Command::new(env!("CARGO_BIN_EXE_berth"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(out.status.success());
    let text = stdout(&out);
    for cmd in ["run", "compose", "network", "volume", "ps"] {
        assert!(text.contains(cmd), "help is missing {cmd}");
    }
    assert!(!text.contains("internal"));
}

#[test]
fn unknown_flag_is_a_usage_error() {
    let out = Command::new(env!("CARGO_BIN_EXE_berth"))
        .args(["ps", "--bogus"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn invalid_publish_exits_125() {
    let sb = Sandbox::new();
    let out = sb.run(&["run", "-d", "--network", "none", "-p", "notaport", "alpine"]);
    assert_eq!(out.status.code(), Some(125), "stderr: {}", stderr(&out));
    assert!(stderr(&out).contains("error: invalid argument:"));
}

#[test]
fn conflicting_options_exit_125() {
    let sb = Sandbox::new();
    let out = sb.run(&["run", "-d", "--network", "none", "--ip", "10.4.1.9", "alpine"]);
    assert_eq!(out.status.code(), Some(125), "stderr: {}", stderr(&out));
}

#[test]
fn run_detached_then_ps_stop_rm() {
    let sb = Sandbox::new();
    let out = sb.run(&[
        "run", "-d", "--network", "none", "--name", "web1", "alpine", "sleep", "60",
    ]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let id = stdout(&out).trim().to_owned();
    assert_eq!(id.len(), 64);

    let out = sb.run(&["ps", "-a", "-q", "--no-trunc"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).lines().any(|l| l == id));

    let out = sb.run(&["ps", "-a", "--format", "json"]);
    let rows: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(rows[0]["name"], "web1");

    let out = sb.run(&["inspect", "web1"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let details: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(details[0]["id"], id.as_str());

    // The name is taken until the container is removed.
    let out = sb.run(&["run", "-d", "--network", "none", "--name", "web1", "alpine"]);
    assert!(!out.status.success());

    let out = sb.run(&["stop", "-t", "0", "web1"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let out = sb.run(&["rm", "-f", "web1"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let out = sb.run(&["ps", "-a", "-q"]);
    assert!(stdout(&out).trim().is_empty());
}

#[test]
fn rm_unknown_container_fails() {
    let sb = Sandbox::new();
    let out = sb.run(&["rm", "nope"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("no such container"));
}

#[test]
fn network_create_ls_rm() {
    let sb = Sandbox::new();
    let out = sb.run(&["network", "create", "--subnet", "10.9.8.0/24", "backend"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let out = sb.run(&["network", "ls", "-q"]);
    assert!(stdout(&out).lines().any(|l| l == "backend"));

    let out = sb.run(&["network", "inspect", "backend"]);
    assert!(stdout(&out).contains("10.9.8.0/24"));

    let out = sb.run(&["network", "rm", "backend"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let out = sb.run(&["network", "ls", "-q"]);
    assert!(!stdout(&out).lines().any(|l| l == "backend"));
}

#[test]
fn reserved_label_prefix_is_rejected() {
    let sb = Sandbox::new();
    let out = sb.run(&["volume", "create", "--label", "berth/owner=me", "data"]);
    assert_eq!(out.status.code(), Some(125), "stderr: {}", stderr(&out));
}

#[test]
fn volume_create_ls_rm() {
    let sb = Sandbox::new();
    let out = sb.run(&["volume", "create", "--label", "tier=db", "pgdata"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "pgdata");

    let out = sb.run(&["volume", "ls", "--format", "json"]);
    let vols: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(vols[0]["Name"], "pgdata");

    let out = sb.run(&["volume", "rm", "pgdata"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let out = sb.run(&["volume", "inspect", "pgdata"]);
    assert!(!out.status.success());
}

#[test]
fn compose_config_lists_services() {
    let sb = Sandbox::new();
    let file = sb.path().join("compose.yaml");
    std::fs::write(
        &file,
        "services:\n  db:\n    image: postgres\n  web:\n    image: nginx\n    depends_on: [db]\n",
    )
    .unwrap();
    let out = sb.run(&[
        "compose",
        "-f",
        file.to_str().unwrap(),
        "config",
        "--services",
    ]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let names: Vec<String> = stdout(&out).lines().map(str::to_owned).collect();
    assert_eq!(names, vec!["db", "web"]);
}

#[test]
fn compose_bad_file_exits_125() {
    let sb = Sandbox::new();
    let file = sb.path().join("compose.yaml");
    std::fs::write(&file, "services:\n  web:\n    ports: [80]\n").unwrap();
    let out = sb.run(&["compose", "-f", file.to_str().unwrap(), "config"]);
    assert_eq!(out.status.code(), Some(125), "stderr: {}", stderr(&out));
}

#[test]
fn completions_bash() {
    let out = Command::new(env!("CARGO_BIN_EXE_berth"))
        .args(["completions", "bash"])
        .env("BERTH_TOML", "/nonexistent/berth.toml")
        .output()
        .unwrap();
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("berth"));
}

#[test]
fn man_pages_written() {
    let sb = Sandbox::new();
    let dir = sb.path().join("man");
    let out = sb.run(&["man-pages", dir.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(dir.join("berth.1").exists());
    assert!(dir.join("berth-compose-up.1").exists());
    assert!(!dir.join("berth-internal.1").exists());
}
