//! Local supervisor driving an OCI runtime binary.
//!
//! Container records live in `<data-root>/supervisor/<ns>/<id>/record.json`
//! next to the OCI bundle. The runtime's own state goes under
//! `<data-root>/supervisor/<ns>/runc`. Hooks listed in the spec are run by
//! the runtime itself: createRuntime during `create`/`run`, poststop during
//! `delete`.

use crate::image::{resolve_image, ImageCache};
use crate::oci::Root;
use crate::snapshot::Snapshot;
use crate::supervisor::{
    ContainerFilter, ContainerRecord, ExecRequest, ImageInfo, NewContainer, Supervisor,
    SupervisorConfig, TaskInfo, TaskIo, TaskStatus,
};
use crate::RuntimeError;
use berth_schema::Labels;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const RECORD_FILE: &str = "record.json";
const EXIT_CODE_FILE: &str = "exit-code";
const RUNTIME_STATE_DIR: &str = "runc";
const PID_FILE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RuncState {
    status: String,
    #[serde(default)]
    pid: u32,
}

pub struct RuncSupervisor {
    config: SupervisorConfig,
    base: PathBuf,
    images: ImageCache,
    /// Foreground tasks started by this process.
    children: Mutex<HashMap<String, Child>>,
}

/// Map runtime stderr to an error kind.
pub fn classify_failure(what: &str, stderr: &str) -> RuntimeError {
    let msg = stderr.trim();
    let lower = msg.to_lowercase();
    if lower.contains("does not exist") || lower.contains("container not found") {
        RuntimeError::NotFound(what.to_owned())
    } else if lower.contains("address already in use") {
        RuntimeError::AddrInUse(format!("{what}: {msg}"))
    } else if lower.contains("not stopped") || lower.contains("is running") || lower.contains("is paused") {
        RuntimeError::Precondition(format!("{what}: {msg}"))
    } else {
        RuntimeError::ExecFailed(format!("{what}: {msg}"))
    }
}

/// Last error message from a JSON-format runtime log.
fn last_log_error(log: &Path) -> Option<String> {
    let content = std::fs::read_to_string(log).ok()?;
    content.lines().rev().find_map(|line| {
        let v: serde_json::Value = serde_json::from_str(line).ok()?;
        (v.get("level")?.as_str()? == "error").then(|| v.get("msg")?.as_str().map(str::to_owned))?
    })
}

impl RuncSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let base = config
            .data_root
            .join("supervisor")
            .join(&config.namespace);
        let images = ImageCache::new(config.data_root.join("images"), config.hosts_dir.clone());
        Self {
            config,
            base,
            images,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.base.join(id)
    }

    fn bundle_dir(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("bundle")
    }

    fn runtime_log(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("runtime.log")
    }

    fn snapshot(&self, rec: &ContainerRecord) -> Result<Option<Snapshot>, RuntimeError> {
        if rec.snapshot.is_empty() {
            return Ok(None);
        }
        let image = self.image(&rec.image)?;
        Ok(Some(Snapshot::new(
            image.rootfs,
            &self.container_dir(&rec.id).join("snapshot"),
            self.config.rootless,
        )))
    }

    fn runtime(&self) -> Command {
        let mut cmd = Command::new(&self.config.runtime);
        cmd.arg("--root").arg(self.base.join(RUNTIME_STATE_DIR));
        if self.config.systemd_cgroup {
            cmd.arg("--systemd-cgroup");
        }
        cmd
    }

    fn runtime_for(&self, id: &str) -> Command {
        let mut cmd = self.runtime();
        cmd.arg("--log")
            .arg(self.runtime_log(id))
            .args(["--log-format", "json"]);
        cmd
    }

    fn run_captured(&self, mut cmd: Command, what: &str) -> Result<Output, RuntimeError> {
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| RuntimeError::ExecFailed(format!("{} failed: {e}", self.config.runtime)))?;
        if !output.status.success() {
            return Err(classify_failure(what, &String::from_utf8_lossy(&output.stderr)));
        }
        Ok(output)
    }

    fn save_record(&self, rec: &ContainerRecord) -> Result<(), RuntimeError> {
        let dir = self.container_dir(&rec.id);
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(rec)?)?;
        tmp.persist(dir.join(RECORD_FILE))
            .map_err(|e| RuntimeError::Io(e.error))?;
        Ok(())
    }

    fn write_bundle(&self, rec: &ContainerRecord) -> Result<PathBuf, RuntimeError> {
        let bundle = self.bundle_dir(&rec.id);
        std::fs::create_dir_all(&bundle)?;
        rec.spec.save(&bundle.join("config.json"))?;
        Ok(bundle)
    }

    fn wait_for_pid(&self, pid_file: &Path, id: &str) -> Result<u32, RuntimeError> {
        let deadline = Instant::now() + PID_FILE_TIMEOUT;
        loop {
            if let Ok(raw) = std::fs::read_to_string(pid_file) {
                if let Ok(pid) = raw.trim().parse::<u32>() {
                    return Ok(pid);
                }
            }
            let exited = {
                let mut children = self
                    .children
                    .lock()
                    .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?;
                match children.get_mut(id) {
                    Some(child) => child.try_wait()?,
                    None => None,
                }
            };
            if let Some(status) = exited {
                self.children
                    .lock()
                    .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
                    .remove(id);
                let msg = last_log_error(&self.runtime_log(id))
                    .unwrap_or_else(|| format!("exited with {}", status.code().unwrap_or(-1)));
                return Err(classify_failure(&format!("start task {id}"), &msg));
            }
            if Instant::now() > deadline {
                return Err(RuntimeError::ExecFailed(format!(
                    "timed out waiting for task {id} to start"
                )));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn write_exit_code(&self, id: &str, code: i32) {
        if let Err(e) = std::fs::write(self.container_dir(id).join(EXIT_CODE_FILE), code.to_string())
        {
            debug!("failed to record exit code for {id}: {e}");
        }
    }

    fn read_exit_code(&self, id: &str) -> Option<i32> {
        std::fs::read_to_string(self.container_dir(id).join(EXIT_CODE_FILE))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    fn spawn_logger(argv: &[String], stream: &str) -> Result<Stdio, RuntimeError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RuntimeError::Invalid("empty logger command".to_owned()))?;
        let mut child = Command::new(program)
            .args(args)
            .args(["--stream", stream])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to start logger: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::ExecFailed("logger has no stdin".to_owned()))?;
        Ok(Stdio::from(stdin))
    }
}

impl Supervisor for RuncSupervisor {
    fn name(&self) -> &'static str {
        "runc"
    }

    fn available(&self) -> bool {
        Command::new(&self.config.runtime)
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let entries = match std::fs::read_dir(&self.base) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().into_owned();
            if id == RUNTIME_STATE_DIR || !entry.path().join(RECORD_FILE).is_file() {
                continue;
            }
            let rec = self.get_container(&id)?;
            if filter.matches(&rec) {
                out.push(rec);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    fn create_container(&self, new: NewContainer) -> Result<ContainerRecord, RuntimeError> {
        let dir = self.container_dir(&new.id);
        if dir.join(RECORD_FILE).exists() {
            return Err(RuntimeError::AlreadyExists(format!("container {}", new.id)));
        }
        let mut spec = new.spec;
        let (root_path, snapshot) = match &new.rootfs_path {
            Some(path) => (path.clone(), String::new()),
            None => {
                let image = self.image(&new.image)?;
                let snap = Snapshot::new(image.rootfs, &dir.join("snapshot"), self.config.rootless);
                (snap.merged, new.id.clone())
            }
        };
        spec.root
            .get_or_insert_with(|| Root {
                path: PathBuf::new(),
                readonly: false,
            })
            .path = root_path;
        let rec = ContainerRecord {
            id: new.id,
            image: new.image,
            labels: new.labels,
            spec,
            created_at: Utc::now(),
            snapshot,
        };
        self.save_record(&rec)?;
        self.write_bundle(&rec)?;
        debug!("created container record {}", rec.id);
        Ok(rec)
    }

    fn get_container(&self, id: &str) -> Result<ContainerRecord, RuntimeError> {
        let path = self.container_dir(id).join(RECORD_FILE);
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuntimeError::NotFound(format!("container {id}")))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    fn update_labels(&self, id: &str, labels: &Labels) -> Result<(), RuntimeError> {
        let mut rec = self.get_container(id)?;
        rec.labels.extend(labels.clone());
        rec.spec.annotations.extend(labels.clone());
        self.save_record(&rec)?;
        self.write_bundle(&rec)?;
        Ok(())
    }

    fn delete_container(&self, id: &str) -> Result<(), RuntimeError> {
        let rec = self.get_container(id)?;
        match self.task_status(id) {
            Ok(_) => {
                return Err(RuntimeError::Precondition(format!(
                    "container {id} still has a task"
                )))
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        match self.snapshot(&rec) {
            Ok(Some(snap)) => snap.unmount()?,
            Ok(None) => {}
            // The image may be gone already; the snapshot dir is removed below.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        crate::image::force_remove(&self.container_dir(id))?;
        debug!("deleted container {id}");
        Ok(())
    }

    fn image(&self, reference: &str) -> Result<ImageInfo, RuntimeError> {
        self.images.get(&resolve_image(reference)?)
    }

    fn pull(&self, reference: &str) -> Result<ImageInfo, RuntimeError> {
        self.images.ensure(&resolve_image(reference)?, true)
    }

    fn fetch(&self, reference: &str) -> Result<(), RuntimeError> {
        self.images.fetch(&resolve_image(reference)?).map(|_| ())
    }

    fn images(&self) -> Result<Vec<ImageInfo>, RuntimeError> {
        self.images.list()
    }

    fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let resolved = resolve_image(reference)?;
        let info = self.images.get(&resolved)?;
        let users: Vec<String> = self
            .containers(&ContainerFilter::default())?
            .into_iter()
            .filter(|c| !c.snapshot.is_empty() && resolve_image(&c.image).is_ok_and(|r| r == resolved))
            .map(|c| c.id)
            .collect();
        if !users.is_empty() {
            return Err(RuntimeError::Precondition(format!(
                "image {} is used by containers {}",
                info.name,
                users.join(", ")
            )));
        }
        self.images.remove(&resolved)
    }

    fn task_status(&self, id: &str) -> Result<TaskInfo, RuntimeError> {
        let mut cmd = self.runtime();
        cmd.args(["state", id]);
        let output = self.run_captured(cmd, &format!("task {id}"))?;
        let state: RuncState = serde_json::from_slice(&output.stdout)?;
        let status = TaskStatus::parse(&state.status);
        Ok(TaskInfo {
            status,
            pid: (state.pid != 0).then_some(state.pid),
            exit_code: if status == TaskStatus::Stopped {
                self.read_exit_code(id)
            } else {
                None
            },
        })
    }

    fn start_task(&self, id: &str, io: &TaskIo) -> Result<u32, RuntimeError> {
        let rec = self.get_container(id)?;
        if let Some(snap) = self.snapshot(&rec)? {
            snap.mount()?;
        }
        let bundle = self.write_bundle(&rec)?;
        let pid_file = self.container_dir(id).join("init.pid");
        let _ = std::fs::remove_file(&pid_file);
        let _ = std::fs::remove_file(self.container_dir(id).join(EXIT_CODE_FILE));
        let _ = std::fs::remove_file(self.runtime_log(id));

        match io {
            TaskIo::Foreground { stdin, .. } => {
                let mut cmd = self.runtime_for(id);
                cmd.arg("run")
                    .arg("--bundle")
                    .arg(&bundle)
                    .arg("--pid-file")
                    .arg(&pid_file)
                    .arg(id)
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
                if *stdin {
                    cmd.stdin(Stdio::inherit());
                } else {
                    cmd.stdin(Stdio::null());
                }
                let child = cmd.spawn().map_err(|e| {
                    RuntimeError::ExecFailed(format!("{} run failed: {e}", self.config.runtime))
                })?;
                self.children
                    .lock()
                    .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
                    .insert(id.to_owned(), child);
                self.wait_for_pid(&pid_file, id)
            }
            TaskIo::Logger { argv } => {
                let stdout = Self::spawn_logger(argv, "stdout")?;
                let stderr = Self::spawn_logger(argv, "stderr")?;
                self.create_and_start(id, &bundle, &pid_file, stdout, stderr)
            }
            TaskIo::Null => {
                self.create_and_start(id, &bundle, &pid_file, Stdio::null(), Stdio::null())
            }
        }
    }

    fn kill_task(&self, id: &str, signal: i32) -> Result<(), RuntimeError> {
        let mut cmd = self.runtime();
        cmd.args(["kill", id, &signal.to_string()]);
        self.run_captured(cmd, &format!("task {id}"))?;
        Ok(())
    }

    fn wait_task(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<i32>, RuntimeError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let child = self
            .children
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
            .remove(id);
        if let Some(mut child) = child {
            loop {
                if let Some(status) = child.try_wait()? {
                    let code = status.code().unwrap_or(-1);
                    self.write_exit_code(id, code);
                    return Ok(Some(code));
                }
                if deadline.is_some_and(|d| Instant::now() > d) {
                    self.children
                        .lock()
                        .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
                        .insert(id.to_owned(), child);
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }

        // Detached tasks: the runtime does not report exit status, poll for stop.
        loop {
            let info = self.task_status(id)?;
            if info.status == TaskStatus::Stopped {
                return Ok(Some(info.exit_code.unwrap_or(0)));
            }
            if deadline.is_some_and(|d| Instant::now() > d) {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn delete_task(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut cmd = self.runtime_for(id);
        cmd.arg("delete");
        if force {
            cmd.arg("--force");
        }
        cmd.arg(id);
        self.run_captured(cmd, &format!("task {id}"))?;
        if let Ok(rec) = self.get_container(id) {
            if let Ok(Some(snap)) = self.snapshot(&rec) {
                if let Err(e) = snap.unmount() {
                    warn!("failed to unmount snapshot of {id}: {e}");
                }
            }
        }
        Ok(())
    }

    fn pause_task(&self, id: &str) -> Result<(), RuntimeError> {
        let mut cmd = self.runtime();
        cmd.args(["pause", id]);
        self.run_captured(cmd, &format!("task {id}"))?;
        Ok(())
    }

    fn resume_task(&self, id: &str) -> Result<(), RuntimeError> {
        let mut cmd = self.runtime();
        cmd.args(["resume", id]);
        self.run_captured(cmd, &format!("task {id}"))?;
        Ok(())
    }

    fn exec(&self, id: &str, req: &ExecRequest) -> Result<i32, RuntimeError> {
        let mut cmd = self.runtime();
        cmd.arg("exec");
        if req.tty {
            cmd.arg("--tty");
        }
        if req.detach {
            cmd.arg("--detach");
        }
        if let Some(cwd) = &req.cwd {
            cmd.args(["--cwd", cwd]);
        }
        if let Some(user) = &req.user {
            cmd.args(["--user", user]);
        }
        for e in &req.env {
            cmd.args(["--env", e]);
        }
        cmd.arg(id).args(&req.args);
        if req.interactive {
            cmd.stdin(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
        }
        let status = cmd
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| RuntimeError::ExecFailed(format!("{} exec failed: {e}", self.config.runtime)))?;
        Ok(status.code().unwrap_or(-1))
    }
}

impl RuncSupervisor {
    fn create_and_start(
        &self,
        id: &str,
        bundle: &Path,
        pid_file: &Path,
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<u32, RuntimeError> {
        let status = self
            .runtime_for(id)
            .arg("create")
            .arg("--bundle")
            .arg(bundle)
            .arg("--pid-file")
            .arg(pid_file)
            .arg(id)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .map_err(|e| RuntimeError::ExecFailed(format!("{} create failed: {e}", self.config.runtime)))?;
        if !status.success() {
            let msg = last_log_error(&self.runtime_log(id))
                .unwrap_or_else(|| format!("exited with {}", status.code().unwrap_or(-1)));
            return Err(classify_failure(&format!("create task {id}"), &msg));
        }
        let mut cmd = self.runtime_for(id);
        cmd.args(["start", id]);
        self.run_captured(cmd, &format!("start task {id}"))?;
        let pid = std::fs::read_to_string(pid_file)?
            .trim()
            .parse::<u32>()
            .map_err(|e| RuntimeError::ExecFailed(format!("bad pid file for {id}: {e}")))?;
        debug!("task {id} started with pid {pid}");
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::default_spec;

    fn supervisor(root: &Path) -> RuncSupervisor {
        RuncSupervisor::new(SupervisorConfig {
            data_root: root.to_path_buf(),
            namespace: "default".to_owned(),
            runtime: "runc".to_owned(),
            rootless: false,
            systemd_cgroup: false,
            hosts_dir: Vec::new(),
        })
    }

    #[test]
    fn classify_runtime_errors() {
        assert!(classify_failure("task x", "container \"x\" does not exist").is_not_found());
        assert!(matches!(
            classify_failure("x", "listen tcp 0.0.0.0:80: bind: address already in use"),
            RuntimeError::AddrInUse(_)
        ));
        assert!(matches!(
            classify_failure("x", "cannot delete container x that is not stopped: running"),
            RuntimeError::Precondition(_)
        ));
        assert!(matches!(
            classify_failure("x", "boom"),
            RuntimeError::ExecFailed(_)
        ));
    }

    #[test]
    fn runtime_log_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("runtime.log");
        std::fs::write(
            &log,
            "{\"level\":\"info\",\"msg\":\"x\"}\n{\"level\":\"error\",\"msg\":\"hook failed\"}\n",
        )
        .unwrap();
        assert_eq!(last_log_error(&log).as_deref(), Some("hook failed"));
        assert_eq!(last_log_error(&dir.path().join("missing")), None);
    }

    #[test]
    fn rootfs_container_records() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let rootfs = dir.path().join("myroot");
        std::fs::create_dir_all(&rootfs).unwrap();
        let mut labels = Labels::new();
        labels.insert("app".to_owned(), "web".to_owned());
        let rec = sup
            .create_container(NewContainer {
                id: "c1".to_owned(),
                image: rootfs.display().to_string(),
                labels,
                spec: default_spec(false),
                rootfs_path: Some(rootfs.clone()),
            })
            .unwrap();
        assert!(rec.snapshot.is_empty());
        assert_eq!(rec.spec.root.as_ref().unwrap().path, rootfs);
        assert!(sup.bundle_dir("c1").join("config.json").is_file());

        let found = sup
            .containers(&ContainerFilter::label("app", "web"))
            .unwrap();
        assert_eq!(found.len(), 1);

        let mut extra = Labels::new();
        extra.insert("berth/name".to_owned(), "renamed".to_owned());
        sup.update_labels("c1", &extra).unwrap();
        let rec = sup.get_container("c1").unwrap();
        assert_eq!(rec.labels["berth/name"], "renamed");
        assert_eq!(rec.spec.annotations["berth/name"], "renamed");

        assert!(matches!(
            sup.create_container(NewContainer {
                id: "c1".to_owned(),
                image: String::new(),
                labels: Labels::new(),
                spec: default_spec(false),
                rootfs_path: Some(rootfs),
            }),
            Err(RuntimeError::AlreadyExists(_))
        ));
        assert!(sup.get_container("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn image_backed_container_needs_image() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let err = sup
            .create_container(NewContainer {
                id: "c2".to_owned(),
                image: "alpine".to_owned(),
                labels: Labels::new(),
                spec: default_spec(false),
                rootfs_path: None,
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
