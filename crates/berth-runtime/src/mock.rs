use crate::image::normalize_reference;
use crate::oci::{Hook, State, OCI_VERSION};
use crate::supervisor::{
    ContainerFilter, ContainerRecord, ExecRequest, ImageConfig, ImageInfo, NewContainer,
    Supervisor, TaskInfo, TaskIo, TaskStatus,
};
use crate::RuntimeError;
use berth_schema::Labels;
use berth_store::FileLock;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// In-process hook callback: `(event, state)`.
pub type HookFn = Arc<dyn Fn(&str, &State) -> Result<(), String> + Send + Sync>;

/// How the mock treats the hooks listed in a container's spec.
#[derive(Clone, Default)]
pub enum HookMode {
    #[default]
    Skip,
    /// Spawn the hook executables like a real OCI runtime would.
    Exec,
    Callback(HookFn),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockTask {
    status: TaskStatus,
    pid: u32,
    exit_code: Option<i32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MockState {
    containers: BTreeMap<String, ContainerRecord>,
    tasks: BTreeMap<String, MockTask>,
    images: BTreeMap<String, ImageInfo>,
    next_pid: u32,
}

/// In-memory supervisor. With a state file it survives across processes,
/// which is what the CLI tests rely on.
pub struct MockSupervisor {
    state: Mutex<MockState>,
    state_file: Option<PathBuf>,
    hooks: HookMode,
    calls: Mutex<Vec<String>>,
    start_failures: Mutex<usize>,
}

impl Default for MockSupervisor {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            state_file: None,
            hooks: HookMode::Skip,
            calls: Mutex::new(Vec::new()),
            start_failures: Mutex::new(0),
        }
    }
}

fn poisoned<T>(e: &std::sync::PoisonError<T>) -> RuntimeError {
    RuntimeError::ExecFailed(format!("mutex poisoned: {e}"))
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// State kept in `path`, hooks executed as subprocesses.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            state_file: Some(path.into()),
            hooks: HookMode::Exec,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: HookMode) -> Self {
        self.hooks = hooks;
        self
    }

    /// Make the next `n` task starts fail with "address already in use".
    pub fn fail_next_starts(&self, n: usize) {
        if let Ok(mut f) = self.start_failures.lock() {
            *f = n;
        }
    }

    /// Operations performed so far, as `op:id`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, op: &str, id: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{op}:{id}"));
        }
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MockState) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let mut state = self.state.lock().map_err(|e| poisoned(&e))?;
        let Some(path) = &self.state_file else {
            return f(&mut state);
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let _lock = FileLock::acquire(&path.with_extension("lock"))?;
        *state = match std::fs::read(path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MockState::default(),
            Err(e) => return Err(e.into()),
        };
        let out = f(&mut state)?;
        save_state(path, &state)?;
        Ok(out)
    }

    fn hooks_for(&self, id: &str) -> Result<(State, Vec<Hook>, Vec<Hook>), RuntimeError> {
        self.with_state(|st| {
            let rec = st
                .containers
                .get(id)
                .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))?;
            let hooks = rec.spec.hooks.clone().unwrap_or_default();
            let state = State {
                oci_version: OCI_VERSION.to_owned(),
                id: id.to_owned(),
                status: "creating".to_owned(),
                pid: st.tasks.get(id).map(|t| t.pid),
                bundle: PathBuf::from("/mock/bundles").join(id),
                annotations: rec.spec.annotations.clone(),
            };
            Ok((state, hooks.create_runtime, hooks.poststop))
        })
    }

    fn run_hooks(&self, event: &str, state: &State, hooks: &[Hook]) -> Result<(), RuntimeError> {
        match &self.hooks {
            HookMode::Skip => Ok(()),
            HookMode::Callback(f) => {
                f(event, state).map_err(|e| RuntimeError::ExecFailed(format!("{event} hook: {e}")))
            }
            HookMode::Exec => {
                for hook in hooks {
                    exec_hook(hook, state)?;
                }
                Ok(())
            }
        }
    }
}

fn save_state(path: &Path, state: &MockState) -> Result<(), RuntimeError> {
    let dir = path
        .parent()
        .ok_or_else(|| RuntimeError::Invalid(format!("no parent: {}", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&serde_json::to_vec(state)?)?;
    tmp.persist(path).map_err(|e| RuntimeError::Io(e.error))?;
    Ok(())
}

/// Run one OCI hook: state JSON on stdin, non-zero exit aborts.
pub fn exec_hook(hook: &Hook, state: &State) -> Result<(), RuntimeError> {
    let mut cmd = Command::new(&hook.path);
    if hook.args.len() > 1 {
        cmd.args(&hook.args[1..]);
    }
    if !hook.env.is_empty() {
        cmd.env_clear();
        for kv in &hook.env {
            if let Some((k, v)) = kv.split_once('=') {
                cmd.env(k, v);
            }
        }
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            RuntimeError::ExecFailed(format!("hook {} failed to start: {e}", hook.path.display()))
        })?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&serde_json::to_vec(state)?)?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(RuntimeError::ExecFailed(format!(
            "hook {} exited with {}: {}",
            hook.path.display(),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

impl Supervisor for MockSupervisor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerRecord>, RuntimeError> {
        self.with_state(|st| {
            Ok(st
                .containers
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect())
        })
    }

    fn create_container(&self, new: NewContainer) -> Result<ContainerRecord, RuntimeError> {
        self.record("create_container", &new.id);
        self.with_state(|st| {
            if st.containers.contains_key(&new.id) {
                return Err(RuntimeError::AlreadyExists(format!("container {}", new.id)));
            }
            let rec = ContainerRecord {
                id: new.id.clone(),
                image: new.image,
                labels: new.labels,
                spec: new.spec,
                created_at: Utc::now(),
                snapshot: if new.rootfs_path.is_some() {
                    String::new()
                } else {
                    new.id.clone()
                },
            };
            st.containers.insert(new.id, rec.clone());
            Ok(rec)
        })
    }

    fn get_container(&self, id: &str) -> Result<ContainerRecord, RuntimeError> {
        self.with_state(|st| {
            st.containers
                .get(id)
                .cloned()
                .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))
        })
    }

    fn update_labels(&self, id: &str, labels: &Labels) -> Result<(), RuntimeError> {
        self.with_state(|st| {
            let rec = st
                .containers
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))?;
            rec.labels.extend(labels.clone());
            rec.spec.annotations.extend(labels.clone());
            Ok(())
        })
    }

    fn delete_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("delete_container", id);
        self.with_state(|st| {
            if st.tasks.contains_key(id) {
                return Err(RuntimeError::Precondition(format!(
                    "container {id} still has a task"
                )));
            }
            st.containers
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))
        })
    }

    fn image(&self, reference: &str) -> Result<ImageInfo, RuntimeError> {
        let name = normalize_reference(reference);
        self.with_state(|st| {
            st.images
                .get(&name)
                .cloned()
                .ok_or_else(|| RuntimeError::ImageNotFound(name.clone()))
        })
    }

    fn pull(&self, reference: &str) -> Result<ImageInfo, RuntimeError> {
        let name = normalize_reference(reference);
        self.record("pull", &name);
        self.with_state(|st| {
            let info = ImageInfo {
                name: name.clone(),
                rootfs: PathBuf::from("/mock/images").join(&name),
                digest: format!(
                    "blake3:{}",
                    blake3::hash(format!("mock-image:{name}").as_bytes()).to_hex()
                ),
                config: ImageConfig::default(),
            };
            st.images.insert(name.clone(), info.clone());
            Ok(info)
        })
    }

    fn fetch(&self, reference: &str) -> Result<(), RuntimeError> {
        self.pull(reference).map(|_| ())
    }

    fn images(&self) -> Result<Vec<ImageInfo>, RuntimeError> {
        self.with_state(|st| Ok(st.images.values().cloned().collect()))
    }

    fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let name = normalize_reference(reference);
        self.with_state(|st| {
            st.images
                .remove(&name)
                .map(|_| ())
                .ok_or_else(|| RuntimeError::ImageNotFound(name.clone()))
        })
    }

    fn task_status(&self, id: &str) -> Result<TaskInfo, RuntimeError> {
        self.with_state(|st| {
            st.tasks
                .get(id)
                .map(|t| TaskInfo {
                    status: t.status,
                    pid: Some(t.pid),
                    exit_code: t.exit_code,
                })
                .ok_or_else(|| RuntimeError::NotFound(format!("task {id}")))
        })
    }

    fn start_task(&self, id: &str, _io: &TaskIo) -> Result<u32, RuntimeError> {
        self.record("start_task", id);
        {
            let mut failures = self.start_failures.lock().map_err(|e| poisoned(&e))?;
            if *failures > 0 {
                *failures -= 1;
                return Err(RuntimeError::AddrInUse(format!(
                    "failed to start {id}: listen tcp: bind: address already in use"
                )));
            }
        }
        let pid = self.with_state(|st| {
            match st.tasks.get(id) {
                Some(t) if t.status == TaskStatus::Running || t.status == TaskStatus::Paused => {
                    return Err(RuntimeError::AlreadyExists(format!("task {id} is running")));
                }
                _ => {}
            }
            if !st.containers.contains_key(id) {
                return Err(RuntimeError::NotFound(format!("container {id}")));
            }
            st.next_pid = st.next_pid.max(1000) + 1;
            let pid = st.next_pid;
            st.tasks.insert(
                id.to_owned(),
                MockTask {
                    status: TaskStatus::Created,
                    pid,
                    exit_code: None,
                },
            );
            Ok(pid)
        })?;

        let (state, create_runtime, poststop) = self.hooks_for(id)?;
        if let Err(e) = self.run_hooks("createRuntime", &state, &create_runtime) {
            // A failed create tears the task down, and that runs poststop.
            let mut stopped = state.clone();
            "stopped".clone_into(&mut stopped.status);
            if let Err(pe) = self.run_hooks("postStop", &stopped, &poststop) {
                debug!("poststop after failed create: {pe}");
            }
            self.with_state(|st| {
                st.tasks.remove(id);
                Ok(())
            })?;
            return Err(e);
        }

        self.with_state(|st| {
            if let Some(t) = st.tasks.get_mut(id) {
                t.status = TaskStatus::Running;
            }
            Ok(())
        })?;
        debug!("mock task {id} started with pid {pid}");
        Ok(pid)
    }

    fn kill_task(&self, id: &str, signal: i32) -> Result<(), RuntimeError> {
        self.record("kill_task", id);
        self.with_state(|st| {
            let t = st
                .tasks
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotFound(format!("task {id}")))?;
            match t.status {
                TaskStatus::Running | TaskStatus::Paused | TaskStatus::Created => {
                    t.status = TaskStatus::Stopped;
                    t.exit_code = Some(128 + signal);
                    Ok(())
                }
                _ => Err(RuntimeError::Precondition(format!(
                    "task {id} is not running"
                ))),
            }
        })
    }

    fn wait_task(
        &self,
        id: &str,
        _timeout: Option<Duration>,
    ) -> Result<Option<i32>, RuntimeError> {
        self.with_state(|st| {
            let t = st
                .tasks
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotFound(format!("task {id}")))?;
            if t.status != TaskStatus::Stopped {
                t.status = TaskStatus::Stopped;
                t.exit_code = Some(0);
            }
            Ok(t.exit_code)
        })
    }

    fn delete_task(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.record("delete_task", id);
        let (mut state, _, poststop) = self.hooks_for(id)?;
        self.with_state(|st| {
            let t = st
                .tasks
                .get(id)
                .ok_or_else(|| RuntimeError::NotFound(format!("task {id}")))?;
            if matches!(t.status, TaskStatus::Running | TaskStatus::Paused) && !force {
                return Err(RuntimeError::Precondition(format!(
                    "task {id} is {}",
                    t.status
                )));
            }
            st.tasks.remove(id);
            Ok(())
        })?;
        "stopped".clone_into(&mut state.status);
        self.run_hooks("postStop", &state, &poststop)
    }

    fn pause_task(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("pause_task", id);
        self.with_state(|st| {
            let t = st
                .tasks
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotFound(format!("task {id}")))?;
            if t.status != TaskStatus::Running {
                return Err(RuntimeError::Precondition(format!("task {id} is {}", t.status)));
            }
            t.status = TaskStatus::Paused;
            Ok(())
        })
    }

    fn resume_task(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("resume_task", id);
        self.with_state(|st| {
            let t = st
                .tasks
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotFound(format!("task {id}")))?;
            if t.status != TaskStatus::Paused {
                return Err(RuntimeError::Precondition(format!("task {id} is {}", t.status)));
            }
            t.status = TaskStatus::Running;
            Ok(())
        })
    }

    fn exec(&self, id: &str, req: &ExecRequest) -> Result<i32, RuntimeError> {
        self.record("exec", id);
        self.with_state(|st| match st.tasks.get(id) {
            Some(t) if t.status == TaskStatus::Running => Ok(()),
            Some(t) => Err(RuntimeError::Precondition(format!("task {id} is {}", t.status))),
            None => Err(RuntimeError::NotFound(format!("task {id}"))),
        })?;
        debug!("mock exec in {id}: {}", req.args.join(" "));
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::default_spec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_container(id: &str) -> NewContainer {
        NewContainer {
            id: id.to_owned(),
            image: "alpine:latest".to_owned(),
            labels: Labels::new(),
            spec: default_spec(false),
            rootfs_path: None,
        }
    }

    #[test]
    fn task_lifecycle() {
        let sup = MockSupervisor::new();
        sup.create_container(new_container("c1")).unwrap();
        assert!(sup.task_status("c1").unwrap_err().is_not_found());
        sup.start_task("c1", &TaskIo::Null).unwrap();
        assert_eq!(sup.task_status("c1").unwrap().status, TaskStatus::Running);

        sup.pause_task("c1").unwrap();
        assert!(sup.delete_task("c1", false).is_err());
        sup.resume_task("c1").unwrap();

        sup.kill_task("c1", 15).unwrap();
        assert_eq!(sup.wait_task("c1", None).unwrap(), Some(143));
        sup.delete_task("c1", false).unwrap();
        sup.delete_container("c1").unwrap();
        assert!(sup.get_container("c1").unwrap_err().is_not_found());
    }

    #[test]
    fn duplicate_container_rejected() {
        let sup = MockSupervisor::new();
        sup.create_container(new_container("c1")).unwrap();
        assert!(matches!(
            sup.create_container(new_container("c1")),
            Err(RuntimeError::AlreadyExists(_))
        ));
    }

    #[test]
    fn failed_create_hook_runs_poststop() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let sup = MockSupervisor::new().with_hooks(HookMode::Callback(Arc::new(
            move |event: &str, _state: &State| {
                seen.lock().unwrap().push(event.to_owned());
                if event == "createRuntime" {
                    Err("bridge: address in use".to_owned())
                } else {
                    Ok(())
                }
            },
        )));
        sup.create_container(new_container("c1")).unwrap();
        assert!(sup.start_task("c1", &TaskIo::Null).is_err());
        assert_eq!(*events.lock().unwrap(), vec!["createRuntime", "postStop"]);
        assert!(sup.task_status("c1").unwrap_err().is_not_found());
    }

    #[test]
    fn hooks_see_annotations() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sup = MockSupervisor::new().with_hooks(HookMode::Callback(Arc::new(
            move |_: &str, state: &State| {
                assert_eq!(state.annotations.get("k").map(String::as_str), Some("v"));
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )));
        let mut new = new_container("c1");
        new.spec.annotations.insert("k".to_owned(), "v".to_owned());
        sup.create_container(new).unwrap();
        sup.start_task("c1", &TaskIo::Null).unwrap();
        sup.kill_task("c1", 9).unwrap();
        sup.delete_task("c1", false).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn persistent_state_survives_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mock.json");
        {
            let sup = MockSupervisor::persistent(&path).with_hooks(HookMode::Skip);
            sup.pull("alpine").unwrap();
            sup.create_container(new_container("c1")).unwrap();
            sup.start_task("c1", &TaskIo::Null).unwrap();
        }
        let sup = MockSupervisor::persistent(&path).with_hooks(HookMode::Skip);
        assert_eq!(sup.task_status("c1").unwrap().status, TaskStatus::Running);
        assert_eq!(sup.image("docker.io/library/alpine:latest").unwrap().name, "alpine:latest");
    }

    #[test]
    fn injected_start_failure() {
        let sup = MockSupervisor::new();
        sup.create_container(new_container("c1")).unwrap();
        sup.fail_next_starts(1);
        assert!(matches!(
            sup.start_task("c1", &TaskIo::Null),
            Err(RuntimeError::AddrInUse(_))
        ));
        sup.start_task("c1", &TaskIo::Null).unwrap();
    }
}
