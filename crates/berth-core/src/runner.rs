//! Container operations on top of [`Engine`].
//!
//! `run` builds the spec, reserves the name and hosts file, creates the
//! container and starts its task; every other command looks the container
//! up by reference and drives its task through the supervisor.

use crate::engine::new_container_id;
use crate::logs::{read_logs, LogEntry, LogOptions};
use crate::lookup::container_name;
use crate::signal::parse_signal;
use crate::spec::{self, LogConfig, SpecContext};
use crate::{ignore_not_found, CoreError, Engine};
use berth_runtime::{
    ContainerRecord, ExecRequest, ImageInfo, NewContainer, TaskInfo, TaskIo, TaskStatus,
};
use berth_schema::labels::{self, Labels};
use berth_schema::{OptionsError, PortMapping, PullMode, RunOptions, VerifyMode};
use berth_store::layout::state_files;
use berth_store::LifecycleStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fresh port allocations tried before a bind conflict is reported.
const MAX_START_ATTEMPTS: usize = 3;
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const SIGKILL: i32 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Detached { id: String },
    Exited { id: String, code: i32 },
}

impl RunOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Detached { id } | Self::Exited { id, .. } => id,
        }
    }
}

/// One row of `ps`.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: String,
    pub created: DateTime<Utc>,
    pub status: String,
    pub ports: Vec<PortMapping>,
    pub labels: Labels,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
}

/// `inspect` output.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created: DateTime<Utc>,
    pub state: ContainerState,
    pub hostname: String,
    pub networks: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<String>,
    pub state_dir: PathBuf,
    pub log_path: Option<PathBuf>,
    pub labels: Labels,
    pub spec: berth_runtime::Spec,
}

/// What a new container looks like before its task starts.
struct Prepared {
    id: String,
    name: String,
    labels: Labels,
}

impl Engine {
    /// Pull, verify and return the image a container is created from.
    fn ensure_image(&self, opts: &RunOptions) -> Result<Option<ImageInfo>, CoreError> {
        if opts.rootfs {
            return Ok(None);
        }
        if opts.verify_mode()? == VerifyMode::Cosign {
            verify_with_cosign(opts)?;
        }
        let sup = self.supervisor();
        let image = match opts.pull_mode()? {
            PullMode::Always => sup.pull(&opts.image)?,
            PullMode::Missing => match sup.image(&opts.image) {
                Ok(i) => i,
                Err(e) if e.is_not_found() => {
                    info!("pulling {}", opts.image);
                    sup.pull(&opts.image)?
                }
                Err(e) => return Err(e.into()),
            },
            PullMode::Never => sup.image(&opts.image)?,
        };
        Ok(Some(image))
    }

    /// Create and start a container. Without `detach`, wait for it and
    /// report its exit code.
    pub fn run(&self, opts: &RunOptions) -> Result<RunOutcome, CoreError> {
        if let Some(cidfile) = &opts.cidfile {
            if cidfile.exists() {
                return Err(CoreError::Precondition(format!(
                    "container ID file found, make sure the other container isn't running or delete {}",
                    cidfile.display()
                )));
            }
        }
        if opts.rm && opts.detach {
            warn!("--rm has no effect with --detach; remove the container with `berth rm`");
        }
        self.initialize()?;
        let image = self.ensure_image(opts)?;

        let mut attempt = 1;
        let prepared = loop {
            let prepared = self.prepare(opts, image.as_ref())?;
            let io = if opts.detach {
                self.detached_io(&prepared.id, &prepared.name, &prepared.labels)?
            } else {
                TaskIo::Foreground {
                    tty: opts.tty,
                    stdin: opts.interactive,
                }
            };
            match self.supervisor().start_task(&prepared.id, &io) {
                Ok(pid) => {
                    debug!("container {} started with pid {pid}", prepared.id);
                    break prepared;
                }
                Err(e) => {
                    self.discard(&prepared.id, &prepared.name);
                    if e.is_addr_in_use() && attempt < MAX_START_ATTEMPTS {
                        warn!("start attempt {attempt} failed ({e}); retrying with fresh ports");
                        attempt += 1;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        };

        if let Some(cidfile) = &opts.cidfile {
            std::fs::write(cidfile, &prepared.id)?;
        }
        if opts.detach {
            return Ok(RunOutcome::Detached { id: prepared.id });
        }

        let code = self
            .supervisor()
            .wait_task(&prepared.id, None)?
            .unwrap_or_default();
        if opts.rm {
            self.remove_record(&self.supervisor().get_container(&prepared.id)?, true, true)?;
        } else {
            ignore_not_found(
                self.supervisor()
                    .delete_task(&prepared.id, false)
                    .map_err(CoreError::from),
            )?;
        }
        Ok(RunOutcome::Exited {
            id: prepared.id,
            code,
        })
    }

    /// Build the spec, claim the name and write the state dir files, then
    /// create the container record. Undoes its own work on failure.
    fn prepare(&self, opts: &RunOptions, image: Option<&ImageInfo>) -> Result<Prepared, CoreError> {
        let id = new_container_id();
        let state_dir = self.state_dir(&id);
        let hosts = self.hosts();
        let hosts_path = hosts.hosts_path(&id).map_err(CoreError::HostsStore)?;
        let hook = self.hook_command();
        let volumes = self.volumes();
        let networks = self.networks();
        let allocate = |proto: &str, ip: &str, count: u16, exclude: &BTreeSet<u16>| {
            self.allocate_port(proto, ip, count, exclude)
        };
        let environ = |key: &str| std::env::var(key).ok();
        let ctx = SpecContext {
            id: &id,
            namespace: self.namespace(),
            state_dir: &state_dir,
            hosts_path: &hosts_path,
            rootless: self.options().rootless,
            cgroup: self.cgroup_env(),
            hook: &hook,
            image,
            host_resolv_conf: self.host_resolv_conf(),
            host_gateway: hook.bridge_ip.clone(),
            default_network: berth_schema::DEFAULT_NETWORK_NAME,
            volumes: &volumes,
            networks: &networks,
            containers: self,
            allocate_port: &allocate,
            apparmor_available: self.options().apparmor,
            environ: &environ,
            init_binary: self.options().init_binary.clone(),
            dev_dir: self.options().dev_dir.clone(),
            cwd: std::env::current_dir()?,
            home: std::env::var_os("HOME").map(PathBuf::from),
        };
        let mut built = spec::build(opts, &ctx)?;

        if let Some(holder) = self
            .containers()?
            .into_iter()
            .find(|r| container_name(r) == built.name)
        {
            return Err(CoreError::NameStore(berth_store::StoreError::NameAlreadyUsed {
                name: built.name,
                id: holder.id,
            }));
        }
        self.names()
            .acquire(&built.name, &id)
            .map_err(CoreError::NameStore)?;

        let result = self.create_record(opts, image, &id, &mut built);
        if let Err(e) = result {
            self.discard(&id, &built.name);
            return Err(e);
        }
        info!("created container {id} ({})", built.name);
        Ok(Prepared {
            id,
            name: built.name,
            labels: built.labels,
        })
    }

    fn create_record(
        &self,
        opts: &RunOptions,
        image: Option<&ImageInfo>,
        id: &str,
        built: &mut spec::BuiltSpec,
    ) -> Result<(), CoreError> {
        let state_dir = self.state_dir(id);
        std::fs::create_dir_all(&state_dir)?;
        if let Some(resolv) = &built.resolv_conf {
            std::fs::write(state_dir.join(state_files::RESOLV_CONF), resolv)?;
        }
        std::fs::write(
            state_dir.join(state_files::HOSTNAME),
            format!("{}\n", built.hostname),
        )?;
        if let Some(seed) = &built.hosts_seed {
            self.hosts()
                .alloc_hosts_file(id, seed.as_bytes())
                .map_err(CoreError::HostsStore)?;
        }

        let log = LogConfig::from_labels(&built.labels);
        if let Some(uri) = log_uri(&log, &state_dir, id) {
            built.labels.insert(labels::LOG_URI.to_owned(), uri.clone());
            built.spec.annotations.insert(labels::LOG_URI.to_owned(), uri);
        }

        let rootfs_path = if opts.rootfs {
            Some(std::path::absolute(&opts.image)?)
        } else {
            None
        };
        self.supervisor().create_container(NewContainer {
            id: id.to_owned(),
            image: image.map_or_else(|| opts.image.clone(), |i| i.name.clone()),
            labels: built.labels.clone(),
            spec: built.spec.clone(),
            rootfs_path,
        })?;
        Ok(())
    }

    fn detached_io(&self, id: &str, name: &str, labels: &Labels) -> Result<TaskIo, CoreError> {
        let log = LogConfig::from_labels(labels);
        let exe = self.options().self_exe.to_string_lossy().into_owned();
        let logger = |extra: &[&str]| {
            let mut argv: Vec<String> = vec![exe.clone(), "internal".to_owned(), "logger".to_owned()];
            argv.extend(extra.iter().map(|s| (*s).to_owned()));
            TaskIo::Logger { argv }
        };
        Ok(match log.driver.as_str() {
            "none" => TaskIo::Null,
            "journald" => {
                let tag = log.opts.get("tag").map_or(name, String::as_str);
                logger(&["--driver", "journald", "--tag", tag])
            }
            d if d.starts_with("binary://") => TaskIo::Logger {
                argv: vec![d["binary://".len()..].to_owned(), "--id".to_owned(), id.to_owned()],
            },
            _ => {
                let path = self.state_dir(id).join(state_files::json_log(id));
                let path = path.to_string_lossy();
                logger(&["--driver", "json-file", "--log-path", &path])
            }
        })
    }

    /// Best-effort teardown of a container that never ran.
    fn discard(&self, id: &str, name: &str) {
        let sup = self.supervisor();
        if let Err(e) = sup.delete_task(id, true) {
            if !e.is_not_found() {
                warn!("discard {id}: delete task: {e}");
            }
        }
        if let Err(e) = sup.delete_container(id) {
            if !e.is_not_found() {
                warn!("discard {id}: delete container: {e}");
            }
        }
        self.release_artifacts(id, name);
    }

    /// Name, hosts file and state dir. Each step runs regardless of the others.
    fn release_artifacts(&self, id: &str, name: &str) {
        if !name.is_empty() {
            match self.names().release(name, id) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("release name {name}: {e}"),
            }
        }
        if let Err(e) = self.hosts().delete(id) {
            warn!("delete hosts entry of {id}: {e}");
        }
        match std::fs::remove_dir_all(self.state_dir(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("remove state dir of {id}: {e}"),
        }
    }

    fn task(&self, id: &str) -> Result<Option<TaskInfo>, CoreError> {
        match self.supervisor().task_status(id) {
            Ok(t) => Ok(Some(t)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a container by reference; returns its id.
    pub fn remove(&self, reference: &str, force: bool, volumes: bool) -> Result<String, CoreError> {
        let rec = self.find(reference)?;
        self.remove_record(&rec, force, volumes)?;
        Ok(rec.id)
    }

    pub fn remove_record(
        &self,
        rec: &ContainerRecord,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), CoreError> {
        let id = rec.id.as_str();
        let name = container_name(rec);
        let sup = self.supervisor();
        if let Some(task) = self.task(id)? {
            match task.status {
                TaskStatus::Created | TaskStatus::Stopped | TaskStatus::Unknown => {
                    ignore_not_found(sup.delete_task(id, false).map_err(CoreError::from))?;
                }
                TaskStatus::Paused => {
                    if !force {
                        return Err(CoreError::Precondition(format!(
                            "cannot remove a paused container {name}: unpause and then stop the container before attempting removal or force remove"
                        )));
                    }
                    ignore_not_found(sup.delete_task(id, true).map_err(CoreError::from))?;
                }
                TaskStatus::Running => {
                    if !force {
                        return Err(CoreError::Precondition(format!(
                            "cannot remove a running container {name}: stop the container before attempting removal or force remove"
                        )));
                    }
                    ignore_not_found(sup.kill_task(id, SIGKILL).map_err(CoreError::from))?;
                    ignore_not_found(
                        sup.wait_task(id, Some(DEFAULT_STOP_TIMEOUT))
                            .map(|_| ())
                            .map_err(CoreError::from),
                    )?;
                    ignore_not_found(sup.delete_task(id, true).map_err(CoreError::from))?;
                }
            }
        }
        ignore_not_found(sup.delete_container(id).map_err(CoreError::from))?;
        self.release_artifacts(id, name);

        if remove_volumes {
            let anonymous = labels::decode_list(&rec.labels, labels::ANONYMOUS_VOLUMES)?;
            let store = self.volumes();
            for vol in anonymous {
                match store.remove(&vol) {
                    Ok(()) => debug!("removed anonymous volume {vol}"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("remove volume {vol}: {e}"),
                }
            }
        }
        info!("removed container {id}");
        Ok(())
    }

    /// Start a created or stopped container. With `attach`, wait for it.
    pub fn start(&self, reference: &str, attach: bool) -> Result<Option<i32>, CoreError> {
        let rec = self.find(reference)?;
        let id = rec.id.as_str();
        let sup = self.supervisor();
        match self.task(id)? {
            Some(t) if matches!(t.status, TaskStatus::Running | TaskStatus::Paused) => {
                debug!("container {id} is already {}", t.status);
                return Ok(None);
            }
            Some(_) => {
                ignore_not_found(sup.delete_task(id, false).map_err(CoreError::from))?;
            }
            None => {}
        }
        let io = if attach {
            TaskIo::Foreground {
                tty: rec.spec.process.as_ref().is_some_and(|p| p.terminal),
                stdin: false,
            }
        } else {
            self.detached_io(id, container_name(&rec), &rec.labels)?
        };
        sup.start_task(id, &io)?;
        info!("started container {id}");
        if !attach {
            return Ok(None);
        }
        let code = sup.wait_task(id, None)?.unwrap_or_default();
        ignore_not_found(sup.delete_task(id, false).map_err(CoreError::from))?;
        Ok(Some(code))
    }

    /// Send the stop signal, wait, then SIGKILL. `timeout` overrides the
    /// container's stop-timeout label; a negative label waits forever.
    pub fn stop(&self, reference: &str, timeout: Option<Duration>) -> Result<String, CoreError> {
        let rec = self.find(reference)?;
        let id = rec.id.clone();
        let sup = self.supervisor();
        let Some(task) = self.task(&id)? else {
            return Ok(id);
        };
        match task.status {
            TaskStatus::Running => {}
            TaskStatus::Paused => sup.resume_task(&id)?,
            _ => {
                ignore_not_found(sup.delete_task(&id, false).map_err(CoreError::from))?;
                return Ok(id);
            }
        }

        let signal = parse_signal(
            rec.labels
                .get(labels::STOP_SIGNAL)
                .map_or("SIGTERM", String::as_str),
        )?;
        let wait = match timeout {
            Some(t) => Some(t),
            None => match rec.labels.get(labels::STOP_TIMEOUT) {
                Some(raw) => {
                    let secs: i64 = raw.parse().map_err(|_| {
                        OptionsError::Invalid(format!("invalid stop-timeout label '{raw}'"))
                    })?;
                    u64::try_from(secs).ok().map(Duration::from_secs)
                }
                None => Some(DEFAULT_STOP_TIMEOUT),
            },
        };

        ignore_not_found(sup.kill_task(&id, signal).map_err(CoreError::from))?;
        let exited = match sup.wait_task(&id, wait) {
            Ok(code) => code,
            Err(e) if e.is_not_found() => Some(0),
            Err(e) => return Err(e.into()),
        };
        if exited.is_none() {
            warn!("container {id} did not stop in time; sending SIGKILL");
            ignore_not_found(sup.kill_task(&id, SIGKILL).map_err(CoreError::from))?;
            ignore_not_found(sup.wait_task(&id, None).map(|_| ()).map_err(CoreError::from))?;
        }
        ignore_not_found(sup.delete_task(&id, true).map_err(CoreError::from))?;
        info!("stopped container {id}");
        Ok(id)
    }

    pub fn restart(&self, reference: &str, timeout: Option<Duration>) -> Result<String, CoreError> {
        let id = self.stop(reference, timeout)?;
        self.start(&id, false)?;
        Ok(id)
    }

    pub fn kill(&self, reference: &str, signal: &str) -> Result<String, CoreError> {
        let rec = self.find(reference)?;
        let sig = parse_signal(signal)?;
        match self.task(&rec.id)? {
            Some(t) if matches!(t.status, TaskStatus::Running | TaskStatus::Paused) => {
                self.supervisor().kill_task(&rec.id, sig)?;
                Ok(rec.id)
            }
            _ => Err(CoreError::Precondition(format!(
                "cannot kill container {}: container is not running",
                container_name(&rec)
            ))),
        }
    }

    pub fn pause(&self, reference: &str) -> Result<String, CoreError> {
        let rec = self.find(reference)?;
        self.supervisor().pause_task(&rec.id)?;
        Ok(rec.id)
    }

    pub fn unpause(&self, reference: &str) -> Result<String, CoreError> {
        let rec = self.find(reference)?;
        self.supervisor().resume_task(&rec.id)?;
        Ok(rec.id)
    }

    /// Rename a container: name store, hosts meta and the name label.
    pub fn rename(&self, reference: &str, new_name: &str) -> Result<(), CoreError> {
        if !berth_schema::is_valid_object_name(new_name) {
            return Err(OptionsError::Invalid(format!("invalid container name '{new_name}'")).into());
        }
        let rec = self.find(reference)?;
        let old = container_name(&rec).to_owned();
        if old == new_name {
            return Err(CoreError::Precondition(format!(
                "renaming a container with the same name as its current name: {old}"
            )));
        }
        if let Some(holder) = self
            .containers()?
            .into_iter()
            .find(|r| container_name(r) == new_name)
        {
            return Err(CoreError::NameStore(berth_store::StoreError::NameAlreadyUsed {
                name: new_name.to_owned(),
                id: holder.id,
            }));
        }
        let names = self.names();
        match names.rename(&old, &rec.id, new_name) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => names
                .acquire(new_name, &rec.id)
                .map_err(CoreError::NameStore)?,
            Err(e) => return Err(CoreError::NameStore(e)),
        }
        match self.hosts().update(&rec.id, new_name) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(CoreError::HostsStore(e)),
        }
        let mut updated = rec.labels.clone();
        updated.insert(labels::NAME.to_owned(), new_name.to_owned());
        self.supervisor().update_labels(&rec.id, &updated)?;
        info!("renamed {old} to {new_name}");
        Ok(())
    }

    pub fn exec(&self, reference: &str, req: &ExecRequest) -> Result<i32, CoreError> {
        let rec = self.find(reference)?;
        match self.task(&rec.id)? {
            Some(t) if t.status == TaskStatus::Running => {}
            _ => {
                return Err(CoreError::Precondition(format!(
                    "container {} is not running",
                    container_name(&rec)
                )))
            }
        }
        if req.args.is_empty() {
            return Err(OptionsError::Invalid("exec requires a command".to_owned()).into());
        }
        Ok(self.supervisor().exec(&rec.id, req)?)
    }

    /// Stream the json-file log of a container to `emit`.
    pub fn logs(
        &self,
        reference: &str,
        opts: LogOptions,
        emit: &mut dyn FnMut(&LogEntry) -> io::Result<()>,
    ) -> Result<(), CoreError> {
        let rec = self.find(reference)?;
        let log = LogConfig::from_labels(&rec.labels);
        if log.driver != "json-file" {
            return Err(CoreError::Precondition(format!(
                "logs are only available with the json-file log driver (container uses {})",
                log.driver
            )));
        }
        let path = self.state_dir(&rec.id).join(state_files::json_log(&rec.id));
        let id = rec.id.clone();
        let stopped = || {
            !matches!(
                self.task(&id),
                Ok(Some(TaskInfo {
                    status: TaskStatus::Running | TaskStatus::Paused | TaskStatus::Created,
                    ..
                }))
            )
        };
        read_logs(&path, opts, &stopped, emit)
    }

    fn state_of(&self, rec: &ContainerRecord) -> Result<ContainerState, CoreError> {
        let started_at = LifecycleStore::new(self.state_dir(&rec.id))
            .load()
            .map(|l| l.started_at)
            .unwrap_or_default();
        Ok(match self.task(&rec.id)? {
            Some(t) => ContainerState {
                status: match (t.status, t.exit_code) {
                    (TaskStatus::Stopped, Some(code)) => format!("exited ({code})"),
                    (TaskStatus::Stopped, None) => "exited".to_owned(),
                    (s, _) => s.to_string(),
                },
                running: t.status == TaskStatus::Running,
                paused: t.status == TaskStatus::Paused,
                pid: t.pid.filter(|_| t.status != TaskStatus::Stopped),
                exit_code: t.exit_code,
                started_at,
            },
            None => ContainerState {
                status: if started_at.is_some() { "exited" } else { "created" }.to_owned(),
                running: false,
                paused: false,
                pid: None,
                exit_code: None,
                started_at,
            },
        })
    }

    fn summary(&self, rec: &ContainerRecord) -> Result<ContainerSummary, CoreError> {
        let state = self.state_of(rec)?;
        let command = rec
            .spec
            .process
            .as_ref()
            .map(|p| p.args.join(" "))
            .unwrap_or_default();
        Ok(ContainerSummary {
            id: rec.id.clone(),
            name: container_name(rec).to_owned(),
            image: rec.image.clone(),
            command,
            created: rec.created_at,
            status: state.status,
            ports: labels::decode_ports(&rec.labels)?,
            labels: rec.labels.clone(),
        })
    }

    /// Containers of this namespace; only running ones unless `all`.
    pub fn ps(&self, all: bool) -> Result<Vec<ContainerSummary>, CoreError> {
        let mut out = Vec::new();
        for rec in self.containers()? {
            let summary = self.summary(&rec)?;
            if all || summary.status == "running" {
                out.push(summary);
            }
        }
        Ok(out)
    }

    pub fn inspect(&self, reference: &str) -> Result<ContainerDetails, CoreError> {
        let rec = self.find(reference)?;
        let state_dir = self.state_dir(&rec.id);
        let log_path = (LogConfig::from_labels(&rec.labels).driver == "json-file")
            .then(|| state_dir.join(state_files::json_log(&rec.id)));
        Ok(ContainerDetails {
            state: self.state_of(&rec)?,
            name: container_name(&rec).to_owned(),
            hostname: rec.labels.get(labels::HOSTNAME).cloned().unwrap_or_default(),
            networks: labels::decode_list(&rec.labels, labels::NETWORKS)?,
            ports: labels::decode_ports(&rec.labels)?,
            mounts: labels::decode_list(&rec.labels, labels::MOUNTS)?,
            id: rec.id,
            image: rec.image,
            created: rec.created_at,
            state_dir,
            log_path,
            labels: rec.labels,
            spec: rec.spec,
        })
    }

    /// Published ports, optionally narrowed to `80` or `80/tcp`.
    pub fn port(&self, reference: &str, filter: Option<&str>) -> Result<Vec<PortMapping>, CoreError> {
        let rec = self.find(reference)?;
        let ports = labels::decode_ports(&rec.labels)?;
        let Some(filter) = filter else {
            return Ok(ports);
        };
        let (port, proto) = filter.split_once('/').unwrap_or((filter, "tcp"));
        let port: u16 = port
            .parse()
            .map_err(|_| OptionsError::InvalidPort(format!("invalid port '{filter}'")))?;
        let matched: Vec<PortMapping> = ports
            .into_iter()
            .filter(|p| p.container_port == port && p.protocol == proto)
            .collect();
        if matched.is_empty() {
            return Err(CoreError::Precondition(format!(
                "no public port '{port}/{proto}' published for {}",
                container_name(&rec)
            )));
        }
        Ok(matched)
    }
}

fn log_uri(log: &LogConfig, state_dir: &std::path::Path, id: &str) -> Option<String> {
    match log.driver.as_str() {
        "json-file" => Some(format!(
            "file://{}",
            state_dir.join(state_files::json_log(id)).display()
        )),
        d if d.starts_with("binary://") => Some(d.to_owned()),
        _ => None,
    }
}

fn verify_with_cosign(opts: &RunOptions) -> Result<(), CoreError> {
    let mut cmd = Command::new("cosign");
    cmd.arg("verify");
    match &opts.cosign_key {
        Some(key) => {
            cmd.args(["--key", key]);
        }
        None => {
            let identity = [
                ("--certificate-identity", &opts.cosign_certificate_identity),
                (
                    "--certificate-identity-regexp",
                    &opts.cosign_certificate_identity_regexp,
                ),
                ("--certificate-oidc-issuer", &opts.cosign_certificate_oidc_issuer),
                (
                    "--certificate-oidc-issuer-regexp",
                    &opts.cosign_certificate_oidc_issuer_regexp,
                ),
            ];
            let mut any = false;
            for (flag, value) in identity {
                if let Some(v) = value {
                    cmd.args([flag, v.as_str()]);
                    any = true;
                }
            }
            if !any {
                return Err(OptionsError::Invalid(
                    "keyless cosign verification needs a certificate identity and OIDC issuer"
                        .to_owned(),
                )
                .into());
            }
        }
    }
    cmd.arg(&opts.image);
    debug!("verifying {} with cosign", opts.image);
    let output = cmd
        .output()
        .map_err(|e| CoreError::Precondition(format!("failed to run cosign: {e}")))?;
    if !output.status.success() {
        return Err(CoreError::Precondition(format!(
            "cosign could not verify {}: {}",
            opts.image,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineOptions;
    use berth_runtime::{MockSupervisor, Supervisor};
    use berth_schema::config::HostFacts;
    use berth_schema::BerthConfig;
    use std::path::Path;
    use std::sync::Arc;

    fn engine(dir: &Path) -> (Engine, Arc<MockSupervisor>) {
        let mut config = BerthConfig::defaults(&HostFacts::default());
        config.data_root = dir.join("root");
        config.cni_netconfpath = dir.join("net.d");
        let mut opts = EngineOptions::new(config);
        opts.proc_root = dir.join("proc");
        opts.host_resolv_conf = dir.join("resolv.conf");
        let sup = Arc::new(MockSupervisor::new());
        (Engine::with_supervisor(opts, sup.clone()), sup)
    }

    fn run_opts(name: &str) -> RunOptions {
        RunOptions {
            image: "alpine".to_owned(),
            name: Some(name.to_owned()),
            detach: true,
            ..RunOptions::default()
        }
    }

    #[test]
    fn detached_run_creates_state() {
        let dir = tempfile::tempdir().unwrap();
        let (e, sup) = engine(dir.path());
        let out = e.run(&run_opts("web")).unwrap();
        let id = out.id().to_owned();
        assert!(matches!(out, RunOutcome::Detached { .. }));
        assert_eq!(e.names().get("web").unwrap().as_deref(), Some(id.as_str()));
        assert!(e.state_dir(&id).join("resolv.conf").exists());
        assert_eq!(
            std::fs::read_to_string(e.state_dir(&id).join("hostname")).unwrap(),
            format!("{}\n", &id[..12])
        );
        assert!(e.hosts().hosts_path(&id).unwrap().exists());
        assert!(sup.calls().iter().any(|c| c.starts_with("pull:")));
        let rec = sup.get_container(&id).unwrap();
        assert!(rec.labels[labels::LOG_URI].ends_with(&format!("{id}-json.log")));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _) = engine(dir.path());
        e.run(&run_opts("web")).unwrap();
        let err = e.run(&run_opts("web")).unwrap_err();
        assert!(err.to_string().contains("already used"), "{err}");
        assert_eq!(e.ps(true).unwrap().len(), 1);
    }

    #[test]
    fn address_in_use_retries_with_a_new_container() {
        let dir = tempfile::tempdir().unwrap();
        let (e, sup) = engine(dir.path());
        sup.fail_next_starts(2);
        let id = e.run(&run_opts("web")).unwrap().id().to_owned();
        let all = e.ps(true).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
        let starts = sup.calls().iter().filter(|c| c.starts_with("start_task:")).count();
        assert_eq!(starts, 3);
    }

    #[test]
    fn address_in_use_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let (e, sup) = engine(dir.path());
        sup.fail_next_starts(MAX_START_ATTEMPTS);
        let err = e.run(&run_opts("web")).unwrap_err();
        assert!(err.is_addr_in_use());
        assert!(e.ps(true).unwrap().is_empty());
        assert_eq!(e.names().get("web").unwrap(), None);
    }

    #[test]
    fn running_container_needs_force() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _) = engine(dir.path());
        let id = e.run(&run_opts("web")).unwrap().id().to_owned();
        let err = e.remove("web", false, false).unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
        assert_eq!(e.ps(false).unwrap().len(), 1);

        e.remove("web", true, true).unwrap();
        assert!(e.ps(true).unwrap().is_empty());
        assert_eq!(e.names().get("web").unwrap(), None);
        assert!(!e.state_dir(&id).exists());
    }

    #[test]
    fn paused_container_needs_force() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _) = engine(dir.path());
        e.run(&run_opts("web")).unwrap();
        e.pause("web").unwrap();
        let err = e.remove("web", false, false).unwrap_err();
        assert!(err.to_string().contains("paused"));
        e.remove("web", true, false).unwrap();
    }

    #[test]
    fn stop_then_start() {
        let dir = tempfile::tempdir().unwrap();
        let (e, sup) = engine(dir.path());
        let id = e.run(&run_opts("web")).unwrap().id().to_owned();
        e.stop("web", Some(Duration::from_secs(1))).unwrap();
        assert!(matches!(sup.task_status(&id), Err(ref err) if err.is_not_found()));
        assert_eq!(e.ps(false).unwrap().len(), 0);
        e.start("web", false).unwrap();
        assert_eq!(e.ps(false).unwrap()[0].status, "running");
        let kills = sup.calls().iter().filter(|c| c.starts_with("kill_task:")).count();
        assert_eq!(kills, 1);
    }

    #[test]
    fn foreground_run_reports_exit_and_honors_rm() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _) = engine(dir.path());
        let opts = RunOptions {
            detach: false,
            rm: true,
            ..run_opts("once")
        };
        let out = e.run(&opts).unwrap();
        assert!(matches!(out, RunOutcome::Exited { code: 0, .. }));
        assert!(e.ps(true).unwrap().is_empty());
    }

    #[test]
    fn cidfile_is_written_and_guards_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _) = engine(dir.path());
        let cidfile = dir.path().join("cid");
        let opts = RunOptions {
            cidfile: Some(cidfile.clone()),
            ..run_opts("web")
        };
        let id = e.run(&opts).unwrap().id().to_owned();
        assert_eq!(std::fs::read_to_string(&cidfile).unwrap(), id);
        let again = RunOptions {
            name: Some("other".to_owned()),
            ..opts
        };
        assert!(matches!(e.run(&again), Err(CoreError::Precondition(_))));
    }

    #[test]
    fn rename_moves_name_and_label() {
        let dir = tempfile::tempdir().unwrap();
        let (e, sup) = engine(dir.path());
        let id = e.run(&run_opts("web")).unwrap().id().to_owned();
        e.rename("web", "api").unwrap();
        assert_eq!(e.names().get("web").unwrap(), None);
        assert_eq!(e.names().get("api").unwrap().as_deref(), Some(id.as_str()));
        assert_eq!(sup.get_container(&id).unwrap().labels[labels::NAME], "api");
        assert_eq!(e.find("api").unwrap().id, id);
    }

    #[test]
    fn kill_requires_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _) = engine(dir.path());
        e.run(&run_opts("web")).unwrap();
        e.kill("web", "SIGKILL").unwrap();
        assert!(e.ps(true).unwrap()[0].status.starts_with("exited (137)"));
        assert!(matches!(e.kill("web", "KILL"), Err(CoreError::Precondition(_))));
    }

    #[test]
    fn port_filter() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _) = engine(dir.path());
        let opts = RunOptions {
            publish: vec!["127.0.0.1:8080:80".to_owned(), "9090:90/udp".to_owned()],
            ..run_opts("web")
        };
        e.run(&opts).unwrap();
        assert_eq!(e.port("web", None).unwrap().len(), 2);
        let tcp = e.port("web", Some("80")).unwrap();
        assert_eq!(tcp[0].host_port, 8080);
        assert_eq!(e.port("web", Some("90/udp")).unwrap()[0].host_port, 9090);
        assert!(e.port("web", Some("91")).is_err());
    }

    #[test]
    fn published_ports_without_host_get_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _) = engine(dir.path());
        let opts = RunOptions {
            publish: vec!["80".to_owned(), "443".to_owned()],
            ..run_opts("web")
        };
        e.run(&opts).unwrap();
        let http = e.port("web", Some("80")).unwrap()[0].host_port;
        let https = e.port("web", Some("443")).unwrap()[0].host_port;
        assert_ne!(http, https);
        assert!(http >= berth_runtime::portalloc::PORT_RANGE_START);
    }

    #[test]
    fn inspect_reports_state() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _) = engine(dir.path());
        let id = e.run(&run_opts("web")).unwrap().id().to_owned();
        let d = e.inspect(&id[..8]).unwrap();
        assert_eq!(d.name, "web");
        assert!(d.state.running);
        assert_eq!(d.networks, vec!["bridge"]);
        assert!(d.log_path.is_some());
    }
}
