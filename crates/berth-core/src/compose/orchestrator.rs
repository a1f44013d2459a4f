use super::service::{parse_service, replica_index, ParsedContainer, ParsedService};
use crate::concurrency::{join_all, shutdown_requested, try_join_all};
use crate::logs::LogOptions;
use crate::lookup::container_name;
use crate::runner::ContainerSummary;
use crate::{CoreError, Engine};
use berth_runtime::cni::CreateNetworkOptions;
use berth_runtime::{ContainerRecord, ExecRequest};
use berth_schema::compose::{reverse_dependency_order, ComposeError, MapOrList, Project};
use berth_schema::{labels, Labels, PortMapping, PullMode};
use console::Style;
use serde::Serialize;
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runs `berth` and the image builder as child processes.
///
/// Replicas are created through the same `run` entry point a user would
/// call, so the orchestrator only needs argument lists.
pub trait CommandRunner: Sync {
    /// Run `berth <args>`. With `attach`, the child shares the terminal.
    fn run_berth(&self, args: &[String], attach: bool) -> Result<i32, CoreError>;
    fn run_builder(&self, args: &[String]) -> Result<i32, CoreError>;
}

pub struct ProcessRunner {
    pub berth: PathBuf,
    /// Global flags repeated on every child (`--namespace`, `--data-root`, ...).
    pub global_args: Vec<String>,
    pub builder: String,
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(1, |s| 128 + s))
}

impl CommandRunner for ProcessRunner {
    fn run_berth(&self, args: &[String], attach: bool) -> Result<i32, CoreError> {
        let mut cmd = Command::new(&self.berth);
        cmd.args(&self.global_args).args(args);
        if !attach {
            cmd.stdin(Stdio::null()).stdout(Stdio::null());
        }
        debug!("exec: {} {}", self.berth.display(), args.join(" "));
        let status = cmd.status().map_err(|e| {
            CoreError::Precondition(format!("failed to run {}: {e}", self.berth.display()))
        })?;
        Ok(exit_code(status))
    }

    fn run_builder(&self, args: &[String]) -> Result<i32, CoreError> {
        debug!("exec: {} {}", self.builder, args.join(" "));
        let status = Command::new(&self.builder)
            .args(args)
            .status()
            .map_err(|e| CoreError::Precondition(format!("failed to run {}: {e}", self.builder)))?;
        Ok(exit_code(status))
    }
}

/// What `up` does with a container that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Recreate {
    /// Remove it and create a fresh one.
    #[default]
    Always,
    /// Keep it, starting it if needed.
    Never,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogStyle {
    pub no_color: bool,
    pub no_log_prefix: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    pub services: Vec<String>,
    pub detach: bool,
    pub build: bool,
    pub no_build: bool,
    pub recreate: Recreate,
    pub remove_orphans: bool,
    pub style: LogStyle,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DownOptions {
    pub remove_orphans: bool,
    pub volumes: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunServiceOptions {
    pub service: String,
    pub command: Option<Vec<String>>,
    pub name: Option<String>,
    pub detach: bool,
    pub rm: bool,
    pub no_deps: bool,
    pub publish: Vec<String>,
    pub service_ports: bool,
    /// Extra `run` flags, already in `--flag=value` form.
    pub extra_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceContainer {
    pub service: String,
    #[serde(flatten)]
    pub summary: ContainerSummary,
}

const COLORS: &[fn(Style) -> Style] = &[
    Style::cyan,
    Style::yellow,
    Style::green,
    Style::magenta,
    Style::blue,
    Style::red,
];

fn label_pairs(list: &MapOrList) -> Labels {
    list.to_pairs('=')
        .into_iter()
        .map(|(k, v)| (k, v.unwrap_or_default()))
        .collect()
}

/// First error of a fan-out, with the rest logged.
fn first_error(results: Vec<Result<(), CoreError>>) -> Result<(), CoreError> {
    let mut first = None;
    for r in results {
        if let Err(e) = r {
            if first.is_none() {
                first = Some(e);
            } else {
                warn!("{e}");
            }
        }
    }
    first.map_or(Ok(()), Err)
}

/// A loaded project bound to an engine.
pub struct Composer<'a> {
    engine: &'a Engine,
    project: Project,
    runner: &'a dyn CommandRunner,
}

impl<'a> Composer<'a> {
    pub fn new(engine: &'a Engine, project: Project, runner: &'a dyn CommandRunner) -> Self {
        Self {
            engine,
            project,
            runner,
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// The project narrowed to `services`; all of it when empty.
    fn selected(&self, services: &[String], with_deps: bool) -> Result<Project, CoreError> {
        let mut p = self.project.clone();
        p.select_services(services, with_deps)?;
        Ok(p)
    }

    fn project_containers(&self) -> Result<Vec<ContainerRecord>, CoreError> {
        Ok(self
            .engine
            .containers()?
            .into_iter()
            .filter(|r| r.labels.get(labels::COMPOSE_PROJECT) == Some(&self.project.name))
            .collect())
    }

    /// Containers of one service, in replica order.
    fn service_containers(&self, service: &str) -> Result<Vec<ContainerRecord>, CoreError> {
        let mut out: Vec<ContainerRecord> = self
            .project_containers()?
            .into_iter()
            .filter(|r| r.labels.get(labels::COMPOSE_SERVICE).map(String::as_str) == Some(service))
            .collect();
        out.sort_by_key(|r| replica_index(container_name(r)).unwrap_or(0));
        Ok(out)
    }

    /// Containers of the named services in dependency order.
    pub fn containers(&self, services: &[String]) -> Result<Vec<ContainerRecord>, CoreError> {
        let p = self.selected(services, false)?;
        let mut out = Vec::new();
        for svc in p.services_in_order()? {
            out.extend(self.service_containers(&svc.name)?);
        }
        Ok(out)
    }

    fn orphans(&self) -> Result<Vec<ContainerRecord>, CoreError> {
        let known = self.project.service_names();
        Ok(self
            .project_containers()?
            .into_iter()
            .filter(|r| {
                r.labels
                    .get(labels::COMPOSE_SERVICE)
                    .is_none_or(|s| !known.contains(s))
            })
            .collect())
    }

    fn handle_orphans(&self, remove: bool) -> Result<(), CoreError> {
        let orphans = self.orphans()?;
        if orphans.is_empty() {
            return Ok(());
        }
        if !remove {
            let names: Vec<&str> = orphans.iter().map(container_name).collect();
            warn!(
                "found orphan containers ({}) for this project; rerun with --remove-orphans to clean them up",
                names.join(", ")
            );
            return Ok(());
        }
        for rec in &orphans {
            info!("removing orphan container {}", container_name(rec));
            self.engine.remove_record(rec, true, false)?;
        }
        Ok(())
    }

    fn ensure_networks(&self) -> Result<(), CoreError> {
        for (key, cfg) in &self.project.networks {
            let full = self.project.network_full_name(key);
            if cfg.is_external() {
                self.engine.inspect_network(&full).map_err(|_| {
                    CoreError::Precondition(format!("external network {full} not found"))
                })?;
                continue;
            }
            if self.engine.inspect_network(&full).is_ok() {
                debug!("network {full} exists");
                continue;
            }
            let mut net_labels = label_pairs(&cfg.labels);
            net_labels.insert(labels::COMPOSE_PROJECT.to_owned(), self.project.name.clone());
            net_labels.insert(labels::COMPOSE_NETWORK.to_owned(), key.clone());
            let pool = cfg.ipam.as_ref().and_then(|i| i.config.first());
            self.engine.create_network(&CreateNetworkOptions {
                name: full,
                driver: cfg.driver.clone().unwrap_or_else(|| "bridge".to_owned()),
                subnet: pool.and_then(|p| p.subnet.clone()),
                gateway: pool.and_then(|p| p.gateway.clone()),
                ip_range: pool.and_then(|p| p.ip_range.clone()),
                labels: net_labels,
            })?;
        }
        Ok(())
    }

    fn ensure_volumes(&self) -> Result<(), CoreError> {
        for (key, cfg) in &self.project.volumes {
            let full = self.project.volume_full_name(key);
            if cfg.is_external() {
                self.engine.inspect_volume(&full).map_err(|_| {
                    CoreError::Precondition(format!("external volume {full} not found"))
                })?;
                continue;
            }
            let mut vol_labels = label_pairs(&cfg.labels);
            vol_labels.insert(labels::COMPOSE_PROJECT.to_owned(), self.project.name.clone());
            vol_labels.insert(labels::COMPOSE_VOLUME.to_owned(), key.clone());
            self.engine.create_volume(&full, vol_labels, true)?;
        }
        Ok(())
    }

    fn check_file_objects(&self) -> Result<(), CoreError> {
        let objects = self
            .project
            .secrets
            .iter()
            .map(|(k, v)| ("secret", k, v))
            .chain(self.project.configs.iter().map(|(k, v)| ("config", k, v)));
        for (kind, key, obj) in objects {
            let Some(file) = &obj.file else { continue };
            let path = self.project.working_dir.join(file);
            if !path.exists() {
                return Err(ComposeError::Invalid(format!(
                    "{kind} {key}: file {} does not exist",
                    path.display()
                ))
                .into());
            }
        }
        Ok(())
    }

    fn prepare_resources(&self) -> Result<(), CoreError> {
        self.ensure_networks()?;
        self.ensure_volumes()?;
        self.check_file_objects()
    }

    fn parse(&self, project: &Project) -> Result<Vec<ParsedService>, CoreError> {
        let mut out = Vec::new();
        for svc in project.services_in_order()? {
            out.push(parse_service(&self.project, svc)?);
        }
        Ok(out)
    }

    fn build_args(&self, svc: &ParsedService, push: bool) -> Option<Vec<String>> {
        let b = svc.build.as_ref()?;
        let dockerfile_dir = b
            .dockerfile
            .parent()
            .map_or_else(|| b.context.clone(), std::path::Path::to_path_buf);
        let filename = b
            .dockerfile
            .file_name()
            .map_or_else(|| "Dockerfile".to_owned(), |f| f.to_string_lossy().into_owned());
        let mut args = vec![
            "build".to_owned(),
            "--frontend".to_owned(),
            "dockerfile.v0".to_owned(),
            "--local".to_owned(),
            format!("context={}", b.context.display()),
            "--local".to_owned(),
            format!("dockerfile={}", dockerfile_dir.display()),
            "--opt".to_owned(),
            format!("filename={filename}"),
        ];
        for arg in &b.args {
            args.push("--opt".to_owned());
            args.push(format!("build-arg:{arg}"));
        }
        if let Some(target) = &b.target {
            args.push("--opt".to_owned());
            args.push(format!("target={target}"));
        }
        args.push("--output".to_owned());
        let push = if push { ",push=true" } else { "" };
        args.push(format!("type=image,name={}{push}", svc.image));
        Some(args)
    }

    fn build_service(&self, svc: &ParsedService, push: bool) -> Result<(), CoreError> {
        let Some(args) = self.build_args(svc, push) else {
            return Ok(());
        };
        info!("building {} for service {}", svc.image, svc.name);
        let code = self.runner.run_builder(&args)?;
        if code != 0 {
            return Err(CoreError::Precondition(format!(
                "failed to build service {} (exit status {code})",
                svc.name
            )));
        }
        Ok(())
    }

    fn pull_image(&self, image: &str, mode: PullMode) -> Result<(), CoreError> {
        let sup = self.engine.supervisor();
        match mode {
            PullMode::Always => {
                sup.pull(image)?;
            }
            PullMode::Missing => match sup.image(image) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    info!("pulling {image}");
                    sup.pull(image)?;
                }
                Err(e) => return Err(e.into()),
            },
            PullMode::Never => {}
        }
        Ok(())
    }

    fn ensure_images(&self, parsed: &[ParsedService], build: bool, no_build: bool) -> Result<(), CoreError> {
        for svc in parsed {
            if let Some(b) = &svc.build {
                let present = self.engine.supervisor().image(&svc.image).is_ok();
                if !no_build && (build || b.force || !present) {
                    self.build_service(svc, false)?;
                }
                continue;
            }
            self.pull_image(&svc.image, svc.pull_mode)?;
        }
        Ok(())
    }

    /// Create one replica through `berth run` and return its id.
    fn run_replica(&self, svc: &ParsedService, c: &ParsedContainer) -> Result<String, CoreError> {
        let dir = tempfile::Builder::new().prefix("berth-compose-").tempdir()?;
        let cidfile = dir.path().join("cid");
        let mut args = vec![
            "run".to_owned(),
            format!("--cidfile={}", cidfile.display()),
            format!("--label={}={}", labels::COMPOSE_PROJECT, self.project.name),
            format!("--label={}={}", labels::COMPOSE_SERVICE, svc.name),
        ];
        args.extend(c.run_args.iter().cloned());
        info!("creating container {}", c.name);
        let code = self.runner.run_berth(&args, false)?;
        if code != 0 {
            return Err(CoreError::Precondition(format!(
                "failed to create container {} (exit status {code})",
                c.name
            )));
        }
        let id = std::fs::read_to_string(&cidfile)?.trim().to_owned();
        if id.is_empty() {
            return Err(CoreError::Precondition(format!(
                "no container id recorded for {}",
                c.name
            )));
        }
        Ok(id)
    }

    /// Bring one service to its replica count; returns the ids now running.
    fn up_service(&self, svc: &ParsedService, recreate: Recreate) -> Result<Vec<String>, CoreError> {
        let existing = self.service_containers(&svc.name)?;
        let created = Mutex::new(Vec::new());
        let result = try_join_all(&svc.containers, |c, cancel| {
            cancel.check()?;
            if let Some(rec) = existing.iter().find(|r| container_name(r) == c.name) {
                if recreate == Recreate::Never {
                    info!("container {} exists, not recreating", c.name);
                    if !self.engine.inspect(&rec.id)?.state.running {
                        self.engine.start(&rec.id, false)?;
                    }
                    return Ok(rec.id.clone());
                }
                info!("recreating container {}", c.name);
                self.engine.remove_record(rec, true, false)?;
            }
            let id = self.run_replica(svc, c)?;
            if let Ok(mut ids) = created.lock() {
                ids.push(id.clone());
            }
            Ok(id)
        });
        result.inspect_err(|_| {
            for id in created.into_inner().unwrap_or_default() {
                if let Err(e) = self.engine.remove(&id, true, false) {
                    warn!("cleanup of {id}: {e}");
                }
            }
        })
    }

    pub fn up(&self, opts: &UpOptions) -> Result<(), CoreError> {
        self.prepare_resources()?;
        let selected = self.selected(&opts.services, true)?;
        let parsed = self.parse(&selected)?;
        self.handle_orphans(opts.remove_orphans)?;
        self.ensure_images(&parsed, opts.build, opts.no_build)?;

        let mut started = Vec::new();
        for svc in &parsed {
            started.extend(self.up_service(svc, opts.recreate)?);
        }
        if opts.detach {
            return Ok(());
        }

        let sink = |line: &str| println!("{line}");
        let follow = LogOptions {
            follow: true,
            ..LogOptions::default()
        };
        self.stream_logs(&started, follow, opts.style, &sink)?;
        if shutdown_requested() {
            info!("stopping containers (forcibly)");
        }
        first_error(join_all(&started, |id| self.engine.remove(id, true, false).map(|_| ())))
    }

    /// Services in reverse dependency order, limited to `services` when given.
    fn reverse_order(&self, services: &[String]) -> Result<Vec<String>, CoreError> {
        let order = reverse_dependency_order(&self.project.services)?;
        Ok(order
            .into_iter()
            .filter(|s| services.is_empty() || services.contains(s))
            .collect())
    }

    pub fn down(&self, opts: DownOptions) -> Result<(), CoreError> {
        for service in self.reverse_order(&[])? {
            let containers = self.service_containers(&service)?;
            for r in join_all(&containers, |rec| {
                if let Err(e) = self.engine.stop(&rec.id, None) {
                    debug!("stop {}: {e}", container_name(rec));
                }
                self.engine.remove_record(rec, true, opts.volumes)
            }) {
                if let Err(e) = r {
                    warn!("{e}");
                }
            }
        }
        self.handle_orphans(opts.remove_orphans)?;

        for (key, cfg) in &self.project.networks {
            if cfg.is_external() {
                continue;
            }
            let full = self.project.network_full_name(key);
            if self.engine.inspect_network(&full).is_err() {
                continue;
            }
            match self.engine.remove_network(&full) {
                Ok(_) => info!("removed network {full}"),
                Err(e) => warn!("{e}"),
            }
        }
        if opts.volumes {
            for (key, cfg) in &self.project.volumes {
                if cfg.is_external() {
                    continue;
                }
                let full = self.project.volume_full_name(key);
                match self.engine.remove_volume(&full) {
                    Ok(()) => info!("removed volume {full}"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("{e}"),
                }
            }
        }
        Ok(())
    }

    /// Apply `op` to every container of `services`, one service at a time
    /// in reverse dependency order.
    fn fan_out(
        &self,
        services: &[String],
        op: impl Fn(&ContainerRecord) -> Result<(), CoreError> + Sync,
    ) -> Result<(), CoreError> {
        for s in services {
            self.project.service(s)?;
        }
        let mut results = Vec::new();
        for service in self.reverse_order(services)? {
            let containers = self.service_containers(&service)?;
            results.extend(join_all(&containers, &op));
        }
        first_error(results)
    }

    pub fn stop(&self, services: &[String], timeout: Option<Duration>) -> Result<(), CoreError> {
        self.fan_out(services, |rec| self.engine.stop(&rec.id, timeout).map(|_| ()))
    }

    pub fn restart(&self, services: &[String], timeout: Option<Duration>) -> Result<(), CoreError> {
        self.fan_out(services, |rec| self.engine.restart(&rec.id, timeout).map(|_| ()))
    }

    pub fn kill(&self, services: &[String], signal: &str) -> Result<(), CoreError> {
        self.fan_out(services, |rec| self.engine.kill(&rec.id, signal).map(|_| ()))
    }

    pub fn pause(&self, services: &[String]) -> Result<(), CoreError> {
        self.fan_out(services, |rec| self.engine.pause(&rec.id).map(|_| ()))
    }

    pub fn unpause(&self, services: &[String]) -> Result<(), CoreError> {
        self.fan_out(services, |rec| self.engine.unpause(&rec.id).map(|_| ()))
    }

    /// The replica numbered `index` (1-based) of `service`.
    fn replica(&self, service: &str, index: u32) -> Result<ContainerRecord, CoreError> {
        self.project.service(service)?;
        let mut containers = self.service_containers(service)?;
        let pos = containers
            .iter()
            .position(|r| replica_index(container_name(r)) == Some(index))
            // container_name services have a single, unnumbered replica.
            .or_else(|| (index == 1 && containers.len() == 1).then_some(0));
        match pos {
            Some(i) => Ok(containers.swap_remove(i)),
            None => Err(CoreError::Precondition(format!(
                "service {service} has no container with index {index}"
            ))),
        }
    }

    pub fn exec(&self, service: &str, index: u32, req: &ExecRequest) -> Result<i32, CoreError> {
        let rec = self.replica(service, index)?;
        self.engine.exec(&rec.id, req)
    }

    /// One-off container for `service`; returns the exit status of `berth run`.
    pub fn run(&self, opts: &RunServiceOptions) -> Result<i32, CoreError> {
        let svc = self.project.service(&opts.service)?;
        self.prepare_resources()?;
        if !opts.no_deps {
            let deps = svc.dependencies();
            if !deps.is_empty() {
                self.up(&UpOptions {
                    services: deps,
                    detach: true,
                    recreate: Recreate::Never,
                    ..UpOptions::default()
                })?;
            }
        }
        let parsed = parse_service(&self.project, svc)?;
        self.ensure_images(std::slice::from_ref(&parsed), false, false)?;

        let name = opts.name.clone().unwrap_or_else(|| {
            let id = crate::engine::new_container_id();
            format!("{}_{}_run_{}", self.project.name, svc.name, &id[..12])
        });
        let mut ports = opts.publish.clone();
        if opts.service_ports {
            ports.extend(parsed.ports.iter().cloned());
        }
        let mut args = vec![
            "run".to_owned(),
            format!("--label={}={}", labels::COMPOSE_PROJECT, self.project.name),
            format!("--label={}={}", labels::COMPOSE_SERVICE, svc.name),
        ];
        args.extend(parsed.one_off_args(
            &name,
            opts.command.as_deref(),
            &ports,
            &opts.extra_flags,
            opts.detach,
            opts.rm,
        ));
        self.runner.run_berth(&args, !opts.detach)
    }

    pub fn ps(&self, services: &[String], all: bool) -> Result<Vec<ServiceContainer>, CoreError> {
        let ids: Vec<String> = self.containers(services)?.into_iter().map(|r| r.id).collect();
        let mut by_id: BTreeMap<String, ContainerSummary> = self
            .engine
            .ps(all)?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        Ok(ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .map(|summary| ServiceContainer {
                service: summary
                    .labels
                    .get(labels::COMPOSE_SERVICE)
                    .cloned()
                    .unwrap_or_default(),
                summary,
            })
            .collect())
    }

    fn stream_logs(
        &self,
        ids: &[String],
        opts: LogOptions,
        style: LogStyle,
        sink: &(dyn Fn(&str) + Sync),
    ) -> Result<(), CoreError> {
        let names: Vec<String> = ids
            .iter()
            .map(|id| {
                self.engine
                    .find(id)
                    .map(|r| container_name(&r).to_owned())
                    .unwrap_or_else(|_| id.clone())
            })
            .collect();
        let width = names.iter().map(String::len).max().unwrap_or(0);
        let streams: Vec<(usize, &String)> = ids.iter().enumerate().collect();
        first_error(join_all(&streams, |(i, id)| {
            let prefix = if style.no_log_prefix {
                String::new()
            } else {
                let raw = format!("{:<width$} | ", names[*i]);
                if style.no_color {
                    raw
                } else {
                    COLORS[i % COLORS.len()](Style::new()).apply_to(raw).to_string()
                }
            };
            self.engine.logs(id, opts, &mut |entry| {
                let text = entry.render(opts.timestamps);
                sink(&format!("{prefix}{}", text.trim_end_matches('\n')));
                Ok(())
            })
        }))
    }

    pub fn logs(
        &self,
        services: &[String],
        opts: LogOptions,
        style: LogStyle,
        sink: &(dyn Fn(&str) + Sync),
    ) -> Result<(), CoreError> {
        let ids: Vec<String> = self.containers(services)?.into_iter().map(|r| r.id).collect();
        self.stream_logs(&ids, opts, style, sink)
    }

    /// Host bindings of `port` (`80` or `80/udp`) on replica `index`.
    pub fn port(&self, service: &str, port: &str, index: u32) -> Result<Vec<PortMapping>, CoreError> {
        let rec = self.replica(service, index)?;
        self.engine.port(&rec.id, Some(port))
    }

    pub fn pull(&self, services: &[String]) -> Result<(), CoreError> {
        let parsed = self.parse(&self.selected(services, false)?)?;
        let pulls: Vec<&ParsedService> = parsed.iter().filter(|s| s.build.is_none()).collect();
        try_join_all(&pulls, |svc, cancel| {
            cancel.check()?;
            info!("pulling {} for service {}", svc.image, svc.name);
            self.engine.supervisor().pull(&svc.image)?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn build(&self, services: &[String]) -> Result<(), CoreError> {
        for svc in self.parse(&self.selected(services, false)?)? {
            if svc.build.is_none() {
                debug!("service {} has no build section", svc.name);
                continue;
            }
            self.build_service(&svc, false)?;
        }
        Ok(())
    }

    /// Build and push the images of services with a build section.
    pub fn push(&self, services: &[String]) -> Result<(), CoreError> {
        for svc in self.parse(&self.selected(services, false)?)? {
            if svc.build.is_none() {
                warn!("skipping service {}: image {} is not built by this project", svc.name, svc.image);
                continue;
            }
            self.build_service(&svc, true)?;
        }
        Ok(())
    }
}
