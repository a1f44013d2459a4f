use super::{
    colorize_state, container_exit_code, json_pretty, port, ps, short_id, spin_fail, spin_ok,
    spinner, timeout_arg, GlobalArgs, OutputFormat, EXIT_SUCCESS,
};
use berth_core::compose::{
    Composer, DownOptions, LogStyle, ProcessRunner, Recreate, RunServiceOptions, UpOptions,
};
use berth_core::logs::LogOptions;
use berth_core::Engine;
use berth_runtime::ExecRequest;
use berth_schema::compose::LoadOptions;
use berth_schema::{BerthConfig, Project};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Args)]
pub struct ComposeArgs {
    /// Compose file; repeat to merge several, later ones win.
    #[arg(short, long = "file", value_name = "FILE")]
    pub file: Vec<PathBuf>,
    /// Project name [env: COMPOSE_PROJECT_NAME].
    #[arg(short, long)]
    pub project_name: Option<String>,
    /// Base directory for relative paths; defaults to the first file's directory.
    #[arg(long, value_name = "DIR")]
    pub project_directory: Option<PathBuf>,
    #[command(subcommand)]
    pub command: ComposeCommand,
}

#[derive(Debug, Subcommand)]
pub enum ComposeCommand {
    /// Create and start containers in dependency order.
    Up {
        #[arg(short, long)]
        detach: bool,
        /// Build images before starting.
        #[arg(long, conflicts_with = "no_build")]
        build: bool,
        #[arg(long)]
        no_build: bool,
        /// Recreate containers even if they exist.
        #[arg(long, conflicts_with = "no_recreate")]
        force_recreate: bool,
        /// Keep existing containers.
        #[arg(long)]
        no_recreate: bool,
        /// Remove containers of services no longer in the project.
        #[arg(long)]
        remove_orphans: bool,
        /// Replica count per service, as SERVICE=N.
        #[arg(long, value_name = "SERVICE=N")]
        scale: Vec<String>,
        #[arg(long)]
        no_color: bool,
        #[arg(long)]
        no_log_prefix: bool,
        services: Vec<String>,
    },
    /// Stop and remove containers, then the project networks.
    Down {
        #[arg(long)]
        remove_orphans: bool,
        /// Also remove named volumes declared by the project.
        #[arg(short, long)]
        volumes: bool,
    },
    /// Stop services.
    Stop {
        /// Seconds to wait before killing.
        #[arg(short, long)]
        timeout: Option<u64>,
        services: Vec<String>,
    },
    /// Restart services.
    Restart {
        #[arg(short, long)]
        timeout: Option<u64>,
        services: Vec<String>,
    },
    /// Send a signal to service containers.
    Kill {
        #[arg(short, long, default_value = "SIGKILL")]
        signal: String,
        services: Vec<String>,
    },
    Pause {
        services: Vec<String>,
    },
    Unpause {
        services: Vec<String>,
    },
    /// Run a command in a running service container.
    Exec {
        #[arg(short, long)]
        detach: bool,
        /// Disable pseudo-TTY allocation.
        #[arg(short = 'T', long = "no-TTY")]
        no_tty: bool,
        /// Replica to run in (1-based).
        #[arg(long, default_value_t = 1)]
        index: u32,
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long)]
        workdir: Option<String>,
        #[arg(short, long)]
        env: Vec<String>,
        service: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run a one-off command on a service.
    Run {
        #[arg(short, long)]
        detach: bool,
        #[arg(long)]
        rm: bool,
        #[arg(long)]
        name: Option<String>,
        /// Do not start linked services.
        #[arg(long)]
        no_deps: bool,
        #[arg(short, long)]
        publish: Vec<String>,
        /// Publish the ports declared by the service.
        #[arg(long)]
        service_ports: bool,
        #[arg(short, long)]
        env: Vec<String>,
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long)]
        workdir: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        entrypoint: Option<String>,
        #[arg(short, long)]
        volume: Vec<String>,
        #[arg(short = 'T', long = "no-TTY")]
        no_tty: bool,
        #[arg(short, long)]
        interactive: bool,
        service: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// List containers of the project.
    Ps {
        #[arg(short, long)]
        all: bool,
        #[arg(short, long)]
        quiet: bool,
        /// Print service names instead.
        #[arg(long)]
        services: bool,
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
        #[arg(value_name = "SERVICE")]
        names: Vec<String>,
    },
    /// Show output of service containers.
    Logs {
        #[arg(short, long)]
        follow: bool,
        /// Number of lines to show from the end of each log.
        #[arg(short = 'n', long)]
        tail: Option<usize>,
        #[arg(short, long)]
        timestamps: bool,
        #[arg(long)]
        no_color: bool,
        #[arg(long)]
        no_log_prefix: bool,
        services: Vec<String>,
    },
    /// Print the host binding of a service port.
    Port {
        #[arg(long, default_value_t = 1)]
        index: u32,
        #[arg(long, default_value = "tcp")]
        protocol: String,
        service: String,
        private_port: u16,
    },
    /// Print the normalized project.
    Config {
        /// Only print service names.
        #[arg(long)]
        services: bool,
        /// Only validate.
        #[arg(short, long)]
        quiet: bool,
    },
    /// Pull service images.
    Pull {
        services: Vec<String>,
    },
    /// Build service images.
    Build {
        services: Vec<String>,
    },
    /// Build and push service images.
    Push {
        services: Vec<String>,
    },
}

impl ComposeCommand {
    /// Whether the command creates containers.
    pub fn creates_containers(&self) -> bool {
        matches!(self, Self::Up { .. } | Self::Run { .. })
    }
}

fn load_project(args: &ComposeArgs) -> Result<Project, String> {
    let cwd = std::env::current_dir().map_err(|e| format!("failed to get current directory: {e}"))?;
    let project = LoadOptions {
        files: args.file.clone(),
        project_dir: args.project_directory.clone(),
        project_name: args.project_name.clone(),
        environment: std::env::vars().collect(),
        cwd,
    }
    .load()
    .map_err(|e| e.to_string())?;
    for var in &project.unset_variables {
        warn!("the {var} variable is not set; defaulting to a blank string");
    }
    Ok(project)
}

fn scale_arg(raw: &str) -> Result<(&str, u32), String> {
    raw.split_once('=')
        .and_then(|(svc, n)| Some((svc, n.parse().ok()?)))
        .filter(|(svc, _)| !svc.is_empty())
        .ok_or_else(|| format!("invalid argument: invalid --scale '{raw}' (expected SERVICE=N)"))
}

fn style(no_color: bool, no_log_prefix: bool) -> LogStyle {
    LogStyle {
        no_color,
        no_log_prefix,
    }
}

fn print_line(line: &str) {
    println!("{line}");
}

fn one_off_flags(
    env: &[String],
    user: Option<&String>,
    workdir: Option<&String>,
    entrypoint: Option<&String>,
    volume: &[String],
    tty: bool,
    interactive: bool,
) -> Vec<String> {
    let mut flags: Vec<String> = env.iter().map(|e| format!("--env={e}")).collect();
    flags.extend(user.map(|u| format!("--user={u}")));
    flags.extend(workdir.map(|w| format!("--workdir={w}")));
    flags.extend(entrypoint.map(|e| format!("--entrypoint={e}")));
    flags.extend(volume.iter().map(|v| format!("--volume={v}")));
    if tty {
        flags.push("-t".to_owned());
    }
    if interactive {
        flags.push("-i".to_owned());
    }
    flags
}

pub fn run(
    engine: &Engine,
    global: &GlobalArgs,
    config: &BerthConfig,
    args: ComposeArgs,
) -> Result<u8, String> {
    let mut project = load_project(&args)?;
    let berth = std::env::current_exe().map_err(|e| format!("failed to locate berth: {e}"))?;
    let runner = ProcessRunner {
        berth,
        global_args: global.child_args(config),
        builder: config.builder.clone(),
    };
    let e = |err: berth_core::CoreError| err.to_string();

    if let ComposeCommand::Up { scale, .. } = &args.command {
        for raw in scale {
            let (svc, n) = scale_arg(raw)?;
            project.set_scale(svc, n).map_err(|err| err.to_string())?;
        }
    }
    if let ComposeCommand::Config { services, quiet } = &args.command {
        if *services {
            for name in project.service_names() {
                println!("{name}");
            }
        } else if !quiet {
            print!("{}", project.to_yaml().map_err(|err| err.to_string())?);
        }
        return Ok(EXIT_SUCCESS);
    }

    let composer = Composer::new(engine, project, &runner);
    match args.command {
        ComposeCommand::Up {
            detach,
            build,
            no_build,
            force_recreate: _,
            no_recreate,
            remove_orphans,
            scale: _,
            no_color,
            no_log_prefix,
            services,
        } => {
            composer
                .up(&UpOptions {
                    services,
                    detach,
                    build,
                    no_build,
                    recreate: if no_recreate {
                        Recreate::Never
                    } else {
                        Recreate::Always
                    },
                    remove_orphans,
                    style: style(no_color, no_log_prefix),
                })
                .map_err(e)?;
        }
        ComposeCommand::Down {
            remove_orphans,
            volumes,
        } => composer
            .down(DownOptions {
                remove_orphans,
                volumes,
            })
            .map_err(e)?,
        ComposeCommand::Stop { timeout, services } => {
            composer.stop(&services, timeout_arg(timeout)).map_err(e)?;
        }
        ComposeCommand::Restart { timeout, services } => {
            composer.restart(&services, timeout_arg(timeout)).map_err(e)?;
        }
        ComposeCommand::Kill { signal, services } => composer.kill(&services, &signal).map_err(e)?,
        ComposeCommand::Pause { services } => composer.pause(&services).map_err(e)?,
        ComposeCommand::Unpause { services } => composer.unpause(&services).map_err(e)?,
        ComposeCommand::Exec {
            detach,
            no_tty,
            index,
            user,
            workdir,
            env,
            service,
            command,
        } => {
            let req = ExecRequest {
                args: command,
                env,
                cwd: workdir,
                user,
                tty: !no_tty && !detach,
                interactive: !detach,
                detach,
            };
            let code = composer.exec(&service, index, &req).map_err(e)?;
            return Ok(container_exit_code(code));
        }
        ComposeCommand::Run {
            detach,
            rm,
            name,
            no_deps,
            publish,
            service_ports,
            env,
            user,
            workdir,
            entrypoint,
            volume,
            no_tty,
            interactive,
            service,
            command,
        } => {
            let extra_flags = one_off_flags(
                &env,
                user.as_ref(),
                workdir.as_ref(),
                entrypoint.as_ref(),
                &volume,
                !no_tty && !detach,
                interactive,
            );
            let code = composer
                .run(&RunServiceOptions {
                    service,
                    command: (!command.is_empty()).then_some(command),
                    name,
                    detach,
                    rm,
                    no_deps,
                    publish,
                    service_ports,
                    extra_flags,
                })
                .map_err(e)?;
            return Ok(container_exit_code(code));
        }
        ComposeCommand::Ps {
            all,
            quiet,
            services,
            format,
            names,
        } => {
            let rows = composer.ps(&names, all).map_err(e)?;
            if services {
                let mut seen: Vec<&str> = rows.iter().map(|r| r.service.as_str()).collect();
                seen.dedup();
                for s in seen {
                    println!("{s}");
                }
            } else if quiet {
                for r in &rows {
                    println!("{}", r.summary.id);
                }
            } else if format == OutputFormat::Json {
                println!("{}", json_pretty(&rows)?);
            } else {
                println!("{:<28} {:<14} {:<12} {:<16} PORTS", "NAME", "CONTAINER ID", "SERVICE", "STATUS");
                for r in &rows {
                    println!(
                        "{:<28} {:<14} {:<12} {} {}",
                        r.summary.name,
                        short_id(&r.summary.id),
                        r.service,
                        colorize_state(&format!("{:<16}", r.summary.status)),
                        ps::format_ports(&r.summary.ports)
                    );
                }
            }
        }
        ComposeCommand::Logs {
            follow,
            tail,
            timestamps,
            no_color,
            no_log_prefix,
            services,
        } => {
            let opts = LogOptions {
                follow,
                tail,
                timestamps,
            };
            composer
                .logs(&services, opts, style(no_color, no_log_prefix), &print_line)
                .map_err(e)?;
        }
        ComposeCommand::Port {
            index,
            protocol,
            service,
            private_port,
        } => {
            let ports = composer
                .port(&service, &format!("{private_port}/{protocol}"), index)
                .map_err(e)?;
            for line in port::render(&ports, true) {
                println!("{line}");
            }
        }
        ComposeCommand::Pull { services } => {
            let pb = spinner("pulling service images");
            match composer.pull(&services) {
                Ok(()) => spin_ok(&pb, "pulled service images"),
                Err(err) => {
                    spin_fail(&pb, "pull failed");
                    return Err(err.to_string());
                }
            }
        }
        ComposeCommand::Build { services } => composer.build(&services).map_err(e)?,
        ComposeCommand::Push { services } => composer.push(&services).map_err(e)?,
        ComposeCommand::Config { .. } => {}
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_values() {
        assert_eq!(scale_arg("web=3").unwrap(), ("web", 3));
        assert!(scale_arg("web").unwrap_err().starts_with("invalid argument:"));
        assert!(scale_arg("=2").is_err());
        assert!(scale_arg("web=-1").is_err());
    }

    #[test]
    fn one_off_flags_in_flag_form() {
        let flags = one_off_flags(
            &["A=1".to_owned()],
            Some(&"nobody".to_owned()),
            None,
            Some(&String::new()),
            &["data:/data".to_owned()],
            true,
            false,
        );
        assert_eq!(
            flags,
            vec!["--env=A=1", "--user=nobody", "--entrypoint=", "--volume=data:/data", "-t"]
        );
    }
}
