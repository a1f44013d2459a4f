mod commands;

use berth_core::install_signal_handler;
use berth_core::logs::LogOptions;
use berth_runtime::rootless;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::compose::ComposeArgs;
use commands::exec::ExecArgs;
use commands::internal::InternalCommand;
use commands::network::NetworkCommand;
use commands::run::RunArgs;
use commands::volume::VolumeCommand;
use commands::{exit_code_for, GlobalArgs, OutputFormat, EXIT_FAILURE};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "berth",
    version,
    about = "Docker-compatible container engine front-end for Linux"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create and run a container from an image.
    #[command(args_override_self = true)]
    Run(RunArgs),
    /// Start stopped containers.
    Start {
        /// Attach to the output and wait for exit.
        #[arg(short, long)]
        attach: bool,
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Stop running containers.
    Stop {
        /// Seconds to wait before killing; defaults to the container's stop timeout.
        #[arg(short = 't', long = "time")]
        time: Option<u64>,
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Restart containers.
    Restart {
        #[arg(short = 't', long = "time")]
        time: Option<u64>,
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Send a signal to running containers.
    Kill {
        #[arg(short, long, default_value = "SIGKILL")]
        signal: String,
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Freeze all processes of containers.
    Pause {
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Thaw paused containers.
    Unpause {
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Remove containers.
    #[command(visible_alias = "remove")]
    Rm {
        /// Kill running containers first.
        #[arg(short, long)]
        force: bool,
        /// Also remove anonymous volumes.
        #[arg(short, long)]
        volumes: bool,
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// Rename a container.
    Rename { container: String, new_name: String },
    /// Run a command in a running container.
    Exec(ExecArgs),
    /// Fetch the output of a container.
    Logs {
        #[arg(short, long)]
        follow: bool,
        /// Number of lines to show from the end of the log.
        #[arg(short = 'n', long)]
        tail: Option<usize>,
        #[arg(short, long)]
        timestamps: bool,
        container: String,
    },
    /// Show container details as JSON.
    Inspect {
        #[arg(required = true)]
        containers: Vec<String>,
    },
    /// List containers.
    #[command(visible_alias = "ls")]
    Ps {
        /// Include stopped containers.
        #[arg(short, long)]
        all: bool,
        /// Only print IDs.
        #[arg(short, long)]
        quiet: bool,
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
        #[arg(long)]
        no_trunc: bool,
    },
    /// List port mappings of a container.
    Port {
        container: String,
        /// PORT or PORT/PROTO.
        port: Option<String>,
    },
    /// Manage networks.
    #[command(subcommand)]
    Network(NetworkCommand),
    /// Manage volumes.
    #[command(subcommand)]
    Volume(VolumeCommand),
    /// Manage multi-container projects from compose files.
    Compose(ComposeArgs),
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Generate man pages.
    ManPages {
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
    #[command(subcommand, hide = true)]
    Internal(InternalCommand),
}

impl Commands {
    fn needs_runtime(&self) -> bool {
        match self {
            Self::Run(_) | Self::Start { .. } | Self::Restart { .. } => true,
            Self::Compose(args) => args.command.creates_containers(),
            _ => false,
        }
    }
}

fn finish(result: Result<u8, String>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    // Hooks and loggers set up their own logging and take paths as arguments.
    let command = match cli.command {
        Commands::Internal(cmd) => return finish(commands::internal::run(cmd)),
        other => other,
    };

    let config = match commands::load_config(&cli.global) {
        Ok(c) => c,
        Err(msg) => return finish(Err(msg)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BERTH_LOG").unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(cli.global.log_level(config.debug))
            }),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    if command.needs_runtime()
        && config.supervisor == "runc"
        && std::env::var("BERTH_SKIP_PREREQS").as_deref() != Ok("1")
    {
        let missing = berth_runtime::check_prereqs(
            &config.runtime,
            &config.cni_path,
            rootless::is_rootless(),
        );
        if !missing.is_empty() {
            eprintln!("error: {}", berth_runtime::format_missing(&missing));
            return ExitCode::from(EXIT_FAILURE);
        }
    }

    match &command {
        Commands::Completions { shell } => {
            return finish(commands::completions::run::<Cli>(*shell));
        }
        Commands::ManPages { dir } => return finish(commands::man_pages::run::<Cli>(dir)),
        _ => {}
    }

    let engine = match commands::open_engine(&config) {
        Ok(e) => e,
        Err(msg) => return finish(Err(msg)),
    };

    let result = match command {
        Commands::Run(args) => commands::run::run(&engine, args),
        Commands::Start { attach, containers } => {
            commands::container::start(&engine, &containers, attach)
        }
        Commands::Stop { time, containers } => {
            commands::container::stop(&engine, &containers, time)
        }
        Commands::Restart { time, containers } => {
            commands::container::restart(&engine, &containers, time)
        }
        Commands::Kill { signal, containers } => {
            commands::container::kill(&engine, &containers, &signal)
        }
        Commands::Pause { containers } => commands::container::pause(&engine, &containers),
        Commands::Unpause { containers } => commands::container::unpause(&engine, &containers),
        Commands::Rm {
            force,
            volumes,
            containers,
        } => commands::container::remove(&engine, &containers, force, volumes),
        Commands::Rename {
            container,
            new_name,
        } => commands::container::rename(&engine, &container, &new_name),
        Commands::Exec(args) => commands::exec::run(&engine, &args),
        Commands::Logs {
            follow,
            tail,
            timestamps,
            container,
        } => commands::logs::run(
            &engine,
            &container,
            LogOptions {
                follow,
                tail,
                timestamps,
            },
        ),
        Commands::Inspect { containers } => commands::inspect::run(&engine, &containers),
        Commands::Ps {
            all,
            quiet,
            format,
            no_trunc,
        } => commands::ps::run(&engine, all, quiet, format, no_trunc),
        Commands::Port { container, port } => {
            commands::port::run(&engine, &container, port.as_deref())
        }
        Commands::Network(cmd) => commands::network::run(&engine, cmd),
        Commands::Volume(cmd) => commands::volume::run(&engine, cmd),
        Commands::Compose(args) => commands::compose::run(&engine, &cli.global, &config, args),
        Commands::Completions { .. } | Commands::ManPages { .. } | Commands::Internal(_) => {
            Ok(commands::EXIT_SUCCESS)
        }
    };
    finish(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use crate::commands::compose::ComposeCommand;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn compose_up_parses_scale_and_services() {
        let cli = Cli::try_parse_from([
            "berth", "compose", "-f", "a.yml", "up", "-d", "--scale", "web=2", "web",
        ])
        .unwrap();
        let Commands::Compose(args) = cli.command else {
            panic!("expected compose");
        };
        assert_eq!(args.file, vec![PathBuf::from("a.yml")]);
        assert!(args.command.creates_containers());
        let ComposeCommand::Up {
            detach,
            scale,
            services,
            ..
        } = args.command
        else {
            panic!("expected up");
        };
        assert!(detach);
        assert_eq!(scale, vec!["web=2"]);
        assert_eq!(services, vec!["web"]);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["berth", "ps", "-a", "--namespace", "test"]).unwrap();
        assert_eq!(cli.global.namespace.as_deref(), Some("test"));
    }

    #[test]
    fn run_flag_repeats_and_command() {
        let cli = Cli::try_parse_from([
            "berth", "run", "--name", "a", "--name", "b", "alpine", "ls", "-l",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.name.as_deref(), Some("b"));
        assert_eq!(args.args, vec!["ls", "-l"]);
    }

    #[test]
    fn conflicting_recreate_flags_rejected() {
        assert!(Cli::try_parse_from([
            "berth",
            "compose",
            "up",
            "--force-recreate",
            "--no-recreate"
        ])
        .is_err());
    }

    #[test]
    fn runtime_commands() {
        let cli = Cli::try_parse_from(["berth", "run", "alpine"]).unwrap();
        assert!(cli.command.needs_runtime());
        let cli = Cli::try_parse_from(["berth", "volume", "ls"]).unwrap();
        assert!(!cli.command.needs_runtime());
    }
}
