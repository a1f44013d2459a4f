use super::{json_pretty, label_map, OutputFormat, EXIT_SUCCESS};
use berth_core::Engine;
use clap::Subcommand;

#[derive(Debug, Subcommand)]
pub enum VolumeCommand {
    /// Create a named volume; prints its name.
    Create {
        #[arg(long)]
        label: Vec<String>,
        /// Volume name; generated when omitted.
        name: Option<String>,
    },
    /// List volumes.
    #[command(visible_alias = "list")]
    Ls {
        #[arg(short, long)]
        quiet: bool,
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
    /// Remove volumes no container mounts.
    #[command(visible_alias = "remove")]
    Rm {
        #[arg(required = true)]
        volumes: Vec<String>,
    },
    /// Show volume details as JSON.
    Inspect {
        #[arg(required = true)]
        volumes: Vec<String>,
    },
}

pub fn run(engine: &Engine, cmd: VolumeCommand) -> Result<u8, String> {
    match cmd {
        VolumeCommand::Create { label, name } => {
            let volume = engine
                .create_volume(name.as_deref().unwrap_or_default(), label_map(&label)?, false)
                .map_err(|e| e.to_string())?;
            println!("{}", volume.name);
        }
        VolumeCommand::Ls { quiet, format } => {
            let volumes = engine.list_volumes().map_err(|e| e.to_string())?;
            if quiet {
                for v in &volumes {
                    println!("{}", v.name);
                }
            } else if format == OutputFormat::Json {
                println!("{}", json_pretty(&volumes)?);
            } else {
                println!("{:<10} {:<40} MOUNTPOINT", "DRIVER", "VOLUME NAME");
                for v in &volumes {
                    println!("{:<10} {:<40} {}", v.driver, v.name, v.mountpoint.display());
                }
            }
        }
        VolumeCommand::Rm { volumes } => {
            let mut errors = Vec::new();
            for v in &volumes {
                match engine.remove_volume(v) {
                    Ok(()) => println!("{v}"),
                    Err(e) => errors.push(e.to_string()),
                }
            }
            if !errors.is_empty() {
                return Err(errors.join("\n"));
            }
        }
        VolumeCommand::Inspect { volumes } => {
            let found = volumes
                .iter()
                .map(|v| engine.inspect_volume(v))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            println!("{}", json_pretty(&found)?);
        }
    }
    Ok(EXIT_SUCCESS)
}
