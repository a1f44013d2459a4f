use super::{json_pretty, label_map, short_id, OutputFormat, EXIT_SUCCESS};
use berth_core::Engine;
use berth_runtime::cni::CreateNetworkOptions;
use berth_runtime::NetworkConfList;
use clap::Subcommand;

#[derive(Debug, Subcommand)]
pub enum NetworkCommand {
    /// Create a bridge network.
    Create {
        /// Driver; only bridge is supported.
        #[arg(short, long, default_value = "bridge")]
        driver: String,
        /// Subnet in CIDR form; allocated from 10.4.1.0/24 upwards when omitted.
        #[arg(long)]
        subnet: Option<String>,
        #[arg(long)]
        gateway: Option<String>,
        /// Allocate container addresses from this sub-range.
        #[arg(long)]
        ip_range: Option<String>,
        #[arg(long)]
        label: Vec<String>,
        name: String,
    },
    /// List networks.
    #[command(visible_alias = "list")]
    Ls {
        /// Only print names.
        #[arg(short, long)]
        quiet: bool,
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
    /// Remove networks no container is attached to.
    #[command(visible_alias = "remove")]
    Rm {
        #[arg(required = true)]
        networks: Vec<String>,
    },
    /// Show network configuration as JSON.
    Inspect {
        #[arg(required = true)]
        networks: Vec<String>,
    },
}

pub fn run(engine: &Engine, cmd: NetworkCommand) -> Result<u8, String> {
    match cmd {
        NetworkCommand::Create {
            driver,
            subnet,
            gateway,
            ip_range,
            label,
            name,
        } => {
            let list = engine
                .create_network(&CreateNetworkOptions {
                    name,
                    driver,
                    subnet,
                    gateway,
                    ip_range,
                    labels: label_map(&label)?,
                })
                .map_err(|e| e.to_string())?;
            println!("{}", list.berth.id);
            Ok(EXIT_SUCCESS)
        }
        NetworkCommand::Ls { quiet, format } => {
            let networks = engine.list_networks().map_err(|e| e.to_string())?;
            list(&networks, quiet, format)
        }
        NetworkCommand::Rm { networks } => {
            let mut errors = Vec::new();
            for n in &networks {
                match engine.remove_network(n) {
                    Ok(name) => println!("{name}"),
                    Err(e) => errors.push(e.to_string()),
                }
            }
            if errors.is_empty() {
                Ok(EXIT_SUCCESS)
            } else {
                Err(errors.join("\n"))
            }
        }
        NetworkCommand::Inspect { networks } => {
            let found = networks
                .iter()
                .map(|n| engine.inspect_network(n))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            println!("{}", json_pretty(&found)?);
            Ok(EXIT_SUCCESS)
        }
    }
}

fn list(networks: &[NetworkConfList], quiet: bool, format: OutputFormat) -> Result<u8, String> {
    if quiet {
        for n in networks {
            println!("{}", n.name);
        }
    } else if format == OutputFormat::Json {
        println!("{}", json_pretty(&networks)?);
    } else {
        println!("{:<14} {:<20} {:<18} GATEWAY", "NETWORK ID", "NAME", "SUBNET");
        for n in networks {
            println!(
                "{:<14} {:<20} {:<18} {}",
                short_id(&n.berth.id),
                n.name,
                n.subnets().join(","),
                n.gateway().unwrap_or_default()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
