use super::{colorize_state, json_pretty, short_id, OutputFormat, EXIT_SUCCESS};
use berth_core::{ContainerSummary, Engine};
use berth_schema::PortMapping;

pub fn format_ports(ports: &[PortMapping]) -> String {
    ports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

pub fn print_table(rows: &[ContainerSummary], no_trunc: bool) {
    println!(
        "{:<14} {:<24} {:<24} {:<16} {:<28} NAMES",
        "CONTAINER ID", "IMAGE", "COMMAND", "STATUS", "PORTS"
    );
    for c in rows {
        let (id, command) = if no_trunc {
            (c.id.clone(), c.command.clone())
        } else {
            (short_id(&c.id).to_owned(), truncate(&c.command, 22))
        };
        // Pad before coloring; escape codes would break the alignment.
        let status = colorize_state(&format!("{:<16}", c.status));
        println!(
            "{:<14} {:<24} {:<24} {} {:<28} {}",
            id,
            truncate(&c.image, 24),
            format!("\"{command}\""),
            status,
            format_ports(&c.ports),
            c.name
        );
    }
}

pub fn run(
    engine: &Engine,
    all: bool,
    quiet: bool,
    format: OutputFormat,
    no_trunc: bool,
) -> Result<u8, String> {
    let rows = engine.ps(all).map_err(|e| e.to_string())?;
    if quiet {
        for c in &rows {
            println!("{}", if no_trunc { &c.id } else { short_id(&c.id) });
        }
    } else if format == OutputFormat::Json {
        println!("{}", json_pretty(&rows)?);
    } else {
        print_table(&rows, no_trunc);
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_joined() {
        let ports = vec![
            PortMapping {
                host_ip: "0.0.0.0".to_owned(),
                host_port: 8080,
                container_port: 80,
                protocol: "tcp".to_owned(),
            },
            PortMapping {
                host_ip: "127.0.0.1".to_owned(),
                host_port: 53,
                container_port: 53,
                protocol: "udp".to_owned(),
            },
        ];
        assert_eq!(
            format_ports(&ports),
            "0.0.0.0:8080->80/tcp, 127.0.0.1:53->53/udp"
        );
    }

    #[test]
    fn long_values_are_truncated() {
        assert_eq!(truncate("sleep", 22), "sleep");
        let t = truncate("sh -c 'while true; do echo hello; done'", 12);
        assert_eq!(t, "sh -c 'wh...");
        assert_eq!(t.chars().count(), 12);
    }
}
