use super::EXIT_SUCCESS;
use berth_core::Engine;
use berth_schema::PortMapping;

/// `80/tcp -> 0.0.0.0:8080` per mapping, or only the host side when the
/// listing was narrowed to one port.
pub fn render(ports: &[PortMapping], narrowed: bool) -> Vec<String> {
    ports
        .iter()
        .map(|p| {
            let host = format!("{}:{}", p.host_ip, p.host_port);
            if narrowed {
                host
            } else {
                format!("{}/{} -> {host}", p.container_port, p.protocol)
            }
        })
        .collect()
}

pub fn run(engine: &Engine, container: &str, port: Option<&str>) -> Result<u8, String> {
    let ports = engine.port(container, port).map_err(|e| e.to_string())?;
    for line in render(&ports, port.is_some()) {
        println!("{line}");
    }
    Ok(EXIT_SUCCESS)
}
