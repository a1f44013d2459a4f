use super::{json_pretty, EXIT_SUCCESS};
use berth_core::Engine;

pub fn run(engine: &Engine, containers: &[String]) -> Result<u8, String> {
    let details = containers
        .iter()
        .map(|c| engine.inspect(c))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    println!("{}", json_pretty(&details)?);
    Ok(EXIT_SUCCESS)
}
