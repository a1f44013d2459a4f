use super::EXIT_SUCCESS;
use clap::{Command, CommandFactory};
use std::path::Path;

fn render(cmd: Command, path: &Path) -> Result<(), String> {
    let mut buf = Vec::new();
    clap_mangen::Man::new(cmd)
        .render(&mut buf)
        .map_err(|e| format!("man page render failed: {e}"))?;
    std::fs::write(path, &buf).map_err(|e| format!("failed to write {}: {e}", path.display()))
}

/// Write `berth.1` plus one page per visible subcommand, nested ones
/// included (`berth-compose-up.1`).
pub fn run<C: CommandFactory>(dir: &Path) -> Result<u8, String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("failed to create dir: {e}"))?;
    let cmd = C::command();
    render(cmd.clone(), &dir.join("berth.1"))?;
    let mut pending: Vec<(String, Command)> = cmd
        .get_subcommands()
        .map(|sub| (format!("berth-{}", sub.get_name()), sub.clone()))
        .collect();
    while let Some((name, sub)) = pending.pop() {
        if sub.is_hide_set() {
            continue;
        }
        pending.extend(
            sub.get_subcommands()
                .map(|child| (format!("{name}-{}", child.get_name()), child.clone())),
        );
        render(sub, &dir.join(format!("{name}.1")))?;
    }
    println!("man pages written to {}", dir.display());
    Ok(EXIT_SUCCESS)
}
