use super::{container_exit_code, each_container, timeout_arg, EXIT_SUCCESS};
use berth_core::Engine;

pub fn start(engine: &Engine, containers: &[String], attach: bool) -> Result<u8, String> {
    if attach {
        let [container] = containers else {
            return Err("invalid argument: you cannot start and attach multiple containers at once".to_owned());
        };
        let code = engine.start(container, true).map_err(|e| e.to_string())?;
        return Ok(code.map_or(EXIT_SUCCESS, container_exit_code));
    }
    each_container(containers, |c| engine.start(c, false).map(|_| ()))
}

pub fn stop(engine: &Engine, containers: &[String], time: Option<u64>) -> Result<u8, String> {
    let timeout = timeout_arg(time);
    each_container(containers, |c| engine.stop(c, timeout).map(|_| ()))
}

pub fn restart(engine: &Engine, containers: &[String], time: Option<u64>) -> Result<u8, String> {
    let timeout = timeout_arg(time);
    each_container(containers, |c| engine.restart(c, timeout).map(|_| ()))
}

pub fn kill(engine: &Engine, containers: &[String], signal: &str) -> Result<u8, String> {
    each_container(containers, |c| engine.kill(c, signal).map(|_| ()))
}

pub fn pause(engine: &Engine, containers: &[String]) -> Result<u8, String> {
    each_container(containers, |c| engine.pause(c).map(|_| ()))
}

pub fn unpause(engine: &Engine, containers: &[String]) -> Result<u8, String> {
    each_container(containers, |c| engine.unpause(c).map(|_| ()))
}

pub fn remove(engine: &Engine, containers: &[String], force: bool, volumes: bool) -> Result<u8, String> {
    each_container(containers, |c| engine.remove(c, force, volumes).map(|_| ()))
}

pub fn rename(engine: &Engine, container: &str, new_name: &str) -> Result<u8, String> {
    engine
        .rename(container, new_name)
        .map_err(|e| e.to_string())?;
    Ok(EXIT_SUCCESS)
}
