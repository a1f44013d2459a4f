use super::container_exit_code;
use berth_core::Engine;
use berth_runtime::ExecRequest;
use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct ExecArgs {
    /// Run the command in the background.
    #[arg(short, long)]
    pub detach: bool,
    /// Keep STDIN open.
    #[arg(short, long)]
    pub interactive: bool,
    /// Allocate a pseudo-TTY.
    #[arg(short, long)]
    pub tty: bool,
    /// Working directory inside the container.
    #[arg(short, long)]
    pub workdir: Option<String>,
    /// Set an environment variable (KEY=VALUE).
    #[arg(short, long)]
    pub env: Vec<String>,
    /// User as name|uid[:group|gid].
    #[arg(short, long)]
    pub user: Option<String>,
    /// Container name, id or id prefix.
    pub container: String,
    /// Command and arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl ExecArgs {
    pub fn request(&self) -> ExecRequest {
        ExecRequest {
            args: self.command.clone(),
            env: self.env.clone(),
            cwd: self.workdir.clone(),
            user: self.user.clone(),
            tty: self.tty,
            interactive: self.interactive,
            detach: self.detach,
        }
    }
}

pub fn run(engine: &Engine, args: &ExecArgs) -> Result<u8, String> {
    let code = engine
        .exec(&args.container, &args.request())
        .map_err(|e| e.to_string())?;
    Ok(container_exit_code(code))
}
