use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// First executable named `name` on `$PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Check what `run` and `compose up` need: the OCI runtime, the CNI
/// plugins, and the image download tools. Empty means all present.
pub fn check_prereqs(runtime: &str, cni_path: &Path, rootless: bool) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists(runtime) {
        missing.push(MissingPrereq {
            name: runtime.to_owned(),
            purpose: "OCI container execution",
            install_hint: "install one of: runc, crun, or youki",
        });
    }

    if !cni_path.join("bridge").is_file() {
        missing.push(MissingPrereq {
            name: format!("CNI plugins in {}", cni_path.display()),
            purpose: "container networking",
            install_hint: "install containernetworking-plugins, or set --cni-path",
        });
    }

    if rootless && !command_exists("fuse-overlayfs") {
        missing.push(MissingPrereq {
            name: "fuse-overlayfs".to_owned(),
            purpose: "overlay filesystem for rootless container layers",
            install_hint: "zypper install fuse-overlayfs | apt install fuse-overlayfs | dnf install fuse-overlayfs | pacman -S fuse-overlayfs",
        });
    }

    for (tool, purpose) in [("curl", "downloading container images"), ("tar", "unpacking container images")] {
        if !command_exists(tool) {
            missing.push(MissingPrereq {
                name: tool.to_owned(),
                purpose,
                install_hint: "install it with your distribution's package manager",
            });
        }
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nSet BERTH_SKIP_PREREQS=1 to skip this check.");
    msg
}
