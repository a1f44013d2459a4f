use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Writable overlay over an image rootfs.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
    /// Use fuse-overlayfs instead of the kernel overlay driver.
    pub fuse: bool,
}

impl Snapshot {
    pub fn new(lower: impl Into<PathBuf>, dir: &Path, fuse: bool) -> Self {
        Self {
            lower: lower.into(),
            upper: dir.join("upper"),
            work: dir.join("work"),
            merged: dir.join("merged"),
            fuse,
        }
    }

    fn options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower.display(),
            self.upper.display(),
            self.work.display()
        )
    }

    pub fn mount(&self) -> Result<(), RuntimeError> {
        if is_mounted(&self.merged) {
            return Ok(());
        }
        if self.work.exists() {
            let _ = std::fs::remove_dir_all(&self.work);
        }
        for dir in [&self.upper, &self.work, &self.merged] {
            std::fs::create_dir_all(dir)?;
        }

        let status = if self.fuse {
            Command::new("fuse-overlayfs")
                .arg("-o")
                .arg(self.options())
                .arg(&self.merged)
                .status()
                .map_err(|e| {
                    RuntimeError::ExecFailed(format!(
                        "fuse-overlayfs not found or failed to start: {e}"
                    ))
                })?
        } else {
            Command::new("mount")
                .args(["-t", "overlay", "overlay", "-o"])
                .arg(self.options())
                .arg(&self.merged)
                .status()
                .map_err(|e| RuntimeError::ExecFailed(format!("mount failed to start: {e}")))?
        };
        if !status.success() {
            return Err(RuntimeError::ExecFailed(format!(
                "overlay mount on {} failed",
                self.merged.display()
            )));
        }
        debug!("mounted snapshot at {}", self.merged.display());
        Ok(())
    }

    pub fn unmount(&self) -> Result<(), RuntimeError> {
        if !self.merged.exists() || !is_mounted(&self.merged) {
            return Ok(());
        }
        let tools: &[&[&str]] = if self.fuse {
            &[&["fusermount3", "-u"], &["fusermount", "-u"]]
        } else {
            &[&["umount"], &["umount", "-l"]]
        };
        for tool in tools {
            let _ = Command::new(tool[0])
                .args(&tool[1..])
                .arg(&self.merged)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if !is_mounted(&self.merged) {
                return Ok(());
            }
        }
        warn!("snapshot {} is still mounted", self.merged.display());
        Err(RuntimeError::ExecFailed(format!(
            "failed to unmount {}",
            self.merged.display()
        )))
    }
}

/// Check if a path is currently a mount point by inspecting /proc/mounts.
pub fn is_mounted(path: &Path) -> bool {
    let canonical = match std::fs::canonicalize(path) {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    };
    match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(&canonical)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_options_name_all_layers() {
        let snap = Snapshot::new("/img/rootfs", Path::new("/snap/c1"), true);
        assert_eq!(
            snap.options(),
            "lowerdir=/img/rootfs,upperdir=/snap/c1/upper,workdir=/snap/c1/work"
        );
        assert_eq!(snap.merged, PathBuf::from("/snap/c1/merged"));
    }

    #[test]
    fn unmounted_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let snap = Snapshot::new(dir.path().join("lower"), dir.path(), false);
        assert!(!is_mounted(&snap.merged));
        snap.unmount().unwrap();
    }
}
