use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout under the data root.
///
/// ```text
/// <root>/containers/<ns>/<id>/     per-container state dir
/// <root>/etchosts/<ns>/<id>/       hosts file + meta.json
/// <root>/names/<ns>/<name>         name registry
/// <root>/volumes/<ns>/<vol>/_data  named volumes
/// <root>/supervisor/<ns>/<id>/     local supervisor records and bundles
/// <root>/images/                   image cache
/// ```
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn containers_dir(&self, ns: &str) -> PathBuf {
        self.root.join("containers").join(ns)
    }

    #[inline]
    pub fn container_state_dir(&self, ns: &str, id: &str) -> PathBuf {
        self.containers_dir(ns).join(id)
    }

    #[inline]
    pub fn etchosts_dir(&self, ns: &str) -> PathBuf {
        self.root.join("etchosts").join(ns)
    }

    #[inline]
    pub fn names_dir(&self, ns: &str) -> PathBuf {
        self.root.join("names").join(ns)
    }

    #[inline]
    pub fn volumes_dir(&self, ns: &str) -> PathBuf {
        self.root.join("volumes").join(ns)
    }

    #[inline]
    pub fn supervisor_dir(&self, ns: &str) -> PathBuf {
        self.root.join("supervisor").join(ns)
    }

    #[inline]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn initialize(&self, ns: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.containers_dir(ns))?;
        fs::create_dir_all(self.etchosts_dir(ns))?;
        fs::create_dir_all(self.names_dir(ns))?;
        fs::create_dir_all(self.volumes_dir(ns))?;
        Ok(())
    }
}

/// Well-known file names inside a container state dir.
pub mod state_files {
    pub const PID: &str = "pid";
    pub const HOSTNAME: &str = "hostname";
    pub const RESOLV_CONF: &str = "resolv.conf";
    pub const LIFECYCLE: &str = "lifecycle.json";
    pub const BYPASS4NETNS_LOG: &str = "bypass4netns.log";

    pub fn hook_log(event: &str) -> String {
        format!("oci-hook.{event}.log")
    }

    pub fn json_log(id: &str) -> String {
        format!("{id}-json.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = DataLayout::new("/tmp/berth-test");
        assert_eq!(
            layout.container_state_dir("default", "abc"),
            PathBuf::from("/tmp/berth-test/containers/default/abc")
        );
        assert_eq!(
            layout.etchosts_dir("k8s.io"),
            PathBuf::from("/tmp/berth-test/etchosts/k8s.io")
        );
        assert_eq!(
            layout.names_dir("default"),
            PathBuf::from("/tmp/berth-test/names/default")
        );
        assert_eq!(
            layout.volumes_dir("default"),
            PathBuf::from("/tmp/berth-test/volumes/default")
        );
        assert_eq!(state_files::hook_log("postStop"), "oci-hook.postStop.log");
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        layout.initialize("default").unwrap();
        layout.initialize("default").unwrap();
        assert!(layout.containers_dir("default").is_dir());
        assert!(layout.names_dir("default").is_dir());
    }
}
