//! On-disk state for berth: data-root layout, file locks, and the name,
//! lifecycle, hosts, and volume stores.
//!
//! Every mutation of state shared between processes goes through
//! [`LockedStore`], a path-keyed namespace guarded by a file lock. The
//! hosts store is the one writer that bypasses atomic rename: hosts files
//! are bind-mounted into running containers and must keep their inode.

pub mod hosts;
pub mod layout;
pub mod lifecycle;
pub mod lock;
pub mod locked;
pub mod names;
pub mod volumes;

pub use hosts::{HostsStore, NetworkMeta};
pub use layout::DataLayout;
pub use lifecycle::{LifecycleState, LifecycleStore};
pub use lock::FileLock;
pub use locked::LockedStore;
pub use names::NameStore;
pub use volumes::{Volume, VolumeStore};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `data` to `path` via a temp file in the same directory and rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Invalid(format!("no parent directory: {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("name '{name}' is already used by container {id}")]
    NameAlreadyUsed { name: String, id: String },
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("invalid argument: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_name_used() {
        let e = StoreError::NameAlreadyUsed {
            name: "web".to_owned(),
            id: "abc123".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("web"));
        assert!(msg.contains("abc123"));
    }

    #[test]
    fn not_found_classification() {
        assert!(StoreError::NotFound("x".to_owned()).is_not_found());
        assert!(!StoreError::LockFailed("x".to_owned()).is_not_found());
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/file.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
    }
}
