use crate::lock::FileLock;
use crate::{write_atomic, StoreError};
use std::fs;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".lock";

/// A directory of keyed files guarded by one file lock.
///
/// Keys are path segments below the root. `get`/`set`/`delete`/`list` do not
/// lock on their own; callers wrap related operations in [`with_lock`]
/// (which is not re-entrant). Entries whose name starts with `.` are private
/// to the store and never listed.
///
/// [`with_lock`]: LockedStore::with_lock
#[derive(Debug, Clone)]
pub struct LockedStore {
    root: PathBuf,
}

fn check_key(key: &[&str]) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::Invalid("empty store key".to_owned()));
    }
    for seg in key {
        if seg.is_empty() || *seg == "." || *seg == ".." || seg.contains('/') {
            return Err(StoreError::Invalid(format!("invalid store key segment '{seg}'")));
        }
    }
    Ok(())
}

impl LockedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `f` while holding the store lock.
    pub fn with_lock<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        fs::create_dir_all(&self.root).map_err(StoreError::from)?;
        let _guard = FileLock::acquire(&self.root.join(LOCK_FILE))?;
        f()
    }

    pub fn location(&self, key: &[&str]) -> Result<PathBuf, StoreError> {
        check_key(key)?;
        let mut p = self.root.clone();
        for seg in key {
            p.push(seg);
        }
        Ok(p)
    }

    pub fn exists(&self, key: &[&str]) -> Result<bool, StoreError> {
        Ok(self.location(key)?.exists())
    }

    pub fn get(&self, key: &[&str]) -> Result<Vec<u8>, StoreError> {
        let path = self.location(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.join("/")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn set(&self, data: &[u8], key: &[&str]) -> Result<(), StoreError> {
        write_atomic(&self.location(key)?, data)
    }

    /// Overwrite an existing file without replacing its inode.
    pub fn write_in_place(&self, data: &[u8], key: &[&str]) -> Result<(), StoreError> {
        let path = self.location(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(())
    }

    /// Remove a file or a whole subtree.
    pub fn delete(&self, key: &[&str]) -> Result<(), StoreError> {
        let path = self.location(key)?;
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.join("/")))
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Entry names under `key` (or the root when `key` is empty). A missing
    /// directory lists as empty.
    pub fn list(&self, key: &[&str]) -> Result<Vec<String>, StoreError> {
        let dir = if key.is_empty() {
            self.root.clone()
        } else {
            self.location(key)?
        };
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
