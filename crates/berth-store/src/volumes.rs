use crate::locked::LockedStore;
use crate::StoreError;
use berth_schema::is_valid_object_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

const VOLUME_META: &str = "volume.json";
const DATA_DIR: &str = "_data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Volume {
    pub name: String,
    pub driver: String,
    pub mountpoint: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VolumeFile {
    created_at: DateTime<Utc>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// Named local volumes under `<data-root>/volumes/<ns>`.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    store: LockedStore,
}

impl VolumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            store: LockedStore::new(dir),
        }
    }

    fn load(&self, name: &str) -> Result<Option<Volume>, StoreError> {
        let data = match self.store.get(&[name, VOLUME_META]) {
            Ok(d) => d,
            Err(e) if e.is_not_found() => {
                if !self.store.exists(&[name, DATA_DIR])? {
                    return Ok(None);
                }
                // Volumes created by hand have no metadata file.
                serde_json::to_vec(&VolumeFile {
                    created_at: Utc::now(),
                    labels: BTreeMap::new(),
                })?
            }
            Err(e) => return Err(e),
        };
        let file: VolumeFile = serde_json::from_slice(&data)?;
        Ok(Some(Volume {
            name: name.to_owned(),
            driver: "local".to_owned(),
            mountpoint: self.store.location(&[name, DATA_DIR])?,
            created_at: file.created_at,
            labels: file.labels,
        }))
    }

    /// Create a volume, or return the existing one when `exist_ok`.
    pub fn create(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        exist_ok: bool,
    ) -> Result<Volume, StoreError> {
        if !is_valid_object_name(name) {
            return Err(StoreError::Invalid(format!("invalid volume name '{name}'")));
        }
        self.store.with_lock(|| {
            if let Some(existing) = self.load(name)? {
                if exist_ok {
                    return Ok(existing);
                }
                return Err(StoreError::Invalid(format!("volume {name} already exists")));
            }
            let data_dir = self.store.location(&[name, DATA_DIR])?;
            std::fs::create_dir_all(&data_dir)?;
            let file = VolumeFile {
                created_at: Utc::now(),
                labels,
            };
            self.store
                .set(&serde_json::to_vec_pretty(&file)?, &[name, VOLUME_META])?;
            info!("created volume {name}");
            self.load(name)?
                .ok_or_else(|| StoreError::NotFound(format!("volume {name}")))
        })
    }

    pub fn get(&self, name: &str) -> Result<Volume, StoreError> {
        self.load(name)?
            .ok_or_else(|| StoreError::NotFound(format!("volume {name}")))
    }

    pub fn list(&self) -> Result<Vec<Volume>, StoreError> {
        let mut out = Vec::new();
        for name in self.store.list(&[])? {
            if let Some(v) = self.load(&name)? {
                out.push(v);
            }
        }
        Ok(out)
    }

    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        if !is_valid_object_name(name) {
            return Err(StoreError::Invalid(format!("invalid volume name '{name}'")));
        }
        self.store.with_lock(|| {
            self.store.delete(&[name])?;
            info!("removed volume {name}");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let vols = VolumeStore::new(dir.path().join("volumes/default"));
        let labels: BTreeMap<String, String> =
            [("com.docker.compose.project".to_owned(), "p".to_owned())].into();
        let v = vols.create("data", labels.clone(), false).unwrap();
        assert!(v.mountpoint.ends_with("data/_data"));
        assert!(v.mountpoint.is_dir());
        assert_eq!(vols.get("data").unwrap().labels, labels);

        assert!(vols.create("data", BTreeMap::new(), false).is_err());
        let again = vols.create("data", BTreeMap::new(), true).unwrap();
        assert_eq!(again.labels, labels);

        assert_eq!(vols.list().unwrap().len(), 1);
        vols.remove("data").unwrap();
        assert!(vols.get("data").unwrap_err().is_not_found());
        assert!(vols.remove("data").unwrap_err().is_not_found());
    }

    #[test]
    fn invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let vols = VolumeStore::new(dir.path());
        assert!(vols.create("../x", BTreeMap::new(), false).is_err());
        assert!(vols.remove("").is_err());
    }
}
