use crate::layout::state_files;
use crate::locked::LockedStore;
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Transient per-container state shared between hook invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set when createRuntime rejected the network attach; the postStop
    /// that follows must then leave everything in place.
    #[serde(default)]
    pub create_error: bool,
}

/// `lifecycle.json` in a container state dir.
#[derive(Debug, Clone)]
pub struct LifecycleStore {
    store: LockedStore,
}

impl LifecycleStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: LockedStore::new(state_dir),
        }
    }

    fn read(&self) -> Result<LifecycleState, StoreError> {
        match self.store.get(&[state_files::LIFECYCLE]) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.is_not_found() => Ok(LifecycleState::default()),
            Err(e) => Err(e),
        }
    }

    /// Current state; a missing file reads as the default state.
    pub fn load(&self) -> Result<LifecycleState, StoreError> {
        self.store.with_lock(|| self.read())
    }

    pub fn save(&self, state: &LifecycleState) -> Result<(), StoreError> {
        let data = serde_json::to_vec(state)?;
        self.store
            .with_lock(|| self.store.set(&data, &[state_files::LIFECYCLE]))
    }

    /// Read-modify-write under the lock. Returns the new state.
    pub fn transform(
        &self,
        f: impl FnOnce(&mut LifecycleState),
    ) -> Result<LifecycleState, StoreError> {
        self.store.with_lock(|| {
            let mut st = self.read()?;
            f(&mut st);
            self.store
                .set(&serde_json::to_vec(&st)?, &[state_files::LIFECYCLE])?;
            Ok(st)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let s = LifecycleStore::new(dir.path());
        assert_eq!(s.load().unwrap(), LifecycleState::default());
    }

    #[test]
    fn transform_persists() {
        let dir = tempfile::tempdir().unwrap();
        let s = LifecycleStore::new(dir.path());
        let now = Utc::now();
        s.transform(|st| {
            st.create_error = true;
            st.started_at = Some(now);
        })
        .unwrap();
        let back = LifecycleStore::new(dir.path()).load().unwrap();
        assert!(back.create_error);
        assert_eq!(back.started_at, Some(now));
        assert!(dir.path().join("lifecycle.json").is_file());

        s.save(&LifecycleState::default()).unwrap();
        assert!(!s.load().unwrap().create_error);
    }

    #[test]
    fn json_field_names() {
        let st = LifecycleState {
            started_at: None,
            create_error: true,
        };
        assert_eq!(serde_json::to_string(&st).unwrap(), r#"{"create_error":true}"#);
    }
}
