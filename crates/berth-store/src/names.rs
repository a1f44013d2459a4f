use crate::locked::LockedStore;
use crate::StoreError;
use berth_schema::is_valid_object_name;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// Per-namespace `name -> container id` registry, one file per name.
#[derive(Debug, Clone)]
pub struct NameStore {
    store: LockedStore,
}

fn check_name(name: &str) -> Result<(), StoreError> {
    if !is_valid_object_name(name) {
        return Err(StoreError::Invalid(format!(
            "invalid container name '{name}' (expected [a-zA-Z0-9][a-zA-Z0-9_.-]*)"
        )));
    }
    Ok(())
}

impl NameStore {
    /// `dir` is `<data-root>/names/<ns>`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            store: LockedStore::new(dir),
        }
    }

    fn read(&self, name: &str) -> Result<Option<String>, StoreError> {
        match self.store.get(&[name]) {
            Ok(data) => Ok(Some(String::from_utf8_lossy(&data).trim().to_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Bind `name` to `id`. Re-acquiring for the same id is a no-op.
    pub fn acquire(&self, name: &str, id: &str) -> Result<(), StoreError> {
        check_name(name)?;
        self.store.with_lock(|| match self.read(name)? {
            Some(existing) if existing == id => Ok(()),
            Some(existing) => Err(StoreError::NameAlreadyUsed {
                name: name.to_owned(),
                id: existing,
            }),
            None => {
                debug!("name {name} -> {id}");
                self.store.set(id.as_bytes(), &[name])
            }
        })
    }

    /// Unbind `name`. Returns [`StoreError::NotFound`] when nothing is bound.
    pub fn release(&self, name: &str, id: &str) -> Result<(), StoreError> {
        check_name(name)?;
        self.store.with_lock(|| match self.read(name)? {
            None => Err(StoreError::NotFound(format!("name {name}"))),
            Some(existing) if existing != id => Err(StoreError::Invalid(format!(
                "name '{name}' is held by container {existing}, not {id}"
            ))),
            Some(_) => {
                debug!("release name {name}");
                self.store.delete(&[name])
            }
        })
    }

    /// Move `id` from `old` to `new` in one locked step.
    pub fn rename(&self, old: &str, id: &str, new: &str) -> Result<(), StoreError> {
        check_name(old)?;
        check_name(new)?;
        self.store.with_lock(|| {
            match self.read(old)? {
                Some(existing) if existing == id => {}
                Some(existing) => {
                    return Err(StoreError::Invalid(format!(
                        "name '{old}' is held by container {existing}, not {id}"
                    )))
                }
                None => return Err(StoreError::NotFound(format!("name {old}"))),
            }
            if let Some(existing) = self.read(new)? {
                return Err(StoreError::NameAlreadyUsed {
                    name: new.to_owned(),
                    id: existing,
                });
            }
            self.store.set(id.as_bytes(), &[new])?;
            self.store.delete(&[old])
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<String>, StoreError> {
        check_name(name)?;
        self.read(name)
    }

    pub fn list(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let mut out = BTreeMap::new();
        for name in self.store.list(&[])? {
            if let Some(id) = self.read(&name)? {
                out.insert(name, id);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, NameStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = NameStore::new(dir.path().join("names/default"));
        (dir, s)
    }

    #[test]
    fn acquire_is_idempotent_for_same_id() {
        let (_d, s) = store();
        s.acquire("web", "id1").unwrap();
        s.acquire("web", "id1").unwrap();
        assert_eq!(s.get("web").unwrap().as_deref(), Some("id1"));
    }

    #[test]
    fn acquire_conflicts_for_other_id() {
        let (_d, s) = store();
        s.acquire("web", "id1").unwrap();
        let err = s.acquire("web", "id2").unwrap_err();
        assert!(matches!(err, StoreError::NameAlreadyUsed { ref id, .. } if id == "id1"));
    }

    #[test]
    fn release_semantics() {
        let (_d, s) = store();
        assert!(s.release("web", "id1").unwrap_err().is_not_found());
        s.acquire("web", "id1").unwrap();
        assert!(s.release("web", "id2").is_err());
        s.release("web", "id1").unwrap();
        assert!(s.get("web").unwrap().is_none());
        assert!(s.release("web", "id1").unwrap_err().is_not_found());
    }

    #[test]
    fn rename_moves_binding() {
        let (_d, s) = store();
        s.acquire("old", "id1").unwrap();
        s.acquire("taken", "id2").unwrap();
        assert!(matches!(
            s.rename("old", "id1", "taken"),
            Err(StoreError::NameAlreadyUsed { .. })
        ));
        s.rename("old", "id1", "new").unwrap();
        assert!(s.get("old").unwrap().is_none());
        assert_eq!(s.get("new").unwrap().as_deref(), Some("id1"));
        let all = s.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["taken"], "id2");
    }

    #[test]
    fn invalid_names_rejected() {
        let (_d, s) = store();
        assert!(s.acquire("../etc", "id").is_err());
        assert!(s.acquire("", "id").is_err());
    }
}
