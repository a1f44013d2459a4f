//! Networks and volumes, and which containers hold them.

use crate::engine::new_container_id;
use crate::lookup::container_name;
use crate::{CoreError, Engine};
use berth_runtime::cni::CreateNetworkOptions;
use berth_runtime::{ContainerRecord, NetworkConfList};
use berth_schema::{labels, Labels};
use berth_store::Volume;
use tracing::info;

fn uses_network(rec: &ContainerRecord, network: &str) -> bool {
    labels::decode_list(&rec.labels, labels::NETWORKS)
        .map(|nets| nets.iter().any(|n| n == network))
        .unwrap_or(false)
}

/// Named volumes appear in the mounts label as `name:target`.
fn uses_volume(rec: &ContainerRecord, volume: &str) -> bool {
    labels::decode_list(&rec.labels, labels::MOUNTS)
        .map(|mounts| {
            mounts
                .iter()
                .any(|m| m.split_once(':').is_some_and(|(src, _)| src == volume))
        })
        .unwrap_or(false)
}

impl Engine {
    pub fn create_network(&self, opts: &CreateNetworkOptions) -> Result<NetworkConfList, CoreError> {
        let list = self.networks().create(opts)?;
        info!("created network {}", list.name);
        Ok(list)
    }

    pub fn inspect_network(&self, name_or_id: &str) -> Result<NetworkConfList, CoreError> {
        Ok(self.networks().get(name_or_id)?)
    }

    pub fn list_networks(&self) -> Result<Vec<NetworkConfList>, CoreError> {
        Ok(self.networks().list()?)
    }

    /// Names of the containers attached to `network`.
    pub fn network_users(&self, network: &str) -> Result<Vec<String>, CoreError> {
        Ok(self
            .containers()?
            .iter()
            .filter(|r| uses_network(r, network))
            .map(|r| container_name(r).to_owned())
            .collect())
    }

    /// Remove a network nobody is attached to; returns its name.
    pub fn remove_network(&self, name_or_id: &str) -> Result<String, CoreError> {
        let list = self.networks().get(name_or_id)?;
        let users = self.network_users(&list.name)?;
        if !users.is_empty() {
            return Err(CoreError::Precondition(format!(
                "network {} is in use by container(s) {}",
                list.name,
                users.join(", ")
            )));
        }
        self.networks().remove(&list.name)?;
        info!("removed network {}", list.name);
        Ok(list.name)
    }

    /// Create a volume; an empty name gets a generated one.
    pub fn create_volume(&self, name: &str, labels: Labels, exist_ok: bool) -> Result<Volume, CoreError> {
        let name = if name.is_empty() {
            new_container_id()
        } else {
            name.to_owned()
        };
        self.volumes()
            .create(&name, labels, exist_ok)
            .map_err(CoreError::VolumeStore)
    }

    pub fn inspect_volume(&self, name: &str) -> Result<Volume, CoreError> {
        self.volumes().get(name).map_err(CoreError::VolumeStore)
    }

    pub fn list_volumes(&self) -> Result<Vec<Volume>, CoreError> {
        self.volumes().list().map_err(CoreError::VolumeStore)
    }

    pub fn volume_users(&self, volume: &str) -> Result<Vec<String>, CoreError> {
        Ok(self
            .containers()?
            .iter()
            .filter(|r| uses_volume(r, volume))
            .map(|r| container_name(r).to_owned())
            .collect())
    }

    /// Remove a volume no container mounts.
    pub fn remove_volume(&self, name: &str) -> Result<(), CoreError> {
        self.inspect_volume(name)?;
        let users = self.volume_users(name)?;
        if !users.is_empty() {
            return Err(CoreError::Precondition(format!(
                "volume {name} is in use by container(s) {}",
                users.join(", ")
            )));
        }
        self.volumes().remove(name).map_err(CoreError::VolumeStore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineOptions;
    use berth_runtime::MockSupervisor;
    use berth_schema::config::HostFacts;
    use berth_schema::{BerthConfig, RunOptions};
    use std::path::Path;
    use std::sync::Arc;

    fn engine(dir: &Path) -> Engine {
        let mut config = BerthConfig::defaults(&HostFacts::default());
        config.data_root = dir.join("root");
        config.cni_netconfpath = dir.join("net.d");
        let mut opts = EngineOptions::new(config);
        opts.proc_root = dir.join("proc");
        opts.host_resolv_conf = dir.join("resolv.conf");
        Engine::with_supervisor(opts, Arc::new(MockSupervisor::new()))
    }

    #[test]
    fn network_in_use_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        e.create_network(&CreateNetworkOptions {
            name: "front".to_owned(),
            ..CreateNetworkOptions::default()
        })
        .unwrap();
        e.run(&RunOptions {
            image: "alpine".to_owned(),
            name: Some("web".to_owned()),
            networks: vec!["front".to_owned()],
            detach: true,
            ..RunOptions::default()
        })
        .unwrap();
        let err = e.remove_network("front").unwrap_err();
        assert!(err.to_string().contains("in use"), "{err}");
        assert_eq!(e.network_users("front").unwrap(), vec!["web"]);

        e.remove("web", true, false).unwrap();
        assert_eq!(e.remove_network("front").unwrap(), "front");
        assert!(e.inspect_network("front").is_err());
    }

    #[test]
    fn volume_in_use_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        e.create_volume("data", Labels::new(), false).unwrap();
        e.run(&RunOptions {
            image: "alpine".to_owned(),
            name: Some("db".to_owned()),
            volumes: vec!["data:/var/lib/data".to_owned()],
            detach: true,
            ..RunOptions::default()
        })
        .unwrap();
        assert!(e.remove_volume("data").is_err());
        e.remove("db", true, false).unwrap();
        e.remove_volume("data").unwrap();
        assert!(e.list_volumes().unwrap().is_empty());
    }

    #[test]
    fn unnamed_volume_gets_an_id() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let v = e.create_volume("", Labels::new(), false).unwrap();
        assert_eq!(v.name.len(), 64);
        assert!(e.remove_volume("missing").unwrap_err().is_not_found());
    }
}
