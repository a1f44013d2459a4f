//! Shared `/etc/hosts` view across the containers of a namespace.
//!
//! Each container owns `<etchosts>/<ns>/<id>/{hosts,meta.json}`. Every
//! acquire, release, or update rewrites the managed region of every hosts
//! file in the namespace while holding the namespace lock, so peers that
//! share a network always resolve each other.

use crate::locked::LockedStore;
use crate::StoreError;
use berth_schema::{CniResult, DEFAULT_NETWORK_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::debug;

pub const MARKER_BEGIN: &str = "# <nerdctl>";
pub const MARKER_END: &str = "# </nerdctl>";

const HOSTS_FILE: &str = "hosts";
const META_FILE: &str = "meta.json";

/// What peers need to know about one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkMeta {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domainname: String,
    /// host -> ip, from `--add-host`.
    #[serde(default)]
    pub extra_hosts: BTreeMap<String, String>,
    /// network name -> CNI result of the attach.
    #[serde(default)]
    pub networks: BTreeMap<String, CniResult>,
}

#[derive(Debug, Clone)]
pub struct HostsStore {
    store: LockedStore,
}

/// Tokens that resolve to `peer` on `network`.
fn peer_tokens(network: &str, peer: &NetworkMeta) -> Vec<String> {
    let mut bases = vec![peer.hostname.as_str()];
    if !peer.name.is_empty() {
        bases.push(peer.name.as_str());
    }
    let mut tokens = Vec::new();
    for base in bases.into_iter().filter(|b| !b.is_empty()) {
        if !peer.domainname.is_empty() {
            tokens.push(format!("{base}.{}", peer.domainname));
        }
        tokens.push(base.to_owned());
        if network != DEFAULT_NETWORK_NAME {
            tokens.push(format!("{base}.{network}"));
        }
    }
    tokens
}

/// Strip the managed region from an existing hosts file, keeping the rest verbatim.
fn unmanaged_part(current: &str) -> String {
    let mut out = String::with_capacity(current.len());
    let mut in_region = false;
    for line in current.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == MARKER_BEGIN {
            in_region = true;
            continue;
        }
        if trimmed == MARKER_END {
            in_region = false;
            continue;
        }
        if !in_region {
            out.push_str(line);
        }
    }
    out
}

/// Render the hosts file for `me` given the metas of every container in the namespace.
pub fn render_hosts(current: &str, me: &NetworkMeta, all: &[NetworkMeta]) -> String {
    let mut buf = unmanaged_part(current);
    if !buf.is_empty() && !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(MARKER_BEGIN);
    buf.push('\n');
    buf.push_str("127.0.0.1\tlocalhost localhost.localdomain\n");
    buf.push_str("::1\t\tlocalhost localhost.localdomain\n");

    for (host, ip) in &me.extra_hosts {
        let _ = writeln!(buf, "{ip:<15} {host}");
    }

    let mut lines: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for peer in all {
        for (network, result) in &peer.networks {
            if !me.networks.contains_key(network) {
                continue;
            }
            for ip in &result.ips {
                lines
                    .entry(ip.ip())
                    .or_default()
                    .extend(peer_tokens(network, peer));
            }
        }
    }
    for (ip, tokens) in lines {
        if !tokens.is_empty() {
            let _ = writeln!(buf, "{ip:<15} {}", tokens.join(" "));
        }
    }

    buf.push_str(MARKER_END);
    buf.push('\n');
    buf
}

impl HostsStore {
    /// `dir` is `<data-root>/etchosts/<ns>`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            store: LockedStore::new(dir),
        }
    }

    pub fn hosts_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        self.store.location(&[id, HOSTS_FILE])
    }

    fn read_meta(&self, id: &str) -> Result<Option<NetworkMeta>, StoreError> {
        match self.store.get(&[id, META_FILE]) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_all(&self) -> Result<Vec<NetworkMeta>, StoreError> {
        let mut metas = Vec::new();
        for id in self.store.list(&[])? {
            if let Some(meta) = self.read_meta(&id)? {
                metas.push(meta);
            }
        }
        Ok(metas)
    }

    /// Rewrite every hosts file that has a meta. Caller holds the lock.
    fn regenerate(&self) -> Result<(), StoreError> {
        let metas = self.read_all()?;
        for meta in &metas {
            let current = match self.store.get(&[&meta.id, HOSTS_FILE]) {
                Ok(data) => String::from_utf8_lossy(&data).into_owned(),
                Err(e) if e.is_not_found() => String::new(),
                Err(e) => return Err(e),
            };
            let content = render_hosts(&current, meta, &metas);
            self.store
                .write_in_place(content.as_bytes(), &[&meta.id, HOSTS_FILE])?;
        }
        debug!("regenerated {} hosts files", metas.len());
        Ok(())
    }

    /// Seed the hosts file before the container starts so it can be bind-mounted.
    pub fn alloc_hosts_file(&self, id: &str, content: &[u8]) -> Result<PathBuf, StoreError> {
        self.store.with_lock(|| {
            self.store.write_in_place(content, &[id, HOSTS_FILE])?;
            self.hosts_path(id)
        })
    }

    pub fn acquire(&self, meta: &NetworkMeta) -> Result<(), StoreError> {
        let data = serde_json::to_vec(meta)?;
        self.store.with_lock(|| {
            if !self.store.exists(&[&meta.id, HOSTS_FILE])? {
                self.store.write_in_place(b"", &[&meta.id, HOSTS_FILE])?;
            }
            self.store.set(&data, &[&meta.id, META_FILE])?;
            self.regenerate()
        })
    }

    /// Drop the meta (the hosts file stays for restarts) and regenerate peers.
    pub fn release(&self, id: &str) -> Result<(), StoreError> {
        self.store.with_lock(|| {
            match self.store.delete(&[id, META_FILE]) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            self.regenerate()
        })
    }

    pub fn update(&self, id: &str, new_name: &str) -> Result<(), StoreError> {
        self.store.with_lock(|| {
            let mut meta = self
                .read_meta(id)?
                .ok_or_else(|| StoreError::NotFound(format!("hosts meta for {id}")))?;
            new_name.clone_into(&mut meta.name);
            self.store
                .set(&serde_json::to_vec(&meta)?, &[id, META_FILE])?;
            self.regenerate()
        })
    }

    /// Remove the container's subtree. Missing entries are not an error.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.store.with_lock(|| match self.store.delete(&[id]) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        })
    }

    pub fn meta(&self, id: &str) -> Result<Option<NetworkMeta>, StoreError> {
        self.read_meta(id)
    }
}
