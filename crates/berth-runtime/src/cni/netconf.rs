//! CNI network configuration lists kept in the netconf directory.
//!
//! Each user network is a `berth-<name>.conflist` file with a
//! bridge + portmap + firewall + tuning chain. The default `bridge`
//! network is synthesized when no file defines it.

use crate::RuntimeError;
use berth_schema::{Labels, DEFAULT_NETWORK_NAME};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CNI_VERSION: &str = "1.0.0";
pub const CONFLIST_PREFIX: &str = "berth-";
pub const CONFLIST_SUFFIX: &str = ".conflist";
pub const DEFAULT_BRIDGE: &str = "berth0";
pub const DEFAULT_SUBNET: &str = "10.4.0.0/24";

/// Names that select a network mode rather than a CNI network.
pub const RESERVED_NAMES: &[&str] = &["host", "none"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfList {
    pub cni_version: String,
    pub name: String,
    #[serde(default)]
    pub berth: NetworkMetadata,
    pub plugins: Vec<serde_json::Value>,
    /// Where the list was read from; `None` for the synthesized default.
    #[serde(skip)]
    pub file: Option<PathBuf>,
}

impl NetworkConfList {
    pub fn labels(&self) -> &Labels {
        &self.berth.labels
    }

    /// Subnets configured on the IPAM of the first plugin.
    pub fn subnets(&self) -> Vec<String> {
        let mut out = Vec::new();
        for plugin in &self.plugins {
            let Some(ranges) = plugin
                .get("ipam")
                .and_then(|ipam| ipam.get("ranges"))
                .and_then(serde_json::Value::as_array)
            else {
                continue;
            };
            for set in ranges {
                for range in set.as_array().into_iter().flatten() {
                    if let Some(subnet) = range.get("subnet").and_then(serde_json::Value::as_str) {
                        out.push(subnet.to_owned());
                    }
                }
            }
        }
        out
    }

    pub fn gateway(&self) -> Option<String> {
        self.plugins.iter().find_map(|p| {
            p.get("ipam")?
                .get("ranges")?
                .get(0)?
                .get(0)?
                .get("gateway")?
                .as_str()
                .map(str::to_owned)
        })
    }

    pub fn bridge(&self) -> Option<&str> {
        self.plugins
            .iter()
            .find(|p| p.get("type").and_then(serde_json::Value::as_str) == Some("bridge"))
            .and_then(|p| p.get("bridge"))
            .and_then(serde_json::Value::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateNetworkOptions {
    pub name: String,
    pub driver: String,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub ip_range: Option<String>,
    pub labels: Labels,
}

/// Parse `a.b.c.d/len`.
pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8), RuntimeError> {
    let (addr, len) = s
        .split_once('/')
        .ok_or_else(|| RuntimeError::Invalid(format!("invalid subnet '{s}': expected CIDR")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| RuntimeError::Invalid(format!("invalid subnet '{s}'")))?;
    let len: u8 = len
        .parse()
        .ok()
        .filter(|l| *l <= 32)
        .ok_or_else(|| RuntimeError::Invalid(format!("invalid prefix length in '{s}'")))?;
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Ok((Ipv4Addr::from(u32::from(addr) & mask), len))
}

fn cidr_contains(net: (Ipv4Addr, u8), ip: Ipv4Addr) -> bool {
    let mask = if net.1 == 0 { 0 } else { u32::MAX << (32 - net.1) };
    u32::from(ip) & mask == u32::from(net.0)
}

fn overlaps(a: (Ipv4Addr, u8), b: (Ipv4Addr, u8)) -> bool {
    cidr_contains(a, b.0) || cidr_contains(b, a.0)
}

fn last_host(net: (Ipv4Addr, u8)) -> Ipv4Addr {
    let host_bits = if net.1 >= 32 { 0 } else { u32::MAX >> net.1 };
    Ipv4Addr::from((u32::from(net.0) | host_bits).saturating_sub(1))
}

/// Build the plugin chain for a bridge network.
pub fn bridge_plugins(
    bridge: &str,
    subnet: &str,
    gateway: &str,
    ip_range: Option<&str>,
) -> Result<Vec<serde_json::Value>, RuntimeError> {
    let mut range = json!({ "subnet": subnet, "gateway": gateway });
    if let Some(ip_range) = ip_range {
        let net = parse_cidr(ip_range)?;
        if !cidr_contains(parse_cidr(subnet)?, net.0) {
            return Err(RuntimeError::Invalid(format!(
                "ip-range {ip_range} is not within subnet {subnet}"
            )));
        }
        range["rangeStart"] = json!(Ipv4Addr::from(u32::from(net.0) + 1).to_string());
        range["rangeEnd"] = json!(last_host(net).to_string());
    }
    Ok(vec![
        json!({
            "type": "bridge",
            "bridge": bridge,
            "isGateway": true,
            "ipMasq": true,
            "hairpinMode": true,
            "ipam": {
                "type": "host-local",
                "ranges": [[range]],
                "routes": [{ "dst": "0.0.0.0/0" }]
            }
        }),
        json!({ "type": "portmap", "capabilities": { "portMappings": true } }),
        json!({ "type": "firewall", "ingressPolicy": "same-bridge" }),
        json!({ "type": "tuning" }),
    ])
}

pub fn network_id(name: &str) -> String {
    blake3::hash(name.as_bytes()).to_hex().to_string()
}

fn default_network() -> Result<NetworkConfList, RuntimeError> {
    Ok(NetworkConfList {
        cni_version: CNI_VERSION.to_owned(),
        name: DEFAULT_NETWORK_NAME.to_owned(),
        berth: NetworkMetadata {
            id: network_id(DEFAULT_NETWORK_NAME),
            labels: Labels::new(),
        },
        plugins: bridge_plugins(DEFAULT_BRIDGE, DEFAULT_SUBNET, "10.4.0.1", None)?,
        file: None,
    })
}

/// Network config lists under one netconf directory.
pub struct NetworkStore {
    dir: PathBuf,
}

impl NetworkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{CONFLIST_PREFIX}{name}{CONFLIST_SUFFIX}"))
    }

    /// All networks, sorted by name, the default one included.
    pub fn list(&self) -> Result<Vec<NetworkConfList>, RuntimeError> {
        let mut out = Vec::new();
        match std::fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("conflist") {
                        continue;
                    }
                    let data = std::fs::read(&path)?;
                    match serde_json::from_slice::<NetworkConfList>(&data) {
                        Ok(mut list) => {
                            list.file = Some(path);
                            out.push(list);
                        }
                        Err(e) => debug!("skipping {}: {e}", path.display()),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if !out.iter().any(|n| n.name == DEFAULT_NETWORK_NAME) {
            out.push(default_network()?);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Look a network up by name, full id, or unique id prefix.
    pub fn get(&self, name_or_id: &str) -> Result<NetworkConfList, RuntimeError> {
        let all = self.list()?;
        if let Some(n) = all.iter().find(|n| n.name == name_or_id) {
            return Ok(n.clone());
        }
        let matches: Vec<&NetworkConfList> = all
            .iter()
            .filter(|n| !name_or_id.is_empty() && n.berth.id.starts_with(name_or_id))
            .collect();
        match matches.as_slice() {
            [one] => Ok((*one).clone()),
            [] => Err(RuntimeError::NotFound(format!("network {name_or_id}"))),
            _ => Err(RuntimeError::Invalid(format!(
                "multiple networks match '{name_or_id}'"
            ))),
        }
    }

    pub fn create(&self, opts: &CreateNetworkOptions) -> Result<NetworkConfList, RuntimeError> {
        if !berth_schema::is_valid_object_name(&opts.name) || RESERVED_NAMES.contains(&opts.name.as_str()) {
            return Err(RuntimeError::Invalid(format!(
                "invalid network name '{}'",
                opts.name
            )));
        }
        if !opts.driver.is_empty() && opts.driver != "bridge" {
            return Err(RuntimeError::Invalid(format!(
                "unsupported network driver '{}'",
                opts.driver
            )));
        }
        let existing = self.list()?;
        if existing.iter().any(|n| n.name == opts.name) {
            return Err(RuntimeError::AlreadyExists(format!("network {}", opts.name)));
        }

        let subnet = match &opts.subnet {
            Some(s) => {
                let net = parse_cidr(s)?;
                format!("{}/{}", net.0, net.1)
            }
            None => next_free_subnet(&existing)?,
        };
        let net = parse_cidr(&subnet)?;
        let gateway = match &opts.gateway {
            Some(g) => {
                let ip: Ipv4Addr = g
                    .parse()
                    .map_err(|_| RuntimeError::Invalid(format!("invalid gateway '{g}'")))?;
                if !cidr_contains(net, ip) {
                    return Err(RuntimeError::Invalid(format!(
                        "gateway {g} is not within subnet {subnet}"
                    )));
                }
                g.clone()
            }
            None => Ipv4Addr::from(u32::from(net.0) + 1).to_string(),
        };

        let id = network_id(&opts.name);
        let list = NetworkConfList {
            cni_version: CNI_VERSION.to_owned(),
            name: opts.name.clone(),
            berth: NetworkMetadata {
                id: id.clone(),
                labels: opts.labels.clone(),
            },
            plugins: bridge_plugins(
                &format!("br-{}", &id[..12]),
                &subnet,
                &gateway,
                opts.ip_range.as_deref(),
            )?,
            file: Some(self.path_for(&opts.name)),
        };

        std::fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(&list)?)?;
        tmp.persist(self.path_for(&opts.name))
            .map_err(|e| RuntimeError::Io(e.error))?;
        debug!("created network {} ({subnet})", opts.name);
        Ok(list)
    }

    pub fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let list = self.get(name)?;
        let Some(file) = list.file else {
            return Err(RuntimeError::Precondition(format!(
                "network {} is built in and cannot be removed",
                list.name
            )));
        };
        std::fs::remove_file(&file)?;
        debug!("removed network {}", list.name);
        Ok(())
    }
}

/// Lowest `10.4.N.0/24` (N ≥ 1) that overlaps no existing subnet.
fn next_free_subnet(existing: &[NetworkConfList]) -> Result<String, RuntimeError> {
    let used: Vec<(Ipv4Addr, u8)> = existing
        .iter()
        .flat_map(NetworkConfList::subnets)
        .filter_map(|s| parse_cidr(&s).ok())
        .collect();
    for n in 1..=255u8 {
        let candidate = (Ipv4Addr::new(10, 4, n, 0), 24);
        if !used.iter().any(|u| overlaps(*u, candidate)) {
            return Ok(format!("10.4.{n}.0/24"));
        }
    }
    Err(RuntimeError::Precondition(
        "no free subnet left in 10.4.0.0/16".to_owned(),
    ))
}
