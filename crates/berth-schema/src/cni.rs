//! CNI result document (spec version 1.0.0), as returned by `ADD`.
//!
//! Shared by the plugin client, which produces it, and the hosts store,
//! which keeps it in each container's network meta.

use serde::{Deserialize, Serialize};

/// Name of the network used when `--network` is not given.
pub const DEFAULT_NETWORK_NAME: &str = "bridge";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniIpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// CIDR notation, e.g. `10.4.0.2/24`.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

impl CniIpConfig {
    /// The address without its prefix length.
    pub fn ip(&self) -> &str {
        self.address
            .split_once('/')
            .map_or(self.address.as_str(), |(ip, _)| ip)
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip().contains(':')
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniRoute {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniDns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<CniInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<CniIpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<CniRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<CniDns>,
}

impl CniResult {
    pub fn first_ipv4(&self) -> Option<&str> {
        self.ips.iter().find(|ip| !ip.is_ipv6()).map(CniIpConfig::ip)
    }

    pub fn first_ipv6(&self) -> Option<&str> {
        self.ips.iter().find(|ip| ip.is_ipv6()).map(CniIpConfig::ip)
    }

    /// MAC of the interface inside the container sandbox.
    pub fn sandbox_mac(&self) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|i| !i.sandbox.is_empty())
            .map(|i| i.mac.as_str())
    }
}
