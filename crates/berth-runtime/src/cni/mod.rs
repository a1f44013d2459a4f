//! Client for CNI plugin chains.
//!
//! Plugins are not safe to run concurrently against the same config dir;
//! callers hold the CNI lock around [`Cni::setup`] and [`Cni::remove`].

pub mod netconf;

pub use netconf::{CreateNetworkOptions, NetworkConfList, NetworkStore};

use crate::RuntimeError;
use berth_schema::{CniResult, PortMapping};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-attachment options passed to every plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceOpts {
    pub port_mappings: Vec<PortMapping>,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub ip6: Option<String>,
}

impl NamespaceOpts {
    /// `CNI_ARGS` value.
    pub fn cni_args(&self) -> String {
        let mut args = vec!["IgnoreUnknown=1".to_owned()];
        if let Some(ip) = &self.ip {
            args.push(format!("IP={ip}"));
        }
        if let Some(mac) = &self.mac {
            args.push(format!("MAC={mac}"));
        }
        args.join(";")
    }

    /// Capability arguments for `runtimeConfig`, limited to what the plugin declares.
    pub fn runtime_config(&self, capabilities: Option<&Value>) -> Option<Value> {
        let caps = capabilities?;
        let enabled = |name: &str| caps.get(name).and_then(Value::as_bool) == Some(true);
        let mut config = serde_json::Map::new();
        if enabled("portMappings") && !self.port_mappings.is_empty() {
            let mappings: Vec<Value> = self
                .port_mappings
                .iter()
                .map(|p| {
                    json!({
                        "hostPort": p.host_port,
                        "containerPort": p.container_port,
                        "protocol": p.protocol,
                        "hostIP": p.host_ip,
                    })
                })
                .collect();
            config.insert("portMappings".to_owned(), Value::Array(mappings));
        }
        if enabled("mac") {
            if let Some(mac) = &self.mac {
                config.insert("mac".to_owned(), json!(mac));
            }
        }
        if enabled("ips") {
            let ips: Vec<&String> = self.ip.iter().chain(self.ip6.iter()).collect();
            if !ips.is_empty() {
                config.insert("ips".to_owned(), json!(ips));
            }
        }
        (!config.is_empty()).then_some(Value::Object(config))
    }
}

/// A CNI client able to attach and detach a network namespace.
pub trait Cni: Send + Sync {
    /// Run `ADD` for every network, interface `eth<i>` for the i-th one.
    fn setup(
        &self,
        networks: &[NetworkConfList],
        full_id: &str,
        netns: &str,
        opts: &NamespaceOpts,
    ) -> Result<BTreeMap<String, CniResult>, RuntimeError>;

    /// Run `DEL` for every network in reverse plugin order.
    fn remove(
        &self,
        networks: &[NetworkConfList],
        full_id: &str,
        netns: &str,
        opts: &NamespaceOpts,
    ) -> Result<(), RuntimeError>;
}

/// Runs plugin binaries found on the CNI path.
pub struct ExecCni {
    plugin_dirs: Vec<PathBuf>,
    cache_dir: PathBuf,
}

#[derive(serde::Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

impl ExecCni {
    pub fn new(plugin_dirs: Vec<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dirs,
            cache_dir: cache_dir.into(),
        }
    }

    fn find_plugin(&self, kind: &str) -> Result<PathBuf, RuntimeError> {
        self.plugin_dirs
            .iter()
            .map(|d| d.join(kind))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                RuntimeError::Cni(format!(
                    "failed to find plugin \"{kind}\" in path {:?}",
                    self.plugin_dirs
                ))
            })
    }

    fn cache_path(&self, network: &str, id: &str, ifname: &str) -> PathBuf {
        self.cache_dir
            .join("results")
            .join(format!("{network}-{id}-{ifname}"))
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &self,
        command: &str,
        list: &NetworkConfList,
        plugin: &Value,
        prev: Option<&Value>,
        id: &str,
        netns: &str,
        ifname: &str,
        opts: &NamespaceOpts,
    ) -> Result<Option<Value>, RuntimeError> {
        let kind = plugin
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::Cni(format!("network {}: plugin without type", list.name)))?;
        let binary = self.find_plugin(kind)?;

        let mut conf = plugin.clone();
        conf["cniVersion"] = json!(list.cni_version);
        conf["name"] = json!(list.name);
        if let Some(prev) = prev {
            conf["prevResult"] = prev.clone();
        }
        if let Some(rc) = opts.runtime_config(plugin.get("capabilities")) {
            conf["runtimeConfig"] = rc;
        }

        let path_env = std::env::join_paths(&self.plugin_dirs)
            .map_err(|e| RuntimeError::Cni(format!("invalid CNI path: {e}")))?;
        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", ifname)
            .env("CNI_ARGS", opts.cni_args())
            .env("CNI_PATH", path_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::Cni(format!("failed to run plugin {kind}: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&serde_json::to_vec(&conf)?)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            let msg = match serde_json::from_slice::<PluginError>(&output.stdout) {
                Ok(e) if e.details.is_empty() => format!("plugin type=\"{kind}\" failed (code {}): {}", e.code, e.msg),
                Ok(e) => format!("plugin type=\"{kind}\" failed (code {}): {}: {}", e.code, e.msg, e.details),
                Err(_) => format!(
                    "plugin type=\"{kind}\" failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            };
            return Err(RuntimeError::Cni(msg));
        }
        if command == "ADD" && !output.stdout.is_empty() {
            return Ok(Some(serde_json::from_slice(&output.stdout)?));
        }
        Ok(None)
    }

    fn add_network(
        &self,
        list: &NetworkConfList,
        id: &str,
        netns: &str,
        ifname: &str,
        opts: &NamespaceOpts,
    ) -> Result<CniResult, RuntimeError> {
        let mut prev: Option<Value> = None;
        for plugin in &list.plugins {
            if let Some(result) =
                self.invoke("ADD", list, plugin, prev.as_ref(), id, netns, ifname, opts)?
            {
                prev = Some(result);
            }
        }
        let result = prev.unwrap_or_else(|| json!({ "cniVersion": list.cni_version }));
        let cache = self.cache_path(&list.name, id, ifname);
        if let Some(parent) = cache.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&cache, serde_json::to_vec(&result)?)?;
        Ok(serde_json::from_value(result)?)
    }

    fn del_network(
        &self,
        list: &NetworkConfList,
        id: &str,
        netns: &str,
        ifname: &str,
        opts: &NamespaceOpts,
    ) -> Result<(), RuntimeError> {
        let cache = self.cache_path(&list.name, id, ifname);
        let prev: Option<Value> = std::fs::read(&cache)
            .ok()
            .and_then(|d| serde_json::from_slice(&d).ok());
        for plugin in list.plugins.iter().rev() {
            self.invoke("DEL", list, plugin, prev.as_ref(), id, netns, ifname, opts)?;
        }
        match std::fs::remove_file(&cache) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl Cni for ExecCni {
    fn setup(
        &self,
        networks: &[NetworkConfList],
        full_id: &str,
        netns: &str,
        opts: &NamespaceOpts,
    ) -> Result<BTreeMap<String, CniResult>, RuntimeError> {
        let mut results = BTreeMap::new();
        for (i, list) in networks.iter().enumerate() {
            let ifname = format!("eth{i}");
            debug!("cni ADD {} on {} ({ifname})", list.name, full_id);
            let result = self.add_network(list, full_id, netns, &ifname, opts)?;
            results.insert(list.name.clone(), result);
        }
        Ok(results)
    }

    fn remove(
        &self,
        networks: &[NetworkConfList],
        full_id: &str,
        netns: &str,
        opts: &NamespaceOpts,
    ) -> Result<(), RuntimeError> {
        let mut first_err = None;
        for (i, list) in networks.iter().enumerate().rev() {
            let ifname = format!("eth{i}");
            debug!("cni DEL {} on {} ({ifname})", list.name, full_id);
            if let Err(e) = self.del_network(list, full_id, netns, &ifname, opts) {
                warn!("cni DEL {} failed: {e}", list.name);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// In-memory CNI for tests. Hands out `10.4.<k>.<n>` addresses per network
/// and records every call as `setup:<net>:<id>` / `remove:<net>:<id>`.
#[derive(Default)]
pub struct MockCni {
    calls: Mutex<Vec<String>>,
    leases: Mutex<BTreeMap<(String, String), String>>,
    fail_setup: Mutex<Option<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
}

impl MockCni {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each call open for `delay` so overlapping callers are detectable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next `setup` fail with `msg`.
    pub fn fail_next_setup(&self, msg: &str) {
        if let Ok(mut f) = self.fail_setup.lock() {
            *f = Some(msg.to_owned());
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Whether two calls were ever in progress at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        if let Some(d) = self.delay {
            std::thread::sleep(d);
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn record(&self, entry: String) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .map_err(|e| RuntimeError::Cni(format!("mutex poisoned: {e}")))?
            .push(entry);
        Ok(())
    }

    fn lease(&self, index: usize, network: &str, id: &str, requested: Option<&str>) -> Result<String, RuntimeError> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| RuntimeError::Cni(format!("mutex poisoned: {e}")))?;
        let key = (network.to_owned(), id.to_owned());
        if let Some(ip) = requested {
            if leases.iter().any(|(k, v)| v == ip && *k != key) {
                return Err(RuntimeError::Cni(format!(
                    "failed to allocate {ip}: address already in use"
                )));
            }
            leases.insert(key, ip.to_owned());
            return Ok(ip.to_owned());
        }
        if let Some(ip) = leases.get(&key) {
            return Ok(ip.clone());
        }
        let used = leases.keys().filter(|(n, _)| n == network).count();
        let ip = format!("10.4.{index}.{}", used + 2);
        leases.insert(key, ip.clone());
        Ok(ip)
    }
}

impl Cni for MockCni {
    fn setup(
        &self,
        networks: &[NetworkConfList],
        full_id: &str,
        netns: &str,
        opts: &NamespaceOpts,
    ) -> Result<BTreeMap<String, CniResult>, RuntimeError> {
        self.enter();
        let result: Result<_, RuntimeError> = (|| {
            for list in networks {
                self.record(format!("setup:{}:{full_id}", list.name))?;
            }
            let injected = self
                .fail_setup
                .lock()
                .map_err(|e| RuntimeError::Cni(format!("mutex poisoned: {e}")))?
                .take();
            if let Some(msg) = injected {
                return Err(RuntimeError::Cni(msg));
            }
            let mut results = BTreeMap::new();
            for (i, list) in networks.iter().enumerate() {
                let requested = if i == 0 { opts.ip.as_deref() } else { None };
                let ip = self.lease(i, &list.name, full_id, requested)?;
                let result: CniResult = serde_json::from_value(json!({
                    "cniVersion": netconf::CNI_VERSION,
                    "interfaces": [{
                        "name": format!("eth{i}"),
                        "mac": opts.mac.clone().unwrap_or_else(|| format!("02:42:0a:04:{i:02x}:02")),
                        "sandbox": netns,
                    }],
                    "ips": [{ "interface": 0, "address": format!("{ip}/24") }],
                }))?;
                results.insert(list.name.clone(), result);
            }
            Ok(results)
        })();
        self.leave();
        result
    }

    fn remove(
        &self,
        networks: &[NetworkConfList],
        full_id: &str,
        _netns: &str,
        _opts: &NamespaceOpts,
    ) -> Result<(), RuntimeError> {
        self.enter();
        let result: Result<_, RuntimeError> = (|| {
            let mut leases = self
                .leases
                .lock()
                .map_err(|e| RuntimeError::Cni(format!("mutex poisoned: {e}")))?;
            for list in networks {
                leases.remove(&(list.name.clone(), full_id.to_owned()));
            }
            drop(leases);
            for list in networks {
                self.record(format!("remove:{}:{full_id}", list.name))?;
            }
            Ok(())
        })();
        self.leave();
        result
    }
}

/// Path of the lock file that serializes CNI work for a netconf dir.
pub fn lock_path(netconf_dir: &Path) -> PathBuf {
    netconf_dir.join(".berth-cni.lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_schema::Labels;

    fn network(name: &str) -> NetworkConfList {
        NetworkConfList {
            cni_version: netconf::CNI_VERSION.to_owned(),
            name: name.to_owned(),
            berth: netconf::NetworkMetadata {
                id: netconf::network_id(name),
                labels: Labels::new(),
            },
            plugins: netconf::bridge_plugins("br-test", "10.4.9.0/24", "10.4.9.1", None).unwrap(),
            file: None,
        }
    }

    #[test]
    fn runtime_config_respects_capabilities() {
        let opts = NamespaceOpts {
            port_mappings: vec![PortMapping {
                host_ip: "127.0.0.1".to_owned(),
                host_port: 8080,
                container_port: 80,
                protocol: "tcp".to_owned(),
            }],
            ip: Some("10.4.0.9".to_owned()),
            mac: None,
            ip6: Some("fd00::9".to_owned()),
        };
        let rc = opts
            .runtime_config(Some(&json!({ "portMappings": true })))
            .unwrap();
        assert_eq!(rc["portMappings"][0]["hostPort"], 8080);
        assert!(rc.get("ips").is_none());
        let rc = opts.runtime_config(Some(&json!({ "ips": true }))).unwrap();
        assert_eq!(rc["ips"], json!(["10.4.0.9", "fd00::9"]));
        assert!(opts.runtime_config(None).is_none());
        assert_eq!(opts.cni_args(), "IgnoreUnknown=1;IP=10.4.0.9");
    }

    #[test]
    fn missing_plugin_reports_cni_error() {
        let dir = tempfile::tempdir().unwrap();
        let cni = ExecCni::new(vec![dir.path().to_path_buf()], dir.path().join("cache"));
        let err = cni
            .setup(&[network("n1")], "abc", "/proc/1/ns/net", &NamespaceOpts::default())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Cni(ref m) if m.contains("bridge")), "{err}");
    }

    #[test]
    fn mock_leases_and_releases() {
        let cni = MockCni::new();
        let nets = [network("n1"), network("n2")];
        let res = cni
            .setup(&nets, "c1", "/proc/1/ns/net", &NamespaceOpts::default())
            .unwrap();
        assert_eq!(res["n1"].first_ipv4(), Some("10.4.0.2"));
        assert_eq!(res["n2"].first_ipv4(), Some("10.4.1.2"));
        let res = cni
            .setup(&nets[..1], "c2", "/proc/2/ns/net", &NamespaceOpts::default())
            .unwrap();
        assert_eq!(res["n1"].first_ipv4(), Some("10.4.0.3"));
        cni.remove(&nets, "c1", "", &NamespaceOpts::default()).unwrap();
        assert_eq!(
            cni.calls(),
            vec![
                "setup:n1:c1",
                "setup:n2:c1",
                "setup:n1:c2",
                "remove:n1:c1",
                "remove:n2:c1"
            ]
        );
        assert!(!cni.overlapped());
    }

    #[test]
    fn mock_static_ip_conflict() {
        let cni = MockCni::new();
        let nets = [network("n1")];
        let opts = NamespaceOpts {
            ip: Some("10.4.0.50".to_owned()),
            ..NamespaceOpts::default()
        };
        cni.setup(&nets, "c1", "", &opts).unwrap();
        let err = cni.setup(&nets, "c2", "", &opts).unwrap_err();
        assert!(err.is_addr_in_use());
    }

    #[test]
    fn mock_injected_failure() {
        let cni = MockCni::new();
        cni.fail_next_setup("plugin type=\"bridge\" failed: address already in use");
        assert!(cni
            .setup(&[network("n1")], "c1", "", &NamespaceOpts::default())
            .is_err());
        assert!(cni
            .setup(&[network("n1")], "c1", "", &NamespaceOpts::default())
            .is_ok());
    }
}
