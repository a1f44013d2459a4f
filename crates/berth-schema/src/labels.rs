//! Container label keys.
//!
//! Every value a hook needs is recorded here at create time; hooks never
//! re-derive anything from the runtime spec.

use crate::ports::PortMapping;
use crate::OptionsError;
use std::collections::BTreeMap;

pub const PREFIX: &str = "berth/";

pub const NAMESPACE: &str = "berth/namespace";
pub const NAME: &str = "berth/name";
pub const HOSTNAME: &str = "berth/hostname";
pub const DOMAINNAME: &str = "berth/domainname";
/// JSON array of `host:ip` entries.
pub const EXTRA_HOSTS: &str = "berth/extraHosts";
pub const STATE_DIR: &str = "berth/state-dir";
/// JSON array of network names, or a single `host`/`none`/`container:<id>` element.
pub const NETWORKS: &str = "berth/networks";
/// JSON array of [`PortMapping`].
pub const PORTS: &str = "berth/ports";
pub const IP_ADDRESS: &str = "berth/ip";
pub const IP6_ADDRESS: &str = "berth/ip6";
pub const MAC_ADDRESS: &str = "berth/mac-address";
pub const LOG_URI: &str = "berth/log-uri";
pub const LOG_CONFIG: &str = "berth/log-config";
pub const PID_FILE: &str = "berth/pid-file";
/// JSON array of generated volume names.
pub const ANONYMOUS_VOLUMES: &str = "berth/anonymous-volumes";
pub const PLATFORM: &str = "berth/platform";
/// JSON array of `source:destination` mount descriptions.
pub const MOUNTS: &str = "berth/mounts";
pub const BYPASS4NETNS: &str = "berth/bypass4netns";
pub const STOP_TIMEOUT: &str = "berth/stop-timeout";
pub const STOP_SIGNAL: &str = "berth/stop-signal";
pub const PID_CONTAINER: &str = "berth/pid-container";
pub const IPC: &str = "berth/ipc";
pub const DEFAULT_NETWORK: &str = "berth/default-network";
pub const RESTART: &str = "berth/restart";
pub const IMAGE: &str = "berth/image";
pub const CREATED_AT: &str = "berth/created-at";
/// Netns path to attach instead of `/proc/<pid>/ns/net`.
pub const NETWORK_NAMESPACE: &str = "berth/network-namespace";

pub const COMPOSE_PROJECT: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE: &str = "com.docker.compose.service";
pub const COMPOSE_NETWORK: &str = "com.docker.compose.network";
pub const COMPOSE_VOLUME: &str = "com.docker.compose.volume";

pub type Labels = BTreeMap<String, String>;

/// Encode a string list as the JSON array form stored in labels.
pub fn encode_list(values: &[String]) -> Result<String, OptionsError> {
    Ok(serde_json::to_string(values)?)
}

/// Decode a JSON-array label; a missing label decodes to an empty list.
pub fn decode_list(labels: &Labels, key: &str) -> Result<Vec<String>, OptionsError> {
    match labels.get(key) {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(Vec::new()),
    }
}

pub fn decode_ports(labels: &Labels) -> Result<Vec<PortMapping>, OptionsError> {
    match labels.get(PORTS) {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(Vec::new()),
    }
}

/// Boolean labels are stored as `"true"`/`"false"`.
pub fn decode_bool(labels: &Labels, key: &str) -> bool {
    labels.get(key).is_some_and(|v| v == "true")
}

/// Reject user-supplied labels that would shadow internal ones.
pub fn check_user_labels(labels: &Labels) -> Result<(), OptionsError> {
    if let Some(key) = labels.keys().find(|k| k.starts_with(PREFIX)) {
        return Err(OptionsError::Invalid(format!(
            "label key '{key}' uses the reserved prefix '{PREFIX}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_roundtrip_through_labels() {
        let mut labels = Labels::new();
        labels.insert(
            NETWORKS.to_owned(),
            encode_list(&["n1".to_owned(), "n2".to_owned()]).unwrap(),
        );
        assert_eq!(decode_list(&labels, NETWORKS).unwrap(), vec!["n1", "n2"]);
        assert!(decode_list(&labels, ANONYMOUS_VOLUMES).unwrap().is_empty());
    }

    #[test]
    fn bool_label() {
        let mut labels = Labels::new();
        assert!(!decode_bool(&labels, BYPASS4NETNS));
        labels.insert(BYPASS4NETNS.to_owned(), "true".to_owned());
        assert!(decode_bool(&labels, BYPASS4NETNS));
    }

    #[test]
    fn reserved_prefix_rejected() {
        let mut labels = Labels::new();
        labels.insert("app".to_owned(), "web".to_owned());
        assert!(check_user_labels(&labels).is_ok());
        labels.insert("berth/name".to_owned(), "x".to_owned());
        assert!(check_user_labels(&labels).is_err());
    }
}
