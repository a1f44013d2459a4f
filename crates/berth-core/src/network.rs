//! Network mode resolution shared by the spec builder and the hook.

use berth_schema::OptionsError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    Host,
    None,
    /// Join another container's network namespace.
    Container(String),
    /// Join an existing namespace by path.
    Namespace(String),
    /// Attach to the named CNI networks, in order.
    Cni(Vec<String>),
}

impl NetworkMode {
    /// Resolve the `--network` list. `host`, `none`, `container:` and `ns:`
    /// must appear alone.
    pub fn parse(networks: &[String]) -> Result<Self, OptionsError> {
        let special = |n: &str| {
            n == "host" || n == "none" || n.starts_with("container:") || n.starts_with("ns:")
        };
        match networks {
            [] => Ok(Self::Cni(Vec::new())),
            [only] if only == "host" => Ok(Self::Host),
            [only] if only == "none" => Ok(Self::None),
            [only] if only.starts_with("container:") => {
                let target = &only["container:".len()..];
                if target.is_empty() {
                    return Err(OptionsError::Invalid(
                        "network container: requires a container".to_owned(),
                    ));
                }
                Ok(Self::Container(target.to_owned()))
            }
            [only] if only.starts_with("ns:") => Ok(Self::Namespace(only["ns:".len()..].to_owned())),
            many => {
                if let Some(bad) = many.iter().find(|n| special(n)) {
                    return Err(OptionsError::Conflict(format!(
                        "network \"{bad}\" cannot be combined with other networks"
                    )));
                }
                let mut seen: Vec<String> = Vec::new();
                for n in many {
                    if seen.contains(n) {
                        return Err(OptionsError::Invalid(format!("network {n} given twice")));
                    }
                    seen.push(n.clone());
                }
                Ok(Self::Cni(seen))
            }
        }
    }

    pub fn cni_networks(&self) -> &[String] {
        match self {
            Self::Cni(names) => names,
            _ => &[],
        }
    }

    /// Whether the container gets its own UTS identity (hostname, hosts file).
    pub fn owns_namespace(&self) -> bool {
        matches!(self, Self::Cni(_) | Self::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn special_modes() {
        assert_eq!(NetworkMode::parse(&v(&["host"])).unwrap(), NetworkMode::Host);
        assert_eq!(NetworkMode::parse(&v(&["none"])).unwrap(), NetworkMode::None);
        assert_eq!(
            NetworkMode::parse(&v(&["container:web"])).unwrap(),
            NetworkMode::Container("web".to_owned())
        );
        assert_eq!(
            NetworkMode::parse(&v(&["ns:/run/netns/x"])).unwrap(),
            NetworkMode::Namespace("/run/netns/x".to_owned())
        );
    }

    #[test]
    fn cni_lists() {
        let m = NetworkMode::parse(&v(&["n1", "n2"])).unwrap();
        assert_eq!(m.cni_networks(), ["n1", "n2"]);
        assert!(NetworkMode::parse(&v(&["n1", "host"])).is_err());
        assert!(NetworkMode::parse(&v(&["n1", "n1"])).is_err());
        assert!(NetworkMode::parse(&v(&["container:"])).is_err());
    }
}
