//! `/etc/resolv.conf`, `/etc/hostname`, and `/etc/hosts` contents for a container.

use std::fmt::Write as _;
use std::net::IpAddr;

pub const FALLBACK_NAMESERVERS: &[&str] = &["8.8.8.8", "8.8.4.4"];

/// The parts of a resolv.conf berth cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    pub nameservers: Vec<String>,
    pub search: Vec<String>,
    pub options: Vec<String>,
}

impl ResolvConf {
    pub fn parse(content: &str) -> Self {
        let mut conf = Self::default();
        for line in content.lines() {
            let line = line.split(['#', ';']).next().unwrap_or("").trim();
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => conf.nameservers.extend(fields.next().map(str::to_owned)),
                Some("search" | "domain") => {
                    conf.search = fields.map(str::to_owned).collect();
                }
                Some("options") => conf.options.extend(fields.map(str::to_owned)),
                _ => {}
            }
        }
        conf
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.search.is_empty() {
            let _ = writeln!(out, "search {}", self.search.join(" "));
        }
        for ns in &self.nameservers {
            let _ = writeln!(out, "nameserver {ns}");
        }
        if !self.options.is_empty() {
            let _ = writeln!(out, "options {}", self.options.join(" "));
        }
        out
    }
}

fn is_loopback(ns: &str) -> bool {
    ns.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// Resolver config for a container with its own network namespace.
///
/// Loopback nameservers from the host cannot be reached from inside the
/// container and are dropped; when nothing is left the public fallback
/// servers are used. Explicit `--dns*` values replace the host's.
pub fn container_resolv_conf(
    host: &str,
    dns: &[String],
    dns_search: &[String],
    dns_opt: &[String],
) -> String {
    let mut conf = ResolvConf::parse(host);
    conf.nameservers.retain(|ns| !is_loopback(ns));
    if !dns.is_empty() {
        conf.nameservers = dns.to_vec();
    }
    if conf.nameservers.is_empty() {
        conf.nameservers = FALLBACK_NAMESERVERS.iter().map(|s| (*s).to_owned()).collect();
    }
    if !dns_search.is_empty() {
        conf.search = if dns_search.iter().any(|s| s == ".") {
            Vec::new()
        } else {
            dns_search.to_vec()
        };
    }
    if !dns_opt.is_empty() {
        conf.options = dns_opt.to_vec();
    }
    conf.render()
}

/// Seed for a fresh hosts file; the managed region is filled in by the hosts store.
pub fn hosts_seed(hostname: &str) -> String {
    let mut out = String::from("127.0.0.1\tlocalhost localhost.localdomain\n::1\tlocalhost localhost.localdomain\n");
    if !hostname.is_empty() {
        let _ = writeln!(out, "127.0.1.1\t{hostname}");
    }
    out
}

/// A valid RFC 1123 hostname label sequence.
pub fn validate_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_servers_dropped_with_fallback() {
        let host = "# generated\nnameserver 127.0.0.53\noptions edns0 trust-ad\nsearch lan\n";
        let out = container_resolv_conf(host, &[], &[], &[]);
        assert!(!out.contains("127.0.0.53"));
        assert!(out.contains("nameserver 8.8.8.8\nnameserver 8.8.4.4\n"));
        assert!(out.contains("search lan"));
        assert!(out.contains("options edns0 trust-ad"));
    }

    #[test]
    fn explicit_dns_overrides_host() {
        let host = "nameserver 192.168.1.1\nsearch corp\n";
        let out = container_resolv_conf(
            host,
            &["1.1.1.1".to_owned()],
            &["example.com".to_owned()],
            &["ndots:2".to_owned()],
        );
        assert_eq!(
            out,
            "search example.com\nnameserver 1.1.1.1\noptions ndots:2\n"
        );
        let out = container_resolv_conf(host, &[], &[".".to_owned()], &[]);
        assert!(!out.contains("search"));
        assert!(out.contains("nameserver 192.168.1.1"));
    }

    #[test]
    fn hostnames() {
        assert!(validate_hostname("web-1.example"));
        assert!(!validate_hostname("-bad"));
        assert!(!validate_hostname("under_score"));
        assert!(hosts_seed("web").contains("127.0.1.1\tweb"));
    }
}
