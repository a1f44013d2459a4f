//! `--publish` flag parsing.
//!
//! Accepted form: `[ip:][hostPort[-hostPortEnd]:]containerPort[-containerPortEnd][/proto]`.
//! Every port of a range expands to its own [`PortMapping`].

use crate::OptionsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "HostIP")]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: u16,
    #[serde(rename = "ContainerPort")]
    pub container_port: u16,
    #[serde(rename = "Protocol")]
    pub protocol: String,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}/{}",
            self.host_ip, self.host_port, self.container_port, self.protocol
        )
    }
}

/// Parse `start[-end]` into an inclusive range.
pub fn parse_port_range(s: &str) -> Result<(u16, u16), OptionsError> {
    let parse = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| OptionsError::InvalidPort(format!("invalid port '{p}' in '{s}'")))
    };
    let (start, end) = match s.split_once('-') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let p = parse(s)?;
            (p, p)
        }
    };
    if end < start {
        return Err(OptionsError::InvalidPort(format!(
            "invalid port range '{s}': end is lower than start"
        )));
    }
    Ok((start, end))
}

/// Split `ip:host:container` into its parts. IPv6 addresses may carry colons,
/// so everything before the last two fields is the IP.
fn split_parts(raw: &str) -> (String, &str, &str) {
    let parts: Vec<&str> = raw.split(':').collect();
    let n = parts.len();
    let container = parts[n - 1];
    match n {
        1 => (String::new(), "", container),
        2 => (String::new(), parts[0], container),
        3 => (parts[0].to_owned(), parts[1], container),
        _ => (parts[..n - 2].join(":"), parts[n - 2], container),
    }
}

/// Parse one `--publish` value.
///
/// `allocate(protocol, host_ip, count)` is consulted only when no host port
/// is given; it returns the first port of a free contiguous run.
pub fn parse_flag_p(
    s: &str,
    allocate: impl FnOnce(&str, &str, u16) -> Result<u16, OptionsError>,
) -> Result<Vec<PortMapping>, OptionsError> {
    let (spec, protocol) = match s.split('/').collect::<Vec<_>>().as_slice() {
        [spec] => (*spec, "tcp".to_owned()),
        [spec, proto] => {
            let proto = proto.to_lowercase();
            if !matches!(proto.as_str(), "tcp" | "udp" | "sctp") {
                return Err(OptionsError::InvalidPort(format!(
                    "invalid protocol '{proto}' in '{s}'"
                )));
            }
            (*spec, proto)
        }
        _ => {
            return Err(OptionsError::InvalidPort(format!(
                "failed to parse '{s}': unexpected slashes"
            )))
        }
    };

    let (ip, host_port, container_port) = split_parts(spec);
    if container_port.is_empty() {
        return Err(OptionsError::InvalidPort(format!("no port specified: {spec}")));
    }
    let ip = ip.trim_start_matches('[').trim_end_matches(']').to_owned();
    let host_ip = if ip.is_empty() {
        "0.0.0.0".to_owned()
    } else {
        ip.parse::<IpAddr>()
            .map_err(|_| OptionsError::InvalidPort(format!("invalid ip address: {ip}")))?;
        ip.clone()
    };

    let (c_start, c_end) = parse_port_range(container_port)?;
    let (h_start, h_end) = if host_port.is_empty() {
        let span = c_end - c_start;
        let count = span.checked_add(1).ok_or_else(|| {
            OptionsError::InvalidPort(format!("too many ports in '{container_port}'"))
        })?;
        let start = allocate(&protocol, &ip, count)?;
        let end = start.checked_add(span).ok_or_else(|| {
            OptionsError::InvalidPort(format!("no free host range for '{container_port}'"))
        })?;
        (start, end)
    } else {
        parse_port_range(host_port)?
    };
    if !host_port.is_empty() && (c_end - c_start) != (h_end - h_start) && c_end != c_start {
        return Err(OptionsError::InvalidPort(format!(
            "invalid ranges specified for container and host ports: {container_port} and {host_port}"
        )));
    }

    Ok((0..=(c_end - c_start))
        .map(|i| PortMapping {
            host_ip: host_ip.clone(),
            host_port: h_start + i,
            container_port: c_start + i,
            protocol: protocol.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_alloc(_: &str, _: &str, _: u16) -> Result<u16, OptionsError> {
        panic!("allocator must not be called when a host port is given")
    }

    #[test]
    fn single_port_defaults_to_tcp_any() {
        let m = parse_flag_p("8080:80", no_alloc).unwrap();
        assert_eq!(
            m,
            vec![PortMapping {
                host_ip: "0.0.0.0".to_owned(),
                host_port: 8080,
                container_port: 80,
                protocol: "tcp".to_owned(),
            }]
        );
    }

    #[test]
    fn ranges_expand_pairwise() {
        let m = parse_flag_p("3000-3001:8080-8081/tcp", no_alloc).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!((m[0].host_port, m[0].container_port), (3000, 8080));
        assert_eq!((m[1].host_port, m[1].container_port), (3001, 8081));
    }

    #[test]
    fn ip_and_protocol() {
        let m = parse_flag_p("127.0.0.1:53:53/UDP", no_alloc).unwrap();
        assert_eq!(m[0].host_ip, "127.0.0.1");
        assert_eq!(m[0].protocol, "udp");
    }

    #[test]
    fn ipv6_host_ip() {
        let m = parse_flag_p("[::1]:8080:80", no_alloc).unwrap();
        assert_eq!(m[0].host_ip, "::1");
        let m = parse_flag_p("::1:8080:80", no_alloc).unwrap();
        assert_eq!(m[0].host_ip, "::1");
    }

    #[test]
    fn unequal_ranges_rejected() {
        assert!(parse_flag_p("3000-3002:8080-8081", no_alloc).is_err());
    }

    #[test]
    fn host_range_to_single_container_port_allowed() {
        let m = parse_flag_p("3000-3002:80", no_alloc).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].host_port, 3000);
    }

    #[test]
    fn missing_host_port_uses_allocator() {
        let m = parse_flag_p("80-81", |proto, ip, count| {
            assert_eq!(proto, "tcp");
            assert_eq!(ip, "");
            assert_eq!(count, 2);
            Ok(49153)
        })
        .unwrap();
        assert_eq!(m[0].host_port, 49153);
        assert_eq!(m[1].host_port, 49154);
        assert_eq!(m[1].container_port, 81);
    }

    #[test]
    fn bad_inputs() {
        assert!(parse_flag_p("80/icmp", no_alloc).is_err());
        assert!(parse_flag_p("80/tcp/x", no_alloc).is_err());
        assert!(parse_flag_p("1.2.3:80:80", no_alloc).is_err());
        assert!(parse_flag_p("8080:", no_alloc).is_err());
        assert!(parse_flag_p("99999:80", no_alloc).is_err());
        assert!(parse_port_range("90-80").is_err());
    }

    #[test]
    fn full_range_without_host_port_is_rejected() {
        let err = parse_flag_p("0-65535", no_alloc).unwrap_err();
        assert!(err.to_string().starts_with("invalid argument:"));

        // An allocated start too close to the top cannot hold the range.
        assert!(parse_flag_p("80-81", |_, _, _| Ok(u16::MAX)).is_err());
        let m = parse_flag_p("1-65535", |_, _, count| {
            assert_eq!(count, u16::MAX);
            Ok(1)
        })
        .unwrap();
        assert_eq!(m.last().map(|p| p.host_port), Some(u16::MAX));
    }

    #[test]
    fn label_encoding_uses_docker_field_names() {
        let m = parse_flag_p("127.0.0.1:8080:80", no_alloc).unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"HostIP\":\"127.0.0.1\""));
        assert!(json.contains("\"ContainerPort\":80"));
    }
}
