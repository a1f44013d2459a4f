//! Host port allocation from the kernel socket tables.
//!
//! Allocation is inherently racy against other processes binding ports;
//! callers retry on a late "address already in use".

use crate::RuntimeError;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

pub const PORT_RANGE_START: u16 = 49153;
pub const PORT_RANGE_END: u16 = 60999;

/// One row of `/proc/net/{tcp,udp}[6]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local_ip: IpAddr,
    pub local_port: u16,
}

/// Decode a kernel address word: 8 or 32 hex digits, each 4-byte group little-endian.
pub fn decode_address(hex: &str) -> Result<IpAddr, RuntimeError> {
    let invalid = || RuntimeError::Invalid(format!("malformed socket address '{hex}'"));
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(8) {
        if chunk.len() != 8 {
            return Err(invalid());
        }
        let word = std::str::from_utf8(chunk).map_err(|_| invalid())?;
        let value = u32::from_str_radix(word, 16).map_err(|_| invalid())?;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    match bytes.len() {
        4 => Ok(IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(invalid()),
    }
}

/// Parse a whole socket table. The header line is skipped.
pub fn parse_table(content: &str) -> Result<Vec<SocketEntry>, RuntimeError> {
    let mut out = Vec::new();
    for line in content.lines().skip(1) {
        let Some(local) = line.split_whitespace().nth(1) else {
            continue;
        };
        let (addr, port) = local
            .split_once(':')
            .ok_or_else(|| RuntimeError::Invalid(format!("malformed socket entry '{local}'")))?;
        let local_port = u16::from_str_radix(port, 16)
            .map_err(|_| RuntimeError::Invalid(format!("malformed port in '{local}'")))?;
        out.push(SocketEntry {
            local_ip: decode_address(addr)?,
            local_port,
        });
    }
    Ok(out)
}

/// Picks free host ports by scanning `<proc>/net`.
pub struct PortAllocator {
    proc_root: PathBuf,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl PortAllocator {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Ports in use that conflict with binding `host_ip`.
    ///
    /// An empty or unspecified `host_ip` binds every address, so any socket
    /// conflicts. Otherwise sockets on an unspecified address or on exactly
    /// `host_ip` do.
    pub fn used_ports(&self, protocol: &str, host_ip: &str) -> Result<BTreeSet<u16>, RuntimeError> {
        if !matches!(protocol, "tcp" | "udp") {
            return Err(RuntimeError::Invalid(format!(
                "unsupported protocol for port allocation: {protocol}"
            )));
        }
        let wanted: Option<IpAddr> = if host_ip.is_empty() {
            None
        } else {
            let ip: IpAddr = host_ip.parse().map_err(|_| {
                RuntimeError::Invalid(format!("invalid host ip '{host_ip}'"))
            })?;
            (!ip.is_unspecified()).then_some(ip)
        };
        let mut used = BTreeSet::new();
        for table in [protocol.to_owned(), format!("{protocol}6")] {
            let path = self.proc_root.join("net").join(&table);
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in parse_table(&content)? {
                let conflicts = match wanted {
                    None => true,
                    Some(ip) => entry.local_ip.is_unspecified() || entry.local_ip == ip,
                };
                if conflicts {
                    used.insert(entry.local_port);
                }
            }
        }
        Ok(used)
    }

    /// First port of the lowest free run of `count` ports in the ephemeral
    /// range. `exclude` holds ports already handed out but not yet bound.
    pub fn allocate(
        &self,
        protocol: &str,
        host_ip: &str,
        count: u16,
        exclude: &BTreeSet<u16>,
    ) -> Result<u16, RuntimeError> {
        let mut used = self.used_ports(protocol, host_ip)?;
        used.extend(exclude);
        lowest_free_run(&used, count).ok_or_else(|| {
            RuntimeError::Precondition(format!(
                "no free run of {count} {protocol} ports in {PORT_RANGE_START}-{PORT_RANGE_END}"
            ))
        })
    }
}

/// Lowest `s` with `[s, s+count-1]` inside the range and disjoint from `used`.
pub fn lowest_free_run(used: &BTreeSet<u16>, count: u16) -> Option<u16> {
    if count == 0 {
        return None;
    }
    let mut start = PORT_RANGE_START;
    loop {
        let end = start.checked_add(count - 1)?;
        if end > PORT_RANGE_END {
            return None;
        }
        match used.range(start..=end).next_back() {
            Some(&taken) => start = taken.checked_add(1)?,
            None => return Some(start),
        }
    }
}
