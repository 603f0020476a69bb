use crate::error::ProbeError;
use crate::types::SubnetEntry;
use anyhow::Result;
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Subnets needing more usable addresses than this are refused before scanning.
pub const MAX_HOST_LIMIT: u64 = 65_536;

/// Used when no usable interface can be found.
pub const FALLBACK_SUBNET: &str = "192.168.1.0/24";

const MAX_LABEL_CHARS: usize = 20;

/// Parse IPv4 CIDR notation into its network address and prefix length.
///
/// Host bits in the address part are masked off, so `10.1.2.3/24` yields
/// `10.1.2.0`. IPv6 input and prefixes outside `0..=32` are rejected.
pub fn parse_cidr(text: &str) -> Result<(Ipv4Addr, u8), ProbeError> {
    let trimmed = text.trim();
    match trimmed.parse::<IpNet>() {
        Ok(IpNet::V4(net)) => Ok((net.network(), net.prefix_len())),
        Ok(IpNet::V6(_)) => Err(ProbeError::InvalidCidr(format!(
            "{trimmed}: only IPv4 subnets are supported"
        ))),
        Err(e) => Err(ProbeError::InvalidCidr(format!("{trimmed}: {e}"))),
    }
}

/// Number of usable host addresses for a prefix length.
///
/// Point-to-point (/31) and host (/32) prefixes have none.
pub fn host_count(prefix: u8) -> u64 {
    if prefix >= 31 {
        return 0;
    }
    (1u64 << (32 - prefix)) - 2
}

/// Host count for a CIDR string, or 0 when it does not parse.
pub fn host_count_for(cidr: &str) -> u64 {
    parse_cidr(cidr).map(|(_, p)| host_count(p)).unwrap_or(0)
}

/// Check that a CIDR can be scanned and return its usable host count.
pub fn validate_subnet(cidr: &str) -> Result<u64, ProbeError> {
    let (_, prefix) = parse_cidr(cidr)?;
    let hosts = host_count(prefix);
    if hosts == 0 {
        return Err(ProbeError::EmptySubnet(cidr.trim().to_string()));
    }
    if hosts > MAX_HOST_LIMIT {
        return Err(ProbeError::SubnetTooLarge {
            hosts,
            max: MAX_HOST_LIMIT,
        });
    }
    Ok(hosts)
}

/// Lazy sequence of the usable host addresses of a subnet
/// (network + 1 up to broadcast - 1).
///
/// Nothing is materialized. A clone replays the remaining addresses, and
/// [`host_addresses`] can be called again for a fresh pass.
#[derive(Debug, Clone)]
pub struct HostAddresses {
    next: u64,
    end: u64,
}

impl Iterator for HostAddresses {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        if self.next >= self.end {
            return None;
        }
        let ip = Ipv4Addr::from(self.next as u32);
        self.next += 1;
        Some(ip)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.next);
        match usize::try_from(remaining) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

/// Build the host address sequence for `network/prefix`.
pub fn host_addresses(network: Ipv4Addr, prefix: u8) -> HostAddresses {
    if prefix >= 31 {
        return HostAddresses { next: 0, end: 0 };
    }
    let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = u32::from(network) & mask;
    let broadcast = network | !mask;
    HostAddresses {
        next: network as u64 + 1,
        end: broadcast as u64,
    }
}

/// Detect the directly connected IPv4 subnets of this machine.
///
/// Loopback interfaces and /31, /32 links are skipped; duplicates are removed
/// and each entry carries its interface name as label.
pub fn connected_subnets() -> Result<Vec<SubnetEntry>> {
    let mut seen = HashSet::<Ipv4Net>::new();
    let mut out = Vec::new();
    for iface in get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        if let IfAddr::V4(v4) = &iface.addr {
            let prefix = u32::from(v4.netmask).leading_ones() as u8;
            if prefix >= 31 {
                continue;
            }
            let net = match Ipv4Net::new(v4.ip, prefix) {
                Ok(n) => n.trunc(),
                Err(_) => continue,
            };
            if seen.insert(net) {
                out.push(SubnetEntry::with_label(
                    net.to_string(),
                    shorten_label(&iface.name),
                ));
            }
        }
    }
    // Sort for stable output
    out.sort_by_key(|e| {
        parse_cidr(&e.cidr)
            .map(|(n, p)| (u32::from(n), p))
            .unwrap_or((0, 0))
    });
    Ok(out)
}

/// Best guess at the subnet the user wants scanned first.
pub fn active_subnet() -> String {
    match connected_subnets() {
        Ok(list) => list
            .into_iter()
            .next()
            .map(|e| e.cidr)
            .unwrap_or_else(|| FALLBACK_SUBNET.to_string()),
        Err(e) => {
            tracing::debug!(error = %e, "interface enumeration failed");
            FALLBACK_SUBNET.to_string()
        }
    }
}

fn shorten_label(name: &str) -> String {
    if name.chars().count() > MAX_LABEL_CHARS {
        let head: String = name.chars().take(17).collect();
        format!("{head}…")
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_masks_host_bits() {
        let (net, prefix) = parse_cidr("10.1.2.3/24").unwrap();
        assert_eq!(net, Ipv4Addr::new(10, 1, 2, 0));
        assert_eq!(prefix, 24);
    }

    #[test]
    fn parse_rejects_ipv6_and_bad_prefix() {
        assert!(parse_cidr("fe80::/64").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("not a subnet").is_err());
    }

    #[test]
    fn small_subnet_excludes_network_and_broadcast() {
        // /30 -> 4 addresses: .0 network, .1 host, .2 host, .3 broadcast
        let hosts: Vec<_> = host_addresses(Ipv4Addr::new(192, 168, 1, 0), 30).collect();
        assert_eq!(
            hosts,
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 2)]
        );
    }

    #[test]
    fn top_of_address_space_does_not_overflow() {
        let hosts: Vec<_> = host_addresses(Ipv4Addr::new(255, 255, 255, 252), 30).collect();
        assert_eq!(hosts.len(), 2);
        assert_eq!(host_addresses(Ipv4Addr::BROADCAST, 32).count(), 0);
    }

    #[test]
    fn long_labels_are_shortened() {
        assert_eq!(shorten_label("eth0"), "eth0");
        let long = shorten_label("Ethernet adapter with a very long name");
        assert_eq!(long.chars().count(), 18);
        assert!(long.ends_with('…'));
    }
}
