use crate::error::ProbeError;
use crate::types::{PortScanMode, PortScanRequest};
use futures::future::join_all;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub const LISTED_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
pub const FULL_RANGE_CONNECT_TIMEOUT: Duration = Duration::from_millis(300);
pub const BATCH_SIZE: u16 = 500;

/// The curated set probed in [`PortScanMode::Common`].
pub const COMMON_PORTS: &[(u16, &str)] = &[
    (21, "FTP"),
    (22, "SSH"),
    (23, "Telnet"),
    (25, "SMTP"),
    (53, "DNS"),
    (80, "HTTP"),
    (110, "POP3"),
    (135, "RPC"),
    (139, "NetBIOS"),
    (143, "IMAP"),
    (443, "HTTPS"),
    (445, "SMB"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (1433, "MSSQL"),
    (1723, "PPTP"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5432, "PostgreSQL"),
    (5900, "VNC"),
    (8080, "HTTP-Proxy"),
];

// Named when found open, but not part of the common sweep.
const EXTRA_SERVICES: &[(u16, &str)] = &[
    (5985, "WinRM"),
    (5986, "WinRM-SSL"),
    (8443, "HTTPS-Alt"),
    (8888, "HTTP-Dev"),
    (27017, "MongoDB"),
];

pub fn common_ports() -> Vec<u16> {
    COMMON_PORTS.iter().map(|&(p, _)| p).collect()
}

pub fn service_name(port: u16) -> Option<&'static str> {
    COMMON_PORTS
        .iter()
        .chain(EXTRA_SERVICES)
        .find(|&&(p, _)| p == port)
        .map(|&(_, name)| name)
}

/// `"80 (HTTP)"` for known services, plain `"8081"` otherwise.
pub fn format_port(port: u16) -> String {
    match service_name(port) {
        Some(name) => format!("{port} ({name})"),
        None => port.to_string(),
    }
}

/// Parse a user supplied port list separated by commas, spaces or semicolons.
///
/// Duplicates are dropped (first occurrence wins). Any token that is not a
/// number in 1..=65535 rejects the whole list.
pub fn parse_custom_ports(s: &str) -> Result<Vec<u16>, ProbeError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for token in s.split([',', ' ', ';', '\t', '\n']) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let port = parse_port_str(token)
            .ok_or_else(|| ProbeError::InvalidPortList(format!("invalid port value: {token}")))?;
        if seen.insert(port) {
            out.push(port);
        }
    }

    if out.is_empty() {
        return Err(ProbeError::InvalidPortList("no ports given".into()));
    }
    Ok(out)
}

fn parse_port_str(s: &str) -> Option<u16> {
    let val: u32 = s.parse().ok()?;
    if val == 0 || val > 65535 {
        return None;
    }
    Some(val as u16)
}

/// Split 1..=65535 into consecutive inclusive ranges of at most `size` ports.
pub fn port_batches(size: u16) -> impl Iterator<Item = RangeInclusive<u16>> {
    let size = u32::from(size.max(1));
    (1u32..=65535).step_by(size as usize).map(move |start| {
        let end = (start + size - 1).min(65535);
        start as u16..=end as u16
    })
}

/// True iff a TCP connect to `ip:port` completes within `timeout`.
pub async fn is_port_open(ip: Ipv4Addr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
    matches!(time::timeout(timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

async fn probe_all(
    ip: Ipv4Addr,
    ports: impl IntoIterator<Item = u16>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u16>, ProbeError> {
    let checks = ports.into_iter().map(move |port| async move {
        is_port_open(ip, port, timeout).await.then_some(port)
    });
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        found = join_all(checks) => Ok(found.into_iter().flatten().collect()),
    }
}

/// Probe `ip` according to `req` and return the open ports as display
/// strings, sorted by port number.
pub async fn scan_ports(
    ip: Ipv4Addr,
    req: &PortScanRequest,
    cancel: &CancellationToken,
) -> Result<Vec<String>, ProbeError> {
    let mut open = match req.mode {
        PortScanMode::Common => {
            probe_all(ip, common_ports(), LISTED_CONNECT_TIMEOUT, cancel).await?
        }
        PortScanMode::Custom => {
            probe_all(ip, req.custom_ports.iter().copied(), LISTED_CONNECT_TIMEOUT, cancel).await?
        }
        PortScanMode::All => {
            let mut open = Vec::new();
            for batch in port_batches(BATCH_SIZE) {
                if cancel.is_cancelled() {
                    return Err(ProbeError::Cancelled);
                }
                open.extend(probe_all(ip, batch, FULL_RANGE_CONNECT_TIMEOUT, cancel).await?);
            }
            open
        }
    };
    open.sort_unstable();
    tracing::debug!(%ip, mode = ?req.mode, open = open.len(), "port scan finished");
    Ok(open.into_iter().map(format_port).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mixed_delimiters_and_dedup() {
        let ports = parse_custom_ports("80, 443;22 80  8080").unwrap();
        assert_eq!(ports, vec![80, 443, 22, 8080]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_custom_ports("70000").is_err());
        assert!(parse_custom_ports("0").is_err());
        assert!(parse_custom_ports("80,http").is_err());
        assert!(parse_custom_ports(" ,; ").is_err());
    }

    #[test]
    fn formats_known_services() {
        assert_eq!(format_port(22), "22 (SSH)");
        assert_eq!(format_port(27017), "27017 (MongoDB)");
        assert_eq!(format_port(8081), "8081");
    }

    #[test]
    fn common_set_is_curated() {
        let c = common_ports();
        assert_eq!(c.len(), 21);
        assert!(c.contains(&80) && c.contains(&443) && c.contains(&3389));
    }

    #[test]
    fn last_batch_is_short() {
        let batches: Vec<_> = port_batches(BATCH_SIZE).collect();
        assert_eq!(batches.len(), 132);
        assert_eq!(batches[0], 1..=500);
        assert_eq!(batches[1], 501..=1000);
        assert_eq!(*batches.last().unwrap(), 65501..=65535);
    }
}
