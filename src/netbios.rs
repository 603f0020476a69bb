//! NetBIOS Node Status (NBSTAT) lookup, used as hostname fallback for
//! Windows machines that never registered in DNS.

use crate::error::ProbeError;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub const NETBIOS_PORT: u16 = 137;
pub const NETBIOS_TIMEOUT: Duration = Duration::from_millis(1000);

const REQUEST_LEN: usize = 50;
const TRANSACTION_ID: [u8; 2] = [0xA5, 0x28];
const NAME_ENTRY_LEN: usize = 18;
const NAME_LEN: usize = 15;
const GROUP_FLAG: u16 = 0x8000;

/// Build the 50-byte Node Status request for the wildcard name `*`.
pub fn build_node_status_request() -> [u8; REQUEST_LEN] {
    let mut req = [0u8; REQUEST_LEN];
    req[0..2].copy_from_slice(&TRANSACTION_ID);
    req[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    req[12] = 0x20; // encoded name length
    // '*' half-byte encoded is "CK", the 15 padding NULs become 30 x 'A'
    req[13] = b'C';
    req[14] = b'K';
    req[15..45].fill(b'A');
    // req[45] terminates the name
    req[46..48].copy_from_slice(&0x0021u16.to_be_bytes()); // NBSTAT
    req[48..50].copy_from_slice(&0x0001u16.to_be_bytes()); // IN
    req
}

/// Extract the workstation name from a Node Status response.
///
/// The answer name is either a 2-byte compression pointer or the full
/// 34-byte encoded name; the name table follows the fixed record header.
/// The first unique (non-group) entry with suffix 0x00 wins.
pub fn parse_node_status_response(data: &[u8]) -> Option<String> {
    let count_offset = if data.len() > 50 && data[50] == 0xC0 {
        62
    } else {
        94
    };
    let count = *data.get(count_offset)? as usize;
    let mut entry = count_offset + 1;

    for _ in 0..count {
        if entry + NAME_ENTRY_LEN > data.len() {
            break;
        }
        let suffix = data[entry + NAME_LEN];
        let flags = u16::from_be_bytes([data[entry + 16], data[entry + 17]]);
        if suffix == 0x00 && flags & GROUP_FLAG == 0 {
            let raw = &data[entry..entry + NAME_LEN];
            let name: String = String::from_utf8_lossy(raw)
                .trim_end_matches([' ', '\0'])
                .to_string();
            if !name.trim().is_empty() {
                return Some(name);
            }
        }
        entry += NAME_ENTRY_LEN;
    }
    None
}

/// Ask `ip` for its NetBIOS name. Timeouts and socket errors yield `Ok(None)`;
/// only cancellation is reported as an error.
pub async fn query_name(
    ip: Ipv4Addr,
    cancel: &CancellationToken,
) -> Result<Option<String>, ProbeError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProbeError::Cancelled),
        res = time::timeout(NETBIOS_TIMEOUT, exchange(ip)) => match res {
            Ok(Ok(data)) => Ok(parse_node_status_response(&data)),
            Ok(Err(e)) => {
                tracing::trace!(%ip, error = %e, "netbios query failed");
                Ok(None)
            }
            Err(_) => Ok(None),
        },
    }
}

async fn exchange(ip: Ipv4Addr) -> std::io::Result<Vec<u8>> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.connect(SocketAddrV4::new(ip, NETBIOS_PORT)).await?;
    sock.send(&build_node_status_request()).await?;
    let mut buf = vec![0u8; 1024];
    let n = sock.recv(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}
