//! MAC address resolution from the operating system's neighbour cache.
//!
//! Only the cache is consulted; no ARP request is sent. Entries for hosts
//! that went offline a while ago may already have been evicted, so a miss
//! is normal and yields `None`.

use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use tokio::process::Command;

const PROC_NET_ARP: &str = "/proc/net/arp";

/// Look up the MAC address cached for `ip`, formatted `AA-BB-CC-DD-EE-FF`.
pub async fn lookup_mac(ip: Ipv4Addr) -> Option<String> {
    if cfg!(target_os = "linux") {
        if let Ok(table) = tokio::fs::read_to_string(PROC_NET_ARP).await {
            return parse_proc_arp(&table, ip);
        }
    }
    lookup_via_arp_command(ip).await
}

/// Find `ip` in the text of `/proc/net/arp`.
pub fn parse_proc_arp(table: &str, ip: Ipv4Addr) -> Option<String> {
    let wanted = ip.to_string();
    for line in table.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 || cols[0] != wanted {
            continue;
        }
        // Flags 0x0 marks an incomplete entry.
        if cols[2] == "0x0" {
            return None;
        }
        return normalize_mac(cols[3]);
    }
    None
}

async fn lookup_via_arp_command(ip: Ipv4Addr) -> Option<String> {
    let flag = if cfg!(windows) { "-a" } else { "-n" };
    let output = Command::new("arp")
        .arg(flag)
        .arg(ip.to_string())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    extract_mac(&String::from_utf8_lossy(&output.stdout))
}

fn mac_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([0-9A-Fa-f]{1,2}[:-]){5}[0-9A-Fa-f]{1,2}\b").expect("static MAC pattern")
    })
}

/// Pull the first MAC-looking token out of `arp` command output.
pub fn extract_mac(text: &str) -> Option<String> {
    mac_pattern()
        .find(text)
        .and_then(|m| normalize_mac(m.as_str()))
}

/// Normalize `a:b:c:d:e:f` / `aa-bb-..` spellings to `AA-BB-CC-DD-EE-FF`.
/// All-zero and broadcast addresses are rejected.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    let mut octets = [0u8; 6];
    for (slot, part) in octets.iter_mut().zip(&parts) {
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    if octets == [0; 6] || octets == [0xff; 6] {
        return None;
    }
    Some(
        octets
            .iter()
            .map(|o| format!("{o:02X}"))
            .collect::<Vec<_>>()
            .join("-"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         3c:84:6a:0b:1c:2d     *        eth0
192.168.1.20     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.33     0x1         0x2         b8:27:eb:aa:bb:cc     *        wlan0
";

    #[test]
    fn finds_complete_entries() {
        assert_eq!(
            parse_proc_arp(TABLE, Ipv4Addr::new(192, 168, 1, 1)).as_deref(),
            Some("3C-84-6A-0B-1C-2D")
        );
        assert_eq!(
            parse_proc_arp(TABLE, Ipv4Addr::new(192, 168, 1, 33)).as_deref(),
            Some("B8-27-EB-AA-BB-CC")
        );
    }

    #[test]
    fn incomplete_and_missing_entries_yield_none() {
        assert!(parse_proc_arp(TABLE, Ipv4Addr::new(192, 168, 1, 20)).is_none());
        assert!(parse_proc_arp(TABLE, Ipv4Addr::new(192, 168, 1, 99)).is_none());
    }

    #[test]
    fn extracts_from_bsd_and_windows_output() {
        let bsd = "? (192.168.1.5) at a4:5e:60:1:2:3 on en0 ifscope [ethernet]";
        assert_eq!(extract_mac(bsd).as_deref(), Some("A4-5E-60-01-02-03"));
        let win = "  192.168.1.5          00-15-5d-01-02-03     dynamic";
        assert_eq!(extract_mac(win).as_deref(), Some("00-15-5D-01-02-03"));
    }
}
