use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Placeholder used for hostnames and MAC addresses that could not be resolved.
pub const NOT_AVAILABLE: &str = "N/A";

/// Outcome of probing one address.
///
/// The round-trip time is only ever present on a reachable host; use
/// [`HostResult::mark_reachable`] / [`HostResult::mark_unreachable`] to keep
/// that pairing intact.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostResult {
    pub ip: Ipv4Addr,
    /// CIDR of the subnet this host was discovered in (empty for ad hoc probes).
    pub subnet: String,
    reachable: bool,
    rtt_ms: Option<u32>,
    /// IP TTL of the echo reply, 0 when unknown.
    pub ttl: u8,
    pub hostname: String,
    pub mac: String,
    pub vendor: String,
    pub open_ports: Vec<String>,
    #[serde(default)]
    pub probing: bool,
    #[serde(default)]
    pub port_scanning: bool,
    #[serde(default)]
    pub ports_scanned: bool,
}

impl HostResult {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            subnet: String::new(),
            reachable: false,
            rtt_ms: None,
            ttl: 0,
            hostname: NOT_AVAILABLE.to_string(),
            mac: NOT_AVAILABLE.to_string(),
            vendor: String::new(),
            open_ports: Vec::new(),
            probing: false,
            port_scanning: false,
            ports_scanned: false,
        }
    }

    pub fn mark_reachable(&mut self, rtt_ms: u32, ttl: u8) {
        self.reachable = true;
        self.rtt_ms = Some(rtt_ms);
        self.ttl = ttl;
    }

    pub fn mark_unreachable(&mut self) {
        self.reachable = false;
        self.rtt_ms = None;
        self.ttl = 0;
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn rtt_ms(&self) -> Option<u32> {
        self.rtt_ms
    }

    /// Numeric ordering key derived from the four octets.
    pub fn sort_key(&self) -> u32 {
        u32::from(self.ip)
    }

    pub fn has_mac(&self) -> bool {
        self.mac != NOT_AVAILABLE && !self.mac.is_empty()
    }

    pub fn status(&self) -> &'static str {
        if self.reachable {
            "Online"
        } else {
            "Offline"
        }
    }

    pub fn ping_display(&self) -> String {
        match self.rtt_ms {
            Some(ms) if self.reachable => format!("{ms} ms"),
            _ => "—".to_string(),
        }
    }

    /// Hostname cut to at most `max` characters for table output.
    pub fn short_hostname(&self, max: usize) -> &str {
        match self.hostname.char_indices().nth(max) {
            Some((cut, _)) => &self.hostname[..cut],
            None => &self.hostname,
        }
    }

    pub fn port_summary(&self) -> String {
        if self.open_ports.is_empty() {
            String::new()
        } else {
            format!("{} open", self.open_ports.len())
        }
    }

    /// Copy the enrichable fields of a fresh probe into this result,
    /// keeping subnet and port information.
    pub fn refresh_from(&mut self, fresh: &HostResult) {
        self.reachable = fresh.reachable;
        self.rtt_ms = fresh.rtt_ms;
        self.ttl = fresh.ttl;
        self.hostname = fresh.hostname.clone();
        self.mac = fresh.mac.clone();
        self.vendor = fresh.vendor.clone();
    }

    /// Best-effort operating system guess, see [`crate::probe::classify_os`].
    pub fn os_guess(&self) -> OsGuess {
        crate::probe::classify_os(self.ttl, &self.vendor, &self.hostname)
    }
}

/// Heuristic operating-system family.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OsGuess {
    Apple,
    Windows,
    Linux,
    Unknown,
}

impl fmt::Display for OsGuess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OsGuess::Apple => "Apple",
            OsGuess::Windows => "Windows",
            OsGuess::Linux => "Linux",
            OsGuess::Unknown => "",
        };
        f.write_str(s)
    }
}

/// A subnet queued for scanning.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubnetEntry {
    pub cidr: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_selected")]
    pub selected: bool,
}

fn default_selected() -> bool {
    true
}

impl SubnetEntry {
    /// Validate `cidr` against the host limit and build an entry for it.
    pub fn new(cidr: &str) -> Result<Self, crate::error::ProbeError> {
        crate::netdetect::validate_subnet(cidr)?;
        Ok(Self::with_label(cidr.trim().to_string(), String::new()))
    }

    pub(crate) fn with_label(cidr: String, label: String) -> Self {
        Self {
            cidr,
            label,
            selected: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PortScanMode {
    #[default]
    Common,
    All,
    Custom,
}

impl std::str::FromStr for PortScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "common" => Ok(PortScanMode::Common),
            "all" => Ok(PortScanMode::All),
            "custom" => Ok(PortScanMode::Custom),
            other => Err(format!("unknown port scan mode: {other}")),
        }
    }
}

/// A validated port scan request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortScanRequest {
    pub mode: PortScanMode,
    /// Parsed custom ports, only meaningful in [`PortScanMode::Custom`].
    pub custom_ports: Vec<u16>,
}

impl PortScanRequest {
    pub fn common() -> Self {
        Self {
            mode: PortScanMode::Common,
            custom_ports: Vec::new(),
        }
    }

    pub fn all() -> Self {
        Self {
            mode: PortScanMode::All,
            custom_ports: Vec::new(),
        }
    }

    /// Build a request from a mode and a delimiter separated port string.
    /// The string is only parsed for custom mode.
    pub fn parse(mode: PortScanMode, custom: &str) -> Result<Self, crate::error::ProbeError> {
        let custom_ports = match mode {
            PortScanMode::Custom => crate::ports::parse_custom_ports(custom)?,
            _ => Vec::new(),
        };
        Ok(Self { mode, custom_ports })
    }
}

/// Messages emitted by the scan orchestrator while it runs.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    SubnetStarted {
        cidr: String,
        index: usize,
        count: usize,
    },
    Host(HostResult),
    Progress {
        completed: u64,
        total: u64,
    },
}

/// Aggregate outcome of a (possibly multi-subnet) scan.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScanReport {
    pub scanned_total: u64,
    pub scanned_done: u64,
    pub reachable_count: u64,
    /// True when the scan was cut short; `hosts` then holds what finished.
    pub cancelled: bool,
    pub finished_at: String,
    pub hosts: Vec<HostResult>,
}
