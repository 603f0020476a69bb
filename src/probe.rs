use crate::arp;
use crate::error::ProbeError;
use crate::netbios;
use crate::ping::{EchoPinger, EchoReply};
use crate::types::{HostResult, OsGuess, NOT_AVAILABLE};
use crate::vendor::VendorDatabase;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PING_ATTEMPTS: usize = 3;
pub const PING_TIMEOUT: Duration = Duration::from_millis(1000);
pub const RETRY_GAP: Duration = Duration::from_millis(200);

const APPLE_HOST_MARKERS: &[&str] = &["iphone", "ipad", "macbook", "imac", "apple"];

/// Probes a single address and reports everything learned about it.
///
/// Implementations never fail for network reasons; an unreachable or
/// unresponsive host is still a valid [`HostResult`]. The only error is
/// [`ProbeError::Cancelled`].
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, ip: Ipv4Addr, cancel: &CancellationToken)
        -> Result<HostResult, ProbeError>;
}

/// Retried ping, then hostname / MAC / vendor enrichment.
pub struct HostProbe {
    pinger: Arc<dyn EchoPinger>,
    vendors: Arc<VendorDatabase>,
}

impl HostProbe {
    pub fn new(pinger: Arc<dyn EchoPinger>, vendors: Arc<VendorDatabase>) -> Self {
        Self { pinger, vendors }
    }

    async fn ping_with_retries(
        &self,
        ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<Option<EchoReply>, ProbeError> {
        for attempt in 0..PING_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }
            let reply = tokio::select! {
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                r = self.pinger.echo(ip, PING_TIMEOUT) => r,
            };
            if reply.is_some() {
                return Ok(reply);
            }
            if attempt + 1 < PING_ATTEMPTS {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                    _ = tokio::time::sleep(RETRY_GAP) => {}
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Prober for HostProbe {
    async fn probe(
        &self,
        ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<HostResult, ProbeError> {
        let mut result = HostResult::new(ip);

        if let Some(reply) = self.ping_with_retries(ip, cancel).await? {
            result.mark_reachable(reply.rtt_ms(), reply.ttl.unwrap_or(0));
            result.hostname = resolve_hostname(ip, cancel).await?;
        }
        // Unreachable hosts too: the neighbour cache may remember a recent device.
        if let Some(mac) = arp::lookup_mac(ip).await {
            result.vendor = self.vendors.lookup(&mac);
            result.mac = mac;
        }

        tracing::debug!(
            %ip,
            reachable = result.is_reachable(),
            rtt_ms = ?result.rtt_ms(),
            mac = %result.mac,
            "host probed"
        );
        Ok(result)
    }
}

/// Resolve a display name for `ip`: reverse DNS first, then a NetBIOS
/// Node Status query. Returns [`NOT_AVAILABLE`] when neither answers.
pub async fn resolve_hostname(
    ip: Ipv4Addr,
    cancel: &CancellationToken,
) -> Result<String, ProbeError> {
    let ptr = tokio::select! {
        _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
        name = reverse_lookup(IpAddr::V4(ip)) => name,
    };
    if let Some(name) = ptr {
        return Ok(name);
    }
    Ok(netbios::query_name(ip, cancel)
        .await?
        .unwrap_or_else(|| NOT_AVAILABLE.to_string()))
}

/// PTR lookup through the system resolver. Answers that merely echo the
/// address back are discarded.
pub async fn reverse_lookup(ip: IpAddr) -> Option<String> {
    let name = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok())
        .await
        .ok()
        .flatten()?;
    let name = name.trim().trim_end_matches('.').to_string();
    if name.is_empty() || name == ip.to_string() {
        None
    } else {
        Some(name)
    }
}

/// Best-effort OS family from reply TTL plus vendor / hostname hints.
///
/// This is a heuristic: default TTLs are configurable and routers in
/// between lower them, so the answer is a hint and never authoritative.
pub fn classify_os(ttl: u8, vendor: &str, hostname: &str) -> OsGuess {
    if ttl == 0 {
        return OsGuess::Unknown;
    }
    let vendor = vendor.to_lowercase();
    let hostname = hostname.to_lowercase();

    let apple_vendor = vendor.contains("apple");
    let apple_host = APPLE_HOST_MARKERS.iter().any(|m| hostname.contains(m));
    if apple_vendor || apple_host {
        return OsGuess::Apple;
    }
    if ttl > 100 && ttl <= 128 {
        return OsGuess::Windows;
    }
    if ttl > 32 && ttl <= 64 {
        return OsGuess::Linux;
    }
    if vendor.contains("microsoft") {
        return OsGuess::Windows;
    }
    if vendor.contains("google") {
        return OsGuess::Linux;
    }
    OsGuess::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` echoes, then answers.
    struct FlakyPinger {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EchoPinger for FlakyPinger {
        async fn echo(&self, _addr: Ipv4Addr, _timeout: Duration) -> Option<EchoReply> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (n >= self.failures).then_some(EchoReply {
                rtt: Duration::from_millis(4),
                ttl: Some(128),
            })
        }
    }

    fn probe_with(failures: usize) -> (HostProbe, Arc<FlakyPinger>) {
        let pinger = Arc::new(FlakyPinger {
            failures,
            calls: AtomicUsize::new(0),
        });
        let probe = HostProbe::new(pinger.clone(), Arc::new(VendorDatabase::builtin()));
        (probe, pinger)
    }

    #[test]
    fn ttl_heuristic() {
        assert_eq!(classify_os(0, "Apple", "iPhone"), OsGuess::Unknown);
        assert_eq!(classify_os(64, "Apple", ""), OsGuess::Apple);
        assert_eq!(classify_os(128, "", "Johns-MacBook-Pro"), OsGuess::Apple);
        assert_eq!(classify_os(128, "Dell", "desktop"), OsGuess::Windows);
        assert_eq!(classify_os(63, "", ""), OsGuess::Linux);
        assert_eq!(classify_os(255, "Microsoft", ""), OsGuess::Windows);
        assert_eq!(classify_os(255, "Google", ""), OsGuess::Linux);
        assert_eq!(classify_os(255, "Cisco", "switch"), OsGuess::Unknown);
    }

    #[tokio::test]
    async fn third_attempt_wins() {
        let (probe, pinger) = probe_with(2);
        let cancel = CancellationToken::new();
        let reply = probe.ping_with_retries(Ipv4Addr::LOCALHOST, &cancel).await.unwrap();
        assert!(reply.is_some());
        assert_eq!(pinger.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_after_all_attempts() {
        let (probe, pinger) = probe_with(usize::MAX);
        let cancel = CancellationToken::new();
        let result = probe
            .probe(Ipv4Addr::new(192, 0, 2, 7), &cancel)
            .await
            .unwrap();
        assert!(!result.is_reachable());
        assert_eq!(result.rtt_ms(), None);
        assert_eq!(result.hostname, NOT_AVAILABLE);
        assert_eq!(pinger.calls.load(Ordering::SeqCst), PING_ATTEMPTS);
    }

    #[tokio::test]
    async fn cancelled_probe_reports_cancellation() {
        let (probe, _) = probe_with(usize::MAX);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = probe
            .probe(Ipv4Addr::new(192, 0, 2, 8), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn rescan_of_stable_host_is_identical() {
        let (probe, _) = probe_with(usize::MAX);
        let cancel = CancellationToken::new();
        let ip = Ipv4Addr::new(192, 0, 2, 9);
        let first = probe.probe(ip, &cancel).await.unwrap();
        let second = probe.probe(ip, &cancel).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rescan_of_answering_host_is_identical() {
        let (probe, _) = probe_with(0);
        let cancel = CancellationToken::new();
        let first = probe.probe(Ipv4Addr::LOCALHOST, &cancel).await.unwrap();
        assert!(first.is_reachable());
        assert_eq!(first.rtt_ms(), Some(4));
        assert_eq!(first.ttl, 128);

        let second = probe.probe(Ipv4Addr::LOCALHOST, &cancel).await.unwrap();
        assert_eq!(first, second);

        let mut kept = first.clone();
        kept.open_ports = vec!["22".into()];
        kept.refresh_from(&second);
        assert_eq!(kept.open_ports, ["22"]);
        kept.open_ports.clear();
        assert_eq!(kept, first);
    }
}
