//! Resolver latency benchmark.
//!
//! Each iteration takes two measurements: a lookup through the operating
//! system resolver (whatever caching it applies is part of the number) and
//! a hand-built A query for a random subdomain sent straight to the
//! resolver under test, which it cannot answer from cache.

use crate::error::ProbeError;
use serde::Serialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub const CACHED_LOOKUP_HOST: &str = "google.com";
pub const UNCACHED_BASE_DOMAIN: &str = "google.com";
pub const RAW_QUERY_TIMEOUT: Duration = Duration::from_millis(2000);
pub const ITERATION_PAUSE: Duration = Duration::from_millis(500);
pub const DNS_PORT: u16 = 53;

const FLAGS_RECURSION_DESIRED: u16 = 0x0100;
const QTYPE_A: u16 = 0x0001;
const QCLASS_IN: u16 = 0x0001;
const MAX_LABEL_LEN: usize = 63;

/// Public resolvers benchmarked by default.
pub const COMMON_RESOLVERS: &[(&str, Ipv4Addr)] = &[
    ("Google Public DNS", Ipv4Addr::new(8, 8, 8, 8)),
    ("Cloudflare DNS", Ipv4Addr::new(1, 1, 1, 1)),
    ("OpenDNS", Ipv4Addr::new(208, 67, 222, 222)),
    ("Quad9", Ipv4Addr::new(9, 9, 9, 9)),
];

pub const LOCAL_RESOLVER_NAME: &str = "Local / System Default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverTarget {
    pub name: String,
    pub address: IpAddr,
}

impl ResolverTarget {
    pub fn new(name: impl Into<String>, address: IpAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }

    /// Parse user input; a blank name falls back to the address text.
    pub fn parse(address: &str, name: &str) -> Result<Self, ProbeError> {
        let address: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| ProbeError::InvalidResolver(address.trim().to_string()))?;
        let name = match name.trim() {
            "" => address.to_string(),
            n => n.to_string(),
        };
        Ok(Self { name, address })
    }
}

/// Build the benchmark target list: the common public resolvers, then the
/// custom ones (duplicates by address dropped), then optionally the local
/// resolver on loopback.
pub fn benchmark_targets(custom: &[ResolverTarget], include_local: bool) -> Vec<ResolverTarget> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let common = COMMON_RESOLVERS
        .iter()
        .map(|&(name, ip)| ResolverTarget::new(name, IpAddr::V4(ip)));
    let local = include_local
        .then(|| ResolverTarget::new(LOCAL_RESOLVER_NAME, IpAddr::V4(Ipv4Addr::LOCALHOST)));

    for target in common.chain(custom.iter().cloned()).chain(local) {
        if seen.insert(target.address) {
            out.push(target);
        }
    }
    out
}

/// Min / max / mean of a sample set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl LatencyStats {
    pub fn of(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        Some(Self { min, max, avg })
    }
}

/// Running measurements for one resolver. Latencies are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsBenchmarkResult {
    pub name: String,
    pub address: IpAddr,
    pub cached: Vec<f64>,
    pub uncached: Vec<f64>,
    pub failed_queries: u64,
}

impl DnsBenchmarkResult {
    pub fn new(target: &ResolverTarget) -> Self {
        Self {
            name: target.name.clone(),
            address: target.address,
            cached: Vec::new(),
            uncached: Vec::new(),
            failed_queries: 0,
        }
    }

    pub fn record_cached(&mut self, latency_ms: f64) {
        if latency_ms >= 0.0 {
            self.cached.push(latency_ms);
        }
    }

    /// Negative latencies mark a failed raw query and are only counted.
    pub fn record_uncached(&mut self, latency_ms: f64) {
        if latency_ms >= 0.0 {
            self.uncached.push(latency_ms);
        } else {
            self.failed_queries += 1;
        }
    }

    pub fn cached_stats(&self) -> Option<LatencyStats> {
        LatencyStats::of(&self.cached)
    }

    pub fn uncached_stats(&self) -> Option<LatencyStats> {
        LatencyStats::of(&self.uncached)
    }
}

/// Encode a standard recursive A/IN query for `domain`.
///
/// Empty labels are skipped and over-long labels clipped to 63 bytes.
pub fn build_query(domain: &str, txid: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(12 + domain.len() + 6);
    packet.extend_from_slice(&txid.to_be_bytes());
    packet.extend_from_slice(&FLAGS_RECURSION_DESIRED.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0u8; 6]); // AN, NS, AR counts

    for label in domain.split('.').filter(|l| !l.is_empty()) {
        let bytes = &label.as_bytes()[..label.len().min(MAX_LABEL_LEN)];
        packet.push(bytes.len() as u8);
        packet.extend_from_slice(bytes);
    }
    packet.push(0);
    packet.extend_from_slice(&QTYPE_A.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
    packet
}

/// A fresh name under [`UNCACHED_BASE_DOMAIN`] no resolver has seen before.
pub fn random_subdomain() -> String {
    format!("{:032x}.{UNCACHED_BASE_DOMAIN}", rand::random::<u128>())
}

fn is_reply_to(reply: &[u8], txid: u16) -> bool {
    reply.len() >= 12 && reply[0..2] == txid.to_be_bytes() && reply[2] & 0x80 != 0
}

/// Time one uncached query against `resolver`. Returns -1.0 on timeout or
/// any socket error. Any well-formed reply counts, NXDOMAIN included.
pub async fn measure_raw_query(resolver: SocketAddr, domain: &str) -> f64 {
    match time::timeout(RAW_QUERY_TIMEOUT, raw_exchange(resolver, domain)).await {
        Ok(Ok(elapsed)) => elapsed.as_secs_f64() * 1000.0,
        Ok(Err(e)) => {
            tracing::debug!(%resolver, error = %e, "raw dns query failed");
            -1.0
        }
        Err(_) => -1.0,
    }
}

async fn raw_exchange(resolver: SocketAddr, domain: &str) -> std::io::Result<Duration> {
    let bind: SocketAddr = if resolver.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let sock = UdpSocket::bind(bind).await?;
    sock.connect(resolver).await?;

    let txid = rand::random::<u16>();
    let query = build_query(domain, txid);
    let mut buf = [0u8; 512];
    let start = Instant::now();
    sock.send(&query).await?;
    loop {
        let n = sock.recv(&mut buf).await?;
        if is_reply_to(&buf[..n], txid) {
            return Ok(start.elapsed());
        }
    }
}

/// Time a lookup through the system resolver. Returns -1.0 on failure.
pub async fn measure_system_lookup(host: &str) -> f64 {
    let start = Instant::now();
    match time::timeout(RAW_QUERY_TIMEOUT, tokio::net::lookup_host((host, 0))).await {
        Ok(Ok(_)) => start.elapsed().as_secs_f64() * 1000.0,
        _ => -1.0,
    }
}

/// Benchmark one resolver for `duration`, sending the updated result after
/// every iteration.
pub async fn run_benchmark(
    target: ResolverTarget,
    duration: Duration,
    cancel: CancellationToken,
    updates: mpsc::UnboundedSender<DnsBenchmarkResult>,
) -> Result<DnsBenchmarkResult, ProbeError> {
    let resolver = SocketAddr::new(target.address, DNS_PORT);
    let mut result = DnsBenchmarkResult::new(&target);
    let deadline = Instant::now() + duration;
    tracing::info!(resolver = %target.address, name = %target.name, ?duration, "dns benchmark started");

    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let cached = tokio::select! {
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            ms = measure_system_lookup(CACHED_LOOKUP_HOST) => ms,
        };
        result.record_cached(cached);

        let subdomain = random_subdomain();
        let uncached = tokio::select! {
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            ms = measure_raw_query(resolver, &subdomain) => ms,
        };
        result.record_uncached(uncached);

        let _ = updates.send(result.clone());
        tokio::select! {
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            _ = time::sleep(ITERATION_PAUSE) => {}
        }
    }

    tracing::info!(
        resolver = %target.address,
        samples = result.uncached.len(),
        failed = result.failed_queries,
        "dns benchmark finished"
    );
    Ok(result)
}

/// Benchmark all `targets` concurrently. Results come back fastest
/// (lowest mean uncached latency) first; resolvers that never answered go last.
pub async fn run_all(
    targets: Vec<ResolverTarget>,
    duration: Duration,
    cancel: CancellationToken,
    updates: mpsc::UnboundedSender<DnsBenchmarkResult>,
) -> Result<Vec<DnsBenchmarkResult>, ProbeError> {
    let mut set = JoinSet::new();
    for target in targets {
        set.spawn(run_benchmark(
            target,
            duration,
            cancel.clone(),
            updates.clone(),
        ));
    }

    let mut results = Vec::new();
    while let Some(res) = set.join_next().await {
        match res {
            Ok(Ok(r)) => results.push(r),
            Ok(Err(e)) => return Err(e),
            Err(e) => tracing::warn!(error = %e, "benchmark task panicked"),
        }
    }
    sort_by_uncached_avg(&mut results);
    Ok(results)
}

pub fn sort_by_uncached_avg(results: &mut [DnsBenchmarkResult]) {
    results.sort_by(|a, b| {
        let a = a.uncached_stats().map(|s| s.avg).unwrap_or(f64::INFINITY);
        let b = b.uncached_stats().map(|s| s.avg).unwrap_or(f64::INFINITY);
        a.total_cmp(&b)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_wire_format() {
        let q = build_query("abc.google.com", 0xBEEF);
        assert_eq!(&q[0..12], &[0xBE, 0xEF, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&q[12..16], &[3, b'a', b'b', b'c']);
        assert_eq!(&q[16..23], b"\x06google");
        assert_eq!(&q[23..27], b"\x03com");
        assert_eq!(&q[27..], &[0, 0, 1, 0, 1]);
    }

    #[test]
    fn random_labels_differ() {
        let a = random_subdomain();
        let b = random_subdomain();
        assert_ne!(a, b);
        assert!(a.ends_with(".google.com"));
        assert_eq!(a.split('.').next().map(str::len), Some(32));
    }

    #[test]
    fn reply_matching() {
        let mut reply = build_query("x.com", 7);
        assert!(!is_reply_to(&reply, 7)); // QR bit clear
        reply[2] |= 0x80;
        assert!(is_reply_to(&reply, 7));
        assert!(!is_reply_to(&reply, 8));
    }

    #[test]
    fn failures_are_counted_not_sampled() {
        let target = ResolverTarget::new("t", IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)));
        let mut r = DnsBenchmarkResult::new(&target);
        r.record_uncached(12.0);
        r.record_uncached(-1.0);
        assert_eq!(r.uncached, vec![12.0]);
        assert_eq!(r.failed_queries, 1);
        assert!(r.cached_stats().is_none());
    }

    #[test]
    fn targets_are_deduplicated() {
        let custom = vec![
            ResolverTarget::parse("1.1.1.1", "again").unwrap(),
            ResolverTarget::parse(" 192.168.1.1 ", "").unwrap(),
        ];
        let targets = benchmark_targets(&custom, true);
        let addrs: Vec<String> = targets.iter().map(|t| t.address.to_string()).collect();
        assert_eq!(
            addrs,
            ["8.8.8.8", "1.1.1.1", "208.67.222.222", "9.9.9.9", "192.168.1.1", "127.0.0.1"]
        );
        assert_eq!(targets[4].name, "192.168.1.1");
        assert!(ResolverTarget::parse("dns.google", "").is_err());
    }
}
