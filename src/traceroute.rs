//! Continuous path monitoring.
//!
//! A running session has two loops sharing one cancellation token: a fast
//! sampler pinging the destination and a slower hop discovery pass that
//! walks TTLs 1..=30. Sessions live in a [`TraceRegistry`] and survive being
//! stopped so their history stays viewable.

use crate::error::ProbeError;
use crate::ping::EchoPinger;
use crate::probe::reverse_lookup;
use crate::timeseries::{local_now, SessionView, TraceSession};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time;
use tokio_util::sync::CancellationToken;

pub const MAX_HOPS: u8 = 30;
pub const HOP_TIMEOUT: Duration = Duration::from_millis(2000);
pub const HOP_INTERVAL: Duration = Duration::from_secs(10);
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
pub const SAMPLE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const MAX_MONITOR_DURATION: Duration = Duration::from_secs(2 * 60 * 60);

/// Address shown for a hop that did not answer.
pub const NO_RESPONSE: &str = "*";
pub const TIMED_OUT_HOSTNAME: &str = "Request timed out.";

const HOP_MARKER: u8 = 0x54;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;

/// One TTL slot of a traced path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TraceHop {
    /// 1-based TTL.
    pub hop: u8,
    pub address: String,
    pub hostname: String,
    /// Milliseconds, -1 on timeout.
    pub latency_ms: i64,
    pub timeout: bool,
}

impl TraceHop {
    pub fn new(hop: u8) -> Self {
        Self {
            hop,
            address: String::new(),
            hostname: String::new(),
            latency_ms: -1,
            timeout: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopReply {
    /// A router on the way answered with time-exceeded.
    Intermediate { from: Ipv4Addr, rtt: Duration },
    /// The destination itself answered.
    Reached { from: Ipv4Addr, rtt: Duration },
    NoReply,
}

/// Sends one TTL-limited probe toward a destination.
#[async_trait]
pub trait HopProber: Send + Sync {
    async fn probe_hop(
        &self,
        dest: Ipv4Addr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<HopReply, ProbeError>;
}

/// TTL-limited ICMP echo over a raw socket. Needs `CAP_NET_RAW` or root.
pub struct RawIcmpHopProber {
    ident: u16,
    seq: AtomicU16,
}

impl Default for RawIcmpHopProber {
    fn default() -> Self {
        Self::new()
    }
}

impl RawIcmpHopProber {
    pub fn new() -> Self {
        Self {
            ident: rand::random(),
            seq: AtomicU16::new(1),
        }
    }
}

#[async_trait]
impl HopProber for RawIcmpHopProber {
    async fn probe_hop(
        &self,
        dest: Ipv4Addr,
        ttl: u8,
        timeout: Duration,
    ) -> Result<HopReply, ProbeError> {
        let ident = self.ident;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        tokio::task::spawn_blocking(move || probe_hop_blocking(dest, ttl, timeout, ident, seq))
            .await
            .map_err(|e| ProbeError::Io(io::Error::other(e)))?
            .map_err(ProbeError::from)
    }
}

fn probe_hop_blocking(
    dest: Ipv4Addr,
    ttl: u8,
    timeout: Duration,
    ident: u16,
    seq: u16,
) -> io::Result<HopReply> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_ttl(u32::from(ttl))?;
    let packet = build_echo_request(ident, seq, &[HOP_MARKER]);
    let target = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(dest, 0)));

    let start = Instant::now();
    socket.send_to(&packet, &target)?;
    let mut buf = [0u8; 1500];
    loop {
        let remaining = match timeout.checked_sub(start.elapsed()) {
            Some(r) if !r.is_zero() => r,
            _ => return Ok(HopReply::NoReply),
        };
        socket.set_read_timeout(Some(remaining))?;
        match (&socket).read(&mut buf) {
            Ok(n) => {
                let rtt = start.elapsed();
                match parse_hop_reply(&buf[..n], ident, seq) {
                    Some(ParsedReply::EchoReply(from)) => {
                        return Ok(HopReply::Reached { from, rtt })
                    }
                    Some(ParsedReply::TimeExceeded(from)) => {
                        return Ok(HopReply::Intermediate { from, rtt })
                    }
                    None => continue,
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(HopReply::NoReply)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Internet checksum (RFC 1071).
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn build_echo_request(ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.push(ICMP_ECHO_REQUEST);
    packet.push(0);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(payload);
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedReply {
    EchoReply(Ipv4Addr),
    TimeExceeded(Ipv4Addr),
}

/// Match an IPv4 datagram read from a raw ICMP socket against our probe.
///
/// Time-exceeded messages quote the original IP header and the first eight
/// bytes of our echo request, which carry the identifier and sequence.
pub fn parse_hop_reply(datagram: &[u8], ident: u16, seq: u16) -> Option<ParsedReply> {
    let ihl = usize::from(*datagram.first()? & 0x0f) * 4;
    if ihl < 20 || datagram.len() < ihl + 8 {
        return None;
    }
    let from = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);
    let icmp = &datagram[ihl..];

    match icmp[0] {
        ICMP_ECHO_REPLY if echo_matches(icmp, ident, seq) => Some(ParsedReply::EchoReply(from)),
        ICMP_TIME_EXCEEDED => {
            let inner = &icmp[8..];
            let inner_ihl = usize::from(*inner.first()? & 0x0f) * 4;
            let quoted = inner.get(inner_ihl..inner_ihl + 8)?;
            (quoted[0] == ICMP_ECHO_REQUEST && echo_matches(quoted, ident, seq))
                .then_some(ParsedReply::TimeExceeded(from))
        }
        _ => None,
    }
}

fn echo_matches(icmp: &[u8], ident: u16, seq: u16) -> bool {
    icmp.len() >= 8
        && u16::from_be_bytes([icmp[4], icmp[5]]) == ident
        && u16::from_be_bytes([icmp[6], icmp[7]]) == seq
}

/// Record `reply` into the slot for `ttl`, creating slots as needed.
/// Returns the responder when its hostname should be looked up.
pub fn update_hop(hops: &mut Vec<TraceHop>, ttl: u8, reply: &HopReply) -> Option<Ipv4Addr> {
    let idx = usize::from(ttl.max(1)) - 1;
    while hops.len() <= idx {
        let next = hops.len() as u8 + 1;
        hops.push(TraceHop::new(next));
    }
    let hop = &mut hops[idx];

    match *reply {
        HopReply::Intermediate { from, rtt } | HopReply::Reached { from, rtt } => {
            let address = from.to_string();
            if hop.address != address {
                hop.hostname.clear();
            }
            hop.address = address;
            hop.latency_ms = rtt.as_millis().min(i64::MAX as u128) as i64;
            hop.timeout = false;
            Some(from)
        }
        HopReply::NoReply => {
            hop.address = NO_RESPONSE.to_string();
            hop.hostname = TIMED_OUT_HOSTNAME.to_string();
            hop.latency_ms = -1;
            hop.timeout = true;
            None
        }
    }
}

fn lock(session: &Mutex<TraceSession>) -> MutexGuard<'_, TraceSession> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

/// Walk TTL 1..=[`MAX_HOPS`] once, updating the session's hop slots.
///
/// Stops early once the destination answers. Hostnames are looked up in
/// the background and filled in when (and if) they arrive.
pub async fn run_trace_once(
    session: &Arc<Mutex<TraceSession>>,
    dest: Ipv4Addr,
    prober: &dyn HopProber,
    cancel: &CancellationToken,
) -> Result<(), ProbeError> {
    for ttl in 1..=MAX_HOPS {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            r = prober.probe_hop(dest, ttl, HOP_TIMEOUT) => r,
        };
        let reply = match reply {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(%dest, ttl, error = %e, "hop probe failed");
                continue;
            }
        };

        let lookup = update_hop(&mut lock(session).hops, ttl, &reply);
        if let Some(addr) = lookup {
            spawn_hostname_lookup(session.clone(), ttl, addr, cancel.clone());
        }
        if matches!(reply, HopReply::Reached { .. }) {
            break;
        }
    }
    Ok(())
}

fn spawn_hostname_lookup(
    session: Arc<Mutex<TraceSession>>,
    ttl: u8,
    addr: Ipv4Addr,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = cancel.cancelled() => return,
            name = reverse_lookup(IpAddr::V4(addr)) => name,
        };
        let Some(name) = name else { return };
        let mut guard = lock(&session);
        if let Some(hop) = guard.hops.get_mut(usize::from(ttl) - 1) {
            // The route may have changed while we were waiting.
            if hop.address == addr.to_string() {
                hop.hostname = name;
            }
        }
    });
}

struct RegistryEntry {
    key: String,
    session: Arc<Mutex<TraceSession>>,
    cancel: Option<CancellationToken>,
}

/// Destination -> session + cancellation handle. Destinations compare
/// case-insensitively; listing keeps insertion order.
#[derive(Default)]
pub struct TraceRegistry {
    entries: Mutex<Vec<RegistryEntry>>,
}

fn registry_key(destination: &str) -> String {
    destination.trim().to_ascii_lowercase()
}

impl TraceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<RegistryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, destination: &str) -> Result<Arc<Mutex<TraceSession>>, ProbeError> {
        let destination = destination.trim();
        if destination.is_empty() || destination.contains(char::is_whitespace) {
            return Err(ProbeError::InvalidDestination(destination.to_string()));
        }
        let key = registry_key(destination);
        let mut entries = self.entries();
        if entries.iter().any(|e| e.key == key) {
            return Err(ProbeError::DuplicateSession(destination.to_string()));
        }
        let session = Arc::new(Mutex::new(TraceSession::new(destination)));
        entries.push(RegistryEntry {
            key,
            session: session.clone(),
            cancel: None,
        });
        Ok(session)
    }

    pub fn get(&self, destination: &str) -> Option<Arc<Mutex<TraceSession>>> {
        let key = registry_key(destination);
        self.entries()
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.session.clone())
    }

    /// Install the cancellation handle for a run. Fails if the session is
    /// unknown or already has one.
    pub fn attach_cancel(&self, destination: &str, token: CancellationToken) -> bool {
        let key = registry_key(destination);
        let mut entries = self.entries();
        match entries.iter_mut().find(|e| e.key == key) {
            Some(e) if e.cancel.is_none() => {
                e.cancel = Some(token);
                true
            }
            _ => false,
        }
    }

    pub fn take_cancel(&self, destination: &str) -> Option<CancellationToken> {
        let key = registry_key(destination);
        self.entries()
            .iter_mut()
            .find(|e| e.key == key)
            .and_then(|e| e.cancel.take())
    }

    /// Drop the session, cancelling it if it runs.
    pub fn remove(&self, destination: &str) -> Option<Arc<Mutex<TraceSession>>> {
        let key = registry_key(destination);
        let mut entries = self.entries();
        let idx = entries.iter().position(|e| e.key == key)?;
        let entry = entries.remove(idx);
        if let Some(token) = entry.cancel {
            token.cancel();
        }
        Some(entry.session)
    }

    pub fn sessions(&self) -> Vec<Arc<Mutex<TraceSession>>> {
        self.entries().iter().map(|e| e.session.clone()).collect()
    }

    pub fn destinations(&self) -> Vec<String> {
        self.sessions()
            .iter()
            .map(|s| lock(s).destination.clone())
            .collect()
    }
}

/// Resolve a trace destination to one IPv4 address.
pub async fn resolve_destination(destination: &str) -> Result<Ipv4Addr, ProbeError> {
    let destination = destination.trim();
    if let Ok(ip) = destination.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = tokio::net::lookup_host((destination, 0))
        .await
        .map_err(|_| ProbeError::Resolve(destination.to_string()))?;
    addrs
        .filter_map(|a| match a.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| ProbeError::Resolve(destination.to_string()))
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorTiming {
    pub sample_interval: Duration,
    pub hop_interval: Duration,
    pub max_duration: Duration,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            sample_interval: SAMPLE_INTERVAL,
            hop_interval: HOP_INTERVAL,
            max_duration: MAX_MONITOR_DURATION,
        }
    }
}

/// Owns the session registry and runs the per-session loops.
#[derive(Clone)]
pub struct TraceMonitor {
    registry: Arc<TraceRegistry>,
    pinger: Arc<dyn EchoPinger>,
    hop_prober: Arc<dyn HopProber>,
    timing: MonitorTiming,
}

impl TraceMonitor {
    pub fn new(pinger: Arc<dyn EchoPinger>, hop_prober: Arc<dyn HopProber>) -> Self {
        Self {
            registry: Arc::new(TraceRegistry::new()),
            pinger,
            hop_prober,
            timing: MonitorTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: MonitorTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn registry(&self) -> &TraceRegistry {
        &self.registry
    }

    pub fn add(&self, destination: &str) -> Result<(), ProbeError> {
        self.registry.insert(destination).map(|_| ())
    }

    pub fn session(&self, destination: &str) -> Option<Arc<Mutex<TraceSession>>> {
        self.registry.get(destination)
    }

    pub fn view(&self, destination: &str) -> Option<SessionView> {
        let session = self.registry.get(destination)?;
        let now = local_now();
        let mut guard = lock(&session);
        guard.tick(now);
        guard.series.refresh_at(now);
        Some(guard.view_at(now))
    }

    pub fn views(&self) -> Vec<SessionView> {
        let now = local_now();
        self.registry
            .sessions()
            .iter()
            .map(|s| {
                let mut guard = lock(s);
                guard.tick(now);
                guard.series.refresh_at(now);
                guard.view_at(now)
            })
            .collect()
    }

    /// Apply `f` to a session under its lock.
    pub fn with_session<R>(
        &self,
        destination: &str,
        f: impl FnOnce(&mut TraceSession) -> R,
    ) -> Result<R, ProbeError> {
        let session = self
            .registry
            .get(destination)
            .ok_or_else(|| ProbeError::UnknownSession(destination.to_string()))?;
        let mut guard = lock(&session);
        Ok(f(&mut guard))
    }

    /// Start monitoring. The destination is resolved once, here; starting
    /// a running session is a no-op.
    pub async fn start(&self, destination: &str) -> Result<(), ProbeError> {
        let session = self
            .registry
            .get(destination)
            .ok_or_else(|| ProbeError::UnknownSession(destination.to_string()))?;
        if lock(&session).is_running() {
            return Ok(());
        }
        let dest = resolve_destination(destination).await?;

        let cancel = CancellationToken::new();
        if !self.registry.attach_cancel(destination, cancel.clone()) {
            return Ok(());
        }
        lock(&session).mark_started(local_now());
        tracing::info!(destination, %dest, "trace monitoring started");

        tokio::spawn(sample_loop(
            self.registry.clone(),
            session.clone(),
            dest,
            self.pinger.clone(),
            self.timing,
            cancel.clone(),
        ));
        tokio::spawn(hop_loop(
            session,
            dest,
            self.hop_prober.clone(),
            self.timing.hop_interval,
            cancel,
        ));
        Ok(())
    }

    /// Stop monitoring; the session and its history stay. Returns false if
    /// the session was not running.
    pub fn stop(&self, destination: &str) -> bool {
        stop_session(&self.registry, destination)
    }

    pub fn remove(&self, destination: &str) -> bool {
        self.stop(destination);
        self.registry.remove(destination).is_some()
    }

    pub async fn start_all(&self) -> Vec<(String, ProbeError)> {
        let mut failed = Vec::new();
        for destination in self.registry.destinations() {
            if let Err(e) = self.start(&destination).await {
                failed.push((destination, e));
            }
        }
        failed
    }

    pub fn stop_all(&self) {
        for destination in self.registry.destinations() {
            self.stop(&destination);
        }
    }
}

fn stop_session(registry: &TraceRegistry, destination: &str) -> bool {
    let Some(token) = registry.take_cancel(destination) else {
        return false;
    };
    token.cancel();
    if let Some(session) = registry.get(destination) {
        lock(&session).mark_stopped(local_now());
    }
    tracing::info!(destination, "trace monitoring stopped");
    true
}

async fn sample_loop(
    registry: Arc<TraceRegistry>,
    session: Arc<Mutex<TraceSession>>,
    dest: Ipv4Addr,
    pinger: Arc<dyn EchoPinger>,
    timing: MonitorTiming,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    while !cancel.is_cancelled() {
        if started.elapsed() >= timing.max_duration {
            let destination = lock(&session).destination.clone();
            tracing::info!(%destination, "maximum monitoring time reached");
            stop_session(&registry, &destination);
            break;
        }
        let reply = tokio::select! {
            _ = cancel.cancelled() => break,
            r = pinger.echo(dest, SAMPLE_TIMEOUT) => r,
        };
        let latency = reply.map(|r| r.rtt.as_secs_f64() * 1000.0).unwrap_or(-1.0);
        {
            let now = local_now();
            let mut guard = lock(&session);
            guard.series.add_sample_at(now, latency);
            guard.tick(now);
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(timing.sample_interval) => {}
        }
    }
}

async fn hop_loop(
    session: Arc<Mutex<TraceSession>>,
    dest: Ipv4Addr,
    prober: Arc<dyn HopProber>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        if run_trace_once(&session, dest, prober.as_ref(), &cancel)
            .await
            .is_err()
        {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(interval) => {}
        }
    }
}
