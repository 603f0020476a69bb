use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;
use surge_ping::{Client, Config, IcmpPacket, PingIdentifier, PingSequence};

/// A successful ICMP echo exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub rtt: Duration,
    /// TTL of the reply packet when the socket exposes it.
    pub ttl: Option<u8>,
}

impl EchoReply {
    pub fn rtt_ms(&self) -> u32 {
        self.rtt.as_millis().min(u32::MAX as u128) as u32
    }
}

/// Sends one echo request and waits for the matching reply.
///
/// Any failure (timeout, unreachable, socket error) is reported as `None`;
/// callers treat a missing reply as "no answer".
#[async_trait]
pub trait EchoPinger: Send + Sync {
    async fn echo(&self, addr: Ipv4Addr, timeout: Duration) -> Option<EchoReply>;
}

/// ICMP echo over a shared surge-ping client socket.
pub struct IcmpPinger {
    client: Client,
    seq: AtomicU16,
    ttl_missing_reported: AtomicBool,
}

impl IcmpPinger {
    /// Open the ICMP socket. Needs either an unprivileged ICMP datagram socket
    /// (Linux `ping_group_range`) or raw socket privileges.
    pub fn new() -> std::io::Result<Self> {
        let client = Client::new(&Config::default())?;
        Ok(Self {
            client,
            seq: AtomicU16::new(0),
            ttl_missing_reported: AtomicBool::new(false),
        })
    }
}

/// True the first time it is called on `flag`.
fn first_report(flag: &AtomicBool) -> bool {
    !flag.swap(true, Ordering::Relaxed)
}

const PAYLOAD: [u8; 32] = [0u8; 32];

#[async_trait]
impl EchoPinger for IcmpPinger {
    async fn echo(&self, addr: Ipv4Addr, timeout: Duration) -> Option<EchoReply> {
        let mut pinger = self
            .client
            .pinger(IpAddr::V4(addr), PingIdentifier(rand::random()))
            .await;
        pinger.timeout(timeout);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match pinger.ping(PingSequence(seq), &PAYLOAD).await {
            Ok((IcmpPacket::V4(packet), rtt)) => {
                // Datagram sockets strip the IP header, in which case the TTL is unknown.
                let ttl: Option<u8> = packet.get_ttl().into();
                if ttl.is_none() && first_report(&self.ttl_missing_reported) {
                    tracing::warn!(
                        "ICMP replies carry no TTL on this socket; OS guesses need CAP_NET_RAW or root"
                    );
                }
                Some(EchoReply { rtt, ttl })
            }
            Ok((IcmpPacket::V6(_), rtt)) => Some(EchoReply { rtt, ttl: None }),
            Err(e) => {
                tracing::trace!(%addr, error = %e, "echo failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ttl_is_reported_once() {
        let flag = AtomicBool::new(false);
        assert!(first_report(&flag));
        assert!(!first_report(&flag));
        assert!(!first_report(&flag));
    }

    #[test]
    fn rtt_rounds_down_to_millis() {
        let reply = EchoReply {
            rtt: Duration::from_micros(4_900),
            ttl: None,
        };
        assert_eq!(reply.rtt_ms(), 4);
    }
}
