use lan_monitor_rs::dns_bench::{
    benchmark_targets, build_query, measure_raw_query, run_all, sort_by_uncached_avg,
    DnsBenchmarkResult, LatencyStats, ResolverTarget, COMMON_RESOLVERS,
};
use lan_monitor_rs::error::ProbeError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Answers every query once with the QR bit set, echoing the transaction id.
async fn fake_resolver() -> SocketAddr {
    let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, peer)) = sock.recv_from(&mut buf).await {
            let mut reply = buf[..n].to_vec();
            reply[2] |= 0x80;
            let _ = sock.send_to(&reply, peer).await;
        }
    });
    addr
}

fn result_with(name: &str, uncached: &[f64]) -> DnsBenchmarkResult {
    let target = ResolverTarget::new(name, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    let mut r = DnsBenchmarkResult::new(&target);
    for &ms in uncached {
        r.record_uncached(ms);
    }
    r
}

#[test]
fn stats_of_samples() {
    let s = LatencyStats::of(&[12.0, 30.0, 9.0]).unwrap();
    assert_eq!(s.min, 9.0);
    assert_eq!(s.max, 30.0);
    assert_eq!(s.avg, 17.0);

    let s = result_with("Cloudflare", &[40.0, 400.0]).uncached_stats().unwrap();
    assert_eq!((s.min, s.max, s.avg), (40.0, 400.0, 220.0));
    assert!(LatencyStats::of(&[]).is_none());
}

#[test]
fn default_targets_include_common_and_local() {
    let targets = benchmark_targets(&[], true);
    assert_eq!(targets.len(), COMMON_RESOLVERS.len() + 1);
    assert_eq!(targets.last().map(|t| t.address), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    assert_eq!(benchmark_targets(&[], false).len(), COMMON_RESOLVERS.len());
}

#[test]
fn invalid_resolver_is_rejected() {
    let err = ResolverTarget::parse("999.1.1.1", "bad").unwrap_err();
    assert!(matches!(err, ProbeError::InvalidResolver(_)));
    assert!(err.is_validation());
}

#[test]
fn query_names_are_encoded_as_labels() {
    let q = build_query("a.b", 1);
    assert_eq!(&q[12..], &[1, b'a', 1, b'b', 0, 0, 1, 0, 1]);
}

#[test]
fn sorted_fastest_first_unanswered_last() {
    let mut results = vec![
        result_with("dead", &[-1.0, -1.0]),
        result_with("slow", &[80.0, 120.0]),
        result_with("fast", &[5.0, 7.0]),
    ];
    sort_by_uncached_avg(&mut results);
    let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["fast", "slow", "dead"]);
    assert_eq!(results[2].failed_queries, 2);
}

#[tokio::test]
async fn raw_query_gets_timed() {
    let addr = fake_resolver().await;
    let ms = measure_raw_query(addr, "abc.example.com").await;
    assert!(ms >= 0.0, "expected a latency, got {ms}");
}

#[tokio::test]
async fn silent_resolver_counts_as_failure() {
    // Bound but never answers.
    let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let ms = measure_raw_query(sock.local_addr().unwrap(), "abc.example.com").await;
    assert_eq!(ms, -1.0);
}

#[tokio::test]
async fn cancelled_benchmark_reports_cancellation() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let err = run_all(
        benchmark_targets(&[], false),
        Duration::from_secs(5),
        cancel,
        tx,
    )
    .await
    .unwrap_err();
    assert!(err.is_cancelled());
    assert!(rx.recv().await.is_none());
}
