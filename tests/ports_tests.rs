use lan_monitor_rs::ports::{is_port_open, parse_custom_ports, scan_ports};
use lan_monitor_rs::types::{PortScanMode, PortScanRequest};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn closed_port() -> u16 {
    let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    l.local_addr().unwrap().port()
}

#[test]
fn parse_with_every_delimiter() {
    let ports = parse_custom_ports("22,80;443 8080\t8443\n22").expect("parse ok");
    assert_eq!(ports, vec![22, 80, 443, 8080, 8443]);
}

#[test]
fn invalid_port_rejected() {
    assert!(parse_custom_ports("0").is_err());
    assert!(parse_custom_ports("22,65536").is_err());
    assert!(parse_custom_ports("ssh").is_err());
    assert!(PortScanRequest::parse(PortScanMode::Custom, "").is_err());
    // Custom text is ignored outside custom mode.
    assert!(PortScanRequest::parse(PortScanMode::Common, "junk").is_ok());
}

#[tokio::test]
async fn detects_listening_port() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let closed = closed_port().await;

    assert!(is_port_open(Ipv4Addr::LOCALHOST, open, Duration::from_millis(500)).await);
    assert!(!is_port_open(Ipv4Addr::LOCALHOST, closed, Duration::from_millis(500)).await);

    let req = PortScanRequest {
        mode: PortScanMode::Custom,
        custom_ports: vec![closed, open],
    };
    let found = scan_ports(Ipv4Addr::LOCALHOST, &req, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(found, vec![open.to_string()]);
}

#[tokio::test]
async fn cancelled_scan_reports_cancellation() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = scan_ports(Ipv4Addr::LOCALHOST, &PortScanRequest::all(), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn full_range_batches_cover_each_port_once() {
    use lan_monitor_rs::ports::{port_batches, BATCH_SIZE};
    let mut next = 1u32;
    for batch in port_batches(BATCH_SIZE) {
        assert_eq!(u32::from(*batch.start()), next);
        assert!(batch.len() <= usize::from(BATCH_SIZE));
        next = u32::from(*batch.end()) + 1;
    }
    assert_eq!(next, 65_536);
}
