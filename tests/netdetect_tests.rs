use lan_monitor_rs::error::ProbeError;
use lan_monitor_rs::netdetect::{
    host_addresses, host_count, host_count_for, parse_cidr, validate_subnet, MAX_HOST_LIMIT,
};
use lan_monitor_rs::types::SubnetEntry;
use std::net::Ipv4Addr;

#[test]
fn parse_masks_host_bits() {
    let (net, prefix) = parse_cidr(" 192.168.42.99/24 ").unwrap();
    assert_eq!(net, Ipv4Addr::new(192, 168, 42, 0));
    assert_eq!(prefix, 24);
}

#[test]
fn parse_rejects_garbage_and_ipv6() {
    assert!(matches!(parse_cidr("10.0.0.0"), Err(ProbeError::InvalidCidr(_))));
    assert!(matches!(parse_cidr("10.0.0.0/33"), Err(ProbeError::InvalidCidr(_))));
    assert!(matches!(parse_cidr("fe80::/64"), Err(ProbeError::InvalidCidr(_))));
}

#[test]
fn host_counts() {
    assert_eq!(host_count(24), 254);
    assert_eq!(host_count(30), 2);
    assert_eq!(host_count(31), 0);
    assert_eq!(host_count(32), 0);
    assert_eq!(host_count(16), 65_534);
    assert_eq!(host_count_for("nonsense"), 0);
}

#[test]
fn expand_excludes_network_and_broadcast() {
    let list: Vec<_> = host_addresses(Ipv4Addr::new(10, 0, 0, 0), 30).collect();
    assert_eq!(
        list,
        vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
    );

    let all = host_addresses(Ipv4Addr::new(192, 168, 1, 77), 24);
    assert_eq!(all.size_hint(), (254, Some(254)));
    let v: Vec<_> = all.collect();
    assert_eq!(v.first(), Some(&Ipv4Addr::new(192, 168, 1, 1)));
    assert_eq!(v.last(), Some(&Ipv4Addr::new(192, 168, 1, 254)));
}

#[test]
fn sequence_is_restartable() {
    let seq = host_addresses(Ipv4Addr::new(172, 16, 0, 0), 29);
    let again = seq.clone();
    assert_eq!(seq.count(), 6);
    assert_eq!(again.count(), 6);
    assert_eq!(host_addresses(Ipv4Addr::new(10, 0, 0, 0), 32).count(), 0);
}

#[test]
fn validation_limits() {
    assert_eq!(validate_subnet("10.1.0.0/16").unwrap(), 65_534);
    match validate_subnet("10.0.0.0/15") {
        Err(ProbeError::SubnetTooLarge { hosts, max }) => {
            assert_eq!(hosts, 131_070);
            assert_eq!(max, MAX_HOST_LIMIT);
        }
        other => panic!("expected SubnetTooLarge, got {other:?}"),
    }
    assert!(matches!(
        validate_subnet("10.0.0.0/31"),
        Err(ProbeError::EmptySubnet(_))
    ));
}

#[test]
fn subnet_entry_validates() {
    let entry = SubnetEntry::new(" 10.20.0.0/24 ").unwrap();
    assert_eq!(entry.cidr, "10.20.0.0/24");
    assert!(entry.selected);
    assert!(SubnetEntry::new("10.0.0.0/8").is_err());
}

#[test]
fn counts_and_sequences_agree_for_every_prefix() {
    let network = Ipv4Addr::new(10, 0, 0, 0);
    for prefix in 0..=32u8 {
        let expected = if prefix >= 31 { 0 } else { (1u64 << (32 - prefix)) - 2 };
        assert_eq!(host_count(prefix), expected, "prefix /{prefix}");
        let seq = host_addresses(network, prefix);
        assert_eq!(seq.size_hint().1.map(|n| n as u64), Some(expected));
        // Walking the large ones adds nothing but time.
        if prefix >= 16 {
            let mask = u32::MAX << (32 - prefix);
            let net = u32::from(network) & mask;
            let broadcast = net | !mask;
            let mut n = 0u64;
            for ip in seq {
                let v = u32::from(ip);
                assert!(v > net && v < broadcast);
                n += 1;
            }
            assert_eq!(n, expected);
        }
    }
}

#[test]
fn point_to_point_subnets_are_rejected() {
    assert_eq!(host_count_for("10.0.0.0/24"), 254);
    assert!(SubnetEntry::new("10.0.0.0/31").is_err());
    assert!(SubnetEntry::new("10.0.0.0/32").is_err());
}
