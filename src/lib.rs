//! Library crate for lan-monitor-rs: subnet sweeps, host identification,
//! port probing, DNS resolver benchmarks and continuous path monitoring.
pub mod arp;
pub mod config;
pub mod dns_bench;
pub mod error;
pub mod netbios;
pub mod netdetect;
pub mod ping;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod timeseries;
pub mod traceroute;
pub mod types;
pub mod vendor;
