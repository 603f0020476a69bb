use std::fs::File;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use lan_monitor_rs::config::{AppSettings, DEFAULT_SETTINGS_FILE};
use lan_monitor_rs::dns_bench::{self, DnsBenchmarkResult, ResolverTarget};
use lan_monitor_rs::netdetect;
use lan_monitor_rs::ping::{EchoPinger, IcmpPinger};
use lan_monitor_rs::ports;
use lan_monitor_rs::probe::HostProbe;
use lan_monitor_rs::scanner::ScanOrchestrator;
use lan_monitor_rs::server::{self, Engine};
use lan_monitor_rs::timeseries::local_now;
use lan_monitor_rs::traceroute::{RawIcmpHopProber, TraceMonitor};
use lan_monitor_rs::types::{HostResult, PortScanMode, PortScanRequest, ScanEvent, ScanReport};
use lan_monitor_rs::vendor::VendorDatabase;

const HOSTNAME_COLUMN: usize = 32;

/// lan-monitor-rs: async LAN discovery, port probing, DNS benchmarking and path monitoring.
#[derive(Debug, Parser)]
#[command(name = "lan-monitor-rs", version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file (JSON).
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::Args)]
struct PortArgs {
    /// Port scan mode: common, all or custom.
    #[arg(long)]
    mode: Option<PortScanMode>,

    /// Ports for custom mode, e.g. "22,80;8080 8443".
    #[arg(long = "custom-ports")]
    custom_ports: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sweep one or more subnets. Without CIDRs, every detected local subnet is scanned.
    Scan {
        cidrs: Vec<String>,

        /// Port-scan reachable hosts once the sweep is done.
        #[arg(long = "ports")]
        scan_ports: bool,

        #[command(flatten)]
        port_args: PortArgs,

        /// Write results as pretty JSON to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Probe a single host again.
    Rescan { ip: Ipv4Addr },
    /// Port-scan a single host.
    Ports {
        ip: Ipv4Addr,

        #[command(flatten)]
        port_args: PortArgs,
    },
    /// Benchmark DNS resolvers.
    Dns {
        /// Benchmark length in seconds.
        #[arg(long)]
        duration: Option<u64>,

        /// Extra resolver, `ADDRESS` or `ADDRESS=NAME`. Repeatable.
        #[arg(long = "resolver")]
        resolvers: Vec<String>,

        /// Skip the local resolver on 127.0.0.1.
        #[arg(long = "no-local")]
        no_local: bool,
    },
    /// Monitor the path to a destination for a while, then print a summary.
    Trace {
        destination: String,

        /// How long to monitor, in seconds.
        #[arg(long, default_value_t = 30)]
        duration: u64,

        /// Chart window for the summary statistics, in minutes.
        #[arg(long, default_value_t = 1)]
        window: u32,
    },
    /// List the IPv4 subnets this machine is attached to.
    Subnets,
    /// Refresh the OUI vendor database and look up MAC addresses.
    Vendors {
        macs: Vec<String>,

        /// Download the registry even if the cache is fresh.
        #[arg(long)]
        refresh: bool,
    },
    /// Run the HTTP API and static UI.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = AppSettings::load_or_default(&cli.settings);

    // Ctrl-C cancels whatever is running.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    match cli.command {
        Command::Scan {
            cidrs,
            scan_ports,
            port_args,
            output,
        } => {
            let port_req = (scan_ports || settings.auto_port_scan)
                .then(|| port_request(&settings, &port_args))
                .transpose()?;
            let cidrs = if cidrs.is_empty() {
                detected_cidrs()
            } else {
                cidrs
            };
            let orch = orchestrator(&settings).await?;
            let report = run_scan(&orch, &cidrs, port_req.as_ref(), cancel).await?;
            print_hosts_table(&report);
            if let Some(path) = output.as_deref() {
                write_json(path, &report)?;
                println!("Wrote JSON results to {}", path.display());
            }
        }
        Command::Rescan { ip } => {
            let orch = orchestrator(&settings).await?;
            let host = orch.rescan_host(ip, &cancel).await?;
            print_host_detail(&host);
        }
        Command::Ports { ip, port_args } => {
            let req = port_request(&settings, &port_args)?;
            let open = ports::scan_ports(ip, &req, &cancel).await?;
            if open.is_empty() {
                println!("No open ports found on {ip}");
            } else {
                println!("Open ports on {ip}:");
                for p in open {
                    println!("  {p}");
                }
            }
        }
        Command::Dns {
            duration,
            resolvers,
            no_local,
        } => {
            let mut custom = Vec::new();
            for r in &settings.custom_resolvers {
                custom.push(ResolverTarget::parse(&r.address, &r.name)?);
            }
            for r in &resolvers {
                let (addr, name) = r.split_once('=').unwrap_or((r.as_str(), ""));
                custom.push(ResolverTarget::parse(addr, name)?);
            }
            let targets = dns_bench::benchmark_targets(&custom, !no_local);
            let duration = Duration::from_secs(duration.unwrap_or(settings.dns_duration_secs).max(1));
            println!(
                "Benchmarking {} resolvers for {}s...",
                targets.len(),
                duration.as_secs()
            );
            let (tx, _rx) = mpsc::unbounded_channel();
            let results = dns_bench::run_all(targets, duration, cancel, tx).await?;
            print_dns_table(&results);
        }
        Command::Trace {
            destination,
            duration,
            window,
        } => run_trace(&destination, Duration::from_secs(duration), window, cancel).await?,
        Command::Subnets => {
            let subnets = netdetect::connected_subnets().context("failed to list interfaces")?;
            if subnets.is_empty() {
                println!("No usable subnets detected (fallback {})", netdetect::FALLBACK_SUBNET);
            }
            for s in subnets {
                println!(
                    "  {:<18}  {:>6} hosts  {}",
                    s.cidr,
                    netdetect::host_count_for(&s.cidr),
                    s.label
                );
            }
        }
        Command::Vendors { macs, refresh } => {
            let vendors = VendorDatabase::new(&settings.oui_cache_path, &settings.oui_source_url);
            let source = if refresh {
                vendors.force_refresh().await
            } else {
                vendors.refresh().await
            };
            println!("Vendor database: {} entries ({source:?})", vendors.len());
            for mac in macs {
                let vendor = vendors.lookup(&mac);
                println!("  {mac}  {}", if vendor.is_empty() { "-" } else { vendor.as_str() });
            }
        }
        Command::Serve { bind } => {
            let pinger = pinger()?;
            let orchestrator = ScanOrchestrator::new(Arc::new(HostProbe::new(
                pinger.clone(),
                vendor_db(&settings).await,
            )));
            let monitor = TraceMonitor::new(pinger, Arc::new(RawIcmpHopProber::new()));
            let engine = Engine {
                orchestrator,
                monitor,
                settings,
            };
            println!("UI server starting at http://{bind} (Ctrl+C to stop)");
            tokio::select! {
                res = server::spawn_server(&bind, engine) => res?,
                _ = cancel.cancelled() => {}
            }
        }
    }

    Ok(())
}

fn port_request(settings: &AppSettings, args: &PortArgs) -> Result<PortScanRequest> {
    let mode = args.mode.unwrap_or(settings.port_scan_mode);
    let custom = args.custom_ports.as_deref().unwrap_or(&settings.custom_ports);
    PortScanRequest::parse(mode, custom).context("invalid port selection")
}

fn detected_cidrs() -> Vec<String> {
    match netdetect::connected_subnets() {
        Ok(subnets) if !subnets.is_empty() => subnets.into_iter().map(|s| s.cidr).collect(),
        Ok(_) => vec![netdetect::active_subnet()],
        Err(e) => {
            tracing::warn!(error = %e, "failed to detect local networks");
            vec![netdetect::active_subnet()]
        }
    }
}

fn pinger() -> Result<Arc<dyn EchoPinger>> {
    let pinger = IcmpPinger::new()
        .context("opening ICMP socket (requires CAP_NET_RAW, root, or ping_group_range)")?;
    Ok(Arc::new(pinger))
}

async fn vendor_db(settings: &AppSettings) -> Arc<VendorDatabase> {
    VendorDatabase::open(
        &settings.oui_cache_path,
        &settings.oui_source_url,
        settings.auto_refresh_vendors,
    )
    .await
}

async fn orchestrator(settings: &AppSettings) -> Result<ScanOrchestrator> {
    let prober = HostProbe::new(pinger()?, vendor_db(settings).await);
    Ok(ScanOrchestrator::new(Arc::new(prober)))
}

async fn run_scan(
    orch: &ScanOrchestrator,
    cidrs: &[String],
    port_req: Option<&PortScanRequest>,
    cancel: CancellationToken,
) -> Result<ScanReport> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match ev {
                ScanEvent::SubnetStarted { cidr, index, count } => {
                    eprintln!("Scanning {cidr} ({}/{count})", index + 1);
                }
                ScanEvent::Progress { completed, total } if completed % 64 == 0 || completed == total => {
                    eprintln!("  {completed}/{total} hosts probed");
                }
                _ => {}
            }
        }
    });

    let mut report = orch.scan_subnets(cidrs, cancel.clone(), tx.clone()).await?;
    if let (Some(req), false) = (port_req, report.cancelled) {
        eprintln!("Port scanning {} reachable hosts...", report.reachable_count);
        if let Err(e) = orch.enrich_ports(&mut report.hosts, req, &cancel, &tx).await {
            tracing::warn!(error = %e, "port scan interrupted");
        }
    }
    drop(tx);
    let _ = progress.await;
    Ok(report)
}

async fn run_trace(
    destination: &str,
    duration: Duration,
    window: u32,
    cancel: CancellationToken,
) -> Result<()> {
    let monitor = TraceMonitor::new(pinger()?, Arc::new(RawIcmpHopProber::new()));
    monitor.add(destination)?;
    monitor.start(destination).await?;
    println!("Monitoring {destination} for {}s (Ctrl+C to stop early)...", duration.as_secs());
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.cancelled() => {}
    }
    monitor.stop(destination);
    monitor.with_session(destination, |s| s.series.set_window_minutes_at(window, local_now()))?;

    let view = monitor
        .view(destination)
        .context("trace session disappeared")?;
    println!(
        "\n{}  elapsed {}  avg {:.1} ms  max {:.0} ms  loss {:.1}%",
        view.destination, view.elapsed, view.average_latency, view.max_latency, view.packet_loss
    );
    println!("{:>3}  {:<15}  {:>8}  hostname", "hop", "address", "latency");
    for hop in &view.hops {
        let latency = if hop.timeout {
            "*".to_string()
        } else {
            format!("{} ms", hop.latency_ms)
        };
        println!("{:>3}  {:<15}  {:>8}  {}", hop.hop, hop.address, latency, hop.hostname);
    }
    Ok(())
}

fn print_hosts_table(report: &ScanReport) {
    let hosts: Vec<&HostResult> = report.hosts.iter().filter(|h| h.is_reachable() || h.has_mac()).collect();
    let mut name_w = "hostname".len();
    let mut vendor_w = "vendor".len();
    for h in &hosts {
        name_w = name_w.max(h.short_hostname(HOSTNAME_COLUMN).chars().count());
        vendor_w = vendor_w.max(h.vendor.len());
    }

    println!(
        "\nReachable hosts: {} (probed: {}/{}{})",
        report.reachable_count,
        report.scanned_done,
        report.scanned_total,
        if report.cancelled { ", cancelled" } else { "" }
    );
    println!(
        "{:<15}  {:<7}  {:>7}  {:<name_w$}  {:<17}  {:<vendor_w$}  {:<7}  ports",
        "ip", "status", "ping", "hostname", "mac", "vendor", "os",
    );
    println!(
        "{:-<15}  {:-<7}  {:-<7}  {:-<name_w$}  {:-<17}  {:-<vendor_w$}  {:-<7}  -----",
        "", "", "", "", "", "", "",
    );
    for h in hosts {
        let name = h.short_hostname(HOSTNAME_COLUMN);
        println!(
            "{:<15}  {:<7}  {:>7}  {:<name_w$}  {:<17}  {:<vendor_w$}  {:<7}  {}",
            h.ip.to_string(),
            h.status(),
            h.ping_display(),
            name,
            h.mac,
            h.vendor,
            h.os_guess().to_string(),
            h.open_ports.join(", "),
        );
    }
}

fn print_host_detail(h: &HostResult) {
    println!("{}", h.ip);
    println!("  status   : {}", h.status());
    println!("  ping     : {}", h.ping_display());
    println!("  ttl      : {}", h.ttl);
    println!("  hostname : {}", h.hostname);
    println!("  mac      : {}", h.mac);
    println!("  vendor   : {}", h.vendor);
    println!("  os       : {}", h.os_guess());
}

fn print_dns_table(results: &[DnsBenchmarkResult]) {
    println!(
        "\n{:<24}  {:<15}  {:>9}  {:>9}  {:>9}  {:>9}  {:>6}",
        "resolver", "address", "cached", "uncached", "min", "max", "failed"
    );
    let fmt = |v: Option<f64>| v.map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".into());
    for r in results {
        let cached = r.cached_stats();
        let uncached = r.uncached_stats();
        println!(
            "{:<24}  {:<15}  {:>9}  {:>9}  {:>9}  {:>9}  {:>6}",
            r.name,
            r.address.to_string(),
            fmt(cached.map(|s| s.avg)),
            fmt(uncached.map(|s| s.avg)),
            fmt(uncached.map(|s| s.min)),
            fmt(uncached.map(|s| s.max)),
            r.failed_queries,
        );
    }
}

fn write_json(path: &Path, report: &ScanReport) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
