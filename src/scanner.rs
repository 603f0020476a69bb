use crate::error::ProbeError;
use crate::netdetect::{host_addresses, parse_cidr, validate_subnet};
use crate::ports;
use crate::probe::Prober;
use crate::types::{HostResult, PortScanRequest, ScanEvent, ScanReport};
use ::time::{format_description::well_known, OffsetDateTime};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Probes admitted at once during a subnet sweep.
pub const MAX_CONCURRENT_PROBES: usize = 50;

/// Drives [`Prober`]s across whole subnets.
///
/// Every host address gets its own task, but only
/// [`MAX_CONCURRENT_PROBES`] of them hold a permit and do network work at a
/// time. Results are streamed as [`ScanEvent`]s the moment a probe finishes
/// and collected into a [`ScanReport`] sorted by address.
pub struct ScanOrchestrator {
    prober: Arc<dyn Prober>,
    concurrency: usize,
}

struct PlannedSubnet {
    cidr: String,
    network: Ipv4Addr,
    prefix: u8,
}

impl ScanOrchestrator {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self {
            prober,
            concurrency: MAX_CONCURRENT_PROBES,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, 1_000);
        self
    }

    pub async fn scan_subnet(
        &self,
        cidr: &str,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<ScanReport, ProbeError> {
        self.scan_subnets(&[cidr.to_string()], cancel, events).await
    }

    /// Scan several subnets one after another.
    ///
    /// All CIDRs are validated before the first packet is sent, so a bad
    /// entry fails the whole run without partial results. Progress events
    /// count across subnets against the combined host total.
    pub async fn scan_subnets(
        &self,
        cidrs: &[String],
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<ScanReport, ProbeError> {
        let mut plan = Vec::with_capacity(cidrs.len());
        let mut total = 0u64;
        for cidr in cidrs {
            total += validate_subnet(cidr)?;
            let (network, prefix) = parse_cidr(cidr)?;
            plan.push(PlannedSubnet {
                cidr: cidr.trim().to_string(),
                network,
                prefix,
            });
        }

        let results: Arc<Mutex<Vec<HostResult>>> = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicU64::new(0));
        let count = plan.len();

        for (index, subnet) in plan.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            tracing::info!(cidr = %subnet.cidr, index, count, "scanning subnet");
            let _ = events.send(ScanEvent::SubnetStarted {
                cidr: subnet.cidr.clone(),
                index,
                count,
            });
            self.sweep(
                subnet,
                total,
                &completed,
                &results,
                &cancel,
                &events,
            )
            .await;
        }

        let mut hosts = std::mem::take(&mut *results.lock().await);
        hosts.sort_by_key(HostResult::sort_key);

        let report = ScanReport {
            scanned_total: total,
            scanned_done: completed.load(Ordering::Relaxed),
            reachable_count: hosts.iter().filter(|h| h.is_reachable()).count() as u64,
            cancelled: cancel.is_cancelled(),
            finished_at: now_rfc3339(),
            hosts,
        };
        tracing::info!(
            done = report.scanned_done,
            total = report.scanned_total,
            reachable = report.reachable_count,
            cancelled = report.cancelled,
            "scan finished"
        );
        Ok(report)
    }

    async fn sweep(
        &self,
        subnet: PlannedSubnet,
        total: u64,
        completed: &Arc<AtomicU64>,
        results: &Arc<Mutex<Vec<HostResult>>>,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<ScanEvent>,
    ) {
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let cidr: Arc<str> = Arc::from(subnet.cidr.as_str());

        for ip in host_addresses(subnet.network, subnet.prefix) {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let prober = self.prober.clone();
            let cidr = cidr.clone();
            let completed = completed.clone();
            let results = results.clone();
            let cancel = cancel.clone();
            let events = events.clone();

            set.spawn(async move {
                let _permit = permit;
                match prober.probe(ip, &cancel).await {
                    Ok(mut host) => {
                        host.subnet = cidr.to_string();
                        let _ = events.send(ScanEvent::Host(host.clone()));
                        results.lock().await.push(host);
                        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                        let _ = events.send(ScanEvent::Progress {
                            completed: done,
                            total,
                        });
                    }
                    Err(ProbeError::Cancelled) => {}
                    Err(e) => tracing::debug!(%ip, error = %e, "probe failed"),
                }
            });
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                tracing::warn!(error = %e, "probe task panicked");
            }
        }
    }

    /// Probe one address again, outside the admission gate.
    pub async fn rescan_host(
        &self,
        ip: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Result<HostResult, ProbeError> {
        self.prober.probe(ip, cancel).await
    }

    /// Refresh `host` in place from a new probe, keeping subnet and ports.
    pub async fn refresh_host(
        &self,
        host: &mut HostResult,
        cancel: &CancellationToken,
    ) -> Result<(), ProbeError> {
        host.probing = true;
        let fresh = self.rescan_host(host.ip, cancel).await;
        host.probing = false;
        host.refresh_from(&fresh?);
        Ok(())
    }

    /// Port-scan every reachable host in `hosts` one after another,
    /// emitting the updated host after each.
    pub async fn enrich_ports(
        &self,
        hosts: &mut [HostResult],
        req: &PortScanRequest,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<(), ProbeError> {
        for host in hosts.iter_mut().filter(|h| h.is_reachable()) {
            scan_host_ports(host, req, cancel).await?;
            let _ = events.send(ScanEvent::Host(host.clone()));
        }
        Ok(())
    }
}

/// Port-scan a single host, maintaining its in-flight flags.
pub async fn scan_host_ports(
    host: &mut HostResult,
    req: &PortScanRequest,
    cancel: &CancellationToken,
) -> Result<(), ProbeError> {
    host.port_scanning = true;
    let res = ports::scan_ports(host.ip, req, cancel).await;
    host.port_scanning = false;
    host.open_ports = res?;
    host.ports_scanned = true;
    Ok(())
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
