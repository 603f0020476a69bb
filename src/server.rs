use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};

use crate::{
    config::AppSettings,
    dns_bench::{self, DnsBenchmarkResult, ResolverTarget},
    error::ProbeError,
    netdetect,
    scanner::ScanOrchestrator,
    timeseries::{local_now, SessionView},
    traceroute::TraceMonitor,
    types::{HostResult, PortScanMode, PortScanRequest, ScanEvent, SubnetEntry},
};

/// Long-lived engine pieces shared by all handlers.
pub struct Engine {
    pub orchestrator: ScanOrchestrator,
    pub monitor: TraceMonitor,
    pub settings: AppSettings,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>, // scan / benchmark progress and results
    engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState::default())),
            engine: Arc::new(engine),
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    status: Status,
    hosts: Vec<HostResult>,
    cancel: Option<CancellationToken>,
    // Bumped per run so a superseded run cannot overwrite its successor.
    scan_id: u64,
    dns_id: u64,
    dns_state: RunState,
    dns: Vec<DnsBenchmarkResult>,
    dns_cancel: Option<CancellationToken>,
}

impl ServerState {
    /// Insert or replace by address, keeping `hosts` sorted.
    fn upsert_host(&mut self, host: HostResult) {
        match self
            .hosts
            .binary_search_by_key(&host.sort_key(), HostResult::sort_key)
        {
            Ok(i) => self.hosts[i] = host,
            Err(i) => self.hosts.insert(i, host),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Done,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Status {
    pub total: u64,
    pub scanned: u64,
    pub reachable: u64,
    pub state: RunState,
    /// Subnet currently being swept, `index/count` style.
    pub subnet: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ScanRequest {
    /// CIDRs to sweep. Empty means every detected local subnet.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Port-scan reachable hosts afterwards (defaults to the settings).
    #[serde(default)]
    pub scan_ports: Option<bool>,
    #[serde(default)]
    pub port_mode: Option<PortScanMode>,
    #[serde(default)]
    pub custom_ports: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PortsRequest {
    #[serde(default)]
    pub mode: PortScanMode,
    #[serde(default)]
    pub custom_ports: String,
}

#[derive(Debug, Deserialize)]
pub struct AddTraceRequest {
    pub destination: String,
    #[serde(default)]
    pub start: bool,
}

#[derive(Debug, Deserialize)]
pub struct WindowRequest {
    pub minutes: u32,
}

#[derive(Debug, Deserialize)]
pub struct PanRequest {
    /// View end; omitted means back to live.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub paused: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct DnsRequest {
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub resolvers: Vec<ResolverInput>,
    #[serde(default = "default_true")]
    pub include_local: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResolverInput {
    pub address: String,
    #[serde(default)]
    pub name: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct DnsStatus {
    state: RunState,
    results: Vec<DnsBenchmarkResult>,
}

/// JSON error body: `{ "error": key, "message": text }`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
}

impl From<ProbeError> for ApiError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::UnknownSession(_) => ApiError::NotFound(e.to_string()),
            e if e.is_validation() => ApiError::BadRequest(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Internal(msg) => {
                tracing::error!(details = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/scan/cancel", post(post_scan_cancel))
        .route("/results", get(get_results))
        .route("/subnets", get(get_subnets))
        .route("/hosts/{ip}/rescan", post(post_rescan))
        .route("/hosts/{ip}/ports", post(post_host_ports))
        .route("/traces", get(get_traces).post(post_trace))
        .route("/traces/{destination}", get(get_trace).delete(delete_trace))
        .route("/traces/{destination}/start", post(post_trace_start))
        .route("/traces/{destination}/stop", post(post_trace_stop))
        .route("/traces/{destination}/window", post(post_trace_window))
        .route("/traces/{destination}/pan", post(post_trace_pan))
        .route("/traces/{destination}/pause", post(post_trace_pause))
        .route("/dns", get(get_dns).post(post_dns))
        .route("/dns/cancel", post(post_dns_cancel))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state);

    let static_svc = ServeDir::new("ui").append_index_html_on_directories(true);

    Router::new()
        .nest("/api", api)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, engine: Engine) -> Result<()> {
    let app = build_router(AppState::new(engine));
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "serving UI");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    (StatusCode::OK, Json(s.status.clone()))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    Json(s.hosts.clone())
}

async fn get_subnets() -> ApiResult<Json<Vec<SubnetEntry>>> {
    netdetect::connected_subnets()
        .map(Json)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

fn resolve_port_request(
    settings: &AppSettings,
    mode: Option<PortScanMode>,
    custom: Option<&str>,
) -> Result<PortScanRequest, ProbeError> {
    PortScanRequest::parse(
        mode.unwrap_or(settings.port_scan_mode),
        custom.unwrap_or(&settings.custom_ports),
    )
}

async fn post_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> ApiResult<impl IntoResponse> {
    let settings = &app.engine.settings;
    let subnets = if req.subnets.is_empty() {
        netdetect::connected_subnets()
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .into_iter()
            .filter(|s| s.selected)
            .map(|s| s.cidr)
            .collect()
    } else {
        req.subnets
    };
    if subnets.is_empty() {
        return Err(ApiError::BadRequest("no subnets to scan".into()));
    }

    // Everything is validated up front so a bad request never starts a sweep.
    let mut total = 0u64;
    for cidr in &subnets {
        total += netdetect::validate_subnet(cidr)?;
    }
    let scan_ports = req.scan_ports.unwrap_or(settings.auto_port_scan);
    let port_req = if scan_ports {
        Some(resolve_port_request(
            settings,
            req.port_mode,
            req.custom_ports.as_deref(),
        )?)
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let status = Status {
        total,
        state: RunState::Running,
        ..Status::default()
    };
    let id = {
        let mut s = app.inner.write().await;
        if let Some(c) = s.cancel.take() {
            c.cancel();
        }
        s.status = status.clone();
        s.hosts.clear();
        s.cancel = Some(cancel.clone());
        s.scan_id += 1;
        s.scan_id
    };

    tokio::spawn(run_scan(app.clone(), id, subnets, port_req, cancel));
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn run_scan(
    app: AppState,
    id: u64,
    subnets: Vec<String>,
    port_req: Option<PortScanRequest>,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ScanEvent>();

    let drain_state = app.clone();
    let drain = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            let mut s = drain_state.inner.write().await;
            if s.scan_id != id {
                continue;
            }
            match ev {
                ScanEvent::SubnetStarted { cidr, index, count } => {
                    s.status.subnet = Some(format!("{cidr} ({}/{count})", index + 1));
                }
                ScanEvent::Host(host) => {
                    if host.is_reachable() && !s.hosts.iter().any(|h| h.ip == host.ip) {
                        s.status.reachable += 1;
                    }
                    s.upsert_host(host);
                }
                ScanEvent::Progress { completed, total } => {
                    s.status.scanned = completed;
                    s.status.total = total;
                }
            }
        }
    });

    let orch = &app.engine.orchestrator;
    let res = orch.scan_subnets(&subnets, cancel.clone(), tx.clone()).await;
    let final_state = match res {
        Ok(mut report) => {
            if let (Some(req), false) = (port_req.as_ref(), report.cancelled) {
                if let Err(e) = orch.enrich_ports(&mut report.hosts, req, &cancel, &tx).await {
                    tracing::debug!(error = %e, "port enrichment stopped");
                }
            }
            if cancel.is_cancelled() {
                RunState::Cancelled
            } else {
                RunState::Done
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "scan failed");
            RunState::Failed
        }
    };
    drop(tx);
    let _ = drain.await;

    let mut s = app.inner.write().await;
    if s.scan_id != id {
        return;
    }
    s.status.state = final_state;
    s.status.subnet = None;
    s.status.reachable = s.hosts.iter().filter(|h| h.is_reachable()).count() as u64;
    s.cancel = None;
}

async fn post_scan_cancel(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    match s.cancel.as_ref() {
        Some(c) => {
            c.cancel();
            StatusCode::ACCEPTED
        }
        None => StatusCode::NO_CONTENT,
    }
}

fn parse_ip(ip: &str) -> ApiResult<Ipv4Addr> {
    ip.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid IPv4 address: {ip}")))
}

async fn post_rescan(
    State(app): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Json<HostResult>> {
    let ip = parse_ip(&ip)?;
    let mut host = {
        let mut s = app.inner.write().await;
        match s.hosts.iter_mut().find(|h| h.ip == ip) {
            Some(h) => {
                h.probing = true;
                h.clone()
            }
            None => HostResult::new(ip),
        }
    };

    let res = app
        .engine
        .orchestrator
        .refresh_host(&mut host, &CancellationToken::new())
        .await;

    let mut s = app.inner.write().await;
    match res {
        Ok(()) => {
            s.upsert_host(host.clone());
            Ok(Json(host))
        }
        Err(e) => {
            if let Some(h) = s.hosts.iter_mut().find(|h| h.ip == ip) {
                h.probing = false;
            }
            Err(e.into())
        }
    }
}

async fn post_host_ports(
    State(app): State<AppState>,
    Path(ip): Path<String>,
    Json(req): Json<PortsRequest>,
) -> ApiResult<Json<HostResult>> {
    let ip = parse_ip(&ip)?;
    let port_req = PortScanRequest::parse(req.mode, &req.custom_ports)?;
    let mut host = {
        let mut s = app.inner.write().await;
        match s.hosts.iter_mut().find(|h| h.ip == ip) {
            Some(h) => {
                h.port_scanning = true;
                h.clone()
            }
            None => HostResult::new(ip),
        }
    };
    crate::scanner::scan_host_ports(&mut host, &port_req, &CancellationToken::new()).await?;
    app.inner.write().await.upsert_host(host.clone());
    Ok(Json(host))
}

async fn get_traces(State(app): State<AppState>) -> Json<Vec<SessionView>> {
    Json(app.engine.monitor.views())
}

async fn post_trace(
    State(app): State<AppState>,
    Json(req): Json<AddTraceRequest>,
) -> ApiResult<impl IntoResponse> {
    let monitor = &app.engine.monitor;
    monitor.add(&req.destination)?;
    if req.start {
        monitor.start(req.destination.trim()).await?;
    }
    let view = monitor
        .view(&req.destination)
        .ok_or_else(|| ApiError::NotFound(req.destination.clone()))?;
    Ok((StatusCode::CREATED, Json(view)))
}

fn view_or_404(app: &AppState, destination: &str) -> ApiResult<Json<SessionView>> {
    app.engine
        .monitor
        .view(destination)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no trace session for {destination}")))
}

async fn get_trace(
    State(app): State<AppState>,
    Path(destination): Path<String>,
) -> ApiResult<Json<SessionView>> {
    view_or_404(&app, &destination)
}

async fn delete_trace(
    State(app): State<AppState>,
    Path(destination): Path<String>,
) -> ApiResult<StatusCode> {
    if app.engine.monitor.remove(&destination) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProbeError::UnknownSession(destination).into())
    }
}

async fn post_trace_start(
    State(app): State<AppState>,
    Path(destination): Path<String>,
) -> ApiResult<Json<SessionView>> {
    app.engine.monitor.start(&destination).await?;
    view_or_404(&app, &destination)
}

async fn post_trace_stop(
    State(app): State<AppState>,
    Path(destination): Path<String>,
) -> ApiResult<Json<SessionView>> {
    app.engine.monitor.stop(&destination);
    view_or_404(&app, &destination)
}

async fn post_trace_window(
    State(app): State<AppState>,
    Path(destination): Path<String>,
    Json(req): Json<WindowRequest>,
) -> ApiResult<Json<SessionView>> {
    app.engine.monitor.with_session(&destination, |s| {
        s.series.set_window_minutes_at(req.minutes, local_now())
    })?;
    view_or_404(&app, &destination)
}

async fn post_trace_pan(
    State(app): State<AppState>,
    Path(destination): Path<String>,
    Json(req): Json<PanRequest>,
) -> ApiResult<Json<SessionView>> {
    app.engine.monitor.with_session(&destination, |s| {
        let now = local_now();
        match req.end {
            Some(end) => s.series.pan_to_at(end, now),
            None => s.series.reset_to_live_at(now),
        }
    })?;
    view_or_404(&app, &destination)
}

async fn post_trace_pause(
    State(app): State<AppState>,
    Path(destination): Path<String>,
    Json(req): Json<PauseRequest>,
) -> ApiResult<Json<SessionView>> {
    app.engine.monitor.with_session(&destination, |s| {
        s.series.set_paused_at(req.paused, local_now())
    })?;
    view_or_404(&app, &destination)
}

async fn get_dns(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let mut results = s.dns.clone();
    dns_bench::sort_by_uncached_avg(&mut results);
    Json(DnsStatus {
        state: s.dns_state,
        results,
    })
}

async fn post_dns(
    State(app): State<AppState>,
    Json(req): Json<DnsRequest>,
) -> ApiResult<impl IntoResponse> {
    let settings = &app.engine.settings;
    let mut custom = Vec::new();
    for r in settings
        .custom_resolvers
        .iter()
        .map(|r| (r.address.as_str(), r.name.as_str()))
        .chain(req.resolvers.iter().map(|r| (r.address.as_str(), r.name.as_str())))
    {
        custom.push(ResolverTarget::parse(r.0, r.1)?);
    }
    let targets = dns_bench::benchmark_targets(&custom, req.include_local);
    let duration = Duration::from_secs(req.duration_secs.unwrap_or(settings.dns_duration_secs).max(1));

    let cancel = CancellationToken::new();
    let id = {
        let mut s = app.inner.write().await;
        if let Some(c) = s.dns_cancel.take() {
            c.cancel();
        }
        s.dns.clear();
        s.dns_state = RunState::Running;
        s.dns_cancel = Some(cancel.clone());
        s.dns_id += 1;
        s.dns_id
    };

    let app2 = app.clone();
    let count = targets.len();
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<DnsBenchmarkResult>();
        let drain_state = app2.clone();
        let drain = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let mut s = drain_state.inner.write().await;
                if s.dns_id != id {
                    continue;
                }
                match s.dns.iter_mut().find(|r| r.address == update.address) {
                    Some(slot) => *slot = update,
                    None => s.dns.push(update),
                }
            }
        });

        let res = dns_bench::run_all(targets, duration, cancel, tx).await;
        let _ = drain.await;

        let mut s = app2.inner.write().await;
        if s.dns_id != id {
            return;
        }
        s.dns_cancel = None;
        let state = match res {
            Ok(results) => {
                s.dns = results;
                RunState::Done
            }
            Err(ProbeError::Cancelled) => RunState::Cancelled,
            Err(e) => {
                tracing::warn!(error = %e, "dns benchmark failed");
                RunState::Failed
            }
        };
        s.dns_state = state;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "resolvers": count, "duration_secs": duration.as_secs() })),
    ))
}

async fn post_dns_cancel(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    match s.dns_cancel.as_ref() {
        Some(c) => {
            c.cancel();
            StatusCode::ACCEPTED
        }
        None => StatusCode::NO_CONTENT,
    }
}
