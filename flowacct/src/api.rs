use crate::endpoints::EndpointTraffic;
use crate::ledger::{Ledger, LedgerEntry};
use crate::report::render_report;
use crate::storage::Storage;
use axum::{
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub storage: Arc<Storage>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    packets_total: Counter,
    bytes_total: Counter,
    polls_total: Counter,
    active_flows: Gauge,
    endpoint_bytes: Family<EndpointLabels, Counter>,
    endpoint_packets: Family<EndpointLabels, Counter>,
}

/// One direction of traffic between two endpoints.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EndpointLabels {
    from: String,
    from_kind: String,
    to: String,
    to_kind: String,
}

impl Metrics {
    /// Counter names get their `_total` suffix from the encoder.
    fn new() -> Self {
        let mut registry = Registry::default();
        let packets_total = Counter::default();
        let bytes_total = Counter::default();
        let polls_total = Counter::default();
        let active_flows = Gauge::default();
        let endpoint_bytes = Family::<EndpointLabels, Counter>::default();
        let endpoint_packets = Family::<EndpointLabels, Counter>::default();

        registry.register(
            "flowacct_packets",
            "Packets accounted across all flows",
            packets_total.clone(),
        );
        registry.register(
            "flowacct_bytes",
            "Bytes accounted across all flows",
            bytes_total.clone(),
        );
        registry.register(
            "flowacct_polls",
            "Completed walks of the flow tables",
            polls_total.clone(),
        );
        registry.register(
            "flowacct_active_flows",
            "Flows that changed within the idle window",
            active_flows.clone(),
        );
        registry.register(
            "flowacct_endpoint_bytes",
            "Bytes sent from one named endpoint to another",
            endpoint_bytes.clone(),
        );
        registry.register(
            "flowacct_endpoint_packets",
            "Packets sent from one named endpoint to another",
            endpoint_packets.clone(),
        );

        Self {
            registry,
            packets_total,
            bytes_total,
            polls_total,
            active_flows,
            endpoint_bytes,
            endpoint_packets,
        }
    }

    /// Bring the monotonic counters up to the ledger totals.
    fn sync(&self, ledger: &Ledger) {
        catch_up(&self.packets_total, ledger.total_packets.load(Ordering::Relaxed));
        catch_up(&self.bytes_total, ledger.total_bytes.load(Ordering::Relaxed));
        catch_up(&self.polls_total, ledger.polls.load(Ordering::Relaxed));
        self.active_flows
            .set(ledger.active_flows.load(Ordering::Relaxed) as i64);

        for traffic in ledger.endpoint_traffic() {
            let labels = EndpointLabels {
                from: traffic.pair.from,
                from_kind: traffic.pair.from_kind.as_str().to_string(),
                to: traffic.pair.to,
                to_kind: traffic.pair.to_kind.as_str().to_string(),
            };
            catch_up(&self.endpoint_bytes.get_or_create(&labels), traffic.bytes);
            catch_up(&self.endpoint_packets.get_or_create(&labels), traffic.packets);
        }
    }
}

fn catch_up(counter: &Counter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    active_flows: usize,
    polls: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    total_packets: u64,
    total_bytes: u64,
    active_flows: usize,
    tracked_flows: usize,
    polls: u64,
    packets_per_second: f64,
    bytes_per_second: f64,
}

#[derive(Serialize)]
pub struct FlowsResponse {
    flows: Vec<LedgerEntry>,
    total_packets: u64,
    total_bytes: u64,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

const MAX_FLOWS: usize = 100;
const DEFAULT_HISTORY: usize = 100;
const MAX_HISTORY: usize = 1000;

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/flows", get(get_flows))
        .route("/api/stats", get(get_stats))
        .route("/api/history", get(get_history))
        .route("/api/report", get(get_report))
        .route("/api/endpoints", get(get_endpoints))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    if !allowed_ips.is_empty() {
        let nets = Arc::new(parse_allowlist(allowed_ips));
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

fn parse_allowlist(allowed_ips: &[String]) -> Vec<IpNet> {
    allowed_ips
        .iter()
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(_) => {
                tracing::warn!("ignoring invalid allowlist entry {:?}", s);
                None
            }
        })
        .collect()
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        tracing::debug!("rejected API request from {}", ip);
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_flows: state.ledger.active_flows.load(Ordering::Relaxed),
        polls: state.ledger.polls.load(Ordering::Relaxed),
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let total_packets = state.ledger.total_packets.load(Ordering::Relaxed);
    let total_bytes = state.ledger.total_bytes.load(Ordering::Relaxed);

    let per_second = |total: u64| {
        if uptime > 0 {
            total as f64 / uptime as f64
        } else {
            0.0
        }
    };

    Json(StatsResponse {
        uptime_seconds: uptime,
        total_packets,
        total_bytes,
        active_flows: state.ledger.active_flows.load(Ordering::Relaxed),
        tracked_flows: state.ledger.tracked(),
        polls: state.ledger.polls.load(Ordering::Relaxed),
        packets_per_second: per_second(total_packets),
        bytes_per_second: per_second(total_bytes),
    })
}

async fn get_flows(State(state): State<Arc<AppState>>) -> Json<FlowsResponse> {
    Json(FlowsResponse {
        flows: state.ledger.active(MAX_FLOWS),
        total_packets: state.ledger.total_packets.load(Ordering::Relaxed),
        total_bytes: state.ledger.total_bytes.load(Ordering::Relaxed),
    })
}

async fn get_endpoints(State(state): State<Arc<AppState>>) -> Json<Vec<EndpointTraffic>> {
    Json(state.ledger.endpoint_traffic())
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY).min(MAX_HISTORY);
    match state.storage.query_history(limit) {
        Ok(data) => Json(serde_json::json!(data)),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

async fn get_report(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        render_report(&state.ledger.last_snapshot()),
    )
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    metrics.sync(&state.ledger);

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        tracing::error!("failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
