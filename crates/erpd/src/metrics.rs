//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  Liveness probe (always 200 if process is running)
//!   GET /readyz   Readiness probe (ECIES and task keys valid, TEE token present)
//!   GET /health   JSON details

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use erp_core::BlobType;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde_json::{json, Map, Value};

use crate::daemon::AppState;

/// Types without which no request can be served.
const REQUIRED_TYPES: [BlobType; 2] = [BlobType::EciesKeypair, BlobType::TaskKeyDerivation];

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

pub struct Metrics {
    registry: Registry,
    sessions_active: Gauge,
    sessions_idle: Gauge,
    sessions_max_used: Gauge,
    vau_requests: Family<OutcomeLabels, Counter>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let sessions_active = Gauge::default();
        let sessions_idle = Gauge::default();
        let sessions_max_used = Gauge::default();
        let vau_requests = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "erp_hsm_sessions_active",
            "HSM sessions currently on loan",
            sessions_active.clone(),
        );
        registry.register(
            "erp_hsm_sessions_idle",
            "HSM sessions waiting in the pool",
            sessions_idle.clone(),
        );
        registry.register(
            "erp_hsm_sessions_max_used",
            "Highest number of concurrently used HSM sessions",
            sessions_max_used.clone(),
        );
        registry.register(
            "erp_vau_requests",
            "VAU requests by outcome",
            vau_requests.clone(),
        );
        Self {
            registry,
            sessions_active,
            sessions_idle,
            sessions_max_used,
            vau_requests,
        }
    }

    pub fn record_vau(&self, outcome: &str) {
        self.vau_requests
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    fn observe_pool(&self, state: &AppState) {
        self.sessions_active
            .set(state.pool.active_session_count() as i64);
        self.sessions_idle
            .set(state.pool.inactive_session_count() as i64);
        self.sessions_max_used
            .set(state.pool.max_used_session_count() as i64);
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/health", get(health_handler))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.observe_pool(&state);
    let mut body = String::new();
    match encode(&mut body, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Why the service cannot serve requests, if it cannot.
fn not_ready_reason(state: &AppState) -> Option<&'static str> {
    if state.pool.is_released() {
        return Some("HSM pool released");
    }
    if state.updater.current().is_none() {
        return Some("no TEE token");
    }
    let valid = state.blob_cache().has_valid_blobs_of_type(&REQUIRED_TYPES);
    if valid.iter().any(|v| !v) {
        return Some("required key material missing");
    }
    None
}

/// Readiness probe: 200 when requests can be served, 503 otherwise.
async fn readyz_handler(State(state): State<AppState>) -> impl IntoResponse {
    match not_ready_reason(&state) {
        None => (StatusCode::OK, "ready"),
        Some(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason),
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let reason = not_ready_reason(&state);
    let validity = state.blob_cache().has_valid_blobs_of_type(&BlobType::ALL);
    let blobs: Map<String, Value> = BlobType::ALL
        .iter()
        .zip(validity)
        .map(|(t, valid)| (t.admin_name().to_string(), Value::Bool(valid)))
        .collect();
    let token_age = state.updater.token_age().ok().map(|age| age.as_secs());

    let body = json!({
        "status": if reason.is_none() { "ok" } else { "degraded" },
        "reason": reason,
        "release": state.blob_cache().release(),
        "hsmPool": {
            "active": state.pool.active_session_count(),
            "idle": state.pool.inactive_session_count(),
            "maxUsed": state.pool.max_used_session_count(),
            "max": state.pool.max_session_count(),
        },
        "teeToken": {
            "present": state.updater.current().is_some(),
            "ageSeconds": token_age,
            "refreshTaskRunning": state.updater.is_running(),
        },
        "blobs": blobs,
    });
    let status = if reason.is_none() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
