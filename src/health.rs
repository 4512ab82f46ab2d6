//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 once the binding cache has synced)
//! - `/metrics` - Prometheus metrics endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How an admission request was answered
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Patch returned
    Mutated,
    /// Allowed without a patch
    Skipped,
    /// Rejected at the HTTP layer (bad content type, empty body)
    Rejected,
    /// Answered with an embedded failure message
    Failed,
}

impl AdmissionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionOutcome::Mutated => "mutated",
            AdmissionOutcome::Skipped => "skipped",
            AdmissionOutcome::Rejected => "rejected",
            AdmissionOutcome::Failed => "failed",
        }
    }
}

/// Labels for admission request metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AdmissionLabels {
    pub outcome: AdmissionOutcome,
}

impl EncodeLabelSet for AdmissionLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for certificate reload metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReloadLabels {
    pub result: &'static str,
}

impl EncodeLabelSet for ReloadLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("result", self.result).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the webhook
pub struct Metrics {
    /// Number of bindings currently held by the binding cache
    pub binding_cache_size: Gauge,
    /// Admission requests by outcome
    pub admission_requests_total: Family<AdmissionLabels, Counter>,
    /// Admission handling duration histogram
    pub admission_duration_seconds: Histogram,
    /// Sidecars injected into Pods
    pub injected_sidecars_total: Counter,
    /// Certificate reload attempts by result
    pub certificate_reloads_total: Family<ReloadLabels, Counter>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let binding_cache_size = Gauge::default();
        registry.register(
            "vault_webhook_binding_cache_size",
            "Current size of the DatabaseCredentialBinding cache",
            binding_cache_size.clone(),
        );

        let admission_requests_total = Family::<AdmissionLabels, Counter>::default();
        registry.register(
            "vault_webhook_admission_requests",
            "Total number of admission requests",
            admission_requests_total.clone(),
        );

        let admission_duration_seconds = Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        registry.register(
            "vault_webhook_admission_duration_seconds",
            "Duration of admission request handling in seconds",
            admission_duration_seconds.clone(),
        );

        let injected_sidecars_total = Counter::default();
        registry.register(
            "vault_webhook_injected_sidecars",
            "Total number of credential sidecars injected",
            injected_sidecars_total.clone(),
        );

        let certificate_reloads_total = Family::<ReloadLabels, Counter>::default();
        registry.register(
            "vault_webhook_certificate_reloads",
            "Total number of serving certificate reload attempts",
            certificate_reloads_total.clone(),
        );

        Self {
            binding_cache_size,
            admission_requests_total,
            admission_duration_seconds,
            injected_sidecars_total,
            certificate_reloads_total,
            registry,
        }
    }

    /// Record a handled admission request
    pub fn record_admission(&self, outcome: AdmissionOutcome, duration_secs: f64) {
        self.admission_requests_total
            .get_or_create(&AdmissionLabels { outcome })
            .inc();
        self.admission_duration_seconds.observe(duration_secs);
    }

    /// Record sidecars added by a patch
    pub fn record_injection(&self, sidecars: usize) {
        self.injected_sidecars_total.inc_by(sidecars as u64);
    }

    /// Record a certificate reload attempt
    pub fn record_reload(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.certificate_reloads_total
            .get_or_create(&ReloadLabels { result })
            .inc();
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the binding cache has completed its initial sync
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Arc<Metrics>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new(Arc::new(Metrics::new()))
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            ready: RwLock::new(false),
            metrics,
        }
    }

    /// Mark the webhook as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the webhook is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
pub(crate) async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the binding cache has synced.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server until `cancel` fires
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    info!(%addr, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
