//! Mutating admission webhook server.
//!
//! Serves `POST /mutate` over TLS. Pods created in a namespace with matching
//! DatabaseCredentialBindings are patched with the credential volume, mounts
//! and sidecars; everything else is allowed unchanged.
//!
//! Register it with a MutatingWebhookConfiguration pointing at `/mutate` and
//! mount the serving certificate at `/etc/webhook/certs/`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use json_patch::{Patch, PatchOperation};
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, error, info, warn};

use crate::bindings::BindingMatcher;
use crate::error::{Error, Result};
use crate::health::{AdmissionOutcome, Metrics, healthz};
use crate::tls::{CertReloader, TlsError};
use crate::webhooks::patch::PatchBuilder;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Shared state for webhook handlers
pub struct WebhookState {
    pub matcher: BindingMatcher,
    pub patcher: PatchBuilder,
    pub metrics: Arc<Metrics>,
}

impl WebhookState {
    pub fn new(matcher: BindingMatcher, patcher: PatchBuilder, metrics: Arc<Metrics>) -> Self {
        Self {
            matcher,
            patcher,
            metrics,
        }
    }
}

/// What to do with an admitted Pod
enum Mutation {
    Skip,
    Patch(Vec<PatchOperation>, usize),
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// `POST /mutate`
///
/// Transport problems are answered with an HTTP error. Anything after that is
/// a 200 carrying an AdmissionReview, with failures reported as a denial.
async fn mutate(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    if body.is_empty() {
        warn!("Rejecting admission request with empty body");
        state
            .metrics
            .record_admission(AdmissionOutcome::Rejected, started.elapsed().as_secs_f64());
        return (StatusCode::BAD_REQUEST, "empty body").into_response();
    }

    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if content_type != Some(JSON_CONTENT_TYPE) {
        warn!(content_type = ?content_type, "Rejecting admission request with unexpected Content-Type");
        state
            .metrics
            .record_admission(AdmissionOutcome::Rejected, started.elapsed().as_secs_f64());
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "invalid Content-Type, expect `application/json`",
        )
            .into_response();
    }

    let (review, outcome) = handle_review(&state, &body);
    state
        .metrics
        .record_admission(outcome, started.elapsed().as_secs_f64());

    (StatusCode::OK, Json(review)).into_response()
}

/// Decode an AdmissionReview body and produce the response review
fn handle_review(state: &WebhookState, body: &[u8]) -> (AdmissionReview<DynamicObject>, AdmissionOutcome) {
    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(body) {
        Ok(review) => review,
        Err(e) => {
            error!(error = %e, "Failed to decode AdmissionReview");
            return (
                AdmissionResponse::invalid(e.to_string()).into_review(),
                AdmissionOutcome::Failed,
            );
        }
    };

    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to extract admission request");
            return (
                AdmissionResponse::invalid(e.to_string()).into_review(),
                AdmissionOutcome::Failed,
            );
        }
    };

    let (response, outcome) = admit(state, &request);
    (response.into_review(), outcome)
}

fn admit(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> (AdmissionResponse, AdmissionOutcome) {
    let uid = &request.uid;

    match mutation(state, request) {
        Ok(Mutation::Skip) => (AdmissionResponse::from(request), AdmissionOutcome::Skipped),
        Ok(Mutation::Patch(ops, sidecars)) => {
            if tracing::enabled!(tracing::Level::DEBUG)
                && let Ok(bytes) = PatchBuilder::encode(&ops)
            {
                debug!(uid = %uid, patch = %String::from_utf8_lossy(&bytes), "Generated patch");
            }

            match AdmissionResponse::from(request).with_patch(Patch(ops)) {
                Ok(response) => {
                    state.metrics.record_injection(sidecars);
                    info!(uid = %uid, sidecars, "Injected credential sidecars");
                    (response, AdmissionOutcome::Mutated)
                }
                Err(e) => {
                    error!(uid = %uid, error = %e, "Failed to serialize patch");
                    (
                        AdmissionResponse::from(request).deny(format!("patch serialization error: {e}")),
                        AdmissionOutcome::Failed,
                    )
                }
            }
        }
        Err(e) => {
            error!(uid = %uid, error = %e, "Admission request failed");
            (
                AdmissionResponse::from(request).deny(e.to_string()),
                AdmissionOutcome::Failed,
            )
        }
    }
}

fn mutation(state: &WebhookState, request: &AdmissionRequest<DynamicObject>) -> Result<Mutation> {
    let uid = &request.uid;

    if request.operation != Operation::Create {
        debug!(uid = %uid, operation = ?request.operation, "Allowing non-CREATE operation unchanged");
        return Ok(Mutation::Skip);
    }

    let Some(object) = &request.object else {
        debug!(uid = %uid, "No object in request, allowing unchanged");
        return Ok(Mutation::Skip);
    };
    let pod = decode_pod(object)?;

    let namespace = request
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone())
        .unwrap_or_default();
    let service_account = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.as_deref())
        .unwrap_or_default();
    let owner = pod
        .metadata
        .owner_references
        .as_deref()
        .and_then(|owners| owners.first());

    info!(
        uid = %uid,
        namespace = %namespace,
        owner_kind = owner.map(|o| o.kind.as_str()).unwrap_or_default(),
        owner_name = owner.map(|o| o.name.as_str()).unwrap_or_default(),
        service_account = %service_account,
        "Processing admission request"
    );

    let credentials = state.matcher.matches(&namespace, service_account)?;
    if credentials.is_empty() {
        debug!(uid = %uid, namespace = %namespace, "No matching bindings, skipping mutation");
        return Ok(Mutation::Skip);
    }

    let ops = state.patcher.build(&pod, &namespace, &credentials)?;
    Ok(Mutation::Patch(ops, credentials.len() * 2))
}

/// Decode the embedded object as a Pod
fn decode_pod(object: &DynamicObject) -> Result<Pod> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(Error::PodDecode)
}

/// Errors that can occur when running the webhook server
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsError),

    /// Server error
    #[error("webhook server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Run the webhook server with TLS until `handle` is told to shut down.
///
/// Certificates are served through `reloader`, so rotations take effect for
/// new connections without a restart.
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    reloader: Arc<CertReloader>,
    handle: Handle,
) -> std::result::Result<(), WebhookError> {
    let app = create_webhook_router(state);
    let config = RustlsConfig::from_config(Arc::new(reloader.server_config()?));

    info!(%addr, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
