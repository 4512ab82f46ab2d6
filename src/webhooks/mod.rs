//! Mutating admission webhook for credential sidecar injection.
//!
//! - `server`: axum/TLS front end handling AdmissionReview requests
//! - `patch`: JSON patch generation for a matched Pod
//! - `sidecar`: the injected containers themselves

pub mod patch;
mod server;
pub mod sidecar;

pub use patch::PatchBuilder;
pub use server::{WebhookError, WebhookState, create_webhook_router, run_webhook_server};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
