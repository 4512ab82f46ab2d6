//! vault-webhook library crate
//!
//! This module exports the binding cache, the admission webhook, the serving
//! certificate reloader, and the DatabaseCredentialBinding CRD.

pub mod bindings;
pub mod config;
pub mod crd;
pub mod error;
pub mod health;
pub mod tls;
pub mod webhooks;

pub use bindings::{BindingCache, BindingMatcher, MatchedCredential};
pub use config::{Config, SidecarConfig};
pub use error::{Error, Result};
pub use health::{HealthState, Metrics};
pub use tls::{CertReloader, TlsError};
pub use webhooks::{
    PatchBuilder, WebhookError, WebhookState, create_webhook_router, run_webhook_server,
};
