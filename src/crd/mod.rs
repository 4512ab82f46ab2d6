//! Custom Resource Definitions (CRDs) for vault-webhook.
//!
//! - `DatabaseCredentialBinding`: grant a service account a Vault database credential

mod database_credential_binding;

pub use database_credential_binding::*;
