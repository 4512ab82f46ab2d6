//! Process configuration.
//!
//! Every option can be given as a flag or through the environment. The parsed
//! configuration is immutable for the lifetime of the process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};

/// Placeholder substituted in the secret path format (database, then role)
const PATH_PLACEHOLDER: &str = "%s";

/// vault-webhook - inject Vault database credential sidecars into Pods
#[derive(Parser, Debug, Clone)]
#[command(name = "vault-webhook", version, about, long_about = None)]
pub struct Config {
    /// Print the DatabaseCredentialBinding CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// Name of the cluster this webhook runs in
    #[arg(long, env = "CLUSTER", required_unless_present = "crd")]
    pub cluster: Option<String>,

    /// Address of the Vault server the sidecar talks to
    #[arg(long, env = "VAULT_ADDR", default_value = "https://vault:8200")]
    pub vault_addr: String,

    /// Path to the Vault CA bundle inside the sidecar
    #[arg(long = "ca-cert", env = "VAULT_CA_CERT", default_value = "/etc/vault/ca.pem")]
    pub ca_cert: String,

    /// Vault Kubernetes auth login path
    #[arg(long, env = "VAULT_LOGIN_PATH", default_value = "kubernetes/login")]
    pub login_path: String,

    /// Image of the credentials sidecar
    #[arg(
        long,
        env = "SIDECAR_IMAGE",
        default_value = "quay.io/uswitch/vault-creds:latest"
    )]
    pub sidecar_image: String,

    /// Prometheus push gateway address handed to the sidecar
    #[arg(
        long,
        env = "GATEWAY_ADDR",
        default_value = "http://prometheus-pushgateway:9091"
    )]
    pub gateway_addr: String,

    /// Vault secret path template, `%s` is replaced by the database then the role
    #[arg(long, env = "SECRET_PATH_FORMAT", default_value = "%s/creds/%s")]
    pub secret_path_format: String,

    /// Address the TLS webhook server binds to
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    pub listen_addr: SocketAddr,

    /// Address the health and metrics server binds to
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    pub health_addr: SocketAddr,

    /// Serving certificate (PEM)
    #[arg(long, env = "TLS_CERT", default_value = "/etc/webhook/certs/cert.pem")]
    pub tls_cert: PathBuf,

    /// Serving private key (PEM)
    #[arg(long, env = "TLS_KEY", default_value = "/etc/webhook/certs/key.pem")]
    pub tls_key: PathBuf,

    /// Seconds to wait for the initial binding list before giving up
    #[arg(long = "sync-timeout", env = "SYNC_TIMEOUT_SECS", default_value_t = 60)]
    pub sync_timeout_secs: u64,
}

impl Config {
    /// Reject configurations that would produce broken sidecars
    pub fn validate(&self) -> Result<()> {
        if self.secret_path_format.matches(PATH_PLACEHOLDER).count() != 2 {
            return Err(Error::Config(format!(
                "secret path format {:?} must contain exactly two %s placeholders",
                self.secret_path_format
            )));
        }
        if self.sidecar_image.trim().is_empty() {
            return Err(Error::Config("sidecar image must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    /// Sidecar settings handed to the patch builder
    pub fn sidecar(&self) -> SidecarConfig {
        SidecarConfig {
            image: self.sidecar_image.clone(),
            vault_addr: self.vault_addr.clone(),
            gateway_addr: self.gateway_addr.clone(),
            ca_cert: self.ca_cert.clone(),
            login_path: self.login_path.clone(),
            secret_path_format: self.secret_path_format.clone(),
        }
    }
}

/// Settings baked into every injected sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarConfig {
    pub image: String,
    pub vault_addr: String,
    pub gateway_addr: String,
    pub ca_cert: String,
    pub login_path: String,
    pub secret_path_format: String,
}

impl SidecarConfig {
    /// Render the Vault secret path for a database role
    ///
    /// Placeholders are filled positionally from the format alone, so names
    /// containing `%s` are inserted verbatim.
    pub fn secret_path(&self, database: &str, role: &str) -> String {
        let Some((head, rest)) = self.secret_path_format.split_once(PATH_PLACEHOLDER) else {
            return self.secret_path_format.clone();
        };
        let tail = match rest.split_once(PATH_PLACEHOLDER) {
            Some((middle, tail)) => format!("{middle}{role}{tail}"),
            None => rest.to_string(),
        };
        format!("{head}{database}{tail}")
    }
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            image: "quay.io/uswitch/vault-creds:latest".to_string(),
            vault_addr: "https://vault:8200".to_string(),
            gateway_addr: "http://prometheus-pushgateway:9091".to_string(),
            ca_cert: "/etc/vault/ca.pem".to_string(),
            login_path: "kubernetes/login".to_string(),
            secret_path_format: "%s/creds/%s".to_string(),
        }
    }
}
