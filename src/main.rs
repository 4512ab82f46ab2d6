//! vault-webhook - inject Vault database credential sidecars into Pods.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Parses and validates configuration
//! - Syncs the DatabaseCredentialBinding cache
//! - Starts the health server, the certificate watcher and the TLS webhook server

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vault_webhook::bindings::{BindingCache, BindingMatcher};
use vault_webhook::config::Config;
use vault_webhook::crd::DatabaseCredentialBinding;
use vault_webhook::error::Error;
use vault_webhook::health::{HealthState, Metrics, run_health_server};
use vault_webhook::tls::CertReloader;
use vault_webhook::webhooks::{PatchBuilder, WebhookState, run_webhook_server};

/// Window for in-flight admission requests to finish during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    if config.crd {
        print!("{}", serde_yaml::to_string(&DatabaseCredentialBinding::crd())?);
        return Ok(());
    }

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vault_webhook=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    config.validate()?;

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        info!("TLS crypto provider already installed");
    }

    info!(
        cluster = config.cluster.as_deref().unwrap_or_default(),
        listen_addr = %config.listen_addr,
        health_addr = %config.health_addr,
        "Starting vault-webhook"
    );

    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::new());
    let health_state = Arc::new(HealthState::new(metrics.clone()));

    // Start health server immediately so liveness probes pass during sync
    let health_handle = {
        let health_state = health_state.clone();
        let cancel = cancel.clone();
        let addr = config.health_addr;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr, cancel).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let cache = Arc::new(BindingCache::new(metrics.binding_cache_size.clone()));
    let mut watch_handle = tokio::time::timeout(config.sync_timeout(), cache.start(client, cancel.clone()))
        .await
        .map_err(|_| {
            Error::InitialSync(format!(
                "binding cache did not sync within {}s",
                config.sync_timeout().as_secs()
            ))
        })??;
    health_state.set_ready(true).await;

    let reloader = Arc::new(
        CertReloader::new(&config.tls_cert, &config.tls_key)?.with_metrics(metrics.clone()),
    );
    let cert_watch_handle = reloader.watch(cancel.clone())?;

    let state = Arc::new(WebhookState::new(
        BindingMatcher::new(cache),
        PatchBuilder::new(config.sidecar()),
        metrics,
    ));

    let server_handle = axum_server::Handle::new();
    let mut webhook_handle = {
        let server_handle = server_handle.clone();
        let addr = config.listen_addr;
        tokio::spawn(async move { run_webhook_server(state, addr, reloader, server_handle).await })
    };

    // Wait for the webhook server or binding watch to stop, or a shutdown signal
    tokio::select! {
        result = &mut watch_handle => {
            if let Err(e) = result {
                error!("Binding watch task panicked: {}", e);
            }
            error!("Binding watch stopped, refusing to serve from a stale cache");

            health_state.set_ready(false).await;
            cancel.cancel();
            server_handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)));
            for (name, handle) in [("certificate watch", cert_watch_handle), ("health server", health_handle)] {
                if let Err(e) = handle.await {
                    error!("{} task panicked: {}", name, e);
                }
            }
            match webhook_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Webhook server error during shutdown: {}", e),
                Err(e) => error!("Webhook server task panicked: {}", e),
            }
            return Err(Error::WatchEnded.into());
        }
        result = &mut webhook_handle => {
            cancel.cancel();
            match result {
                Ok(Ok(())) => info!("Webhook server stopped"),
                Ok(Err(e)) => {
                    error!("Webhook server error: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Webhook server task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Mark as not ready to stop receiving new requests
            health_state.set_ready(false).await;
            cancel.cancel();

            info!(
                "Waiting up to {}s for in-flight admission requests to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            server_handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)));
            match webhook_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Webhook server error during shutdown: {}", e),
                Err(e) => error!("Webhook server task panicked: {}", e),
            }
        }
    }

    for (name, handle) in [
        ("binding watch", watch_handle),
        ("certificate watch", cert_watch_handle),
        ("health server", health_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{} task panicked: {}", name, e);
        }
    }

    info!("vault-webhook stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the webhook cannot shut down
/// gracefully without them. Using expect() here is intentional.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
