//! Serving certificate with hot reload.
//!
//! The webhook certificate is usually mounted from a Secret and rotated by
//! cert-manager. `CertReloader` keeps the active pair behind a lock, serves it
//! to every handshake, and swaps it whenever a file is created in the
//! certificate directory.

use std::fmt;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rustls::ServerConfig;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::Metrics;

/// Errors loading or watching the serving certificate
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse PEM in {}: {source}", .path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificate found in {}", .0.display())]
    NoCertificate(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("certificate watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// Hot-reloadable certificate resolver
pub struct CertReloader {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: RwLock<Arc<CertifiedKey>>,
    metrics: Option<Arc<Metrics>>,
}

impl fmt::Debug for CertReloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertReloader")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl CertReloader {
    /// Load the initial pair. Fails if either file is unreadable or the key
    /// does not belong to the certificate.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Result<Self, TlsError> {
        let cert_path = cert_path.into();
        let key_path = key_path.into();
        let certified = load_certified_key(&cert_path, &key_path)?;

        Ok(Self {
            cert_path,
            key_path,
            current: RwLock::new(Arc::new(certified)),
            metrics: None,
        })
    }

    /// Count reload attempts in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Re-read the pair from disk and swap it in.
    ///
    /// On failure the active pair is left untouched.
    pub fn reload(&self) -> Result<(), TlsError> {
        let result = load_certified_key(&self.cert_path, &self.key_path);
        if let Some(metrics) = &self.metrics {
            metrics.record_reload(result.is_ok());
        }

        let certified = Arc::new(result?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = certified;
        info!(cert = %self.cert_path.display(), "Reloaded serving certificate");
        Ok(())
    }

    /// The pair handed to new handshakes
    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Directory watched for rotations
    fn watch_dir(&self) -> &Path {
        self.cert_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// Reload on every create event in the certificate directory until
    /// `cancel` fires. Reload failures are logged and the previous pair stays
    /// active.
    pub fn watch(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>, TlsError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "Certificate watch error"),
            })?;
        watcher.watch(self.watch_dir(), RecursiveMode::NonRecursive)?;
        info!(dir = %self.watch_dir().display(), "Watching serving certificate directory");

        let reloader = Arc::clone(self);
        Ok(tokio::spawn(async move {
            // Dropping the watcher stops notifications, so it lives in the task
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Certificate watch cancelled");
                        return;
                    }
                    event = rx.recv() => {
                        let Some(event) = event else {
                            warn!("Certificate watch channel closed");
                            return;
                        };
                        if !matches!(event.kind, EventKind::Create(_)) {
                            continue;
                        }
                        debug!(paths = ?event.paths, "Certificate directory changed");
                        if let Err(e) = reloader.reload() {
                            error!(error = %e, "Failed to reload serving certificate, keeping previous one");
                        }
                    }
                }
            }
        }))
    }

    /// rustls server configuration resolving certificates through this reloader
    pub fn server_config(self: &Arc<Self>) -> Result<ServerConfig, TlsError> {
        let resolver: Arc<dyn ResolvesServerCert> = Arc::clone(self) as Arc<dyn ResolvesServerCert>;
        let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

impl ResolvesServerCert for CertReloader {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, TlsError> {
    let cert_pem = read_file(cert_path)?;
    let key_pem = read_file(key_path)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(&cert_pem[..]))
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Pem {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(cert_path.to_path_buf()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(&key_pem[..]))
        .map_err(|source| TlsError::Pem {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    let signing_key = aws_lc_rs::sign::any_supported_type(&key)?;
    let certified = CertifiedKey::new(certs, signing_key);
    certified.keys_match()?;
    Ok(certified)
}
