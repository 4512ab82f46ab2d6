//! Error types for the webhook.
//!
//! Per-request errors are recovered into admission responses by the server;
//! only startup errors (`InitialSync`, `Config`) and a lost binding watch
//! (`WatchEnded`) are fatal.

use thiserror::Error;

/// Error type for webhook operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// An object in the binding store does not have the binding shape
    #[error("unexpected object in binding store {key}: {message}")]
    Enumeration { key: String, message: String },

    /// The admission request object could not be decoded as a Pod
    #[error("could not decode pod: {0}")]
    PodDecode(#[source] serde_json::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The binding watch ended before the initial list was applied
    #[error("initial binding sync failed: {0}")]
    InitialSync(String),

    /// The binding watch stopped after startup, leaving the cache frozen
    #[error("binding watch ended")]
    WatchEnded,

    /// Invalid process configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error should abort process startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InitialSync(_) | Error::Config(_) | Error::WatchEnded
        )
    }
}

/// Result type alias for webhook operations
pub type Result<T> = std::result::Result<T, Error>;
