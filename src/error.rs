use std::sync::Arc;

use crate::store::StoreError;

/// Represents a result type for operations in the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the engine.
///
/// Most of these are recovered from internally (retried, queued, or logged). The one that callers
/// should never ignore is [`Error::NotInitialized`].
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The engine was used before [`Engine::initialize`](crate::Engine::initialize) completed or
    /// after it was disposed.
    #[error("engine used before initialization")]
    NotInitialized,

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Server responded with a non-2xx status.
    #[error("unexpected response status: {0}")]
    HttpStatus(u16),

    /// Error reported by a custom transport implementation.
    #[error("transport error: {0}")]
    Transport(String),

    /// Persistent store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failed to (de)serialize a persisted or received value.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// A background task was requested outside of a tokio runtime.
    #[error("no tokio runtime available to spawn background task")]
    NoRuntime,

    /// The periodic refresh task panicked.
    #[error("periodic refresh task panicked")]
    PollerPanicked,
}

impl Error {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Unauthorized | Error::InvalidBaseUrl(_) | Error::NotInitialized
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}
