//! Error types, one enum per layer.

use std::time::Duration;

use thiserror::Error;

/// Configuration could not be loaded from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Why an inbound notification failed authentication.
///
/// Variants carry no secret material; the HTTP layer never echoes them back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    #[error("no shared secret configured for signed payloads")]
    SecretNotConfigured,

    #[error("signature mismatch")]
    InvalidSignature,

    #[error("unknown or inactive channel")]
    UnknownChannel,

    #[error("channel token mismatch")]
    TokenMismatch,

    #[error("timestamp {skew_secs}s outside tolerance of {tolerance:?}")]
    StaleTimestamp { skew_secs: i64, tolerance: Duration },

    #[error("unparseable timestamp: {0}")]
    BadTimestamp(String),
}

/// Failure talking to a provider's subscription or change-listing API.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no provider configured for {0}")]
    NotConfigured(String),

    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The stored checkpoint is no longer accepted (e.g. HTTP 410); a full
    /// resync from a fresh checkpoint is required.
    #[error("checkpoint expired")]
    CheckpointExpired,

    #[error("access token unavailable: {0}")]
    Credentials(String),

    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Transient failures are retried by the owning layer on its own schedule.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Failure in one of the durable stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("conditional update lost for {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failure while creating, renewing or stopping a watch channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("could not derive channel token: {0}")]
    Token(#[from] AuthError),

    #[error("channel manager is shutting down")]
    ShuttingDown,
}

impl ChannelError {
    /// Store failures are local and expected to clear; provider failures
    /// defer to [`ProviderError::is_transient`].
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::Store(_) => true,
            Self::Token(_) | Self::ShuttingDown => false,
        }
    }
}

/// Failure inside the ingestion path after authentication succeeded.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed notification: {0}")]
    Malformed(String),
}
