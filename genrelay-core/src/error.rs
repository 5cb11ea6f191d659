use std::time::Duration;

use thiserror::Error;

/// Core error type for genrelay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum GenRelayError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("cannot connect to provider at {endpoint}")]
    ProviderConnection { endpoint: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderProtocol {
        provider: String,
        code: String,
        message: String,
    },

    /// Client side: the relay itself could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// Client side: the relay answered with a non-success status.
    #[error("relay returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Client side: the relay ended the stream with an `error` frame.
    #[error("stream failed: {0}")]
    Stream(String),

    #[error("stream timeout after {}s", .0.as_secs())]
    StreamTimeout(Duration),

    /// Caller- or timeout-initiated stop. Not a fault.
    #[error("cancelled")]
    Cancelled,

    #[error("unparseable frame: {0}")]
    FrameParse(String),

    /// A stream line grew past the framer's limit without a newline.
    #[error("stream line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, GenRelayError>;

/// Statuses the client treats as transient.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

impl GenRelayError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true for transient errors that may succeed on retry.
    /// Validation and authentication failures never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::ProviderConnection { .. } => true,
            Self::RateLimited { .. } => true,
            Self::Status { status, .. } => RETRYABLE_STATUSES.contains(status),
            _ => false,
        }
    }

    /// Stable snake_case tag for logs, telemetry and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Validation(_) => "validation",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderConnection { .. } => "provider_connection",
            Self::ProviderProtocol { .. } => "provider_protocol",
            Self::Network(_) => "network",
            Self::Status { .. } => "status",
            Self::Stream(_) => "stream",
            Self::StreamTimeout(_) => "stream_timeout",
            Self::Cancelled => "cancelled",
            Self::FrameParse(_) => "frame_parse",
            Self::LineTooLong { .. } => "line_too_long",
            Self::Io(_) => "io",
            Self::Other(_) => "internal",
        }
    }

    /// Message safe to hand to callers. Does not leak endpoints,
    /// upstream bodies or status details; the full error goes to the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Authentication(_) => "authentication required".to_string(),
            Self::Validation(msg) => msg.clone(),
            Self::RateLimited { .. } => "provider is busy, try again shortly".to_string(),
            Self::ProviderConnection { .. } => "generation provider is unavailable".to_string(),
            Self::ProviderProtocol { .. } => "generation provider returned an invalid response".to_string(),
            Self::Network(_) => "could not reach the relay".to_string(),
            Self::Status { status, .. } => format!("relay returned status {status}"),
            Self::Stream(msg) => msg.clone(),
            Self::StreamTimeout(limit) => {
                format!("stream timeout: generation exceeded {}s", limit.as_secs())
            }
            Self::Cancelled => "stream cancelled".to_string(),
            Self::LineTooLong { .. } => "stream sent an oversized frame".to_string(),
            Self::FrameParse(_) | Self::Io(_) | Self::Other(_) => "internal error".to_string(),
        }
    }
}
