//! Error types for Marksync

use thiserror::Error;

/// Result type alias for Marksync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for Marksync
#[derive(Error, Debug)]
pub enum SyncError {
    /// WebDAV is not configured (missing URL)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server rejected the credentials (401/403)
    #[error("Authentication failed (HTTP {status})")]
    Auth { status: u16 },

    /// Connection-level failure (DNS, refused, TLS, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// Unexpected HTTP status from the server
    #[error("Protocol error (HTTP {status}): {message}")]
    Protocol { status: u16, message: String },

    /// A snapshot filename carried no decodable timestamp
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Build a protocol error from a status code and response body
    pub fn protocol(status: u16, message: impl Into<String>) -> Self {
        SyncError::Protocol {
            status,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => SyncError::Auth { status },
            404 => SyncError::NotFound(message.into()),
            _ => SyncError::protocol(status, message),
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Auth { status } | SyncError::Protocol { status, .. } => Some(*status),
            SyncError::NotFound(_) => Some(404),
            _ => None,
        }
    }

    /// Check if error is retryable.
    ///
    /// Nothing in the engine retries on its own; callers use this to decide
    /// whether offering a manual retry makes sense.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Protocol { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Stable error code for the request/response contract
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Config(_) => "config_error",
            SyncError::Auth { .. } => "auth_error",
            SyncError::Network(_) => "network_error",
            SyncError::Protocol { .. } => "protocol_error",
            SyncError::Parse(_) => "parse_error",
            SyncError::InvalidInput(_) => "invalid_input",
            SyncError::NotFound(_) => "not_found",
            SyncError::Serialization(_) => "serialization_error",
            SyncError::Io(_) => "io_error",
            SyncError::Internal(_) => "internal_error",
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return SyncError::from_status(status.as_u16(), e.to_string());
        }
        if e.is_connect() || e.is_timeout() || e.is_request() {
            return SyncError::Network(e.to_string());
        }
        if e.is_decode() || e.is_body() {
            return SyncError::Internal(e.to_string());
        }
        SyncError::Network(e.to_string())
    }
}
