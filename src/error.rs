//! Error types for the VFS cache proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Upstream statuses that are worth another attempt.
pub const RETRY_STATUS_CODES: [u16; 6] = [
    429, // Too Many Requests
    500, // Internal Server Error
    502, // Bad Gateway
    503, // Service Unavailable
    504, // Gateway Timeout
    509, // Bandwidth Limit Exceeded
];

/// Error types that can occur while resolving and serving virtual files
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Metadata fetch error: {0}")]
    MetadataFetchError(String),

    #[error("Metadata fetch failed: unknown file size")]
    UnknownSize,

    #[error("Origin server returned 4xx error: {status} - {message}")]
    OriginClientError { status: u16, message: String },

    #[error("Origin server returned 5xx error: {status} - {message}")]
    OriginServerError { status: u16, message: String },

    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    #[error("read only file system")]
    ReadOnly,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout(err.to_string())
        } else if err.is_builder() {
            ProxyError::BadRequest(format!("invalid upstream request: {}", err))
        } else if let Some(status) = err.status() {
            ProxyError::from_http_status(status.as_u16(), err.to_string())
        } else {
            ProxyError::HttpError(err.to_string())
        }
    }
}

impl ProxyError {
    /// Determine if this error should trigger a retry
    ///
    /// Transport failures, timeouts and the statuses in [`RETRY_STATUS_CODES`]
    /// are transient. Every other 4xx, malformed responses and local errors
    /// are terminal.
    pub fn should_retry(&self) -> bool {
        match self {
            ProxyError::OriginServerError { status, .. }
            | ProxyError::OriginClientError { status, .. } => is_retry_status(*status),

            ProxyError::Timeout(_) => true,
            ProxyError::HttpError(_) => true,
            ProxyError::IoError(_) => true,

            ProxyError::BadRequest(_) => false,
            ProxyError::NotFound(_) => false,
            ProxyError::MetadataFetchError(_) => false, // already past the pacer
            ProxyError::UnknownSize => false,
            ProxyError::InvalidRange(_) => false,
            ProxyError::ReadOnly => false,
            ProxyError::ConfigError(_) => false,
            ProxyError::CacheError(_) => false,
            ProxyError::ParseError(_) => false,
            ProxyError::InternalError(_) => false,
        }
    }

    /// Convert error to the HTTP status returned to the client
    ///
    /// Upstream and resolution failures surface through the not-found path:
    /// the virtual file could not be produced, whatever the reason.
    pub fn to_http_status(&self) -> u16 {
        match self {
            ProxyError::BadRequest(_) => 400,
            ProxyError::ParseError(_) => 400,

            ProxyError::NotFound(_) => 404,
            ProxyError::MetadataFetchError(_) => 404,
            ProxyError::UnknownSize => 404,
            ProxyError::OriginClientError { .. } => 404,
            ProxyError::OriginServerError { .. } => 404,
            ProxyError::Timeout(_) => 404,

            ProxyError::InvalidRange(_) => 416,

            ProxyError::ReadOnly => 500,
            ProxyError::ConfigError(_) => 500,
            ProxyError::CacheError(_) => 500,
            ProxyError::IoError(_) => 500,
            ProxyError::HttpError(_) => 500,
            ProxyError::InternalError(_) => 500,
        }
    }

    /// Whether the error means the identifier is simply not registered,
    /// as opposed to a registered entry whose resolution failed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProxyError::NotFound(_))
    }

    /// Create an OriginClientError from a status code and message
    pub fn origin_client_error(status: u16, message: impl Into<String>) -> Self {
        ProxyError::OriginClientError {
            status,
            message: message.into(),
        }
    }

    /// Create an OriginServerError from a status code and message
    pub fn origin_server_error(status: u16, message: impl Into<String>) -> Self {
        ProxyError::OriginServerError {
            status,
            message: message.into(),
        }
    }

    /// Create an error from an HTTP status code
    ///
    /// Automatically categorizes as 4xx or 5xx error
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            ProxyError::origin_client_error(status, message)
        } else if (500..600).contains(&status) {
            ProxyError::origin_server_error(status, message)
        } else {
            ProxyError::HttpError(format!("HTTP {}: {}", status, message))
        }
    }
}

/// Whether an upstream status code is transient
pub fn is_retry_status(status: u16) -> bool {
    RETRY_STATUS_CODES.contains(&status)
}
