use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Browser pool is shutting down")]
    ShuttingDown,

    #[error("Timeout waiting for available browser")]
    AcquireTimeout,

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Render deadline exceeded after {0:?}")]
    TotalTimeout(Duration),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Browser error: {0}")]
    BrowserError(String),

    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable machine-readable error codes carried in the response `errors` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NavigationFailed,
    Timeout,
    TotalTimeout,
    ProxyError,
    BrowserError,
    RenderFailed,
    InternalError,
    ValidationError,
    RateLimited,
}

impl ErrorCode {
    /// HTTP status mapping at the edge: timeouts 504, validation 400,
    /// rate limiting 429, everything else 500.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Timeout | ErrorCode::TotalTimeout => 504,
            ErrorCode::ValidationError => 400,
            ErrorCode::RateLimited => 429,
            _ => 500,
        }
    }
}

impl RenderError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RenderError::NavigationFailed(_) => ErrorCode::NavigationFailed,
            RenderError::Timeout(_) | RenderError::AcquireTimeout => ErrorCode::Timeout,
            RenderError::TotalTimeout(_) => ErrorCode::TotalTimeout,
            RenderError::ProxyError(_) => ErrorCode::ProxyError,
            RenderError::BrowserError(_)
            | RenderError::LaunchFailed(_)
            | RenderError::ShuttingDown => ErrorCode::BrowserError,
            RenderError::RenderFailed(_) => ErrorCode::RenderFailed,
            RenderError::ValidationFailed(_) => ErrorCode::ValidationError,
            RenderError::RateLimited => ErrorCode::RateLimited,
            RenderError::ConfigurationError(_) | RenderError::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// HTTP status the edge reports for this error class.
    pub fn http_status(&self) -> u16 {
        self.code().http_status()
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::AcquireTimeout
                | RenderError::NavigationFailed(_)
                | RenderError::Timeout(_)
                | RenderError::BrowserError(_)
        )
    }
}

impl From<AcquireError> for RenderError {
    fn from(err: AcquireError) -> Self {
        RenderError::BrowserError(err.to_string())
    }
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::Internal(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for RenderError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        RenderError::BrowserError(err.to_string())
    }
}
