use thiserror::Error;

use crate::auth::RefreshError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not logged in")]
    Unauthenticated,

    #[error("Session expired: {0}")]
    SessionExpired(Unrecoverable),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Why authentication could not be recovered for a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Unrecoverable {
    #[error("refresh failed: {0}")]
    RefreshFailed(RefreshError),

    #[error("request rejected again after refreshing credentials")]
    RejectedAfterRefresh,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 | 422 => ApiError::InvalidRequest(truncated),
            401 => ApiError::Unauthenticated,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// True for errors caused by the network or the server rather than the request.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ApiError::NetworkError(_) | ApiError::Transport(_) | ApiError::ServerError(_)
        )
    }
}
