use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::auth::SessionError;

/// Failure to get any response at all out of the backend.
///
/// These are transient by nature: they never cause a credential renewal and
/// never clear stored credentials.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not authenticated - please log in again")]
    Unauthenticated,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] TransportError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut cut = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthenticated,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unauthenticated => ApiError::Unauthenticated,
            SessionError::Transport(e) => ApiError::NetworkError(e),
            SessionError::RenewalFailed { status, message } => match StatusCode::from_u16(status) {
                Ok(status) => ApiError::from_status(status, &message),
                Err(_) => ApiError::InvalidResponse(message),
            },
            SessionError::RenewalAborted => {
                ApiError::InvalidResponse("session renewal did not complete".to_string())
            }
        }
    }
}

/// FastAPI error payload: `detail` is either a message or a list of
/// validation errors.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    detail: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Message(String),
    Validation(Vec<ValidationIssue>),
}

#[derive(Debug, Deserialize)]
struct ValidationIssue {
    msg: String,
}

/// Turn a backend error response into a message fit to show a user.
///
/// Prefers the server's own `detail` text; falls back to a generic message
/// chosen by status so raw bodies never leak into the UI.
pub fn human_readable_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorPayload>(body) {
        match payload.detail {
            ErrorDetail::Message(message) if !message.trim().is_empty() => return message,
            ErrorDetail::Validation(issues) if !issues.is_empty() => {
                return issues
                    .into_iter()
                    .map(|issue| issue.msg)
                    .collect::<Vec<_>>()
                    .join("; ");
            }
            _ => {}
        }
    }

    match status.as_u16() {
        400 | 422 => "The request was invalid. Please check your input.".to_string(),
        401 => "Invalid credentials".to_string(),
        403 => "This account is not allowed to sign in".to_string(),
        429 => "Too many attempts. Please wait and try again.".to_string(),
        500..=599 => "The server encountered an error. Please try again later.".to_string(),
        code => format!("Request failed (status {})", code),
    }
}
