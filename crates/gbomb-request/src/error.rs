//! Request error types and their categorisation.

use gbomb_session::{OAUTH_ERROR_CODE, SessionError};
use serde_json::Value;
use thiserror::Error;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, RequestError>;

/// Server code for an invalid or expired session on legacy endpoints.
pub const API_SESSION_ERROR_CODE: i64 = 102;

/// How a failed request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient; retrying the same request may succeed.
    Retry,
    /// The app or user is being rate limited.
    Throttling,
    /// The token was rejected; the session must be reopened.
    AuthenticationReopenSession,
    /// The token lacks a required permission.
    Permissions,
    /// The server failed.
    Server,
    /// The request itself is wrong.
    BadRequest,
    UserCancelled,
    Other,
}

/// Errors delivered to request completion handlers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    /// The network round trip failed.
    #[error("network error: {0}")]
    Network(String),

    /// The network round trip timed out.
    #[error("request timed out")]
    Timeout,

    /// The server returned an error.
    #[error("API error ({status}, code {code:?}): {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        subcode: Option<i64>,
        message: String,
        error_type: Option<String>,
    },

    /// The response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The session could not be repaired after its token was rejected.
    #[error("session repair failed: {0}")]
    Repair(SessionError),

    #[error("request cancelled")]
    Cancelled,
}

impl From<url::ParseError> for RequestError {
    fn from(e: url::ParseError) -> Self {
        RequestError::InvalidRequest(e.to_string())
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(e: serde_json::Error) -> Self {
        RequestError::InvalidResponse(e.to_string())
    }
}

impl RequestError {
    /// Build an API error from a server `error` object.
    pub fn from_error_object(status: u16, error: &Value) -> Self {
        let code = error
            .get("code")
            .or_else(|| error.get("error_code"))
            .and_then(Value::as_i64);
        let message = error
            .get("message")
            .or_else(|| error.get("error_msg"))
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("HTTP {}", status));
        RequestError::Api {
            status,
            code,
            subcode: error.get("error_subcode").and_then(Value::as_i64),
            message,
            error_type: error.get("type").and_then(Value::as_str).map(String::from),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RequestError::Network(_) | RequestError::Timeout => ErrorCategory::Retry,
            RequestError::Cancelled => ErrorCategory::UserCancelled,
            RequestError::InvalidRequest(_) => ErrorCategory::BadRequest,
            RequestError::InvalidResponse(_) | RequestError::Repair(_) => ErrorCategory::Other,
            RequestError::Api { status, code, .. } => match (*status, *code) {
                (_, Some(OAUTH_ERROR_CODE | API_SESSION_ERROR_CODE)) | (401, _) => {
                    ErrorCategory::AuthenticationReopenSession
                }
                (_, Some(4 | 17 | 341 | 613)) | (429, _) => ErrorCategory::Throttling,
                (_, Some(1 | 2)) => ErrorCategory::Retry,
                (_, Some(10 | 200..=299)) | (403, _) => ErrorCategory::Permissions,
                (500.., _) => ErrorCategory::Server,
                (400..=499, _) => ErrorCategory::BadRequest,
                _ => ErrorCategory::Other,
            },
        }
    }

    /// Network failures, timeouts and rate limits.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Retry | ErrorCategory::Throttling
        )
    }

    /// The token was rejected and the session needs repair.
    pub fn is_session_related(&self) -> bool {
        self.category() == ErrorCategory::AuthenticationReopenSession
    }

    pub fn is_rate_limited(&self) -> bool {
        self.category() == ErrorCategory::Throttling
    }

    /// Whether the user should see a message before the request is retried.
    pub fn should_notify_user(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::AuthenticationReopenSession
                | ErrorCategory::Permissions
                | ErrorCategory::Throttling
        )
    }

    /// Message suitable for showing to the end user.
    pub fn user_message(&self) -> Option<String> {
        let message = match self.category() {
            ErrorCategory::AuthenticationReopenSession => {
                "Your session has expired. Please log in again."
            }
            ErrorCategory::Permissions => "The app does not have permission to do that.",
            ErrorCategory::Throttling => "Too many requests. Try again in a moment?",
            ErrorCategory::Retry => "A network error occurred. Try again?",
            ErrorCategory::Server => "The server is having trouble. Try again later.",
            _ => return None,
        };
        Some(message.to_string())
    }

    /// Server error code, if any.
    pub fn code(&self) -> Option<i64> {
        match self {
            RequestError::Api { code, .. } => *code,
            _ => None,
        }
    }
}
