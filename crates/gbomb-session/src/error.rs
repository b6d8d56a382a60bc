//! Error types for session authorization.

use crate::types::SessionState;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, SessionError>;

/// OAuth error code reported by the server for rejected tokens.
pub const OAUTH_ERROR_CODE: i64 = 190;

/// Server subcodes that refine an authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum AuthSubcode {
    AppNotInstalled = 458,
    UserCheckpointed = 459,
    PasswordChanged = 460,
    Expired = 463,
    UnconfirmedUser = 464,
}

impl AuthSubcode {
    pub fn from_code(subcode: i64) -> Option<Self> {
        match subcode {
            458 => Some(Self::AppNotInstalled),
            459 => Some(Self::UserCheckpointed),
            460 => Some(Self::PasswordChanged),
            463 => Some(Self::Expired),
            464 => Some(Self::UnconfirmedUser),
            _ => None,
        }
    }
}

/// Why a login strategy failed to produce a token.
///
/// Always surfaced to the session's caller; strategies never retry on their
/// own. `Unavailable` and `AppNotInstalled` let the session move on to the
/// next strategy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("login cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("server error {code} (subcode {subcode:?}): {message}")]
    ServerError {
        code: i64,
        subcode: Option<i64>,
        message: String,
    },

    #[error("password changed since the token was issued")]
    PasswordChanged,

    #[error("user account is checkpointed")]
    UserCheckpointed,

    #[error("app not installed")]
    AppNotInstalled,

    #[error("session expired")]
    Expired,

    #[error("user account is unconfirmed")]
    UnconfirmedUser,

    #[error("login method unavailable: {0}")]
    Unavailable(String),
}

impl AuthFailure {
    /// Build a failure from a server error code and optional subcode.
    pub fn from_server(code: i64, subcode: Option<i64>, message: impl Into<String>) -> Self {
        match subcode.and_then(AuthSubcode::from_code) {
            Some(AuthSubcode::AppNotInstalled) => Self::AppNotInstalled,
            Some(AuthSubcode::UserCheckpointed) => Self::UserCheckpointed,
            Some(AuthSubcode::PasswordChanged) => Self::PasswordChanged,
            Some(AuthSubcode::Expired) => Self::Expired,
            Some(AuthSubcode::UnconfirmedUser) => Self::UnconfirmedUser,
            None => Self::ServerError {
                code,
                subcode,
                message: message.into(),
            },
        }
    }

    /// Whether the session should try the next login strategy.
    pub fn falls_through(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::AppNotInstalled)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The server subcode this failure corresponds to, if any.
    pub fn subcode(&self) -> Option<i64> {
        match self {
            Self::AppNotInstalled => Some(AuthSubcode::AppNotInstalled as i64),
            Self::UserCheckpointed => Some(AuthSubcode::UserCheckpointed as i64),
            Self::PasswordChanged => Some(AuthSubcode::PasswordChanged as i64),
            Self::Expired => Some(AuthSubcode::Expired as i64),
            Self::UnconfirmedUser => Some(AuthSubcode::UnconfirmedUser as i64),
            Self::ServerError { subcode, .. } => *subcode,
            _ => None,
        }
    }
}

/// Errors raised by session operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// The operation is not valid in the session's current state.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// Authorization failed.
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthFailure),

    /// The requested permission set is malformed for the call.
    #[error("invalid permission request: {0}")]
    InvalidPermissions(String),

    /// Reading or writing the token cache failed.
    #[error("token cache error: {0}")]
    TokenCache(String),

    /// Session configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),

    /// A login URL could not be built or parsed.
    #[error("invalid login url: {0}")]
    InvalidUrl(String),
}

impl From<url::ParseError> for SessionError {
    fn from(e: url::ParseError) -> Self {
        SessionError::InvalidUrl(e.to_string())
    }
}
