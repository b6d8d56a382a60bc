//! Facade error types.

use gbomb_config::ConfigError;
use gbomb_request::RequestError;
use gbomb_session::SessionError;
use thiserror::Error;

/// Result type alias for the facade.
pub type Result<T> = std::result::Result<T, SdkError>;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid graph url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The operation needs an open session.
    #[error("no open session")]
    NoSession,
}
