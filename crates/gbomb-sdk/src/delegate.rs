//! Legacy delegate protocols.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gbomb_request::RequestError;
use gbomb_session::{AuthFailure, Session, SessionDelegate};
use serde_json::Value;

use crate::request::GbombRequest;

/// Login lifecycle callbacks. Every method defaults to a no-op.
pub trait GbombSessionDelegate: Send + Sync {
    fn did_login(&self) {}

    fn did_not_login(&self, _cancelled: bool) {}

    fn did_login_error(&self, _error: &AuthFailure) {}

    /// The token was extended; replace any stored copy of the old one.
    fn did_extend_token(&self, _access_token: &str, _expires_at: Option<DateTime<Utc>>) {}

    fn did_logout(&self) {}

    /// The token was rejected, revoked or expired.
    fn session_invalidated(&self) {}
}

/// Per-request callbacks. Every method defaults to a no-op.
pub trait GbombRequestDelegate: Send + Sync {
    fn request_loading(&self, _request: &GbombRequest) {}

    fn did_load(&self, _request: &GbombRequest, _result: &Value) {}

    fn did_fail(&self, _request: &GbombRequest, _error: &RequestError) {}
}

/// Forwards login and extension events of the facade's session.
///
/// Logout and invalidation are reported by the facade itself.
pub(crate) struct DelegateBridge(pub(crate) Arc<dyn GbombSessionDelegate>);

impl SessionDelegate for DelegateBridge {
    fn did_login(&self, _session: &Session) {
        self.0.did_login();
    }

    fn did_not_login(&self, _session: &Session, cancelled: bool) {
        self.0.did_not_login(cancelled);
    }

    fn did_login_error(&self, _session: &Session, error: &AuthFailure) {
        self.0.did_login_error(error);
    }

    fn did_extend_token(
        &self,
        _session: &Session,
        access_token: &str,
        expiration_date: Option<DateTime<Utc>>,
    ) {
        self.0.did_extend_token(access_token, expiration_date);
    }
}
