//! Diagnostic events for auth and reauth cycles.
//!
//! Each login attempt gets one [`AuthLogger`]. Events go to `tracing` and are
//! also kept on the logger so callers can inspect what was tried.

use serde_json::{Map, Value};

use crate::error::AuthFailure;

/// Serialization keys.
pub const PARAM_AUTH_METHOD_KEY: &str = "method";
pub const PARAM_ID_KEY: &str = "0_auth_logger_id";

/// Names of the supported authentication methods.
pub const AUTH_METHOD_INTEGRATED: &str = "integrated_auth";
pub const AUTH_METHOD_GB_APPLICATION_NATIVE: &str = "gb_application_native_auth";
pub const AUTH_METHOD_GB_APPLICATION_WEB: &str = "gb_application_web_auth";
pub const AUTH_METHOD_BROWSER: &str = "browser_auth";
pub const AUTH_METHOD_FALLBACK: &str = "fallback_auth";

/// Well-known result strings.
pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";
pub const RESULT_CANCELLED: &str = "cancelled";
pub const RESULT_SKIPPED: &str = "skipped";

/// Kind of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    AuthStart,
    AuthMethodStart,
    AuthMethodEnd,
    AuthEnd,
}

/// One recorded auth event.
#[derive(Debug, Clone)]
pub struct AuthLogEvent {
    pub kind: AuthEventKind,
    pub method: Option<String>,
    pub result: Option<&'static str>,
    pub error: Option<String>,
    pub extras: Map<String, Value>,
}

/// Result string for a strategy outcome.
pub fn result_for(failure: Option<&AuthFailure>) -> &'static str {
    match failure {
        None => RESULT_SUCCESS,
        Some(f) if f.is_cancelled() => RESULT_CANCELLED,
        Some(f) if f.falls_through() => RESULT_SKIPPED,
        Some(_) => RESULT_ERROR,
    }
}

/// Logger for a single auth request.
#[derive(Debug)]
pub struct AuthLogger {
    id: String,
    session_id: String,
    auth_method: Option<String>,
    extras: Map<String, Value>,
    events: Vec<AuthLogEvent>,
}

impl AuthLogger {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_id(session_id, uuid::Uuid::new_v4().to_string(), None)
    }

    /// Rebuild a logger from serialized parameters (e.g. carried in a URL).
    pub fn with_id(
        session_id: impl Into<String>,
        id: impl Into<String>,
        auth_method: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            auth_method,
            extras: Map::new(),
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parameters identifying this logger across a process hand-off.
    pub fn to_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert(PARAM_ID_KEY.to_string(), Value::String(self.id.clone()));
        if let Some(method) = &self.auth_method {
            params.insert(
                PARAM_AUTH_METHOD_KEY.to_string(),
                Value::String(method.clone()),
            );
        }
        params
    }

    /// Attach extras to the next logged event only.
    pub fn add_extras_for_next_event(&mut self, extras: Map<String, Value>) {
        self.extras.extend(extras);
    }

    pub fn log_start_auth(&mut self) {
        tracing::info!(
            session_id = %self.session_id,
            auth_logger_id = %self.id,
            "Auth started"
        );
        self.record(AuthEventKind::AuthStart, None, None);
    }

    pub fn log_start_auth_method(&mut self, method: &str) {
        self.auth_method = Some(method.to_string());
        tracing::debug!(
            session_id = %self.session_id,
            auth_logger_id = %self.id,
            method,
            "Auth method started"
        );
        self.record(AuthEventKind::AuthMethodStart, None, None);
    }

    /// Log the end of the last started method.
    pub fn log_end_auth_method(&mut self, result: &'static str, error: Option<&AuthFailure>) {
        tracing::debug!(
            session_id = %self.session_id,
            auth_logger_id = %self.id,
            method = self.auth_method.as_deref().unwrap_or(""),
            result,
            error = ?error,
            "Auth method ended"
        );
        self.record(AuthEventKind::AuthMethodEnd, Some(result), error);
    }

    pub fn log_end_auth(&mut self, result: &'static str, error: Option<&AuthFailure>) {
        tracing::info!(
            session_id = %self.session_id,
            auth_logger_id = %self.id,
            method = self.auth_method.as_deref().unwrap_or(""),
            result,
            error = ?error,
            "Auth ended"
        );
        self.record(AuthEventKind::AuthEnd, Some(result), error);
    }

    pub fn events(&self) -> &[AuthLogEvent] {
        &self.events
    }

    fn record(
        &mut self,
        kind: AuthEventKind,
        result: Option<&'static str>,
        error: Option<&AuthFailure>,
    ) {
        self.events.push(AuthLogEvent {
            kind,
            method: self.auth_method.clone(),
            result,
            error: error.map(ToString::to_string),
            extras: std::mem::take(&mut self.extras),
        });
    }
}
