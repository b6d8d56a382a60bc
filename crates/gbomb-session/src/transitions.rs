//! The narrow session surface used by the request pipeline.
//!
//! A request batch never logs in or out on its own. It only needs to read the
//! token, repair a rejected session, and feed piggybacked extension and
//! permission results back. [`SessionTransitions`] is exactly that.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::session::Session;
use crate::types::SessionState;

/// Session operations available to request dispatch.
#[async_trait]
pub trait SessionTransitions: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    fn state(&self) -> SessionState;

    fn access_token(&self) -> Option<String>;

    async fn repair(&self) -> Result<()>;

    fn should_extend_access_token(&self) -> bool;

    fn record_extension_attempt(&self);

    async fn refresh_access_token(
        &self,
        access_token: &str,
        expiration_date: Option<DateTime<Utc>>,
    ) -> Result<()>;

    fn should_refresh_permissions(&self) -> bool;

    async fn refresh_permissions(&self, permissions: Vec<String>) -> Result<()>;

    async fn close_and_clear_token_information(&self, reason: &str);
}

/// Shared handle to a session as seen by request dispatch.
pub type SharedSession = Arc<dyn SessionTransitions>;

#[async_trait]
impl SessionTransitions for Session {
    fn id(&self) -> &str {
        Session::id(self)
    }

    fn state(&self) -> SessionState {
        Session::state(self)
    }

    fn access_token(&self) -> Option<String> {
        Session::access_token(self)
    }

    async fn repair(&self) -> Result<()> {
        Session::repair(self).await
    }

    fn should_extend_access_token(&self) -> bool {
        Session::should_extend_access_token(self)
    }

    fn record_extension_attempt(&self) {
        Session::record_extension_attempt(self)
    }

    async fn refresh_access_token(
        &self,
        access_token: &str,
        expiration_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        Session::refresh_access_token(self, access_token, expiration_date).await
    }

    fn should_refresh_permissions(&self) -> bool {
        Session::should_refresh_permissions(self)
    }

    async fn refresh_permissions(&self, permissions: Vec<String>) -> Result<()> {
        Session::refresh_permissions(self, permissions).await
    }

    async fn close_and_clear_token_information(&self, reason: &str) {
        Session::close_and_clear_token_information(self, reason).await
    }
}
