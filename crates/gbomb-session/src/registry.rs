//! The active session.
//!
//! Most apps work with one session at a time. [`SessionRegistry`] holds it;
//! [`global`] is the process-wide instance, and tests can use their own.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::session::Session;

/// Holder of the active session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: RwLock<Option<Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `session` the active session, returning the previous one.
    pub fn set_active(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        tracing::debug!(session_id = %session.id(), "Active session set");
        self.active.write().replace(session)
    }

    pub fn active(&self) -> Option<Arc<Session>> {
        self.active.read().clone()
    }

    /// The active session, only if it is open.
    pub fn active_if_open(&self) -> Option<Arc<Session>> {
        self.active().filter(|s| s.is_open())
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active
            .read()
            .as_ref()
            .is_some_and(|s| s.id() == session_id)
    }

    /// Drop the active session, returning it.
    pub fn clear(&self) -> Option<Arc<Session>> {
        self.active.write().take()
    }
}

/// The process-wide registry.
pub fn global() -> &'static SessionRegistry {
    static GLOBAL: OnceLock<SessionRegistry> = OnceLock::new();
    GLOBAL.get_or_init(SessionRegistry::new)
}
