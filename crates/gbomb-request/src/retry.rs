//! Two-phase retry of failed requests.
//!
//! While a response is processed, each failed request runs through its
//! [`HandlerChain`](crate::HandlerChain) and may be queued or deferred on a
//! [`RetryManager`]. Once every handler has run, the manager performs the
//! retries in one go: replaying queued requests, or first repairing the one
//! session elected for reconnection and then replaying.

use std::fmt;
use std::mem;

use async_trait::async_trait;
use gbomb_session::SharedSession;
use tracing::{debug, info, warn};

use crate::connection::Dispatcher;
use crate::error::RequestError;
use crate::metadata::RequestMetadata;

/// What the manager does when retries are performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Replay queued requests.
    Normal,
    /// Deliver every queued request's original error.
    AbortRetries,
    /// Repair the elected session, then replay.
    RepairSession,
}

/// Asks the user whether to go ahead with a retry.
#[async_trait]
pub trait RetryPrompt: Send + Sync + fmt::Debug {
    /// Shown before retrying; `false` aborts the retries.
    async fn confirm(&self, message: &str) -> bool;

    /// Shown when a failure is reported but nothing is retried.
    fn notify(&self, _message: &str) {}
}

/// Always confirms.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

#[async_trait]
impl RetryPrompt for AutoConfirm {
    async fn confirm(&self, _message: &str) -> bool {
        true
    }
}

/// Collects retry work for one response.
///
/// Held requests carry the order they were handed over in, which is their
/// order in the response, so a replay keeps the batch order.
pub struct RetryManager {
    state: RetryState,
    session_to_reconnect: Option<SharedSession>,
    alert_message: Option<String>,
    queued: Vec<(usize, RequestMetadata)>,
    deferred: Vec<(usize, RequestMetadata, RequestError)>,
    held: usize,
    max_retry_limit: u32,
}

impl fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager")
            .field("state", &self.state)
            .field(
                "session_to_reconnect",
                &self.session_to_reconnect.as_ref().map(|s| s.id().to_string()),
            )
            .field("alert_message", &self.alert_message)
            .field("queued", &self.queued.len())
            .field("deferred", &self.deferred.len())
            .field("max_retry_limit", &self.max_retry_limit)
            .finish()
    }
}

impl RetryManager {
    pub fn new(max_retry_limit: u32) -> Self {
        Self {
            state: RetryState::Normal,
            session_to_reconnect: None,
            alert_message: None,
            queued: Vec::new(),
            deferred: Vec::new(),
            held: 0,
            max_retry_limit,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn max_retry_limit(&self) -> u32 {
        self.max_retry_limit
    }

    pub fn session_to_reconnect(&self) -> Option<&SharedSession> {
        self.session_to_reconnect.as_ref()
    }

    pub fn alert_message(&self) -> Option<&str> {
        self.alert_message.as_deref()
    }

    /// Keeps the first message.
    pub fn set_alert_message(&mut self, message: String) {
        if self.alert_message.is_none() {
            self.alert_message = Some(message);
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn queue(&mut self, metadata: RequestMetadata) {
        let position = self.next_position();
        self.queued.push((position, metadata));
    }

    /// Hold a session failure until retries run. Replayed if a repair
    /// happens, otherwise delivered as is.
    pub fn defer(&mut self, metadata: RequestMetadata, error: RequestError) {
        let position = self.next_position();
        self.deferred.push((position, metadata, error));
    }

    fn next_position(&mut self) -> usize {
        self.held += 1;
        self.held
    }

    /// Queued requests in the order they were held.
    fn take_queued(&mut self) -> Vec<RequestMetadata> {
        mem::take(&mut self.queued)
            .into_iter()
            .map(|(_, metadata)| metadata)
            .collect()
    }

    /// Elect `session` for repair. The first session wins; returns whether
    /// `session` is the elected one.
    pub fn request_repair(&mut self, session: &SharedSession) -> bool {
        match &self.session_to_reconnect {
            Some(elected) => elected.id() == session.id(),
            None => {
                self.session_to_reconnect = Some(session.clone());
                self.state = RetryState::RepairSession;
                true
            }
        }
    }

    /// Abort instead of retrying.
    pub fn abort(&mut self) {
        self.state = RetryState::AbortRetries;
    }

    pub fn has_work(&self) -> bool {
        !self.queued.is_empty()
            || !self.deferred.is_empty()
            || self.alert_message.is_some()
            || self.state == RetryState::RepairSession
    }

    pub(crate) async fn perform_retries(mut self, dispatcher: &Dispatcher) {
        match self.state {
            RetryState::RepairSession => self.repair_and_replay(dispatcher).await,
            RetryState::Normal => self.retry(dispatcher).await,
            RetryState::AbortRetries => {
                self.alert_message = None;
                self.deliver_all(dispatcher);
            }
        }
    }

    async fn retry(mut self, dispatcher: &Dispatcher) {
        for (_, metadata, error) in mem::take(&mut self.deferred) {
            dispatcher.deliver(metadata, Err(error));
        }

        if self.queued.is_empty() {
            if let Some(message) = &self.alert_message {
                dispatcher.prompt().notify(message);
            }
            return;
        }

        if let Some(message) = self.alert_message.take()
            && !dispatcher.prompt().confirm(&message).await
        {
            info!(count = self.queued.len(), "Retry declined by user");
            self.state = RetryState::AbortRetries;
            self.deliver_all(dispatcher);
            return;
        }

        info!(count = self.queued.len(), "Retrying requests");
        dispatcher.dispatch(self.take_queued()).await;
    }

    async fn repair_and_replay(mut self, dispatcher: &Dispatcher) {
        let Some(session) = self.session_to_reconnect.take() else {
            self.state = RetryState::Normal;
            return self.retry(dispatcher).await;
        };

        for (position, mut metadata, error) in mem::take(&mut self.deferred) {
            if metadata.retry_count < self.max_retry_limit {
                metadata.retry_count += 1;
                metadata.original_error = Some(error);
                self.queued.push((position, metadata));
            } else {
                dispatcher.deliver(metadata, Err(error));
            }
        }
        self.queued.sort_by_key(|(position, _)| *position);

        if let Some(message) = self.alert_message.take()
            && !dispatcher.prompt().confirm(&message).await
        {
            info!(session_id = %session.id(), "Session repair declined by user");
            self.state = RetryState::AbortRetries;
            self.deliver_all(dispatcher);
            return;
        }

        info!(
            session_id = %session.id(),
            count = self.queued.len(),
            "Repairing session before replay"
        );
        match session.repair().await {
            Ok(()) => {
                debug!(session_id = %session.id(), "Session repaired, replaying");
                dispatcher.dispatch(self.take_queued()).await;
            }
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Session repair failed");
                for metadata in self.take_queued() {
                    dispatcher.deliver(metadata, Err(RequestError::Repair(e.clone())));
                }
            }
        }
    }

    /// Deliver every held request with the error that got it held.
    fn deliver_all(&mut self, dispatcher: &Dispatcher) {
        for (_, metadata, error) in mem::take(&mut self.deferred) {
            dispatcher.deliver(metadata, Err(error));
        }
        for mut metadata in self.take_queued() {
            let error = metadata
                .original_error
                .take()
                .unwrap_or(RequestError::Cancelled);
            dispatcher.deliver(metadata, Err(error));
        }
    }
}
