//! Error-handling policy chain.
//!
//! Each request gets a [`HandlerChain`] built from its [`ErrorBehavior`] when
//! it is added to a connection. On failure the policies run in a fixed order
//! (alert, reconnect, retry); each may pass the error on, deliver it
//! immediately, or hand the request to the [`RetryManager`]. Whatever falls
//! off the end is delivered to the caller.

use tracing::debug;

use crate::error::RequestError;
use crate::metadata::RequestMetadata;
use crate::request::ErrorBehavior;
use crate::retry::RetryManager;

/// What a policy did with a failed request.
#[derive(Debug)]
pub enum PolicyOutcome {
    /// Let the next policy look at it.
    Next(RequestMetadata, RequestError),
    /// Deliver the error now, skipping the remaining policies.
    Deliver(RequestMetadata, RequestError),
    /// The retry manager took the request.
    Queued,
}

/// One error-handling policy.
pub trait ErrorPolicy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        manager: &mut RetryManager,
        metadata: RequestMetadata,
        error: RequestError,
    ) -> PolicyOutcome;
}

/// Records a user-facing message for errors worth telling the user about.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlertUserPolicy;

impl ErrorPolicy for AlertUserPolicy {
    fn name(&self) -> &'static str {
        "alert_user"
    }

    fn apply(
        &self,
        manager: &mut RetryManager,
        metadata: RequestMetadata,
        error: RequestError,
    ) -> PolicyOutcome {
        if error.should_notify_user()
            && let Some(message) = error.user_message()
        {
            manager.set_alert_message(message);
        }
        PolicyOutcome::Next(metadata, error)
    }
}

/// Repairs the request's session when its token was rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconnectPolicy;

impl ErrorPolicy for ReconnectPolicy {
    fn name(&self) -> &'static str {
        "reconnect"
    }

    fn apply(
        &self,
        manager: &mut RetryManager,
        mut metadata: RequestMetadata,
        error: RequestError,
    ) -> PolicyOutcome {
        if !error.is_session_related() || metadata.retry_count >= manager.max_retry_limit() {
            return PolicyOutcome::Next(metadata, error);
        }
        let Some(session) = metadata
            .request
            .session()
            .filter(|s| s.state().is_open())
            .cloned()
        else {
            return PolicyOutcome::Next(metadata, error);
        };

        if !manager.request_repair(&session) {
            debug!(
                session_id = %session.id(),
                "Another session is already being repaired in this batch"
            );
            return PolicyOutcome::Deliver(metadata, error);
        }
        metadata.retry_count += 1;
        metadata.original_error = Some(error);
        manager.queue(metadata);
        PolicyOutcome::Queued
    }
}

/// Retries transient failures; defers session failures so a repair can
/// pick them up.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryPolicy;

impl ErrorPolicy for RetryPolicy {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn apply(
        &self,
        manager: &mut RetryManager,
        mut metadata: RequestMetadata,
        error: RequestError,
    ) -> PolicyOutcome {
        if metadata.retry_count >= manager.max_retry_limit() {
            return PolicyOutcome::Next(metadata, error);
        }
        if error.is_transient() {
            metadata.retry_count += 1;
            metadata.original_error = Some(error);
            manager.queue(metadata);
            return PolicyOutcome::Queued;
        }
        if error.is_session_related() {
            manager.defer(metadata, error);
            return PolicyOutcome::Queued;
        }
        PolicyOutcome::Next(metadata, error)
    }
}

/// Ordered composition of policies ending in delivery to the caller.
#[derive(Debug, Default)]
pub struct HandlerChain {
    policies: Vec<Box<dyn ErrorPolicy>>,
}

impl HandlerChain {
    pub fn new(policies: Vec<Box<dyn ErrorPolicy>>) -> Self {
        Self { policies }
    }

    pub fn policy_names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    /// Run the policies. Returns the request and error to deliver now, or
    /// `None` when the retry manager kept the request.
    pub fn handle(
        &self,
        manager: &mut RetryManager,
        metadata: RequestMetadata,
        error: RequestError,
    ) -> Option<(RequestMetadata, RequestError)> {
        let mut current = (metadata, error);
        for policy in &self.policies {
            match policy.apply(manager, current.0, current.1) {
                PolicyOutcome::Next(metadata, error) => current = (metadata, error),
                PolicyOutcome::Deliver(metadata, error) => return Some((metadata, error)),
                PolicyOutcome::Queued => return None,
            }
        }
        Some(current)
    }
}

/// Builds the policy chain for a behavior.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestHandlerFactory;

impl RequestHandlerFactory {
    pub fn chain_for(behavior: ErrorBehavior) -> HandlerChain {
        let mut policies: Vec<Box<dyn ErrorPolicy>> = Vec::new();
        if behavior.contains(ErrorBehavior::ALERT_USER) {
            policies.push(Box::new(AlertUserPolicy));
        }
        if behavior.contains(ErrorBehavior::RECONNECT) {
            policies.push(Box::new(ReconnectPolicy));
        }
        if behavior.contains(ErrorBehavior::RETRY) {
            policies.push(Box::new(RetryPolicy));
        }
        HandlerChain::new(policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::GraphRequest;
    use crate::retry::RetryState;

    fn metadata(behavior: ErrorBehavior) -> RequestMetadata {
        RequestMetadata::new(GraphRequest::for_me(), behavior, |_| {})
    }

    fn session_error() -> RequestError {
        RequestError::Api {
            status: 400,
            code: Some(190),
            subcode: None,
            message: "expired".into(),
            error_type: None,
        }
    }

    #[test]
    fn test_chain_order() {
        let all = ErrorBehavior::ALERT_USER | ErrorBehavior::RETRY | ErrorBehavior::RECONNECT;
        assert_eq!(
            RequestHandlerFactory::chain_for(all).policy_names(),
            vec!["alert_user", "reconnect", "retry"]
        );
        assert!(
            RequestHandlerFactory::chain_for(ErrorBehavior::NONE)
                .policy_names()
                .is_empty()
        );
    }

    #[test]
    fn test_no_behavior_delivers_immediately() {
        let mut manager = RetryManager::new(1);
        let m = metadata(ErrorBehavior::NONE);
        let chain = m.chain.clone();
        assert!(chain.handle(&mut manager, m, RequestError::Timeout).is_some());
        assert_eq!(manager.queued_len(), 0);
    }

    #[test]
    fn test_retry_queues_transient_until_limit() {
        let mut manager = RetryManager::new(1);
        let m = metadata(ErrorBehavior::RETRY);
        let chain = m.chain.clone();
        assert!(chain.handle(&mut manager, m, RequestError::Timeout).is_none());
        assert_eq!(manager.queued_len(), 1);

        let mut exhausted = metadata(ErrorBehavior::RETRY);
        exhausted.retry_count = 1;
        let chain = exhausted.chain.clone();
        let delivered = chain.handle(&mut manager, exhausted, RequestError::Timeout);
        assert!(matches!(delivered, Some((_, RequestError::Timeout))));
    }

    #[test]
    fn test_retry_defers_session_errors() {
        let mut manager = RetryManager::new(1);
        let m = metadata(ErrorBehavior::RETRY);
        let chain = m.chain.clone();
        assert!(chain.handle(&mut manager, m, session_error()).is_none());
        assert_eq!(manager.deferred_len(), 1);
        assert_eq!(manager.state(), RetryState::Normal);
    }

    #[test]
    fn test_reconnect_without_session_falls_through() {
        let mut manager = RetryManager::new(1);
        let m = metadata(ErrorBehavior::RECONNECT);
        let chain = m.chain.clone();
        assert!(chain.handle(&mut manager, m, session_error()).is_some());
        assert_eq!(manager.state(), RetryState::Normal);
    }

    #[test]
    fn test_alert_records_message_and_continues() {
        let mut manager = RetryManager::new(1);
        let m = metadata(ErrorBehavior::ALERT_USER);
        let chain = m.chain.clone();
        let err = RequestError::Api {
            status: 429,
            code: None,
            subcode: None,
            message: "slow down".into(),
            error_type: None,
        };
        assert!(chain.handle(&mut manager, m, err).is_some());
        assert!(manager.alert_message().is_some());
    }
}
