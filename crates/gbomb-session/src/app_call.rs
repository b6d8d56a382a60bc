//! Pending inter-app calls.
//!
//! Login strategies that leave the process (native app, system browser)
//! register a call here and wait. When the host app is resumed with a URL,
//! [`AppCallRegistry::handle_open_url`] finds the matching call by the id
//! embedded in the client state and completes it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use url::Url;

use crate::error::AuthFailure;
use crate::utility::{
    LOGIN_UX_CLIENT_STATE_CALL_ID, client_state_from_query_params, query_params_from_login_url,
};

/// Response parameters delivered to a pending call.
pub type AppCallResponse = HashMap<String, String>;

type PendingMap = Mutex<HashMap<String, oneshot::Sender<AppCallResponse>>>;

/// Registry of calls awaiting an "app resumed with URL" event.
#[derive(Debug)]
pub struct AppCallRegistry {
    app_id: String,
    url_scheme_suffix: String,
    pending: Arc<PendingMap>,
}

impl AppCallRegistry {
    pub fn new(app_id: impl Into<String>, url_scheme_suffix: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            url_scheme_suffix: url_scheme_suffix.into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn url_scheme_suffix(&self) -> &str {
        &self.url_scheme_suffix
    }

    /// Register a new pending call with a fresh id.
    pub fn register(&self) -> PendingAppCall {
        let call_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_id.clone(), tx);
        tracing::trace!(call_id = %call_id, "Registered pending app call");
        PendingAppCall {
            call_id,
            receiver: rx,
            pending: Arc::downgrade(&self.pending),
        }
    }

    /// Drop a pending call; its waiter resolves as cancelled.
    pub fn cancel(&self, call_id: &str) {
        if self.pending.lock().remove(call_id).is_some() {
            tracing::debug!(call_id, "Pending app call cancelled");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Deliver a resumed URL. Returns whether a pending call consumed it.
    pub fn handle_open_url(&self, url: &Url) -> bool {
        let Some(params) = query_params_from_login_url(url, &self.app_id, &self.url_scheme_suffix)
        else {
            return false;
        };
        let Some(call_id) = client_state_from_query_params(&params).and_then(|state| {
            state
                .get(LOGIN_UX_CLIENT_STATE_CALL_ID)
                .and_then(Value::as_str)
                .map(String::from)
        }) else {
            tracing::debug!("Resumed URL carries no call id");
            return false;
        };

        let Some(sender) = self.pending.lock().remove(&call_id) else {
            tracing::debug!(call_id = %call_id, "No pending call for resumed URL");
            return false;
        };
        if sender.send(params).is_err() {
            tracing::debug!(call_id = %call_id, "Waiter for resumed URL is gone");
            return false;
        }
        true
    }
}

/// One outstanding inter-app call.
///
/// Dropping it (including after a timed-out [`wait`](Self::wait)) removes
/// the call from its registry.
#[derive(Debug)]
pub struct PendingAppCall {
    pub call_id: String,
    receiver: oneshot::Receiver<AppCallResponse>,
    pending: Weak<PendingMap>,
}

impl PendingAppCall {
    /// Wait for the response, bounded by `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<AppCallResponse, AuthFailure> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(_)) => Err(AuthFailure::Cancelled),
            Err(_) => Err(AuthFailure::Unavailable(format!(
                "no response to app call {} within {:?}",
                self.call_id, timeout
            ))),
        }
    }
}

impl Drop for PendingAppCall {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.upgrade()
            && pending.lock().remove(&self.call_id).is_some()
        {
            tracing::trace!(call_id = %self.call_id, "Abandoned pending app call");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utility::client_state_json;

    fn resume_url(call_id: &str, fragment: &str) -> Url {
        let state = client_state_json(call_id, true, false);
        Url::parse(&format!(
            "gb42://authorize#{}&state={}",
            fragment,
            urlencoding::encode(&state)
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_handle_open_url_completes_call() {
        let registry = AppCallRegistry::new("42", "");
        let call = registry.register();
        let url = resume_url(&call.call_id, "access_token=tok");

        assert!(registry.handle_open_url(&url));
        let params = call.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(params["access_token"], "tok");
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_call_is_not_consumed() {
        let registry = AppCallRegistry::new("42", "");
        let _call = registry.register();
        assert!(!registry.handle_open_url(&resume_url("other", "access_token=t")));
        assert!(!registry.handle_open_url(&Url::parse("https://example.com/").unwrap()));
    }

    #[tokio::test]
    async fn test_wait_times_out_as_unavailable() {
        let registry = AppCallRegistry::new("42", "");
        let call = registry.register();
        let result = call.wait(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(AuthFailure::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_timed_out_call_is_removed_and_late_url_rejected() {
        let registry = AppCallRegistry::new("42", "");
        let call = registry.register();
        let call_id = call.call_id.clone();

        let result = call.wait(Duration::from_millis(10)).await;
        let message = match result {
            Err(AuthFailure::Unavailable(message)) => message,
            other => panic!("expected a timeout, got {:?}", other),
        };
        assert!(message.contains("10ms"), "{}", message);
        assert_eq!(registry.pending_count(), 0);
        assert!(!registry.handle_open_url(&resume_url(&call_id, "access_token=late")));
    }

    #[tokio::test]
    async fn test_sub_second_timeout_is_reported_precisely() {
        let registry = AppCallRegistry::new("42", "");
        let result = registry.register().wait(Duration::from_millis(250)).await;
        let message = match result {
            Err(AuthFailure::Unavailable(message)) => message,
            other => panic!("expected a timeout, got {:?}", other),
        };
        assert!(message.ends_with("within 250ms"), "{}", message);
    }

    #[test]
    fn test_dropped_call_is_removed() {
        let registry = AppCallRegistry::new("42", "");
        let call = registry.register();
        let call_id = call.call_id.clone();
        let _kept = registry.register();
        assert_eq!(registry.pending_count(), 2);

        drop(call);
        assert_eq!(registry.pending_count(), 1);
        assert!(!registry.handle_open_url(&resume_url(&call_id, "access_token=t")));
    }

    #[test]
    fn test_call_outliving_registry_drops_cleanly() {
        let registry = AppCallRegistry::new("42", "");
        let call = registry.register();
        drop(registry);
        drop(call);
    }

    #[tokio::test]
    async fn test_cancel_resolves_waiter() {
        let registry = AppCallRegistry::new("42", "");
        let call = registry.register();
        registry.cancel(&call.call_id.clone());
        assert_eq!(
            call.wait(Duration::from_secs(1)).await,
            Err(AuthFailure::Cancelled)
        );
    }
}
