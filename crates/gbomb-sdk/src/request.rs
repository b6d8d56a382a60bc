//! Handle for a request started through the facade.

use std::sync::atomic::{AtomicBool, Ordering};

use gbomb_request::{GraphRequest, HttpMethod, RequestError};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Ready,
    Loading,
    Complete,
    Error,
}

impl RequestState {
    pub fn is_finished(&self) -> bool {
        matches!(self, RequestState::Complete | RequestState::Error)
    }
}

/// A request in flight. Observe it through its delegate or [`wait`](Self::wait).
#[derive(Debug)]
pub struct GbombRequest {
    graph_path: String,
    method: HttpMethod,
    params: Vec<(String, String)>,
    state: watch::Sender<RequestState>,
    session_did_expire: AtomicBool,
    result: Mutex<Option<Value>>,
    error: Mutex<Option<RequestError>>,
}

impl GbombRequest {
    pub(crate) fn new(request: &GraphRequest) -> Self {
        let (state, _) = watch::channel(RequestState::Ready);
        Self {
            graph_path: request.graph_path.clone(),
            method: request.method,
            params: request
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            state,
            session_did_expire: AtomicBool::new(false),
            result: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn graph_path(&self) -> &str {
        &self.graph_path
    }

    pub fn http_method(&self) -> HttpMethod {
        self.method
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    pub fn is_loading(&self) -> bool {
        self.state() == RequestState::Loading
    }

    /// The server rejected the session's token.
    pub fn session_did_expire(&self) -> bool {
        self.session_did_expire.load(Ordering::SeqCst)
    }

    pub fn result(&self) -> Option<Value> {
        self.result.lock().clone()
    }

    pub fn error(&self) -> Option<RequestError> {
        self.error.lock().clone()
    }

    /// Wait until the request completes or fails.
    pub async fn wait(&self) -> RequestState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(RequestState::is_finished).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    pub(crate) fn set_loading(&self) {
        self.state.send_replace(RequestState::Loading);
    }

    pub(crate) fn store_result(&self, value: Value) {
        *self.result.lock() = Some(value);
    }

    pub(crate) fn store_error(&self, error: RequestError) {
        *self.error.lock() = Some(error);
    }

    pub(crate) fn finish(&self, state: RequestState) {
        self.state.send_replace(state);
    }

    pub(crate) fn mark_session_expired(&self) {
        self.session_did_expire.store(true, Ordering::SeqCst);
    }
}
