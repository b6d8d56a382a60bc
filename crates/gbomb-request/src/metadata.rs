//! Per-request bookkeeping.

use std::fmt;
use std::sync::Arc;

use gbomb_session::SharedSession;
use serde_json::Value;

use crate::error::{RequestError, Result};
use crate::handler::{HandlerChain, RequestHandlerFactory};
use crate::request::{ErrorBehavior, GraphRequest};

/// Completion callback of one request. Invoked at most once.
pub type CompletionHandler = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// Where a request's result goes.
pub(crate) enum Completion {
    Handler(CompletionHandler),
    /// Piggybacked token extension for a session.
    ExtendToken(SharedSession),
    /// Piggybacked permission refresh for a session.
    RefreshPermissions(SharedSession),
}

/// One logical API call plus its handler and retry bookkeeping.
pub struct RequestMetadata {
    pub request: GraphRequest,
    pub batch_name: Option<String>,
    pub behavior: ErrorBehavior,
    pub retry_count: u32,
    /// Error that caused the request to be queued for retry.
    pub original_error: Option<RequestError>,
    pub(crate) completion: Completion,
    pub(crate) chain: Arc<HandlerChain>,
}

impl fmt::Debug for RequestMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMetadata")
            .field("request", &self.request)
            .field("batch_name", &self.batch_name)
            .field("behavior", &self.behavior)
            .field("retry_count", &self.retry_count)
            .field("original_error", &self.original_error)
            .field("piggyback", &self.is_piggyback())
            .finish()
    }
}

impl RequestMetadata {
    pub fn new<F>(request: GraphRequest, behavior: ErrorBehavior, handler: F) -> Self
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        Self {
            request,
            batch_name: None,
            behavior,
            retry_count: 0,
            original_error: None,
            completion: Completion::Handler(Box::new(handler)),
            chain: Arc::new(RequestHandlerFactory::chain_for(behavior)),
        }
    }

    pub fn with_batch_name(mut self, name: impl Into<String>) -> Self {
        self.batch_name = Some(name.into());
        self
    }

    pub(crate) fn piggyback(request: GraphRequest, completion: Completion) -> Self {
        Self {
            request,
            batch_name: None,
            behavior: ErrorBehavior::NONE,
            retry_count: 0,
            original_error: None,
            completion,
            chain: Arc::new(HandlerChain::default()),
        }
    }

    /// Whether this entry was added by the connection rather than the caller.
    pub fn is_piggyback(&self) -> bool {
        !matches!(self.completion, Completion::Handler(_))
    }

    /// Hand `result` to the caller's handler.
    pub(crate) fn invoke(self, result: Result<Value>) {
        if let Completion::Handler(handler) = self.completion {
            handler(result);
        }
    }
}
