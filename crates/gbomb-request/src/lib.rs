//! Graph requests for the Gbomb SDK.
//!
//! This crate provides:
//! - [`GraphRequest`]: one logical API call
//! - [`RequestConnection`]: batching, response demultiplexing and piggybacked
//!   token maintenance
//! - [`RequestHandlerFactory`]: the per-request error policy chain
//! - [`RetryManager`]: retries and session repair once a response is processed
//! - [`Transport`]: the HTTP seam, with a `reqwest` implementation
//! - [`ResponseCache`]: LRU cache of GET responses

pub mod cache;
pub mod connection;
pub mod error;
pub mod handler;
pub mod metadata;
pub mod request;
pub mod retry;
pub mod transport;

pub use cache::ResponseCache;
pub use connection::{
    ConnectionDelegate, ConnectionSummary, EXTEND_TOKEN_PATH, PERMISSIONS_PATH, RequestConnection, expiration_from_response,
};
pub use error::{API_SESSION_ERROR_CODE, ErrorCategory, RequestError, Result};
pub use handler::{
    AlertUserPolicy, ErrorPolicy, HandlerChain, PolicyOutcome, ReconnectPolicy,
    RequestHandlerFactory, RetryPolicy,
};
pub use metadata::{CompletionHandler, RequestMetadata};
pub use request::{ErrorBehavior, GraphRequest, HttpMethod};
pub use retry::{AutoConfirm, RetryManager, RetryPrompt, RetryState};
pub use transport::{
    HttpRequest, HttpResponse, MockTransport, ReqwestTransport, SharedTransport, Transport,
    create_transport,
};
