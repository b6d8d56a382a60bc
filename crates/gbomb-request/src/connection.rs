//! Batched graph request connection.
//!
//! A [`RequestConnection`] collects requests and sends them in one round
//! trip: a single request goes straight to its endpoint, several are wrapped
//! in a graph batch. Every response is demultiplexed back to its request's
//! handler. Token extension and permission refresh calls ride along for any
//! open session that is due for one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use gbomb_config::SdkConfig;
use gbomb_session::SharedSession;
use gbomb_session::utility::expiration_date_from_response_params;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::ResponseCache;
use crate::error::{RequestError, Result};
use crate::metadata::{Completion, RequestMetadata};
use crate::request::{ErrorBehavior, GraphRequest, HttpMethod};
use crate::retry::{AutoConfirm, RetryManager, RetryPrompt};
use crate::transport::{HttpRequest, HttpResponse, SharedTransport};

/// Graph path used to extend a session's token.
pub const EXTEND_TOKEN_PATH: &str = "oauth/access_token_extend";

/// Graph path listing the permissions granted to the token.
pub const PERMISSIONS_PATH: &str = "me/permissions";

/// Observer of a connection's network activity.
pub trait ConnectionDelegate: Send + Sync {
    fn will_send(&self, _batch_size: usize) {}

    fn did_receive_response(&self, _status: u16) {}

    fn did_fail(&self, _error: &RequestError) {}

    fn did_finish(&self, _summary: &ConnectionSummary) {}
}

/// What happened when a connection ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// Requests added by the caller.
    pub requests: usize,
    /// Network round trips, retries included.
    pub round_trips: usize,
    /// Requests answered from the response cache.
    pub from_cache: usize,
    pub cancelled: bool,
}

impl ConnectionSummary {
    /// Every request was answered from the cache.
    pub fn is_result_from_cache(&self) -> bool {
        self.from_cache > 0 && self.round_trips == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RequestConnection
// ─────────────────────────────────────────────────────────────────────────────

/// A set of requests sent together.
pub struct RequestConnection {
    dispatcher: Dispatcher,
    entries: Vec<RequestMetadata>,
}

impl std::fmt::Debug for RequestConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestConnection")
            .field("graph_base_url", &self.dispatcher.graph_base_url.as_str())
            .field("entries", &self.entries)
            .field("max_retry_limit", &self.dispatcher.max_retry_limit)
            .finish()
    }
}

impl RequestConnection {
    pub fn new(transport: SharedTransport, graph_base_url: Url) -> Self {
        Self {
            dispatcher: Dispatcher {
                transport,
                graph_base_url,
                max_retry_limit: 1,
                cache: None,
                cache_identity: None,
                prompt: Arc::new(AutoConfirm),
                delegate: None,
                cancel: CancellationToken::new(),
                round_trips: AtomicUsize::new(0),
            },
            entries: Vec::new(),
        }
    }

    pub fn from_config(transport: SharedTransport, config: &SdkConfig) -> Result<Self> {
        let endpoints = config.endpoints();
        let base = Url::parse(&endpoints.graph_base_url)?;
        Ok(Self::new(transport, base).with_max_retry_limit(config.request_policy().max_retry_limit))
    }

    pub fn with_max_retry_limit(mut self, limit: u32) -> Self {
        self.dispatcher.max_retry_limit = limit;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.dispatcher.cache = Some(cache);
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn RetryPrompt>) -> Self {
        self.dispatcher.prompt = prompt;
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn ConnectionDelegate>) -> Self {
        self.dispatcher.delegate = Some(delegate);
        self
    }

    /// Add a request whose errors go straight to `handler`.
    pub fn add_request<F>(&mut self, request: GraphRequest, handler: F)
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        self.add_metadata(RequestMetadata::new(request, ErrorBehavior::NONE, handler));
    }

    pub fn add_request_with<F>(
        &mut self,
        request: GraphRequest,
        behavior: ErrorBehavior,
        batch_name: Option<&str>,
        handler: F,
    ) where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let mut metadata = RequestMetadata::new(request, behavior, handler);
        if let Some(name) = batch_name {
            metadata = metadata.with_batch_name(name);
        }
        self.add_metadata(metadata);
    }

    pub fn add_metadata(&mut self, metadata: RequestMetadata) {
        self.entries.push(metadata);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Token that cancels this connection. Handlers are not called once it
    /// is cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.dispatcher.cancel.clone()
    }

    pub fn cancel(&self) {
        self.dispatcher.cancel.cancel();
    }

    /// Send every request and run their handlers.
    pub async fn start(self) -> ConnectionSummary {
        let RequestConnection {
            dispatcher,
            entries,
        } = self;
        dispatcher.run(entries, false).await
    }

    /// Like [`start`](Self::start), caching GET responses under `identity`.
    /// With `skip_roundtrip_if_cached`, cached responses are delivered
    /// without going to the network.
    pub async fn start_with_cache_identity(
        self,
        identity: impl Into<String>,
        skip_roundtrip_if_cached: bool,
    ) -> ConnectionSummary {
        let RequestConnection {
            mut dispatcher,
            entries,
        } = self;
        dispatcher.cache_identity = Some(identity.into());
        dispatcher.run(entries, skip_roundtrip_if_cached).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// The sending half of a connection, shared with retries.
pub(crate) struct Dispatcher {
    transport: SharedTransport,
    graph_base_url: Url,
    max_retry_limit: u32,
    cache: Option<Arc<ResponseCache>>,
    cache_identity: Option<String>,
    prompt: Arc<dyn RetryPrompt>,
    delegate: Option<Arc<dyn ConnectionDelegate>>,
    cancel: CancellationToken,
    round_trips: AtomicUsize,
}

impl Dispatcher {
    pub(crate) fn prompt(&self) -> &dyn RetryPrompt {
        self.prompt.as_ref()
    }

    async fn run(&self, entries: Vec<RequestMetadata>, skip_roundtrip: bool) -> ConnectionSummary {
        let mut summary = ConnectionSummary {
            requests: entries.len(),
            ..Default::default()
        };

        let mut remaining = Vec::with_capacity(entries.len());
        for entry in entries {
            if skip_roundtrip && let Some(value) = self.cached(&entry.request) {
                trace!(path = %entry.request.graph_path, "Answered from cache");
                summary.from_cache += 1;
                self.deliver(entry, Ok(value));
            } else {
                remaining.push(entry);
            }
        }

        if !remaining.is_empty() {
            self.dispatch(remaining).await;
        }

        summary.round_trips = self.round_trips.load(Ordering::SeqCst);
        summary.cancelled = self.cancel.is_cancelled();
        if let Some(delegate) = &self.delegate {
            delegate.did_finish(&summary);
        }
        summary
    }

    /// Send one round trip and process its results, retries included.
    pub(crate) fn dispatch(&self, entries: Vec<RequestMetadata>) -> BoxFuture<'_, ()> {
        async move {
            if entries.is_empty() {
                return;
            }
            if self.cancel.is_cancelled() {
                debug!(count = entries.len(), "Connection cancelled before sending");
                return;
            }

            let mut entries = entries;
            self.add_piggybacks(&mut entries);
            let batch_size = entries.len();

            let results = match self.build_http_request(&entries) {
                Ok(http) => {
                    if let Some(delegate) = &self.delegate {
                        delegate.will_send(batch_size);
                    }
                    self.round_trips.fetch_add(1, Ordering::SeqCst);
                    debug!(batch_size, url = %http.url, method = %http.method, "Sending graph request");

                    let response = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            debug!(batch_size, "Connection cancelled in flight");
                            return;
                        }
                        response = self.transport.send(http) => response,
                    };
                    match response {
                        Ok(response) => {
                            if let Some(delegate) = &self.delegate {
                                delegate.did_receive_response(response.status);
                            }
                            parse_response(&response, batch_size)
                        }
                        Err(e) => {
                            warn!(error = %e, batch_size, "Graph request failed");
                            if let Some(delegate) = &self.delegate {
                                delegate.did_fail(&e);
                            }
                            vec![Err(e); batch_size]
                        }
                    }
                }
                Err(e) => vec![Err(e); batch_size],
            };

            self.process_results(entries, results).await;
        }
        .boxed()
    }

    async fn process_results(&self, entries: Vec<RequestMetadata>, results: Vec<Result<Value>>) {
        let mut manager = RetryManager::new(self.max_retry_limit);
        let mut piggybacks = Vec::new();

        for (entry, result) in entries.into_iter().zip(results) {
            if entry.is_piggyback() {
                piggybacks.push((entry, result));
                continue;
            }
            match result {
                Ok(value) => {
                    self.store_in_cache(&entry.request, &value);
                    self.deliver(entry, Ok(value));
                }
                Err(error) => {
                    let chain = entry.chain.clone();
                    if let Some((entry, error)) = chain.handle(&mut manager, entry, error) {
                        self.deliver(entry, Err(error));
                    }
                }
            }
        }

        for (entry, result) in piggybacks {
            complete_piggyback(entry.completion, result).await;
        }

        if manager.has_work() {
            manager.perform_retries(self).await;
        }
    }

    /// Hand a result to its handler unless the connection was cancelled.
    pub(crate) fn deliver(&self, entry: RequestMetadata, result: Result<Value>) {
        if self.cancel.is_cancelled() {
            trace!(path = %entry.request.graph_path, "Dropping result of cancelled connection");
            return;
        }
        entry.invoke(result);
    }

    fn add_piggybacks(&self, entries: &mut Vec<RequestMetadata>) {
        if entries
            .iter()
            .any(|e| e.request.graph_path == EXTEND_TOKEN_PATH)
        {
            return;
        }

        let mut seen = HashSet::new();
        let sessions: Vec<SharedSession> = entries
            .iter()
            .filter_map(|e| e.request.session().cloned())
            .filter(|s| seen.insert(s.id().to_string()))
            .collect();

        for session in sessions {
            if !session.state().is_open() {
                continue;
            }
            if session.should_extend_access_token() {
                debug!(session_id = %session.id(), "Piggybacking token extension");
                session.record_extension_attempt();
                entries.push(RequestMetadata::piggyback(
                    GraphRequest::get(EXTEND_TOKEN_PATH).with_session(session.clone()),
                    Completion::ExtendToken(session.clone()),
                ));
            }
            if session.should_refresh_permissions() {
                debug!(session_id = %session.id(), "Piggybacking permission refresh");
                entries.push(RequestMetadata::piggyback(
                    GraphRequest::get(PERMISSIONS_PATH).with_session(session.clone()),
                    Completion::RefreshPermissions(session),
                ));
            }
        }
    }

    fn build_http_request(&self, entries: &[RequestMetadata]) -> Result<HttpRequest> {
        if let [entry] = entries {
            return self.build_single(&entry.request);
        }

        let batch_token = entries.iter().find_map(|e| e.request.access_token());
        let items: Vec<Value> = entries
            .iter()
            .map(|entry| {
                let request = &entry.request;
                let token = request.access_token();
                let own_token = token.as_ref().filter(|t| Some(*t) != batch_token.as_ref());

                let mut item = json!({ "method": request.method.as_str() });
                let mut relative_url = request.relative_url();
                if request.method == HttpMethod::Post {
                    let mut body = request.encoded_params();
                    if let Some(token) = own_token {
                        append_pair(&mut body, '&', "access_token", token);
                    }
                    item["body"] = Value::String(body);
                } else if let Some(token) = own_token {
                    let separator = if relative_url.contains('?') { '&' } else { '?' };
                    append_pair(&mut relative_url, separator, "access_token", token);
                }
                item["relative_url"] = Value::String(relative_url);
                if let Some(name) = &entry.batch_name {
                    item["name"] = Value::String(name.clone());
                }
                item
            })
            .collect();

        let mut form = vec![("batch".to_string(), Value::Array(items).to_string())];
        if let Some(token) = batch_token {
            form.push(("access_token".to_string(), token));
        }
        Ok(HttpRequest {
            method: HttpMethod::Post,
            url: self.graph_base_url.clone(),
            form,
        })
    }

    fn build_single(&self, request: &GraphRequest) -> Result<HttpRequest> {
        let mut url = self.graph_base_url.join(&request.graph_path)?;
        let mut pairs: Vec<(String, String)> = request
            .params
            .iter()
            .filter(|(k, _)| k.as_str() != "access_token")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(token) = request.access_token() {
            pairs.push(("access_token".to_string(), token));
        }

        let form = match request.method {
            HttpMethod::Post => pairs,
            HttpMethod::Get | HttpMethod::Delete => {
                if !pairs.is_empty() {
                    url.query_pairs_mut().extend_pairs(pairs);
                }
                Vec::new()
            }
        };
        Ok(HttpRequest {
            method: request.method,
            url,
            form,
        })
    }

    fn cache_key(&self, request: &GraphRequest) -> Option<(&ResponseCache, String)> {
        if request.method != HttpMethod::Get {
            return None;
        }
        let cache = self.cache.as_deref()?;
        let identity = self.cache_identity.as_deref()?;
        Some((cache, ResponseCache::key(identity, &request.relative_url())))
    }

    fn cached(&self, request: &GraphRequest) -> Option<Value> {
        let (cache, key) = self.cache_key(request)?;
        cache.get(&key)
    }

    fn store_in_cache(&self, request: &GraphRequest, value: &Value) {
        if let Some((cache, key)) = self.cache_key(request) {
            cache.put(key, value.clone());
        }
    }
}

fn append_pair(target: &mut String, separator: char, key: &str, value: &str) {
    if !target.is_empty() && !target.ends_with(separator) {
        target.push(separator);
    }
    target.push_str(key);
    target.push('=');
    target.push_str(&urlencoding::encode(value));
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// Split a response into one result per request.
fn parse_response(response: &HttpResponse, batch_size: usize) -> Vec<Result<Value>> {
    if batch_size == 1 {
        return vec![parse_body(response.status, &response.body)];
    }

    let parsed = match serde_json::from_str::<Value>(&response.body) {
        Ok(value) => value,
        Err(e) => {
            let error = if response.status >= 400 {
                http_error(response.status)
            } else {
                RequestError::from(e)
            };
            return vec![Err(error); batch_size];
        }
    };

    let items = match parsed {
        Value::Array(items) => items,
        other => {
            let error = match interpret(response.status, other) {
                Err(e) => e,
                Ok(_) => RequestError::InvalidResponse("expected a batch response array".into()),
            };
            return vec![Err(error); batch_size];
        }
    };

    (0..batch_size)
        .map(|i| match items.get(i) {
            Some(Value::Object(item)) => {
                let status = item
                    .get("code")
                    .and_then(Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(200);
                match item.get("body") {
                    Some(Value::String(body)) => parse_body(status, body),
                    Some(body) => interpret(status, body.clone()),
                    None => interpret(status, Value::Null),
                }
            }
            _ => Err(RequestError::InvalidResponse(format!(
                "missing result for batch entry {}",
                i
            ))),
        })
        .collect()
}

fn parse_body(status: u16, body: &str) -> Result<Value> {
    if body.trim().is_empty() {
        return interpret(status, Value::Null);
    }
    match serde_json::from_str::<Value>(body) {
        Ok(value) => interpret(status, value),
        Err(_) if status >= 400 => Err(http_error(status)),
        Err(e) => Err(e.into()),
    }
}

/// Turn a decoded body into a result, recognising graph and legacy errors.
fn interpret(status: u16, value: Value) -> Result<Value> {
    if let Some(error) = value.get("error") {
        return Err(match error {
            Value::Object(_) => RequestError::from_error_object(status, error),
            other => RequestError::Api {
                status,
                code: None,
                subcode: None,
                message: other
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| other.to_string()),
                error_type: None,
            },
        });
    }
    if value.get("error_code").is_some() {
        return Err(RequestError::from_error_object(status, &value));
    }
    if status >= 400 {
        return Err(http_error(status));
    }
    Ok(value)
}

fn http_error(status: u16) -> RequestError {
    RequestError::Api {
        status,
        code: None,
        subcode: None,
        message: format!("HTTP {}", status),
        error_type: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Piggybacks
// ─────────────────────────────────────────────────────────────────────────────

async fn complete_piggyback(completion: Completion, result: Result<Value>) {
    match (completion, result) {
        (Completion::ExtendToken(session), Ok(value)) => {
            let Some(token) = value.get("access_token").and_then(Value::as_str) else {
                debug!(session_id = %session.id(), "Extension response carried no token");
                return;
            };
            let expiration = expiration_from_response(&value);
            if let Err(e) = session.refresh_access_token(token, expiration).await {
                warn!(session_id = %session.id(), error = %e, "Failed to apply extended token");
            }
        }
        (Completion::RefreshPermissions(session), Ok(value)) => {
            let Some(permissions) = permissions_from_value(&value) else {
                debug!(session_id = %session.id(), "Permissions response not understood");
                return;
            };
            if let Err(e) = session.refresh_permissions(permissions).await {
                warn!(session_id = %session.id(), error = %e, "Failed to apply permissions");
            }
        }
        (Completion::ExtendToken(session) | Completion::RefreshPermissions(session), Err(e)) => {
            debug!(session_id = %session.id(), error = %e, "Piggybacked request failed");
        }
        (Completion::Handler(_), _) => {}
    }
}

/// Expiration carried by a token response (`expires_in` seconds or
/// `expires_at` unix time).
pub fn expiration_from_response(value: &Value) -> Option<chrono::DateTime<Utc>> {
    let mut params = HashMap::new();
    if let Some(v) = value.get("expires_in") {
        params.insert("expires_in".to_string(), scalar_to_string(v));
    }
    if let Some(v) = value.get("expires_at").or_else(|| value.get("expires")) {
        params.insert("expires".to_string(), scalar_to_string(v));
    }
    expiration_date_from_response_params(&params, Utc::now())
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Granted permissions from `data: [{permission, status}]` or the legacy
/// `data: [{name: 1, ...}]` shape.
fn permissions_from_value(value: &Value) -> Option<Vec<String>> {
    let data = value.get("data")?.as_array()?;
    let mut permissions = Vec::new();
    for item in data {
        if let Some(name) = item.get("permission").and_then(Value::as_str) {
            let granted = item
                .get("status")
                .and_then(Value::as_str)
                .is_none_or(|s| s == "granted");
            if granted {
                permissions.push(name.to_string());
            }
        } else if let Some(object) = item.as_object() {
            permissions.extend(
                object
                    .iter()
                    .filter(|(_, v)| v.as_i64() == Some(1) || v.as_bool() == Some(true))
                    .map(|(k, _)| k.clone()),
            );
        }
    }
    Some(permissions)
}
