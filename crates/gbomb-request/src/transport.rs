//! HTTP transport.
//!
//! [`RequestConnection`](crate::RequestConnection) builds [`HttpRequest`]s and
//! interprets [`HttpResponse`]s; a [`Transport`] only moves bytes. Non-2xx
//! statuses are returned as responses, not errors.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gbomb_config::RequestConfig;
use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use crate::error::{RequestError, Result};
use crate::request::HttpMethod;

/// A request ready to go on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    /// Form-encoded body fields (POST only).
    pub form: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn query_value(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

/// Raw response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }
}

/// Moves one HTTP request over the network.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Shared transport for use across connections.
pub type SharedTransport = Arc<dyn Transport>;

// ─────────────────────────────────────────────────────────────────────────────
// ReqwestTransport
// ─────────────────────────────────────────────────────────────────────────────

/// Transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("gbomb-sdk-rs/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RequestError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, timeout })
    }

    pub fn from_config(config: &RequestConfig) -> Result<Self> {
        Self::new(config.timeout())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let builder = match request.method {
            HttpMethod::Get => self.http.get(request.url),
            HttpMethod::Post => self.http.post(request.url).form(&request.form),
            HttpMethod::Delete => self.http.delete(request.url),
        };

        let response = builder.timeout(self.timeout).send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_error)?;
        tracing::trace!(status, bytes = body.len(), "HTTP response received");
        Ok(HttpResponse { status, body })
    }
}

fn map_error(e: reqwest::Error) -> RequestError {
    if e.is_timeout() {
        RequestError::Timeout
    } else {
        RequestError::Network(e.to_string())
    }
}

/// Create a shared reqwest transport from request settings.
pub fn create_transport(config: &RequestConfig) -> Result<SharedTransport> {
    Ok(Arc::new(ReqwestTransport::from_config(config)?))
}

// ─────────────────────────────────────────────────────────────────────────────
// MockTransport
// ─────────────────────────────────────────────────────────────────────────────

/// A scripted transport for testing.
///
/// Returns the queued results in order and records every request. Once the
/// queue is empty, further sends fail with a network error.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new(responses: Vec<Result<HttpResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, response: Result<HttpResponse>) {
        self.responses.lock().push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(RequestError::Network("mock transport exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_reqwest_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(query_param("access_token", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1"})))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/me?access_token=tok", server.uri())).unwrap();
        let response = transport
            .send(HttpRequest {
                method: HttpMethod::Get,
                url,
                form: Vec::new(),
            })
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(
            serde_json::from_str::<Value>(&response.body).unwrap(),
            json!({"id": "1"})
        );
    }

    #[tokio::test]
    async fn test_reqwest_post_form_and_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_string_contains("batch="))
            .respond_with(ResponseTemplate::new(400).set_body_string("{}"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .send(HttpRequest {
                method: HttpMethod::Post,
                url: Url::parse(&format!("{}/", server.uri())).unwrap(),
                form: vec![("batch".into(), "[]".into())],
            })
            .await
            .unwrap();
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_reqwest_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_millis(100)).unwrap();
        let result = transport
            .send(HttpRequest {
                method: HttpMethod::Get,
                url: Url::parse(&server.uri()).unwrap(),
                form: Vec::new(),
            })
            .await;
        assert_eq!(result, Err(RequestError::Timeout));
    }

    #[tokio::test]
    async fn test_mock_transport_records_and_exhausts() {
        let mock = MockTransport::new(vec![Ok(HttpResponse::new(200, "{}"))]);
        let request = HttpRequest {
            method: HttpMethod::Get,
            url: Url::parse("https://graph.example/me").unwrap(),
            form: Vec::new(),
        };
        assert!(mock.send(request.clone()).await.is_ok());
        assert!(matches!(
            mock.send(request).await,
            Err(RequestError::Network(_))
        ));
        assert_eq!(mock.call_count(), 2);
    }
}
