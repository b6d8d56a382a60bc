//! Graph request descriptors.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use gbomb_session::SharedSession;
use gbomb_session::utility::serialize_query;

/// HTTP verb of a graph request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ErrorBehavior
// ─────────────────────────────────────────────────────────────────────────────

/// Error-handling policy flags attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorBehavior(u8);

impl ErrorBehavior {
    /// Deliver every error to the handler immediately.
    pub const NONE: Self = Self(0);
    /// Retry transient failures.
    pub const RETRY: Self = Self(1);
    /// Repair the session and replay when the token is rejected.
    pub const RECONNECT: Self = Self(1 << 1);
    /// Ask the user before retrying.
    pub const ALERT_USER: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ErrorBehavior {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorBehavior {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GraphRequest
// ─────────────────────────────────────────────────────────────────────────────

/// One logical graph API call.
#[derive(Clone, Default)]
pub struct GraphRequest {
    pub graph_path: String,
    pub method: HttpMethod,
    pub params: BTreeMap<String, String>,
    session: Option<SharedSession>,
}

impl fmt::Debug for GraphRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphRequest")
            .field("graph_path", &self.graph_path)
            .field("method", &self.method)
            .field("params", &self.params)
            .field("session", &self.session.as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}

impl GraphRequest {
    pub fn new(graph_path: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            graph_path: graph_path.into().trim_start_matches('/').to_string(),
            method,
            params: BTreeMap::new(),
            session: None,
        }
    }

    pub fn get(graph_path: impl Into<String>) -> Self {
        Self::new(graph_path, HttpMethod::Get)
    }

    pub fn post<I, K, V>(graph_path: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut request = Self::new(graph_path, HttpMethod::Post);
        request
            .params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        request
    }

    pub fn delete(graph_path: impl Into<String>) -> Self {
        Self::new(graph_path, HttpMethod::Delete)
    }

    /// The current user.
    pub fn for_me() -> Self {
        Self::get("me")
    }

    /// A legacy REST call (`method/{name}`), answered as JSON.
    pub fn rest_method<I, K, V>(name: &str, params: I, method: HttpMethod) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut request = Self::new(format!("method/{}", name), method);
        request
            .params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        request
            .params
            .insert("format".to_string(), "json".to_string());
        request
    }

    pub fn with_session(mut self, session: SharedSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn session(&self) -> Option<&SharedSession> {
        self.session.as_ref()
    }

    /// Token to send: the session's current one, or an explicit
    /// `access_token` parameter.
    pub fn access_token(&self) -> Option<String> {
        self.session
            .as_ref()
            .and_then(|s| s.access_token())
            .or_else(|| self.params.get("access_token").cloned())
    }

    /// Parameters without any explicit token.
    pub fn encoded_params(&self) -> String {
        serialize_query(
            self.params
                .iter()
                .filter(|(k, _)| k.as_str() != "access_token")
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }

    /// Path relative to the graph root, with the query for non-POST requests.
    pub fn relative_url(&self) -> String {
        let query = self.encoded_params();
        if self.method == HttpMethod::Post || query.is_empty() {
            self.graph_path.clone()
        } else {
            format!("{}?{}", self.graph_path, query)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_behavior_flags() {
        let b = ErrorBehavior::RETRY | ErrorBehavior::ALERT_USER;
        assert!(b.contains(ErrorBehavior::RETRY));
        assert!(b.contains(ErrorBehavior::ALERT_USER));
        assert!(!b.contains(ErrorBehavior::RECONNECT));
        assert!(!b.contains(ErrorBehavior::NONE));
        assert!(ErrorBehavior::default().is_none());
    }

    #[test]
    fn test_relative_url() {
        let get = GraphRequest::get("/me/friends")
            .with_param("limit", "10")
            .with_param("fields", "id,name");
        assert_eq!(get.relative_url(), "me/friends?fields=id%2Cname&limit=10");

        let post = GraphRequest::post("me/feed", [("message", "hi there")]);
        assert_eq!(post.relative_url(), "me/feed");
        assert_eq!(post.encoded_params(), "message=hi%20there");
    }

    #[test]
    fn test_rest_method() {
        let req = GraphRequest::rest_method("auth.expireSession", [("a", "b")], HttpMethod::Get);
        assert_eq!(req.graph_path, "method/auth.expireSession");
        assert_eq!(req.params["format"], "json");
    }

    #[test]
    fn test_explicit_access_token() {
        let req = GraphRequest::for_me().with_param("access_token", "abc");
        assert_eq!(req.access_token().as_deref(), Some("abc"));
        assert_eq!(req.relative_url(), "me");
    }
}
