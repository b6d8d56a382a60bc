//! Login strategies.
//!
//! Each strategy is one channel for obtaining a token. The session tries them
//! in a fixed order (system account store, native app, embedded web dialog,
//! system browser) and stops at the first success. Strategies that cannot
//! run report [`AuthFailure::Unavailable`] or [`AuthFailure::AppNotInstalled`]
//! so the session can move on without user-visible delay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gbomb_config::EndpointsConfig;
use url::Url;

use crate::app_call::{AppCallRegistry, PendingAppCall};
use crate::auth_logger::{
    AUTH_METHOD_BROWSER, AUTH_METHOD_GB_APPLICATION_NATIVE, AUTH_METHOD_GB_APPLICATION_WEB,
    AUTH_METHOD_INTEGRATED,
};
use crate::error::AuthFailure;
use crate::types::{DefaultAudience, LoginType, TokenGrant};
use crate::utility::{
    LOGIN_UX_CLIENT_STATE, LOGIN_UX_RESPONSE_TYPE, LOGIN_UX_RESPONSE_TYPE_TOKEN, app_base_url,
    client_state_json, parse_login_response, parse_query,
};

/// Redirect target the embedded dialog finishes on.
pub const WEB_DIALOG_REDIRECT_URI: &str = "gbconnect://success";

// ─────────────────────────────────────────────────────────────────────────────
// Strategy trait
// ─────────────────────────────────────────────────────────────────────────────

/// The channel a strategy uses; also fixes its position in the login chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StrategyKind {
    SystemAccountStore,
    NativeAppHandoff,
    WebDialog,
    BrowserFallback,
}

/// Parameters of one login attempt.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub app_id: String,
    pub url_scheme_suffix: String,
    pub permissions: Vec<String>,
    pub audience: DefaultAudience,
    pub is_reauthorize: bool,
    pub is_active_session: bool,
}

/// One way of obtaining a token.
#[async_trait]
pub trait AuthStrategy: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> StrategyKind;

    /// Method name recorded by the auth logger.
    fn method_name(&self) -> &'static str;

    /// Try to obtain a token. Never retries internally.
    async fn attempt(&self, request: &AuthRequest) -> Result<TokenGrant, AuthFailure>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Host collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Credential handed back by an OS account store.
#[derive(Debug, Clone)]
pub struct SystemAccountCredential {
    pub access_token: String,
    pub expiration_date: Option<DateTime<Utc>>,
}

/// OS-level account store.
#[async_trait]
pub trait AccountStore: Send + Sync + std::fmt::Debug {
    /// Whether the platform offers an account store at all.
    fn is_available(&self) -> bool;

    /// Ask for access. `Ok(None)` means the user has no linked account.
    async fn request_access(
        &self,
        app_id: &str,
        permissions: &[String],
        audience: DefaultAudience,
    ) -> Result<Option<SystemAccountCredential>, AuthFailure>;
}

/// Opens URLs outside the process (other apps, the system browser).
pub trait AppSwitcher: Send + Sync + std::fmt::Debug {
    /// Whether some installed app handles `url`.
    fn can_open(&self, url: &Url) -> bool;

    /// Hand `url` off. Returns whether the switch happened.
    fn open(&self, url: &Url) -> bool;
}

/// Presents the embedded login web view.
#[async_trait]
pub trait LoginDialogPresenter: Send + Sync + std::fmt::Debug {
    /// Show `url` and return the URL the flow redirected to once it reached
    /// `redirect_prefix`, or `None` if the user dismissed the dialog.
    async fn present(&self, url: &Url, redirect_prefix: &str) -> Result<Option<Url>, AuthFailure>;
}

// ─────────────────────────────────────────────────────────────────────────────
// URL building
// ─────────────────────────────────────────────────────────────────────────────

fn login_params(
    request: &AuthRequest,
    redirect_uri: &str,
    client_state: Option<&str>,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("client_id".to_string(), request.app_id.clone()),
        ("redirect_uri".to_string(), redirect_uri.to_string()),
        ("type".to_string(), "user_agent".to_string()),
        ("display".to_string(), "touch".to_string()),
        ("sdk".to_string(), "rust".to_string()),
        ("return_scopes".to_string(), "true".to_string()),
        (
            LOGIN_UX_RESPONSE_TYPE.to_string(),
            LOGIN_UX_RESPONSE_TYPE_TOKEN.to_string(),
        ),
    ];
    if !request.permissions.is_empty() {
        params.push(("scope".to_string(), request.permissions.join(",")));
    }
    if let Some(audience) = request.audience.as_param() {
        params.push(("default_audience".to_string(), audience.to_string()));
    }
    if request.is_reauthorize {
        params.push(("auth_type".to_string(), "rerequest".to_string()));
    }
    if let Some(state) = client_state {
        params.push((LOGIN_UX_CLIENT_STATE.to_string(), state.to_string()));
    }
    params
}

fn build_url(base: &str, params: &[(String, String)]) -> Result<Url, AuthFailure> {
    Url::parse_with_params(base, params)
        .map_err(|e| AuthFailure::Unavailable(format!("invalid login url '{}': {}", base, e)))
}

/// URL that hands login off to the native platform app.
pub fn native_login_url(
    endpoints: &EndpointsConfig,
    request: &AuthRequest,
    call_id: &str,
) -> Result<Url, AuthFailure> {
    let redirect = format!(
        "{}authorize",
        app_base_url(&request.app_id, &request.url_scheme_suffix)
    );
    let state = client_state_json(call_id, true, request.is_active_session);
    let base = format!("{}://authorize", endpoints.native_auth_scheme);
    build_url(&base, &login_params(request, &redirect, Some(&state)))
}

/// URL of the web login dialog, redirecting to `redirect_uri`.
pub fn dialog_login_url(
    endpoints: &EndpointsConfig,
    request: &AuthRequest,
    redirect_uri: &str,
    call_id: Option<&str>,
) -> Result<Url, AuthFailure> {
    let state = call_id.map(|id| client_state_json(id, true, request.is_active_session));
    let base = format!("{}oauth", endpoints.dialog_base_url);
    build_url(&base, &login_params(request, redirect_uri, state.as_deref()))
}

/// Launch `url` through `switcher` and wait for the resumed URL.
///
/// `call` leaves the registry however this returns, including when the
/// future is dropped mid-wait.
async fn hand_off(
    switcher: &dyn AppSwitcher,
    call: PendingAppCall,
    url: &Url,
    timeout: Duration,
) -> Result<std::collections::HashMap<String, String>, AuthFailure> {
    if !switcher.can_open(url) || !switcher.open(url) {
        return Err(AuthFailure::AppNotInstalled);
    }
    tracing::debug!(call_id = %call.call_id, scheme = url.scheme(), "Handed off login");
    call.wait(timeout).await
}

// ─────────────────────────────────────────────────────────────────────────────
// SystemAccountStore
// ─────────────────────────────────────────────────────────────────────────────

/// Login through the OS account store.
#[derive(Debug)]
pub struct SystemAccountStoreStrategy {
    store: Option<Arc<dyn AccountStore>>,
}

impl SystemAccountStoreStrategy {
    pub fn new(store: Option<Arc<dyn AccountStore>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuthStrategy for SystemAccountStoreStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SystemAccountStore
    }

    fn method_name(&self) -> &'static str {
        AUTH_METHOD_INTEGRATED
    }

    async fn attempt(&self, request: &AuthRequest) -> Result<TokenGrant, AuthFailure> {
        let store = self
            .store
            .as_ref()
            .filter(|s| s.is_available())
            .ok_or_else(|| AuthFailure::Unavailable("no system account store".to_string()))?;

        let credential = store
            .request_access(&request.app_id, &request.permissions, request.audience)
            .await?
            .ok_or_else(|| AuthFailure::Unavailable("no linked system account".to_string()))?;

        Ok(TokenGrant::new(
            credential.access_token,
            credential.expiration_date,
            request.permissions.iter().cloned(),
            LoginType::SystemAccount,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NativeAppHandoff
// ─────────────────────────────────────────────────────────────────────────────

/// Login by switching to the native platform app.
#[derive(Debug)]
pub struct NativeAppHandoffStrategy {
    switcher: Arc<dyn AppSwitcher>,
    registry: Arc<AppCallRegistry>,
    endpoints: EndpointsConfig,
    url_scheme_registered: bool,
    timeout: Duration,
}

impl NativeAppHandoffStrategy {
    pub fn new(
        switcher: Arc<dyn AppSwitcher>,
        registry: Arc<AppCallRegistry>,
        endpoints: EndpointsConfig,
        url_scheme_registered: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            switcher,
            registry,
            endpoints,
            url_scheme_registered,
            timeout,
        }
    }
}

#[async_trait]
impl AuthStrategy for NativeAppHandoffStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NativeAppHandoff
    }

    fn method_name(&self) -> &'static str {
        AUTH_METHOD_GB_APPLICATION_NATIVE
    }

    async fn attempt(&self, request: &AuthRequest) -> Result<TokenGrant, AuthFailure> {
        // Without a registered scheme the app could never resume us.
        if !self.url_scheme_registered {
            return Err(AuthFailure::AppNotInstalled);
        }

        let call = self.registry.register();
        let url = native_login_url(&self.endpoints, request, &call.call_id)?;
        let params = hand_off(self.switcher.as_ref(), call, &url, self.timeout).await?;
        parse_login_response(
            &params,
            &request.permissions,
            LoginType::NativeApp,
            Utc::now(),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebDialog
// ─────────────────────────────────────────────────────────────────────────────

/// Login through an embedded web view.
#[derive(Debug)]
pub struct WebDialogStrategy {
    presenter: Arc<dyn LoginDialogPresenter>,
    endpoints: EndpointsConfig,
}

impl WebDialogStrategy {
    pub fn new(presenter: Arc<dyn LoginDialogPresenter>, endpoints: EndpointsConfig) -> Self {
        Self {
            presenter,
            endpoints,
        }
    }
}

#[async_trait]
impl AuthStrategy for WebDialogStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::WebDialog
    }

    fn method_name(&self) -> &'static str {
        AUTH_METHOD_GB_APPLICATION_WEB
    }

    async fn attempt(&self, request: &AuthRequest) -> Result<TokenGrant, AuthFailure> {
        let url = dialog_login_url(&self.endpoints, request, WEB_DIALOG_REDIRECT_URI, None)?;
        let Some(redirect) = self
            .presenter
            .present(&url, WEB_DIALOG_REDIRECT_URI)
            .await?
        else {
            return Err(AuthFailure::Cancelled);
        };

        let mut params = redirect.query().map(parse_query).unwrap_or_default();
        if let Some(fragment) = redirect.fragment() {
            params.extend(parse_query(fragment));
        }
        parse_login_response(&params, &request.permissions, LoginType::WebView, Utc::now())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BrowserFallback
// ─────────────────────────────────────────────────────────────────────────────

/// Login in the system browser, resuming through the app's URL scheme.
#[derive(Debug)]
pub struct BrowserFallbackStrategy {
    switcher: Arc<dyn AppSwitcher>,
    registry: Arc<AppCallRegistry>,
    endpoints: EndpointsConfig,
    url_scheme_registered: bool,
    timeout: Duration,
}

impl BrowserFallbackStrategy {
    pub fn new(
        switcher: Arc<dyn AppSwitcher>,
        registry: Arc<AppCallRegistry>,
        endpoints: EndpointsConfig,
        url_scheme_registered: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            switcher,
            registry,
            endpoints,
            url_scheme_registered,
            timeout,
        }
    }
}

#[async_trait]
impl AuthStrategy for BrowserFallbackStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BrowserFallback
    }

    fn method_name(&self) -> &'static str {
        AUTH_METHOD_BROWSER
    }

    async fn attempt(&self, request: &AuthRequest) -> Result<TokenGrant, AuthFailure> {
        if !self.url_scheme_registered {
            return Err(AuthFailure::Unavailable(
                "app url scheme is not registered".to_string(),
            ));
        }

        let call = self.registry.register();
        let redirect = format!(
            "{}authorize",
            app_base_url(&request.app_id, &request.url_scheme_suffix)
        );
        let url = dialog_login_url(&self.endpoints, request, &redirect, Some(&call.call_id))?;
        let params = hand_off(self.switcher.as_ref(), call, &url, self.timeout)
            .await
        .map_err(|e| match e {
            AuthFailure::AppNotInstalled => {
                AuthFailure::Unavailable("no browser available".to_string())
            }
            other => other,
        })?;
        parse_login_response(&params, &request.permissions, LoginType::Browser, Utc::now())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MockStrategy
// ─────────────────────────────────────────────────────────────────────────────

/// A scripted strategy for testing.
///
/// Returns queued results in order; once the queue is empty it keeps
/// returning the fallback result (or `Unavailable` when none is set).
#[derive(Debug)]
pub struct MockStrategy {
    kind: StrategyKind,
    results: parking_lot::Mutex<std::collections::VecDeque<Result<TokenGrant, AuthFailure>>>,
    fallback: Option<Result<TokenGrant, AuthFailure>>,
    delay: Option<Duration>,
    requests: parking_lot::Mutex<Vec<AuthRequest>>,
}

impl MockStrategy {
    pub fn new(kind: StrategyKind, results: Vec<Result<TokenGrant, AuthFailure>>) -> Self {
        Self {
            kind,
            results: parking_lot::Mutex::new(results.into()),
            fallback: None,
            delay: None,
            requests: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// A strategy that returns `result` on every attempt.
    pub fn always(kind: StrategyKind, result: Result<TokenGrant, AuthFailure>) -> Self {
        let mut mock = Self::new(kind, Vec::new());
        mock.fallback = Some(result);
        mock
    }

    /// A strategy that grants `token` (expiring in an hour) on every attempt.
    pub fn granting(kind: StrategyKind, token: &str) -> Self {
        let grant = TokenGrant::new(
            token,
            Some(Utc::now() + chrono::Duration::hours(1)),
            Vec::<String>::new(),
            LoginType::TestUser,
        );
        Self::always(kind, Ok(grant))
    }

    /// Sleep for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<AuthRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl AuthStrategy for MockStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn method_name(&self) -> &'static str {
        match self.kind {
            StrategyKind::SystemAccountStore => AUTH_METHOD_INTEGRATED,
            StrategyKind::NativeAppHandoff => AUTH_METHOD_GB_APPLICATION_NATIVE,
            StrategyKind::WebDialog => AUTH_METHOD_GB_APPLICATION_WEB,
            StrategyKind::BrowserFallback => AUTH_METHOD_BROWSER,
        }
    }

    async fn attempt(&self, request: &AuthRequest) -> Result<TokenGrant, AuthFailure> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.results.lock().pop_front();
        let mut result = queued
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Err(AuthFailure::Unavailable("mock exhausted".to_string())));
        // Grants default to the permissions that were asked for.
        if let Ok(grant) = &mut result
            && grant.permissions.is_empty()
        {
            grant.permissions = request.permissions.iter().cloned().collect();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utility::query_params_from_login_url;
    use parking_lot::Mutex;

    fn request() -> AuthRequest {
        AuthRequest {
            app_id: "42".to_string(),
            url_scheme_suffix: String::new(),
            permissions: vec!["email".to_string()],
            audience: DefaultAudience::Friends,
            is_reauthorize: false,
            is_active_session: true,
        }
    }

    /// Switcher that records opened URLs and, optionally, resumes the app.
    #[derive(Debug)]
    struct RecordingSwitcher {
        installed: bool,
        opened: Mutex<Vec<Url>>,
    }

    impl AppSwitcher for RecordingSwitcher {
        fn can_open(&self, _url: &Url) -> bool {
            self.installed
        }

        fn open(&self, url: &Url) -> bool {
            self.opened.lock().push(url.clone());
            true
        }
    }

    #[derive(Debug)]
    struct FixedPresenter(Option<&'static str>);

    #[async_trait]
    impl LoginDialogPresenter for FixedPresenter {
        async fn present(&self, _url: &Url, _prefix: &str) -> Result<Option<Url>, AuthFailure> {
            Ok(self.0.map(|u| Url::parse(u).unwrap()))
        }
    }

    #[derive(Debug)]
    struct NoAccountStore;

    #[async_trait]
    impl AccountStore for NoAccountStore {
        fn is_available(&self) -> bool {
            true
        }

        async fn request_access(
            &self,
            _app_id: &str,
            _permissions: &[String],
            _audience: DefaultAudience,
        ) -> Result<Option<SystemAccountCredential>, AuthFailure> {
            Ok(None)
        }
    }

    #[test]
    fn test_native_login_url_carries_client_state() {
        let url = native_login_url(&EndpointsConfig::default(), &request(), "call-9").unwrap();
        assert_eq!(url.scheme(), "gbauth");
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "42");
        assert_eq!(pairs["redirect_uri"], "gb42://authorize");
        assert_eq!(pairs["scope"], "email");
        assert_eq!(pairs["default_audience"], "friends");
        assert!(pairs["state"].contains("call-9"));
    }

    #[test]
    fn test_dialog_login_url() {
        let url = dialog_login_url(
            &EndpointsConfig::default(),
            &request(),
            WEB_DIALOG_REDIRECT_URI,
            None,
        )
        .unwrap();
        assert!(url.as_str().starts_with("https://m.gbombgames.com/dialog/oauth?"));
        assert!(!url.query_pairs().any(|(k, _)| k == "state"));
    }

    #[tokio::test]
    async fn test_system_account_without_store_is_unavailable() {
        let strategy = SystemAccountStoreStrategy::new(None);
        let result = strategy.attempt(&request()).await;
        assert!(matches!(result, Err(AuthFailure::Unavailable(_))));

        let strategy = SystemAccountStoreStrategy::new(Some(Arc::new(NoAccountStore)));
        let result = strategy.attempt(&request()).await;
        assert!(matches!(result, Err(AuthFailure::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_native_handoff_without_scheme_is_app_not_installed() {
        let registry = Arc::new(AppCallRegistry::new("42", ""));
        let switcher = Arc::new(RecordingSwitcher {
            installed: true,
            opened: Mutex::new(Vec::new()),
        });
        let strategy = NativeAppHandoffStrategy::new(
            switcher.clone(),
            registry.clone(),
            EndpointsConfig::default(),
            false,
            Duration::from_secs(60),
        );

        let started = std::time::Instant::now();
        let result = strategy.attempt(&request()).await;
        assert_eq!(result, Err(AuthFailure::AppNotInstalled));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(switcher.opened.lock().is_empty());
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_native_handoff_app_missing() {
        let registry = Arc::new(AppCallRegistry::new("42", ""));
        let switcher = Arc::new(RecordingSwitcher {
            installed: false,
            opened: Mutex::new(Vec::new()),
        });
        let strategy = NativeAppHandoffStrategy::new(
            switcher,
            registry.clone(),
            EndpointsConfig::default(),
            true,
            Duration::from_secs(60),
        );
        assert_eq!(
            strategy.attempt(&request()).await,
            Err(AuthFailure::AppNotInstalled)
        );
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_native_handoff_completes_on_resume() {
        let registry = Arc::new(AppCallRegistry::new("42", ""));
        let switcher = Arc::new(RecordingSwitcher {
            installed: true,
            opened: Mutex::new(Vec::new()),
        });
        let strategy = NativeAppHandoffStrategy::new(
            switcher.clone(),
            registry.clone(),
            EndpointsConfig::default(),
            true,
            Duration::from_secs(5),
        );

        let attempt = tokio::spawn({
            let request = request();
            async move { strategy.attempt(&request).await }
        });

        // Wait for the hand-off, then resume with the state the app echoes back.
        let opened = loop {
            if let Some(url) = switcher.opened.lock().first().cloned() {
                break url;
            }
            tokio::task::yield_now().await;
        };
        let state = opened
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let resume = Url::parse(&format!(
            "gb42://authorize#access_token=native-token&expires_in=3600&state={}",
            urlencoding::encode(&state)
        ))
        .unwrap();
        assert!(query_params_from_login_url(&resume, "42", "").is_some());
        assert!(registry.handle_open_url(&resume));

        let grant = attempt.await.unwrap().unwrap();
        assert_eq!(grant.access_token, "native-token");
        assert_eq!(grant.login_type, LoginType::NativeApp);
    }

    #[tokio::test]
    async fn test_web_dialog_parses_redirect() {
        let strategy = WebDialogStrategy::new(
            Arc::new(FixedPresenter(Some(
                "gbconnect://success#access_token=web-token&expires_in=60",
            ))),
            EndpointsConfig::default(),
        );
        let grant = strategy.attempt(&request()).await.unwrap();
        assert_eq!(grant.access_token, "web-token");
        assert!(grant.expiration_date.is_some());
    }

    #[tokio::test]
    async fn test_web_dialog_dismissed_is_cancelled() {
        let strategy =
            WebDialogStrategy::new(Arc::new(FixedPresenter(None)), EndpointsConfig::default());
        assert_eq!(
            strategy.attempt(&request()).await,
            Err(AuthFailure::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_browser_requires_registered_scheme() {
        let registry = Arc::new(AppCallRegistry::new("42", ""));
        let switcher = Arc::new(RecordingSwitcher {
            installed: true,
            opened: Mutex::new(Vec::new()),
        });
        let strategy = BrowserFallbackStrategy::new(
            switcher,
            registry,
            EndpointsConfig::default(),
            false,
            Duration::from_secs(1),
        );
        assert!(matches!(
            strategy.attempt(&request()).await,
            Err(AuthFailure::Unavailable(_))
        ));
    }
}
