//! The legacy top-level SDK object.
//!
//! [`Gbomb`] wraps a single [`Session`] and the request pipeline behind the
//! older one-object API: authorize, extend the token, make requests, log out.
//! New code should use `gbomb_session` and `gbomb_request` directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use gbomb_config::{RequestConfig, SdkConfig};
use gbomb_request::{
    EXTEND_TOKEN_PATH, ErrorBehavior, GraphRequest, HttpMethod, RequestConnection, RequestError,
    SharedTransport, create_transport, expiration_from_response,
};
use gbomb_session::registry;
use gbomb_session::{
    AccountStore, AppSwitcher, AuthStrategy, LoginDialogPresenter, Session, SessionBuilder,
    SessionDelegate, SessionState, SharedSession, SharedTokenCache,
    create_memory_token_cache,
};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::delegate::{DelegateBridge, GbombRequestDelegate, GbombSessionDelegate};
use crate::error::{Result, SdkError};
use crate::request::{GbombRequest, RequestState};

const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.gbombgames.com/";

/// Legacy SDK entry point.
pub struct Gbomb {
    app_id: String,
    template: SessionBuilder,
    session: RwLock<Option<Arc<Session>>>,
    session_delegate: Option<Arc<dyn GbombSessionDelegate>>,
    transport: SharedTransport,
    graph_base_url: Url,
    max_retry_limit: u32,
    is_extending_access_token: AtomicBool,
}

impl std::fmt::Debug for Gbomb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gbomb")
            .field("app_id", &self.app_id)
            .field("session", &*self.session.read())
            .field("graph_base_url", &self.graph_base_url.as_str())
            .finish()
    }
}

impl Gbomb {
    pub fn builder(app_id: impl Into<String>) -> GbombBuilder {
        GbombBuilder::new(app_id)
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// The current session, open or not.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.session().and_then(|s| s.access_token())
    }

    pub fn expiration_date(&self) -> Option<DateTime<Utc>> {
        self.session().and_then(|s| s.expiration_date())
    }

    /// An open session holding an unexpired token.
    pub fn is_session_valid(&self) -> bool {
        self.open_session()
            .and_then(|s| s.grant())
            .is_some_and(|grant| !grant.is_expired())
    }

    fn open_session(&self) -> Option<Arc<Session>> {
        self.session().filter(|s| s.is_open())
    }

    fn bridge(&self) -> Option<Arc<dyn SessionDelegate>> {
        self.session_delegate
            .as_ref()
            .map(|d| Arc::new(DelegateBridge(d.clone())) as Arc<dyn SessionDelegate>)
    }

    // ── Login ───────────────────────────────────────────────────────────────

    /// Start a new session asking for `permissions` and open it.
    ///
    /// A usable cached token opens the session without any login UI. Any
    /// login still in flight on the previous session is abandoned.
    pub async fn authorize<I, S>(&self, permissions: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut builder = self.template.clone().permissions(permissions);
        if let Some(bridge) = self.bridge() {
            builder = builder.delegate(bridge);
        }
        let session = Arc::new(builder.build().await?);

        let previous = self.session.write().replace(session.clone());
        if let Some(previous) = previous {
            previous.set_delegate(None);
            previous.cancel();
        }
        registry::global().set_active(session.clone());

        info!(app_id = %self.app_id, session_id = %session.id(), "Authorizing");
        session.open().await?;
        Ok(())
    }

    /// Route an app-resume URL to the pending login.
    pub fn handle_open_url(&self, url: &Url) -> bool {
        self.session().is_some_and(|s| s.handle_open_url(url))
    }

    /// Close the session, forget its token and report the logout.
    pub async fn logout(&self) {
        let session = self.session.write().take();
        if let Some(session) = session {
            session.set_delegate(None);
            session.close().await;
            registry::global().clear();
        }
        if let Some(delegate) = &self.session_delegate {
            delegate.did_logout();
        }
    }

    // ── Token extension ─────────────────────────────────────────────────────

    /// Whether the token is due for extension and none is in progress.
    pub fn should_extend_access_token(&self) -> bool {
        !self.is_extending_access_token.load(Ordering::SeqCst)
            && self
                .open_session()
                .is_some_and(|s| s.should_extend_access_token())
    }

    pub async fn extend_access_token_if_needed(&self) -> Result<()> {
        if self.should_extend_access_token() {
            self.extend_access_token().await?;
        }
        Ok(())
    }

    /// Ask the server for a longer lived token. A no-op while another
    /// extension is in progress.
    pub async fn extend_access_token(&self) -> Result<()> {
        let session = self.open_session().ok_or(SdkError::NoSession)?;
        if self.is_extending_access_token.swap(true, Ordering::SeqCst) {
            debug!("Token extension already in progress");
            return Ok(());
        }
        let result = self.extend_with(&session).await;
        self.is_extending_access_token.store(false, Ordering::SeqCst);
        result
    }

    async fn extend_with(&self, session: &Arc<Session>) -> Result<()> {
        session.record_extension_attempt();
        let shared: SharedSession = session.clone();
        let (tx, rx) = oneshot::channel();
        let mut connection = self.connection();
        connection.add_request(
            GraphRequest::get(EXTEND_TOKEN_PATH).with_session(shared),
            move |result| {
                let _ = tx.send(result);
            },
        );
        connection.start().await;

        let value = rx.await.map_err(|_| RequestError::Cancelled)??;
        let token = value
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| RequestError::InvalidResponse("no access_token in response".into()))?;
        session
            .refresh_access_token(token, expiration_from_response(&value))
            .await?;
        Ok(())
    }

    // ── Requests ────────────────────────────────────────────────────────────

    /// GET `graph_path`.
    pub fn request_with_graph_path(
        &self,
        graph_path: &str,
        delegate: Option<Arc<dyn GbombRequestDelegate>>,
    ) -> Arc<GbombRequest> {
        self.start_request(GraphRequest::get(graph_path), delegate)
    }

    pub fn request_with_graph_path_and_params<I, K, V>(
        &self,
        graph_path: &str,
        params: I,
        method: HttpMethod,
        delegate: Option<Arc<dyn GbombRequestDelegate>>,
    ) -> Arc<GbombRequest>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut request = GraphRequest::new(graph_path, method);
        request
            .params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self.start_request(request, delegate)
    }

    /// Call a legacy REST method.
    pub fn request_with_method_name<I, K, V>(
        &self,
        method_name: &str,
        params: I,
        method: HttpMethod,
        delegate: Option<Arc<dyn GbombRequestDelegate>>,
    ) -> Arc<GbombRequest>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.start_request(GraphRequest::rest_method(method_name, params, method), delegate)
    }

    fn connection(&self) -> RequestConnection {
        RequestConnection::new(self.transport.clone(), self.graph_base_url.clone())
            .with_max_retry_limit(self.max_retry_limit)
    }

    /// Spawn the request on the current runtime and return its handle.
    fn start_request(
        &self,
        request: GraphRequest,
        delegate: Option<Arc<dyn GbombRequestDelegate>>,
    ) -> Arc<GbombRequest> {
        let session = self.open_session();
        let request = match &session {
            Some(session) => {
                let shared: SharedSession = session.clone();
                request.with_session(shared)
            }
            None => request,
        };
        let handle = Arc::new(GbombRequest::new(&request));
        let task = RequestTask {
            connection: self.connection(),
            request,
            handle: handle.clone(),
            delegate,
            session,
            session_delegate: self.session_delegate.clone(),
        };
        tokio::spawn(task.run());
        handle
    }
}

/// Everything a spawned facade request needs.
struct RequestTask {
    connection: RequestConnection,
    request: GraphRequest,
    handle: Arc<GbombRequest>,
    delegate: Option<Arc<dyn GbombRequestDelegate>>,
    session: Option<Arc<Session>>,
    session_delegate: Option<Arc<dyn GbombSessionDelegate>>,
}

impl RequestTask {
    async fn run(self) {
        let RequestTask {
            mut connection,
            request,
            handle,
            delegate,
            session,
            session_delegate,
        } = self;

        handle.set_loading();
        if let Some(delegate) = &delegate {
            delegate.request_loading(&handle);
        }

        let (tx, rx) = oneshot::channel();
        connection.add_request_with(request, ErrorBehavior::RETRY, None, move |result| {
            let _ = tx.send(result);
        });
        connection.start().await;
        let result = rx.await.unwrap_or(Err(RequestError::Cancelled));

        match result {
            Ok(value) => {
                handle.store_result(value.clone());
                if let Some(delegate) = &delegate {
                    delegate.did_load(&handle, &value);
                }
                handle.finish(RequestState::Complete);
            }
            Err(error) => {
                if error.is_session_related() {
                    warn!(path = %handle.graph_path(), error = %error, "Request reported an invalid session");
                    handle.mark_session_expired();
                    if let Some(session) = &session
                        && session.state() != SessionState::Closed
                    {
                        session
                            .close_and_clear_token_information("request reported an invalid session")
                            .await;
                    }
                    if let Some(session_delegate) = &session_delegate {
                        session_delegate.session_invalidated();
                    }
                }
                handle.store_error(error.clone());
                if let Some(delegate) = &delegate {
                    delegate.did_fail(&handle, &error);
                }
                handle.finish(RequestState::Error);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`Gbomb`].
pub struct GbombBuilder {
    session: SessionBuilder,
    session_delegate: Option<Arc<dyn GbombSessionDelegate>>,
    token_cache: Option<SharedTokenCache>,
    transport: Option<SharedTransport>,
    request_config: RequestConfig,
    graph_base_url: Option<Url>,
}

impl GbombBuilder {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            session: SessionBuilder::new(app_id),
            session_delegate: None,
            token_cache: None,
            transport: None,
            request_config: RequestConfig::default(),
            graph_base_url: None,
        }
    }

    /// Start from app identity, endpoints and policies in `config`.
    pub fn from_config(config: &SdkConfig) -> Result<Self> {
        Ok(Self {
            session: SessionBuilder::from_config(config)?,
            session_delegate: None,
            token_cache: None,
            transport: None,
            request_config: config.request_policy(),
            graph_base_url: Some(Url::parse(&config.endpoints().graph_base_url)?),
        })
    }

    pub fn url_scheme_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.session = self.session.url_scheme_suffix(suffix);
        self
    }

    pub fn url_scheme_registered(mut self, registered: bool) -> Self {
        self.session = self.session.url_scheme_registered(registered);
        self
    }

    pub fn session_delegate(mut self, delegate: Arc<dyn GbombSessionDelegate>) -> Self {
        self.session_delegate = Some(delegate);
        self
    }

    pub fn token_cache(mut self, cache: SharedTokenCache) -> Self {
        self.token_cache = Some(cache);
        self
    }

    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn graph_base_url(mut self, url: Url) -> Self {
        self.graph_base_url = Some(url);
        self
    }

    pub fn max_retry_limit(mut self, limit: u32) -> Self {
        self.request_config.max_retry_limit = limit;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.session = self.session.strategy(strategy);
        self
    }

    pub fn standard_strategies(
        mut self,
        account_store: Option<Arc<dyn AccountStore>>,
        switcher: Option<Arc<dyn AppSwitcher>>,
        presenter: Option<Arc<dyn LoginDialogPresenter>>,
    ) -> Self {
        self.session = self
            .session
            .standard_strategies(account_store, switcher, presenter);
        self
    }

    /// Build the facade, reopening a usable cached session if there is one.
    pub async fn build(self) -> Result<Gbomb> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => create_transport(&self.request_config)?,
        };
        let graph_base_url = match self.graph_base_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_GRAPH_BASE_URL)?,
        };
        let token_cache = self.token_cache.unwrap_or_else(create_memory_token_cache);
        let template = self.session.token_cache(token_cache);

        let restored = template.clone().build().await?;
        let app_id = restored.app_id().to_string();
        let session = if restored.state() == SessionState::CreatedTokenLoaded {
            restored.open().await?;
            debug!(session_id = %restored.id(), "Restored cached session");
            let restored = Arc::new(restored);
            registry::global().set_active(restored.clone());
            Some(restored)
        } else {
            None
        };

        let gbomb = Gbomb {
            app_id,
            template,
            session: RwLock::new(session),
            session_delegate: self.session_delegate,
            transport,
            graph_base_url,
            max_retry_limit: self.request_config.max_retry_limit,
            is_extending_access_token: AtomicBool::new(false),
        };
        if let Some(session) = gbomb.session() {
            session.set_delegate(gbomb.bridge());
        }
        Ok(gbomb)
    }
}
