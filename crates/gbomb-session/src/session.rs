//! The session state machine.
//!
//! A [`Session`] owns the current [`TokenGrant`] and at most one in-flight
//! login attempt. All state lives behind one mutex that is never held across
//! an `.await`; every transition is a short critical section followed by
//! delegate notification outside the lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gbomb_config::{EndpointsConfig, SdkConfig, SessionPolicyConfig};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::app_call::AppCallRegistry;
use crate::auth_logger::{AuthLogEvent, AuthLogger, RESULT_CANCELLED, RESULT_ERROR, RESULT_SUCCESS, result_for};
use crate::error::{AuthFailure, Result, SessionError};
use crate::registry;
use crate::strategy::{
    AccountStore, AppSwitcher, AuthRequest, AuthStrategy, BrowserFallbackStrategy,
    LoginDialogPresenter, NativeAppHandoffStrategy, StrategyKind, SystemAccountStoreStrategy,
    WebDialogStrategy,
};
use crate::token_cache::{DEFAULT_TOKEN_KEY, SharedTokenCache};
use crate::types::{DefaultAudience, LoginBehavior, LoginType, SessionState, TokenGrant};
use crate::utility::{
    are_all_permissions_read_permissions, are_required_permissions_a_subset_of,
    validate_request_for_permissions,
};

// ─────────────────────────────────────────────────────────────────────────────
// Delegate
// ─────────────────────────────────────────────────────────────────────────────

/// Session notifications. Every method defaults to a no-op.
///
/// Called outside the session lock, so implementations may query the session.
pub trait SessionDelegate: Send + Sync {
    fn did_login(&self, _session: &Session) {}

    fn did_not_login(&self, _session: &Session, _cancelled: bool) {}

    fn did_login_error(&self, _session: &Session, _error: &AuthFailure) {}

    fn did_extend_token(
        &self,
        _session: &Session,
        _access_token: &str,
        _expiration_date: Option<DateTime<Utc>>,
    ) {
    }

    fn did_logout(&self, _session: &Session) {}

    fn session_invalidated(&self, _session: &Session, _reason: &str) {}

    fn state_changed(&self, _session: &Session, _from: SessionState, _to: SessionState) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    Open,
    Reauthorize,
    Repair,
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    kind: AttemptKind,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    /// Present exactly when `state` is open.
    grant: Option<TokenGrant>,
    /// Grant read from the cache while in `CreatedTokenLoaded`.
    loaded_grant: Option<TokenGrant>,
    behavior: LoginBehavior,
    audience: DefaultAudience,
    is_repairing: bool,
    generation: u64,
    attempt: Option<InFlight>,
    last_extension_attempt: Option<DateTime<Utc>>,
    auth_events: Vec<AuthLogEvent>,
}

impl SessionInner {
    fn begin(&mut self, kind: AttemptKind) -> (u64, CancellationToken) {
        self.generation += 1;
        let cancel = CancellationToken::new();
        self.attempt = Some(InFlight {
            generation: self.generation,
            kind,
            cancel: cancel.clone(),
        });
        (self.generation, cancel)
    }

    /// Clear the in-flight attempt if it is still `generation`.
    fn finish(&mut self, generation: u64) -> bool {
        match &self.attempt {
            Some(flight) if flight.generation == generation => {
                self.attempt = None;
                true
            }
            _ => false,
        }
    }

    fn set_state(&mut self, to: SessionState) -> SessionState {
        std::mem::replace(&mut self.state, to)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Authorization state machine holding the current credential.
pub struct Session {
    id: String,
    app_id: String,
    url_scheme_suffix: String,
    initial_permissions: Vec<String>,
    default_audience: DefaultAudience,
    policy: SessionPolicyConfig,
    token_cache: Option<SharedTokenCache>,
    token_key: String,
    strategies: Vec<Arc<dyn AuthStrategy>>,
    app_calls: Arc<AppCallRegistry>,
    delegate: RwLock<Option<Arc<dyn SessionDelegate>>>,
    cache_guard: tokio::sync::Mutex<()>,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("app_id", &self.app_id)
            .field("state", &self.state())
            .field("strategies", &self.strategies.len())
            .finish()
    }
}

impl Session {
    pub fn builder(app_id: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(app_id)
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn url_scheme_suffix(&self) -> &str {
        &self.url_scheme_suffix
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn is_repairing(&self) -> bool {
        self.inner.lock().is_repairing
    }

    /// The access token; `None` unless the session is open.
    pub fn access_token(&self) -> Option<String> {
        self.inner.lock().grant.as_ref().map(|g| g.access_token.clone())
    }

    pub fn expiration_date(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().grant.as_ref().and_then(|g| g.expiration_date)
    }

    pub fn grant(&self) -> Option<TokenGrant> {
        self.inner.lock().grant.clone()
    }

    pub fn permissions(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .grant
            .as_ref()
            .or(inner.loaded_grant.as_ref())
            .map(|g| g.permissions.iter().cloned().collect())
            .unwrap_or_else(|| self.initial_permissions.clone())
    }

    pub fn login_type(&self) -> LoginType {
        self.inner
            .lock()
            .grant
            .as_ref()
            .map(|g| g.login_type)
            .unwrap_or_default()
    }

    /// Diagnostic events of the most recent login attempt.
    pub fn auth_events(&self) -> Vec<AuthLogEvent> {
        self.inner.lock().auth_events.clone()
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn SessionDelegate>>) {
        *self.delegate.write() = delegate;
    }

    /// Forward an "app resumed with URL" event to pending login hand-offs.
    pub fn handle_open_url(&self, url: &Url) -> bool {
        self.app_calls.handle_open_url(url)
    }

    pub fn app_call_registry(&self) -> &Arc<AppCallRegistry> {
        &self.app_calls
    }

    // ── Open / authorize ────────────────────────────────────────────────────

    /// Open with the default login behavior.
    pub async fn open(&self) -> Result<()> {
        self.open_with_behavior(LoginBehavior::default()).await
    }

    /// Open the session: a cached grant opens immediately, otherwise login runs.
    pub async fn open_with_behavior(&self, behavior: LoginBehavior) -> Result<()> {
        let from = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::CreatedTokenLoaded => {
                    inner.grant = inner.loaded_grant.take();
                    inner.behavior = behavior;
                    Some(inner.set_state(SessionState::Open))
                }
                SessionState::Created => None,
                state => {
                    return Err(SessionError::InvalidState {
                        operation: "open",
                        state,
                    });
                }
            }
        };

        match from {
            Some(from) => {
                tracing::info!(session_id = %self.id, "Session opened from cached token");
                self.notify_state(from, SessionState::Open);
                self.with_delegate(|d| d.did_login(self));
                Ok(())
            }
            None => {
                let permissions = self.initial_permissions.clone();
                self.authorize(&permissions, behavior, self.default_audience, false)
                    .await
            }
        }
    }

    /// Run the login chain for `permissions`.
    ///
    /// Only valid from a created state unless `is_reauthorize` is set, in
    /// which case the session must be open and is reauthorized in place.
    pub async fn authorize(
        &self,
        permissions: &[String],
        behavior: LoginBehavior,
        audience: DefaultAudience,
        is_reauthorize: bool,
    ) -> Result<()> {
        if is_reauthorize {
            return if are_all_permissions_read_permissions(permissions) {
                self.request_new_read_permissions(permissions).await
            } else {
                self.request_new_publish_permissions(permissions, audience)
                    .await
            };
        }

        let (generation, cancel, from) = {
            let mut inner = self.inner.lock();
            if !inner.state.is_created() {
                return Err(SessionError::InvalidState {
                    operation: "authorize",
                    state: inner.state,
                });
            }
            inner.loaded_grant = None;
            inner.behavior = behavior;
            inner.audience = audience;
            let (generation, cancel) = inner.begin(AttemptKind::Open);
            let from = inner.set_state(SessionState::CreatedOpening);
            (generation, cancel, from)
        };
        self.notify_state(from, SessionState::CreatedOpening);

        let request = self.auth_request(permissions.to_vec(), audience, false);
        let (outcome, events) = self.run_chain(request, behavior, cancel).await;
        self.complete_open(generation, AttemptKind::Open, outcome, events)
            .await
    }

    /// Reauthorize an open session for additional read permissions.
    pub async fn request_new_read_permissions(&self, permissions: &[String]) -> Result<()> {
        self.request_new_permissions(permissions, DefaultAudience::None, true)
            .await
    }

    /// Reauthorize an open session for publish permissions.
    pub async fn request_new_publish_permissions(
        &self,
        permissions: &[String],
        audience: DefaultAudience,
    ) -> Result<()> {
        self.request_new_permissions(permissions, audience, false)
            .await
    }

    async fn request_new_permissions(
        &self,
        permissions: &[String],
        audience: DefaultAudience,
        is_read: bool,
    ) -> Result<()> {
        let behavior = self.inner.lock().behavior;
        let allow_system_account =
            self.policy.allow_system_account && behavior.allows_system_account();
        validate_request_for_permissions(permissions, audience, allow_system_account, is_read)?;

        let (generation, cancel) = {
            let mut inner = self.inner.lock();
            if !inner.state.is_open() || inner.attempt.is_some() {
                return Err(SessionError::InvalidState {
                    operation: "request new permissions",
                    state: inner.state,
                });
            }
            let already_granted = inner.grant.as_ref().is_some_and(|g| {
                are_required_permissions_a_subset_of(permissions, &g.permissions)
            });
            if already_granted {
                tracing::debug!(session_id = %self.id, "Requested permissions already granted");
                return Ok(());
            }
            inner.begin(AttemptKind::Reauthorize)
        };

        let request = self.auth_request(permissions.to_vec(), audience, true);
        let (outcome, events) = self.run_chain(request, behavior, cancel).await;

        let from = {
            let mut inner = self.inner.lock();
            inner.auth_events = events;
            if !inner.finish(generation) {
                return Err(AuthFailure::Cancelled.into());
            }
            match &outcome {
                Ok(grant) => {
                    let mut grant = grant.clone();
                    if let Some(previous) = &inner.grant {
                        grant
                            .permissions
                            .extend(previous.permissions.iter().cloned());
                    }
                    inner.grant = Some(grant);
                    Some(inner.set_state(SessionState::OpenTokenExtended))
                }
                Err(_) => None,
            }
        };

        match outcome {
            Ok(_) => {
                tracing::info!(session_id = %self.id, "Session reauthorized");
                if let Some(from) = from {
                    self.notify_state(from, SessionState::OpenTokenExtended);
                }
                self.persist().await;
                Ok(())
            }
            Err(failure) => {
                tracing::warn!(session_id = %self.id, error = %failure, "Reauthorization failed");
                Err(failure.into())
            }
        }
    }

    // ── Repair ──────────────────────────────────────────────────────────────

    /// Re-run login for an open session whose token was rejected.
    ///
    /// Reuses the granted permissions and the last login behavior.
    pub async fn repair(&self) -> Result<()> {
        let (generation, cancel, request, behavior, from) = {
            let mut inner = self.inner.lock();
            if !inner.state.is_open() || inner.is_repairing || inner.attempt.is_some() {
                return Err(SessionError::InvalidState {
                    operation: "repair",
                    state: inner.state,
                });
            }
            let permissions: Vec<String> = inner
                .grant
                .take()
                .map(|g| g.permissions.into_iter().collect())
                .unwrap_or_default();
            inner.is_repairing = true;
            let (generation, cancel) = inner.begin(AttemptKind::Repair);
            let from = inner.set_state(SessionState::CreatedOpening);
            let request = self.auth_request(permissions, inner.audience, false);
            (generation, cancel, request, inner.behavior, from)
        };
        tracing::info!(session_id = %self.id, "Repairing session");
        self.notify_state(from, SessionState::CreatedOpening);

        let (outcome, events) = self.run_chain(request, behavior, cancel).await;
        self.complete_open(generation, AttemptKind::Repair, outcome, events)
            .await
    }

    // ── Cancel / close ──────────────────────────────────────────────────────

    /// Cancel the in-flight login, reauthorization or repair.
    ///
    /// The attempt resolves as [`AuthFailure::Cancelled`] and its late
    /// completion is ignored. Returns whether anything was cancelled.
    pub fn cancel(&self) -> bool {
        let (kind, from, to) = {
            let mut inner = self.inner.lock();
            let Some(flight) = inner.attempt.take() else {
                return false;
            };
            flight.cancel.cancel();
            inner.is_repairing = false;
            let from = inner.state;
            if from == SessionState::CreatedOpening {
                inner.grant = None;
                inner.set_state(SessionState::ClosedLoginFailed);
            }
            (flight.kind, from, inner.state)
        };

        tracing::info!(session_id = %self.id, ?kind, "Login attempt cancelled");
        if from != to {
            self.notify_state(from, to);
        }
        if kind != AttemptKind::Reauthorize {
            self.with_delegate(|d| d.did_not_login(self, true));
        }
        true
    }

    /// Close the session and clear its cached token.
    ///
    /// Closing an already closed session does nothing.
    pub async fn close(&self) {
        self.close_inner().await;
    }

    /// Close, clear the cache, and report the session as invalidated.
    pub async fn close_and_clear_token_information(&self, reason: &str) {
        if self.close_inner().await {
            self.with_delegate(|d| d.session_invalidated(self, reason));
        } else {
            self.persist().await;
        }
    }

    async fn close_inner(&self) -> bool {
        let from = {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return false;
            }
            if let Some(flight) = inner.attempt.take() {
                flight.cancel.cancel();
            }
            inner.is_repairing = false;
            inner.grant = None;
            inner.loaded_grant = None;
            inner.set_state(SessionState::Closed)
        };

        tracing::info!(session_id = %self.id, "Session closed");
        self.notify_state(from, SessionState::Closed);
        self.persist().await;
        self.with_delegate(|d| d.did_logout(self));
        true
    }

    // ── Token extension / permissions refresh ───────────────────────────────

    pub fn should_extend_access_token(&self) -> bool {
        self.should_extend_access_token_at(Utc::now())
    }

    /// Whether more than the configured fraction of the token lifetime has
    /// elapsed and no extension was attempted within the cooldown.
    pub fn should_extend_access_token_at(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.lock();
        if !inner.state.is_open() {
            return false;
        }
        let Some(grant) = inner.grant.as_ref() else {
            return false;
        };
        let Some(lifetime) = grant.lifetime().filter(|l| l.num_milliseconds() > 0) else {
            return false;
        };
        if grant.is_expired_at(now) {
            return false;
        }

        let elapsed = (now - grant.refresh_date).num_milliseconds() as f64;
        if elapsed <= lifetime.num_milliseconds() as f64 * self.policy.extension_threshold {
            return false;
        }

        inner.last_extension_attempt.is_none_or(|last| {
            (now - last)
                .to_std()
                .is_ok_and(|since| since >= self.policy.extension_cooldown())
        })
    }

    /// Remember that an extension request went out.
    pub fn record_extension_attempt(&self) {
        self.record_extension_attempt_at(Utc::now());
    }

    pub fn record_extension_attempt_at(&self, at: DateTime<Utc>) {
        self.inner.lock().last_extension_attempt = Some(at);
    }

    /// Install an extended token. Moves the session to `OpenTokenExtended`.
    pub async fn refresh_access_token(
        &self,
        access_token: &str,
        expiration_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let from = {
            let mut inner = self.inner.lock();
            let state = inner.state;
            let Some(grant) = inner.grant.as_mut().filter(|_| state.is_open()) else {
                return Err(SessionError::InvalidState {
                    operation: "refresh access token",
                    state,
                });
            };
            grant.access_token = access_token.to_string();
            grant.expiration_date = expiration_date;
            grant.refresh_date = Utc::now();
            inner.set_state(SessionState::OpenTokenExtended)
        };

        tracing::info!(session_id = %self.id, ?expiration_date, "Access token extended");
        if from != SessionState::OpenTokenExtended {
            self.notify_state(from, SessionState::OpenTokenExtended);
        }
        self.persist().await;
        self.with_delegate(|d| d.did_extend_token(self, access_token, expiration_date));
        Ok(())
    }

    pub fn should_refresh_permissions(&self) -> bool {
        self.should_refresh_permissions_at(Utc::now())
    }

    pub fn should_refresh_permissions_at(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.lock();
        if !inner.state.is_open() {
            return false;
        }
        match inner.grant.as_ref().and_then(|g| g.permissions_refresh_date) {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .is_ok_and(|since| since >= self.policy.permissions_refresh_interval()),
        }
    }

    /// Replace the granted permissions with the server's current list.
    pub async fn refresh_permissions(&self, permissions: Vec<String>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let state = inner.state;
            let Some(grant) = inner.grant.as_mut().filter(|_| state.is_open()) else {
                return Err(SessionError::InvalidState {
                    operation: "refresh permissions",
                    state,
                });
            };
            grant.permissions = permissions.into_iter().collect();
            grant.permissions_refresh_date = Some(Utc::now());
        }
        tracing::debug!(session_id = %self.id, "Permissions refreshed");
        self.persist().await;
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn auth_request(
        &self,
        permissions: Vec<String>,
        audience: DefaultAudience,
        is_reauthorize: bool,
    ) -> AuthRequest {
        AuthRequest {
            app_id: self.app_id.clone(),
            url_scheme_suffix: self.url_scheme_suffix.clone(),
            permissions,
            audience,
            is_reauthorize,
            is_active_session: registry::global().is_active(&self.id),
        }
    }

    fn eligible(&self, behavior: LoginBehavior) -> Vec<Arc<dyn AuthStrategy>> {
        self.strategies
            .iter()
            .filter(|s| match s.kind() {
                StrategyKind::SystemAccountStore => {
                    self.policy.allow_system_account && behavior.allows_system_account()
                }
                StrategyKind::NativeAppHandoff => behavior.allows_native_app(),
                StrategyKind::WebDialog => behavior.allows_web_dialog(),
                StrategyKind::BrowserFallback => behavior.allows_browser(),
            })
            .cloned()
            .collect()
    }

    /// Run eligible strategies in order until one succeeds or fails hard.
    async fn run_chain(
        &self,
        request: AuthRequest,
        behavior: LoginBehavior,
        cancel: CancellationToken,
    ) -> (std::result::Result<TokenGrant, AuthFailure>, Vec<AuthLogEvent>) {
        let strategies = self.eligible(behavior);
        let mut logger = AuthLogger::new(self.id.clone());
        logger.log_start_auth();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthFailure::Cancelled),
            result = try_strategies(&strategies, &request, &mut logger) => result,
        };

        match &outcome {
            Ok(_) => logger.log_end_auth(RESULT_SUCCESS, None),
            Err(failure) if failure.is_cancelled() => {
                logger.log_end_auth(RESULT_CANCELLED, Some(failure))
            }
            Err(failure) => logger.log_end_auth(RESULT_ERROR, Some(failure)),
        }
        (outcome, logger.events().to_vec())
    }

    async fn complete_open(
        &self,
        generation: u64,
        kind: AttemptKind,
        outcome: std::result::Result<TokenGrant, AuthFailure>,
        events: Vec<AuthLogEvent>,
    ) -> Result<()> {
        let (from, to) = {
            let mut inner = self.inner.lock();
            if !inner.finish(generation) {
                tracing::debug!(session_id = %self.id, "Ignoring stale login completion");
                return Err(AuthFailure::Cancelled.into());
            }
            inner.auth_events = events;
            inner.is_repairing = false;
            match &outcome {
                Ok(grant) => inner.grant = Some(grant.clone()),
                Err(_) => inner.grant = None,
            }
            let to = if outcome.is_ok() {
                SessionState::Open
            } else {
                SessionState::ClosedLoginFailed
            };
            (inner.set_state(to), to)
        };
        self.notify_state(from, to);
        self.persist().await;

        match outcome {
            Ok(grant) => {
                tracing::info!(
                    session_id = %self.id,
                    login_type = ?grant.login_type,
                    repaired = kind == AttemptKind::Repair,
                    "Session opened"
                );
                if kind == AttemptKind::Open {
                    self.with_delegate(|d| d.did_login(self));
                }
                Ok(())
            }
            Err(failure) => {
                tracing::warn!(session_id = %self.id, error = %failure, "Login failed");
                if failure.is_cancelled() {
                    self.with_delegate(|d| d.did_not_login(self, true));
                } else {
                    self.with_delegate(|d| d.did_login_error(self, &failure));
                }
                Err(failure.into())
            }
        }
    }

    /// Write the current grant to the cache, or clear it when not open.
    async fn persist(&self) {
        let Some(cache) = &self.token_cache else {
            return;
        };
        let _guard = self.cache_guard.lock().await;
        let grant = {
            let inner = self.inner.lock();
            inner.grant.clone().filter(|_| inner.state.is_open())
        };
        let result = match &grant {
            Some(grant) => cache.set(&self.token_key, grant).await,
            None => cache.clear(&self.token_key).await,
        };
        if let Err(e) = result {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to update token cache");
        }
    }

    fn notify_state(&self, from: SessionState, to: SessionState) {
        tracing::debug!(session_id = %self.id, %from, %to, "Session state changed");
        self.with_delegate(|d| d.state_changed(self, from, to));
    }

    fn with_delegate(&self, f: impl FnOnce(&dyn SessionDelegate)) {
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            f(delegate.as_ref());
        }
    }
}

async fn try_strategies(
    strategies: &[Arc<dyn AuthStrategy>],
    request: &AuthRequest,
    logger: &mut AuthLogger,
) -> std::result::Result<TokenGrant, AuthFailure> {
    let mut last_failure = None;
    for strategy in strategies {
        logger.log_start_auth_method(strategy.method_name());
        match strategy.attempt(request).await {
            Ok(grant) => {
                logger.log_end_auth_method(RESULT_SUCCESS, None);
                return Ok(grant);
            }
            Err(failure) => {
                logger.log_end_auth_method(result_for(Some(&failure)), Some(&failure));
                if !failure.falls_through() {
                    return Err(failure);
                }
                last_failure = Some(failure);
            }
        }
    }
    Err(last_failure
        .unwrap_or_else(|| AuthFailure::Unavailable("no login method available".to_string())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`Session`].
#[derive(Clone)]
pub struct SessionBuilder {
    app_id: String,
    url_scheme_suffix: String,
    url_scheme_registered: bool,
    permissions: Vec<String>,
    default_audience: DefaultAudience,
    policy: SessionPolicyConfig,
    endpoints: EndpointsConfig,
    token_cache: Option<SharedTokenCache>,
    token_key: String,
    strategies: Vec<Arc<dyn AuthStrategy>>,
    app_calls: Option<Arc<AppCallRegistry>>,
    delegate: Option<Arc<dyn SessionDelegate>>,
}

impl SessionBuilder {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            url_scheme_suffix: String::new(),
            url_scheme_registered: false,
            permissions: Vec::new(),
            default_audience: DefaultAudience::None,
            policy: SessionPolicyConfig::default(),
            endpoints: EndpointsConfig::default(),
            token_cache: None,
            token_key: DEFAULT_TOKEN_KEY.to_string(),
            strategies: Vec::new(),
            app_calls: None,
            delegate: None,
        }
    }

    /// Start from the app identity and policies in `config`.
    pub fn from_config(config: &SdkConfig) -> Result<Self> {
        let app_id = config
            .app_id()
            .map_err(|e| SessionError::Config(e.to_string()))?;
        let registered = config
            .app
            .as_ref()
            .is_some_and(|app| app.url_scheme_registered);
        Ok(Self::new(app_id)
            .url_scheme_suffix(config.url_scheme_suffix())
            .url_scheme_registered(registered)
            .policy(config.session_policy())
            .endpoints(config.endpoints())
            .token_key(config.token_cache().key))
    }

    pub fn url_scheme_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.url_scheme_suffix = suffix.into();
        self
    }

    pub fn url_scheme_registered(mut self, registered: bool) -> Self {
        self.url_scheme_registered = registered;
        self
    }

    /// Permissions requested by `open()` and required of a cached token.
    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_audience(mut self, audience: DefaultAudience) -> Self {
        self.default_audience = audience;
        self
    }

    pub fn policy(mut self, policy: SessionPolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn endpoints(mut self, endpoints: EndpointsConfig) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn token_cache(mut self, cache: SharedTokenCache) -> Self {
        self.token_cache = Some(cache);
        self
    }

    pub fn token_key(mut self, key: impl Into<String>) -> Self {
        self.token_key = key.into();
        self
    }

    pub fn app_call_registry(mut self, registry: Arc<AppCallRegistry>) -> Self {
        self.app_calls = Some(registry);
        self
    }

    pub fn delegate(mut self, delegate: Arc<dyn SessionDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Add a strategy. Strategies run in channel order regardless of the
    /// order they are added in.
    pub fn strategy(mut self, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Add the built-in strategies for whichever host collaborators exist.
    pub fn standard_strategies(
        mut self,
        account_store: Option<Arc<dyn AccountStore>>,
        switcher: Option<Arc<dyn AppSwitcher>>,
        presenter: Option<Arc<dyn LoginDialogPresenter>>,
    ) -> Self {
        let registry = self
            .app_calls
            .get_or_insert_with(|| {
                Arc::new(AppCallRegistry::new(
                    self.app_id.clone(),
                    self.url_scheme_suffix.clone(),
                ))
            })
            .clone();
        let timeout = self.policy.handoff_timeout();

        self.strategies
            .push(Arc::new(SystemAccountStoreStrategy::new(account_store)));
        if let Some(switcher) = &switcher {
            self.strategies.push(Arc::new(NativeAppHandoffStrategy::new(
                switcher.clone(),
                registry.clone(),
                self.endpoints.clone(),
                self.url_scheme_registered,
                timeout,
            )));
        }
        if let Some(presenter) = presenter {
            self.strategies.push(Arc::new(WebDialogStrategy::new(
                presenter,
                self.endpoints.clone(),
            )));
        }
        if let Some(switcher) = switcher {
            self.strategies.push(Arc::new(BrowserFallbackStrategy::new(
                switcher,
                registry,
                self.endpoints.clone(),
                self.url_scheme_registered,
                timeout,
            )));
        }
        self
    }

    /// Build the session, loading a usable cached token if there is one.
    pub async fn build(mut self) -> Result<Session> {
        if self.app_id.trim().is_empty() {
            return Err(SessionError::Config("app id is empty".to_string()));
        }
        self.strategies.sort_by_key(|s| s.kind());

        let app_calls = self.app_calls.unwrap_or_else(|| {
            Arc::new(AppCallRegistry::new(
                self.app_id.clone(),
                self.url_scheme_suffix.clone(),
            ))
        });

        let loaded_grant = match &self.token_cache {
            Some(cache) => load_cached_grant(cache, &self.token_key, &self.permissions).await,
            None => None,
        };
        let state = if loaded_grant.is_some() {
            SessionState::CreatedTokenLoaded
        } else {
            SessionState::Created
        };

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            app_id: self.app_id,
            url_scheme_suffix: self.url_scheme_suffix,
            initial_permissions: self.permissions,
            default_audience: self.default_audience,
            policy: self.policy,
            token_cache: self.token_cache,
            token_key: self.token_key,
            strategies: self.strategies,
            app_calls,
            delegate: RwLock::new(self.delegate),
            cache_guard: tokio::sync::Mutex::new(()),
            inner: Mutex::new(SessionInner {
                state,
                grant: None,
                loaded_grant,
                behavior: LoginBehavior::default(),
                audience: DefaultAudience::None,
                is_repairing: false,
                generation: 0,
                attempt: None,
                last_extension_attempt: None,
                auth_events: Vec::new(),
            }),
        };
        tracing::debug!(session_id = %session.id, app_id = %session.app_id, %state, "Session created");
        Ok(session)
    }
}

/// A cached grant usable for `required` permissions; expired grants are cleared.
async fn load_cached_grant(
    cache: &SharedTokenCache,
    key: &str,
    required: &[String],
) -> Option<TokenGrant> {
    let grant = match cache.get(key).await {
        Ok(grant) => grant?,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read token cache");
            return None;
        }
    };

    if grant.is_expired() {
        tracing::debug!(key, "Cached token expired, clearing");
        if let Err(e) = cache.clear(key).await {
            tracing::warn!(error = %e, "Failed to clear expired token");
        }
        return None;
    }
    if !are_required_permissions_a_subset_of(required, &grant.permissions) {
        tracing::debug!(key, "Cached token lacks requested permissions");
        return None;
    }
    Some(grant)
}
