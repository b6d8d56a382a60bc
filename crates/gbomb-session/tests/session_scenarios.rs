//! End-to-end session scenarios using the built-in strategies with fake host
//! collaborators.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use gbomb_session::{
    AppSwitcher, AuthFailure, FileTokenCache, InMemoryTokenCache, LoginBehavior,
    LoginDialogPresenter, LoginType, MockStrategy, Session, SessionDelegate, SessionState,
    StrategyKind, TokenCache, TokenGrant, DEFAULT_TOKEN_KEY,
};
use parking_lot::Mutex;
use url::Url;

#[derive(Debug, Default)]
struct FakeSwitcher {
    installed: bool,
    opened: Mutex<Vec<Url>>,
}

impl AppSwitcher for FakeSwitcher {
    /// Web URLs always open; the native app only when installed.
    fn can_open(&self, url: &Url) -> bool {
        url.scheme() != "gbauth" || self.installed
    }

    fn open(&self, url: &Url) -> bool {
        self.opened.lock().push(url.clone());
        true
    }
}

#[derive(Debug)]
struct FakePresenter {
    redirect: &'static str,
    shown: Mutex<usize>,
}

#[async_trait]
impl LoginDialogPresenter for FakePresenter {
    async fn present(&self, _url: &Url, _prefix: &str) -> Result<Option<Url>, AuthFailure> {
        *self.shown.lock() += 1;
        Ok(Some(Url::parse(self.redirect).unwrap()))
    }
}

#[derive(Default)]
struct Events(Mutex<Vec<&'static str>>);

impl SessionDelegate for Events {
    fn did_login(&self, _session: &Session) {
        self.0.lock().push("login");
    }
    fn did_extend_token(
        &self,
        _session: &Session,
        _token: &str,
        _expiration: Option<chrono::DateTime<Utc>>,
    ) {
        self.0.lock().push("extend");
    }
    fn did_logout(&self, _session: &Session) {
        self.0.lock().push("logout");
    }
}

#[tokio::test]
async fn authorize_never_leaves_session_opening() {
    for result in [
        Ok(TokenGrant::new("t", None, ["email"], LoginType::WebView)),
        Err(AuthFailure::Cancelled),
        Err(AuthFailure::Expired),
    ] {
        let session = Session::builder("42")
            .permissions(["email"])
            .strategy(Arc::new(MockStrategy::always(StrategyKind::WebDialog, result)))
            .build()
            .await
            .unwrap();
        let _ = session.open().await;
        let state = session.state();
        assert!(
            state == SessionState::Open || state == SessionState::ClosedLoginFailed,
            "unexpected state {state}"
        );
        assert_eq!(session.access_token().is_some(), state.is_open());
    }
}

#[tokio::test]
async fn closing_twice_notifies_logout_once() {
    let events = Arc::new(Events::default());
    let session = Session::builder("42")
        .strategy(Arc::new(MockStrategy::granting(StrategyKind::WebDialog, "t")))
        .delegate(events.clone())
        .build()
        .await
        .unwrap();
    session.open().await.unwrap();

    session.close().await;
    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(*events.0.lock(), vec!["login", "logout"]);
}

#[tokio::test]
async fn token_near_expiry_is_extended() {
    // A sixty minute token with two minutes left.
    let issued = Utc::now() - Duration::minutes(58);
    let grant = TokenGrant::new(
        "old",
        Some(Utc::now() + Duration::minutes(2)),
        ["email"],
        LoginType::NativeApp,
    )
    .with_refresh_date(issued);

    let events = Arc::new(Events::default());
    let session = Session::builder("42")
        .strategy(Arc::new(MockStrategy::always(StrategyKind::WebDialog, Ok(grant))))
        .delegate(events.clone())
        .build()
        .await
        .unwrap();
    session.open().await.unwrap();
    assert!(session.should_extend_access_token());

    let new_expiry = Utc::now() + Duration::hours(1);
    session
        .refresh_access_token("new", Some(new_expiry))
        .await
        .unwrap();

    assert_eq!(session.state(), SessionState::OpenTokenExtended);
    assert_eq!(session.access_token().as_deref(), Some("new"));
    assert_eq!(session.expiration_date(), Some(new_expiry));
    assert!(events.0.lock().contains(&"extend"));
    assert!(!session.should_extend_access_token());
}

#[tokio::test]
async fn unregistered_scheme_falls_through_to_web_dialog() {
    let switcher = Arc::new(FakeSwitcher {
        installed: true,
        ..Default::default()
    });
    let presenter = Arc::new(FakePresenter {
        redirect: "gbconnect://success#access_token=web&expires_in=3600",
        shown: Mutex::new(0),
    });
    let session = Session::builder("42")
        .url_scheme_registered(false)
        .standard_strategies(None, Some(switcher.clone()), Some(presenter.clone()))
        .build()
        .await
        .unwrap();

    let started = Instant::now();
    session.open().await.unwrap();

    assert!(started.elapsed() < StdDuration::from_secs(1));
    assert_eq!(session.access_token().as_deref(), Some("web"));
    assert_eq!(session.login_type(), LoginType::WebView);
    assert!(switcher.opened.lock().is_empty());
    assert_eq!(*presenter.shown.lock(), 1);

    let methods: Vec<_> = session
        .auth_events()
        .iter()
        .filter_map(|e| e.result.map(|r| (e.method.clone().unwrap_or_default(), r)))
        .collect();
    assert_eq!(
        methods,
        vec![
            ("integrated_auth".to_string(), "skipped"),
            ("gb_application_native_auth".to_string(), "skipped"),
            ("gb_application_web_auth".to_string(), "success"),
            ("gb_application_web_auth".to_string(), "success"),
        ]
    );
}

async fn resume_from(switcher: &FakeSwitcher, session: &Session, token: &str) -> Url {
    let launched = loop {
        if let Some(url) = switcher.opened.lock().first().cloned() {
            break url;
        }
        tokio::task::yield_now().await;
    };
    let state = launched
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let resume = Url::parse(&format!(
        "gb42://authorize#access_token={}&expires_in=3600&state={}",
        token,
        urlencoding::encode(&state)
    ))
    .unwrap();
    assert!(session.handle_open_url(&resume));
    launched
}

#[tokio::test]
async fn native_handoff_completes_through_open_url() {
    let switcher = Arc::new(FakeSwitcher {
        installed: true,
        ..Default::default()
    });
    let session = Arc::new(
        Session::builder("42")
            .url_scheme_registered(true)
            .standard_strategies(None, Some(switcher.clone()), None)
            .build()
            .await
            .unwrap(),
    );

    let opening = tokio::spawn({
        let session = session.clone();
        async move { session.open().await }
    });
    let launched = resume_from(&switcher, &session, "native").await;
    assert_eq!(launched.scheme(), "gbauth");

    opening.await.unwrap().unwrap();
    assert_eq!(session.access_token().as_deref(), Some("native"));
    assert_eq!(session.login_type(), LoginType::NativeApp);
}

#[tokio::test]
async fn cancelling_native_handoff_releases_pending_call() {
    let switcher = Arc::new(FakeSwitcher {
        installed: true,
        ..Default::default()
    });
    let session = Arc::new(
        Session::builder("42")
            .url_scheme_registered(true)
            .standard_strategies(None, Some(switcher.clone()), None)
            .build()
            .await
            .unwrap(),
    );

    let opening = tokio::spawn({
        let session = session.clone();
        async move { session.open().await }
    });
    let launched = loop {
        if let Some(url) = switcher.opened.lock().first().cloned() {
            break url;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(session.app_call_registry().pending_count(), 1);

    assert!(session.cancel());
    assert!(opening.await.unwrap().is_err());
    assert_eq!(session.app_call_registry().pending_count(), 0);

    // The app answering after the cancel is no longer ours.
    let state = launched
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let late = Url::parse(&format!(
        "gb42://authorize#access_token=late&state={}",
        urlencoding::encode(&state)
    ))
    .unwrap();
    assert!(!session.handle_open_url(&late));
    assert_eq!(session.state(), SessionState::ClosedLoginFailed);
}

#[tokio::test]
async fn browser_fallback_when_native_app_missing() {
    let switcher = Arc::new(FakeSwitcher::default());
    let session = Arc::new(
        Session::builder("42")
            .url_scheme_registered(true)
            .standard_strategies(None, Some(switcher.clone()), None)
            .build()
            .await
            .unwrap(),
    );

    let opening = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .open_with_behavior(LoginBehavior::WithNoFallbackToWebView)
                .await
        }
    });
    let launched = resume_from(&switcher, &session, "browser").await;
    assert!(
        launched
            .as_str()
            .starts_with("https://m.gbombgames.com/dialog/oauth?")
    );

    opening.await.unwrap().unwrap();
    assert_eq!(session.access_token().as_deref(), Some("browser"));
    assert_eq!(session.login_type(), LoginType::Browser);
}

#[tokio::test]
async fn file_cache_survives_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(FileTokenCache::new(dir.path()));
    let session = Session::builder("42")
        .token_cache(cache.clone())
        .strategy(Arc::new(MockStrategy::granting(StrategyKind::WebDialog, "persisted")))
        .build()
        .await
        .unwrap();
    session.open().await.unwrap();
    let written = cache.get(DEFAULT_TOKEN_KEY).await.unwrap().unwrap();
    assert_eq!(Some(written.clone()), session.grant());

    let reopened = Session::builder("42")
        .token_cache(Arc::new(FileTokenCache::new(dir.path())))
        .build()
        .await
        .unwrap();
    assert_eq!(reopened.state(), SessionState::CreatedTokenLoaded);
    reopened.open().await.unwrap();
    assert_eq!(reopened.grant(), Some(written));
}

#[tokio::test]
async fn repair_failure_clears_cache() {
    let cache = Arc::new(InMemoryTokenCache::new());
    let session = Session::builder("42")
        .token_cache(cache.clone())
        .strategy(Arc::new(MockStrategy::new(
            StrategyKind::WebDialog,
            vec![
                Ok(TokenGrant::new("t", None, ["email"], LoginType::WebView)),
                Err(AuthFailure::PasswordChanged),
            ],
        )))
        .build()
        .await
        .unwrap();
    session.open().await.unwrap();
    assert!(cache.get(DEFAULT_TOKEN_KEY).await.unwrap().is_some());

    assert!(session.repair().await.is_err());
    assert_eq!(session.state(), SessionState::ClosedLoginFailed);
    assert!(cache.get(DEFAULT_TOKEN_KEY).await.unwrap().is_none());
}
