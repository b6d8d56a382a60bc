//! Core session vocabulary: states, login behaviors, and the token grant.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// SessionState
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`Session`](crate::Session).
///
/// A token is held exactly when the state is `Open` or `OpenTokenExtended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No token; nothing cached.
    Created,
    /// A valid token was found in the cache but the session is not open yet.
    CreatedTokenLoaded,
    /// A login attempt (or repair) is in flight.
    CreatedOpening,
    /// Open with a token from login or the cache.
    Open,
    /// Open with a token that has been extended or reauthorized.
    OpenTokenExtended,
    /// Login failed or was cancelled.
    ClosedLoginFailed,
    /// Closed explicitly.
    Closed,
}

impl SessionState {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open | Self::OpenTokenExtended)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed | Self::ClosedLoginFailed)
    }

    /// States from which a fresh login may start.
    pub fn is_created(self) -> bool {
        matches!(self, Self::Created | Self::CreatedTokenLoaded)
    }

    /// Stable description tag for this state.
    pub fn description(self) -> &'static str {
        match self {
            Self::Created => "GBSessionStateCreated",
            Self::CreatedTokenLoaded => "GBSessionStateCreatedTokenLoaded",
            Self::CreatedOpening => "GBSessionStateCreatedOpening",
            Self::Open => "GBSessionStateOpen",
            Self::OpenTokenExtended => "GBSessionStateOpenTokenExtended",
            Self::ClosedLoginFailed => "GBSessionStateClosedLoginFailed",
            Self::Closed => "GBSessionStateClosed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Login options
// ─────────────────────────────────────────────────────────────────────────────

/// Which login strategies a login attempt may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginBehavior {
    /// System account, then native app, then the embedded web dialog, then the browser.
    #[default]
    WithFallbackToWebView,
    /// System account, native app, then the browser. Never the embedded dialog.
    WithNoFallbackToWebView,
    /// Only the embedded web dialog.
    ForcingWebView,
    /// Same chain as `WithFallbackToWebView`, preferring the system account.
    UseSystemAccountIfPresent,
}

impl LoginBehavior {
    pub fn allows_system_account(self) -> bool {
        !matches!(self, Self::ForcingWebView)
    }

    pub fn allows_native_app(self) -> bool {
        !matches!(self, Self::ForcingWebView)
    }

    pub fn allows_web_dialog(self) -> bool {
        !matches!(self, Self::WithNoFallbackToWebView)
    }

    pub fn allows_browser(self) -> bool {
        !matches!(self, Self::ForcingWebView)
    }
}

/// Audience for content published on the user's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAudience {
    #[default]
    None,
    OnlyMe,
    Friends,
    Everyone,
}

impl DefaultAudience {
    /// Wire value used in login URLs.
    pub fn as_param(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::OnlyMe => Some("only_me"),
            Self::Friends => Some("friends"),
            Self::Everyone => Some("everyone"),
        }
    }
}

/// How a token was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginType {
    #[default]
    None,
    SystemAccount,
    NativeApp,
    WebView,
    Browser,
    /// Imported from a previous cache entry or handed in by the app.
    TestUser,
}

// ─────────────────────────────────────────────────────────────────────────────
// TokenGrant
// ─────────────────────────────────────────────────────────────────────────────

/// Credential, expiry, and granted permissions.
///
/// The access token is opaque; nothing here inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// `None` means the token does not expire.
    pub expiration_date: Option<DateTime<Utc>>,
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub login_type: LoginType,
    /// When the token was issued or last extended.
    pub refresh_date: DateTime<Utc>,
    /// When the permission list was last confirmed with the server.
    #[serde(default)]
    pub permissions_refresh_date: Option<DateTime<Utc>>,
}

impl TokenGrant {
    pub fn new(
        access_token: impl Into<String>,
        expiration_date: Option<DateTime<Utc>>,
        permissions: impl IntoIterator<Item = impl Into<String>>,
        login_type: LoginType,
    ) -> Self {
        let now = Utc::now();
        Self {
            access_token: access_token.into(),
            expiration_date,
            permissions: permissions.into_iter().map(Into::into).collect(),
            login_type,
            refresh_date: now,
            permissions_refresh_date: Some(now),
        }
    }

    pub fn with_refresh_date(mut self, refresh_date: DateTime<Utc>) -> Self {
        self.refresh_date = refresh_date;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_some_and(|exp| exp <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Total lifetime from refresh to expiry; `None` for non-expiring tokens.
    pub fn lifetime(&self) -> Option<Duration> {
        self.expiration_date.map(|exp| exp - self.refresh_date)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Open.is_open());
        assert!(SessionState::OpenTokenExtended.is_open());
        assert!(!SessionState::CreatedOpening.is_open());
        assert!(SessionState::ClosedLoginFailed.is_closed());
        assert!(SessionState::CreatedTokenLoaded.is_created());
        assert!(!SessionState::CreatedOpening.is_created());
    }

    #[test]
    fn test_state_descriptions() {
        assert_eq!(SessionState::Created.to_string(), "GBSessionStateCreated");
        assert_eq!(
            SessionState::OpenTokenExtended.description(),
            "GBSessionStateOpenTokenExtended"
        );
    }

    #[test]
    fn test_login_behavior_chain() {
        assert!(!LoginBehavior::ForcingWebView.allows_native_app());
        assert!(LoginBehavior::ForcingWebView.allows_web_dialog());
        assert!(!LoginBehavior::WithNoFallbackToWebView.allows_web_dialog());
        assert!(LoginBehavior::WithNoFallbackToWebView.allows_browser());
    }

    #[test]
    fn test_grant_expiry_and_lifetime() {
        let refreshed = Utc::now() - Duration::minutes(58);
        let grant = TokenGrant::new(
            "abc",
            Some(Utc::now() + Duration::minutes(2)),
            ["email"],
            LoginType::WebView,
        )
        .with_refresh_date(refreshed);

        assert!(!grant.is_expired());
        assert!(grant.lifetime().unwrap() > Duration::minutes(59));
        assert!(grant.has_permission("email"));

        let never = TokenGrant::new("abc", None, Vec::<String>::new(), LoginType::None);
        assert!(!never.is_expired());
        assert!(never.lifetime().is_none());
    }

    #[test]
    fn test_grant_json_roundtrip_is_exact() {
        let grant = TokenGrant::new(
            "token-xyz",
            Some(Utc::now() + Duration::hours(1)),
            ["email", "user_friends"],
            LoginType::NativeApp,
        );
        let json = serde_json::to_string(&grant).unwrap();
        let back: TokenGrant = serde_json::from_str(&json).unwrap();
        assert_eq!(back, grant);
    }
}
