//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [app]            # app id and URL scheme suffix
//! [endpoints]      # graph / dialog base URLs, native auth scheme
//! [session]        # token extension and hand-off policy
//! [request]        # retry limit, timeout, response cache
//! [token_cache]    # where credentials are persisted
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Environment variable that overrides `[app].app_id`.
pub const APP_ID_ENV: &str = "GBOMB_APP_ID";

/// Default number of retries for a retryable request.
pub const DEFAULT_MAX_RETRY_LIMIT: u32 = 1;

/// Fraction of the token lifetime after which an extension is attempted.
pub const DEFAULT_EXTENSION_THRESHOLD: f64 = 0.5;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    /// App identity.
    pub app: Option<AppConfig>,

    /// Service endpoints.
    pub endpoints: Option<EndpointsConfig>,

    /// Session authorization policy.
    pub session: Option<SessionPolicyConfig>,

    /// Request dispatch policy.
    pub request: Option<RequestConfig>,

    /// Credential persistence.
    pub token_cache: Option<TokenCacheConfig>,
}

impl SdkConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: SdkConfig) {
        if other.app.is_some() {
            self.app = other.app;
        }

        if other.endpoints.is_some() {
            self.endpoints = other.endpoints;
        }

        if other.session.is_some() {
            self.session = other.session;
        }

        if other.request.is_some() {
            self.request = other.request;
        }

        if other.token_cache.is_some() {
            self.token_cache = other.token_cache;
        }
    }

    /// Apply environment overrides (`GBOMB_APP_ID`).
    pub fn apply_env(&mut self) {
        if let Ok(app_id) = std::env::var(APP_ID_ENV)
            && !app_id.is_empty()
        {
            let app = self.app.get_or_insert_with(AppConfig::default);
            app.app_id = Some(app_id);
        }
    }

    /// The configured app id.
    pub fn app_id(&self) -> Result<&str> {
        self.app
            .as_ref()
            .and_then(|a| a.app_id.as_deref())
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::MissingAppId)
    }

    /// The configured URL scheme suffix (empty when unset).
    pub fn url_scheme_suffix(&self) -> &str {
        self.app
            .as_ref()
            .and_then(|a| a.url_scheme_suffix.as_deref())
            .unwrap_or("")
    }

    /// Resolved endpoints section.
    pub fn endpoints(&self) -> EndpointsConfig {
        self.endpoints.clone().unwrap_or_default()
    }

    /// Resolved session policy section.
    pub fn session_policy(&self) -> SessionPolicyConfig {
        self.session.clone().unwrap_or_default()
    }

    /// Resolved request section.
    pub fn request_policy(&self) -> RequestConfig {
        self.request.clone().unwrap_or_default()
    }

    /// Resolved token cache section.
    pub fn token_cache(&self) -> TokenCacheConfig {
        self.token_cache.clone().unwrap_or_default()
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let session = self.session_policy();
        if !(0.0..=1.0).contains(&session.extension_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "session.extension_threshold".to_string(),
                reason: format!("{} is not within 0.0..=1.0", session.extension_threshold),
            });
        }
        let request = self.request_policy();
        if request.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request.timeout_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// `[app]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application id issued by the platform.
    pub app_id: Option<String>,

    /// Suffix appended to the `gb{app_id}` URL scheme, for apps sharing an id.
    pub url_scheme_suffix: Option<String>,

    /// Whether the app's URL scheme is registered with the host OS.
    pub url_scheme_registered: bool,
}

/// `[endpoints]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Root of the graph API; batches are POSTed here.
    pub graph_base_url: String,

    /// Root of the web dialogs (`{dialog_base_url}oauth`).
    pub dialog_base_url: String,

    /// URL scheme of the native platform app.
    pub native_auth_scheme: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            graph_base_url: "https://graph.gbombgames.com/".to_string(),
            dialog_base_url: "https://m.gbombgames.com/dialog/".to_string(),
            native_auth_scheme: "gbauth".to_string(),
        }
    }
}

/// `[session]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicyConfig {
    /// Fraction of the token lifetime that must elapse before extending.
    pub extension_threshold: f64,

    /// Minimum seconds between two extension attempts.
    pub extension_cooldown_secs: u64,

    /// Seconds after which granted permissions are refreshed.
    pub permissions_refresh_secs: u64,

    /// Bound on waiting for the native app to resume us.
    pub handoff_timeout_secs: u64,

    /// Whether the OS account store may be used.
    pub allow_system_account: bool,
}

impl Default for SessionPolicyConfig {
    fn default() -> Self {
        Self {
            extension_threshold: DEFAULT_EXTENSION_THRESHOLD,
            extension_cooldown_secs: 3600,
            permissions_refresh_secs: 24 * 3600,
            handoff_timeout_secs: 120,
            allow_system_account: true,
        }
    }
}

impl SessionPolicyConfig {
    pub fn extension_cooldown(&self) -> Duration {
        Duration::from_secs(self.extension_cooldown_secs)
    }

    pub fn permissions_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.permissions_refresh_secs)
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_secs(self.handoff_timeout_secs)
    }
}

/// `[request]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Maximum retries per request before the error is surfaced.
    pub max_retry_limit: u32,

    /// HTTP timeout per network round trip.
    pub timeout_secs: u64,

    /// Maximum number of cached responses.
    pub cache_max_entries: usize,

    /// Freshness window for cached responses.
    pub cache_ttl_secs: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_retry_limit: DEFAULT_MAX_RETRY_LIMIT,
            timeout_secs: 180,
            cache_max_entries: 256,
            cache_ttl_secs: 3600,
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// `[token_cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCacheConfig {
    /// Directory holding the token file. Defaults to the config directory.
    pub dir: Option<PathBuf>,

    /// Key under which the grant is stored.
    pub key: String,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            key: "GBAccessTokenInformationKey".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SdkConfig::from_toml("").unwrap();
        assert!(config.app.is_none());
        assert_eq!(config.request_policy().max_retry_limit, DEFAULT_MAX_RETRY_LIMIT);
        assert_eq!(config.session_policy().extension_threshold, 0.5);
        assert_eq!(config.endpoints().native_auth_scheme, "gbauth");
        assert_eq!(config.token_cache().key, "GBAccessTokenInformationKey");
    }

    #[test]
    fn test_parse_sections() {
        let config = SdkConfig::from_toml(
            r#"
[app]
app_id = "1234"
url_scheme_suffix = "lite"
url_scheme_registered = true

[request]
max_retry_limit = 3

[session]
extension_threshold = 0.75
"#,
        )
        .unwrap();

        assert_eq!(config.app_id().unwrap(), "1234");
        assert_eq!(config.url_scheme_suffix(), "lite");
        assert_eq!(config.request_policy().max_retry_limit, 3);
        // Unspecified fields in a present section fall back to defaults
        assert_eq!(config.request_policy().timeout_secs, 180);
        assert_eq!(config.session_policy().extension_threshold, 0.75);
        assert_eq!(config.session_policy().extension_cooldown_secs, 3600);
    }

    #[test]
    fn test_missing_app_id() {
        let config = SdkConfig::new();
        assert!(matches!(config.app_id(), Err(ConfigError::MissingAppId)));
    }

    #[test]
    fn test_merge_overrides_sections() {
        let mut base = SdkConfig::from_toml("[app]\napp_id = \"base\"\n[request]\nmax_retry_limit = 2\n")
            .unwrap();
        let overlay = SdkConfig::from_toml("[app]\napp_id = \"overlay\"\n").unwrap();
        base.merge(overlay);

        assert_eq!(base.app_id().unwrap(), "overlay");
        assert_eq!(base.request_policy().max_retry_limit, 2);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let config = SdkConfig::from_toml("[session]\nextension_threshold = 1.5\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(SdkConfig::new().validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip_preserves_app() {
        let config = SdkConfig::from_toml("[app]\napp_id = \"42\"\n").unwrap();
        let text = config.to_toml().unwrap();
        let back = SdkConfig::from_toml(&text).unwrap();
        assert_eq!(back.app_id().unwrap(), "42");
    }
}
