//! Login URL, client state, and permission helpers that do not need a
//! session instance.

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{AuthFailure, Result, SessionError};
use crate::types::{DefaultAudience, LoginType, TokenGrant};

/// Query key carrying the JSON client state.
pub const LOGIN_UX_CLIENT_STATE: &str = "state";
/// Marker proving the client state was produced by this SDK.
pub const LOGIN_UX_CLIENT_STATE_IS_CLIENT_STATE: &str = "com.gbomb.sdk_client_state";
pub const LOGIN_UX_CLIENT_STATE_IS_OPEN_SESSION: &str = "is_open_session";
pub const LOGIN_UX_CLIENT_STATE_IS_ACTIVE_SESSION: &str = "is_active_session";
/// Correlates a resumed URL with the pending call that launched it.
pub const LOGIN_UX_CLIENT_STATE_CALL_ID: &str = "call_id";
pub const LOGIN_UX_RESPONSE_TYPE: &str = "response_type";
pub const LOGIN_UX_RESPONSE_TYPE_TOKEN: &str = "token,signed_request";

/// Permission implicitly requested by every read login.
pub const BASIC_INFO_PERMISSION: &str = "basic_info";

const PUBLISH_PERMISSIONS: [&str; 3] = ["ads_management", "create_event", "rsvp_event"];

/// URL scheme the platform uses to call back into the app.
pub fn app_url_scheme(app_id: &str, url_scheme_suffix: &str) -> String {
    format!("gb{}{}", app_id, url_scheme_suffix)
}

/// Base URL (`gb{app_id}{suffix}://`) for redirects back into the app.
pub fn app_base_url(app_id: &str, url_scheme_suffix: &str) -> String {
    format!("{}://", app_url_scheme(app_id, url_scheme_suffix))
}

/// Parse an `a=b&c=d` string, percent-decoding keys and values.
pub fn parse_query(encoded: &str) -> HashMap<String, String> {
    encoded
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(&key.replace('+', " ")).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " "))
                .ok()?
                .into_owned();
            Some((key, value))
        })
        .collect()
}

/// Serialize parameters as a percent-encoded query string.
pub fn serialize_query<'a, I>(params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    params
        .into_iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Extract the login response parameters from a URL addressed to this app.
///
/// Returns `None` when the URL does not use the app's scheme. Fragment
/// parameters take precedence over query parameters.
pub fn query_params_from_login_url(
    url: &Url,
    app_id: &str,
    url_scheme_suffix: &str,
) -> Option<HashMap<String, String>> {
    let scheme = app_url_scheme(app_id, url_scheme_suffix);
    if !url.scheme().eq_ignore_ascii_case(&scheme) {
        return None;
    }

    let mut params = url.query().map(parse_query).unwrap_or_default();
    if let Some(fragment) = url.fragment() {
        params.extend(parse_query(fragment));
    }
    Some(params)
}

/// Client state embedded in the response, if this SDK produced it.
pub fn client_state_from_query_params(params: &HashMap<String, String>) -> Option<Map<String, Value>> {
    let raw = params.get(LOGIN_UX_CLIENT_STATE)?;
    let Value::Object(state) = serde_json::from_str::<Value>(raw).ok()? else {
        return None;
    };
    let is_ours = state
        .get(LOGIN_UX_CLIENT_STATE_IS_CLIENT_STATE)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    is_ours.then_some(state)
}

/// Whether `url` is a login response belonging to an open-session request.
pub fn is_open_session_response_url(url: &Url, app_id: &str, url_scheme_suffix: &str) -> bool {
    query_params_from_login_url(url, app_id, url_scheme_suffix)
        .as_ref()
        .and_then(client_state_from_query_params)
        .and_then(|state| {
            state
                .get(LOGIN_UX_CLIENT_STATE_IS_OPEN_SESSION)
                .and_then(Value::as_bool)
        })
        .unwrap_or(false)
}

/// Build the JSON client state carried through a login round trip.
pub fn client_state_json(call_id: &str, is_open_session: bool, is_active_session: bool) -> String {
    serde_json::json!({
        LOGIN_UX_CLIENT_STATE_IS_CLIENT_STATE: true,
        LOGIN_UX_CLIENT_STATE_IS_OPEN_SESSION: is_open_session,
        LOGIN_UX_CLIENT_STATE_IS_ACTIVE_SESSION: is_active_session,
        LOGIN_UX_CLIENT_STATE_CALL_ID: call_id,
    })
    .to_string()
}

/// Expiration carried by a login response.
///
/// `expires_in` (seconds from `now`) wins over `expires` (unix time). A value
/// of `0`, or neither key, means the token does not expire.
pub fn expiration_date_from_response_params(
    params: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(secs) = params
        .get("expires_in")
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        return (secs > 0).then(|| now + Duration::seconds(secs));
    }
    params
        .get("expires")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|secs| *secs > 0)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

pub fn is_publish_permission(permission: &str) -> bool {
    permission.starts_with("publish")
        || permission.starts_with("manage")
        || PUBLISH_PERMISSIONS.contains(&permission)
}

pub fn are_all_permissions_read_permissions<S: AsRef<str>>(permissions: &[S]) -> bool {
    permissions
        .iter()
        .all(|p| !is_publish_permission(p.as_ref()))
}

/// Append `basic_info` unless already requested.
pub fn add_basic_info_permission<S: AsRef<str>>(permissions: &[S]) -> Vec<String> {
    let mut out: Vec<String> = permissions.iter().map(|p| p.as_ref().to_string()).collect();
    if !out.iter().any(|p| p == BASIC_INFO_PERMISSION) {
        out.push(BASIC_INFO_PERMISSION.to_string());
    }
    out
}

/// Whether every required permission is already granted.
pub fn are_required_permissions_a_subset_of<'a, R, G>(required: R, granted: G) -> bool
where
    R: IntoIterator<Item = &'a String>,
    G: IntoIterator<Item = &'a String> + Clone,
{
    required
        .into_iter()
        .all(|r| granted.clone().into_iter().any(|g| g == r))
}

/// Reject permission requests that cannot succeed.
pub fn validate_request_for_permissions<S: AsRef<str>>(
    permissions: &[S],
    audience: DefaultAudience,
    allow_system_account: bool,
    is_read: bool,
) -> Result<()> {
    if is_read {
        if let Some(p) = permissions.iter().find(|p| is_publish_permission(p.as_ref())) {
            return Err(SessionError::InvalidPermissions(format!(
                "publish permission '{}' requested in a read-permission request",
                p.as_ref()
            )));
        }
        return Ok(());
    }

    if audience == DefaultAudience::None {
        return Err(SessionError::InvalidPermissions(
            "publish permissions require a default audience".to_string(),
        ));
    }
    if allow_system_account && !permissions.iter().all(|p| is_publish_permission(p.as_ref())) {
        return Err(SessionError::InvalidPermissions(
            "publish requests through the system account must not include read permissions"
                .to_string(),
        ));
    }
    Ok(())
}

/// Turn login response parameters into a grant or a failure.
///
/// Granted permissions come from `granted_scopes` when the server reports
/// them, otherwise the requested permissions are assumed.
pub fn parse_login_response(
    params: &HashMap<String, String>,
    requested_permissions: &[String],
    login_type: LoginType,
    now: DateTime<Utc>,
) -> std::result::Result<TokenGrant, AuthFailure> {
    if let Some(token) = params.get("access_token").filter(|t| !t.is_empty()) {
        let permissions: Vec<String> = match params.get("granted_scopes") {
            Some(scopes) => scopes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => requested_permissions.to_vec(),
        };
        let expiration = expiration_date_from_response_params(params, now);
        let mut grant = TokenGrant::new(token.clone(), expiration, permissions, login_type);
        grant.refresh_date = now;
        grant.permissions_refresh_date = Some(now);
        return Ok(grant);
    }

    let reason = params
        .get("error_reason")
        .or_else(|| params.get("error"))
        .map(String::as_str);
    if matches!(reason, Some("user_denied") | Some("access_denied")) {
        return Err(AuthFailure::Cancelled);
    }

    let code = params
        .get("error_code")
        .and_then(|c| c.parse::<i64>().ok());
    let subcode = params
        .get("error_subcode")
        .and_then(|c| c.parse::<i64>().ok());
    match (code, reason) {
        (None, None) => Err(AuthFailure::Cancelled),
        (code, _) => {
            let message = params
                .get("error_message")
                .or_else(|| params.get("error_description"))
                .or_else(|| params.get("error"))
                .cloned()
                .unwrap_or_default();
            Err(AuthFailure::from_server(code.unwrap_or(0), subcode, message))
        }
    }
}
