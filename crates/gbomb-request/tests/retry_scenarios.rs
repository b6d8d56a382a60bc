//! Batch, retry and session repair scenarios against a scripted transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gbomb_request::{
    ErrorBehavior, GraphRequest, HttpResponse, MockTransport, RequestConnection, RequestError,
    ResponseCache, RetryPrompt, ReqwestTransport,
};
use gbomb_session::{
    LoginType, MockStrategy, Session, SessionState, SharedSession, StrategyKind, TokenGrant,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use url::Url;

type Results = Arc<Mutex<BTreeMap<usize, Result<Value, RequestError>>>>;

fn graph_url() -> Url {
    Url::parse("https://graph.example.com/").unwrap()
}

fn grant(token: &str) -> TokenGrant {
    TokenGrant::new(
        token,
        Some(Utc::now() + chrono::Duration::hours(1)),
        ["basic_info"],
        LoginType::WebView,
    )
}

async fn session_with_grants(app_id: &str, grants: Vec<TokenGrant>) -> (Arc<Session>, SharedSession) {
    let session = Session::builder(app_id)
        .strategy(Arc::new(MockStrategy::new(
            StrategyKind::WebDialog,
            grants.into_iter().map(Ok).collect(),
        )))
        .build()
        .await
        .unwrap();
    session.open().await.unwrap();
    let session = Arc::new(session);
    let shared: SharedSession = session.clone();
    (session, shared)
}

fn add(conn: &mut RequestConnection, results: &Results, idx: usize, request: GraphRequest, behavior: ErrorBehavior) {
    let results = results.clone();
    conn.add_request_with(request, behavior, None, move |r| {
        results.lock().insert(idx, r);
    });
}

fn expired_token_item() -> Value {
    json!({
        "code": 400,
        "body": json!({"error": {"code": 190, "message": "Error validating access token", "type": "OAuthException"}}).to_string()
    })
}

fn ok_item(body: Value) -> Value {
    json!({"code": 200, "body": body.to_string()})
}

#[derive(Debug, Default)]
struct DecliningPrompt {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl RetryPrompt for DecliningPrompt {
    async fn confirm(&self, message: &str) -> bool {
        self.messages.lock().push(message.to_string());
        false
    }
}

#[tokio::test]
async fn rejected_token_repairs_session_and_replays_batch() {
    let (session, shared) = session_with_grants("100", vec![grant("old"), grant("new")]).await;
    let mock = Arc::new(MockTransport::new(vec![
        Ok(HttpResponse::json(
            200,
            &json!([expired_token_item(), expired_token_item(), expired_token_item()]),
        )),
        Ok(HttpResponse::json(
            200,
            &json!([
                ok_item(json!({"n": 1})),
                ok_item(json!({"n": 2})),
                ok_item(json!({"n": 3}))
            ]),
        )),
    ]));
    let results: Results = Default::default();

    let mut conn = RequestConnection::new(mock.clone(), graph_url());
    add(&mut conn, &results, 1, GraphRequest::get("me").with_session(shared.clone()), ErrorBehavior::RETRY);
    add(&mut conn, &results, 2, GraphRequest::get("me/friends").with_session(shared.clone()), ErrorBehavior::RECONNECT);
    add(&mut conn, &results, 3, GraphRequest::get("me/photos").with_session(shared.clone()), ErrorBehavior::RETRY);
    let summary = conn.start().await;

    assert_eq!(summary.round_trips, 2);
    assert_eq!(session.access_token().as_deref(), Some("new"));
    assert_eq!(session.state(), SessionState::Open);

    let results = results.lock();
    assert_eq!(results.len(), 3);
    assert_eq!(results[&1], Ok(json!({"n": 1})));
    assert_eq!(results[&2], Ok(json!({"n": 2})));
    assert_eq!(results[&3], Ok(json!({"n": 3})));

    // The replay keeps the order the requests were added in.
    let replay = &mock.requests()[1];
    assert_eq!(replay.form_value("access_token"), Some("new"));
    let batch: Value = serde_json::from_str(replay.form_value("batch").unwrap()).unwrap();
    let paths: Vec<&str> = batch
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["relative_url"].as_str().unwrap().split('?').next().unwrap())
        .collect();
    assert_eq!(paths, ["me", "me/friends", "me/photos"]);
}

#[tokio::test]
async fn only_the_first_rejected_session_is_repaired() {
    let (a, shared_a) = session_with_grants("200", vec![grant("a-old"), grant("a-new")]).await;
    let (b, shared_b) = session_with_grants("201", vec![grant("b-old"), grant("b-new")]).await;
    let mock = Arc::new(MockTransport::new(vec![
        Ok(HttpResponse::json(200, &json!([expired_token_item(), expired_token_item()]))),
        Ok(HttpResponse::json(200, &json!({"id": "a"}))),
    ]));
    let results: Results = Default::default();

    let mut conn = RequestConnection::new(mock.clone(), graph_url());
    add(&mut conn, &results, 1, GraphRequest::for_me().with_session(shared_a), ErrorBehavior::RECONNECT);
    add(&mut conn, &results, 2, GraphRequest::for_me().with_session(shared_b), ErrorBehavior::RECONNECT);
    conn.start().await;

    let results = results.lock();
    assert_eq!(results[&1], Ok(json!({"id": "a"})));
    assert!(results[&2].as_ref().unwrap_err().is_session_related());
    assert_eq!(a.access_token().as_deref(), Some("a-new"));
    assert_eq!(b.access_token().as_deref(), Some("b-old"));

    let first = &mock.requests()[0];
    let batch: Value = serde_json::from_str(first.form_value("batch").unwrap()).unwrap();
    assert_eq!(batch[1]["relative_url"], "me?access_token=b-old");
}

#[tokio::test]
async fn transient_failure_is_retried_up_to_the_limit() {
    let mock = Arc::new(MockTransport::new(vec![
        Err(RequestError::Network("connection reset".into())),
        Err(RequestError::Network("connection reset".into())),
        Ok(HttpResponse::new(200, "{}")),
    ]));
    let results: Results = Default::default();

    let mut conn = RequestConnection::new(mock.clone(), graph_url()).with_max_retry_limit(1);
    add(&mut conn, &results, 1, GraphRequest::for_me(), ErrorBehavior::RETRY);
    conn.start().await;

    assert_eq!(mock.call_count(), 2);
    assert!(matches!(results.lock()[&1], Err(RequestError::Network(_))));
}

#[tokio::test]
async fn declined_alert_delivers_original_error() {
    let mock = Arc::new(MockTransport::new(vec![Ok(HttpResponse::json(
        400,
        &json!({"error": {"code": 4, "message": "Application request limit reached"}}),
    ))]));
    let prompt = Arc::new(DecliningPrompt::default());
    let results: Results = Default::default();

    let mut conn = RequestConnection::new(mock.clone(), graph_url()).with_prompt(prompt.clone());
    add(
        &mut conn,
        &results,
        1,
        GraphRequest::for_me(),
        ErrorBehavior::ALERT_USER | ErrorBehavior::RETRY,
    );
    conn.start().await;

    assert_eq!(mock.call_count(), 1);
    assert_eq!(prompt.messages.lock().len(), 1);
    let results = results.lock();
    let error = results[&1].as_ref().unwrap_err();
    assert_eq!(error.code(), Some(4));
    assert!(error.is_rate_limited());
}

#[tokio::test]
async fn failed_repair_is_reported_to_every_replayed_request() {
    // The strategy has nothing left to grant once the session is open.
    let (session, shared) = session_with_grants("300", vec![grant("old")]).await;
    let mock = Arc::new(MockTransport::new(vec![Ok(HttpResponse::json(
        200,
        &json!([expired_token_item(), expired_token_item()]),
    ))]));
    let results: Results = Default::default();

    let mut conn = RequestConnection::new(mock.clone(), graph_url());
    add(&mut conn, &results, 1, GraphRequest::for_me().with_session(shared.clone()), ErrorBehavior::RECONNECT);
    add(&mut conn, &results, 2, GraphRequest::get("me/likes").with_session(shared), ErrorBehavior::RETRY);
    conn.start().await;

    assert_eq!(mock.call_count(), 1);
    assert_eq!(session.state(), SessionState::ClosedLoginFailed);
    let results = results.lock();
    assert!(matches!(results[&1], Err(RequestError::Repair(_))));
    assert!(matches!(results[&2], Err(RequestError::Repair(_))));
}

#[tokio::test]
async fn cancelled_connection_never_calls_handlers() {
    let mock = Arc::new(
        MockTransport::new(vec![Ok(HttpResponse::new(200, "{}"))])
            .with_delay(Duration::from_millis(500)),
    );
    let results: Results = Default::default();

    let mut conn = RequestConnection::new(mock.clone(), graph_url());
    add(&mut conn, &results, 1, GraphRequest::for_me(), ErrorBehavior::RETRY);
    let token = conn.cancellation_token();
    let running = tokio::spawn(conn.start());

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    let summary = running.await.unwrap();

    assert!(summary.cancelled);
    assert!(results.lock().is_empty());
}

#[tokio::test]
async fn extension_rides_along_with_user_request() {
    let issued = Utc::now() - chrono::Duration::minutes(58);
    let stale = TokenGrant::new(
        "old",
        Some(Utc::now() + chrono::Duration::minutes(2)),
        ["basic_info"],
        LoginType::WebView,
    )
    .with_refresh_date(issued);
    let (session, shared) = session_with_grants("400", vec![stale]).await;
    assert!(session.should_extend_access_token());

    let mock = Arc::new(MockTransport::new(vec![Ok(HttpResponse::json(
        200,
        &json!([
            ok_item(json!({"id": "1"})),
            ok_item(json!({"access_token": "extended", "expires_in": 3600}))
        ]),
    ))]));
    let results: Results = Default::default();

    let mut conn = RequestConnection::new(mock.clone(), graph_url());
    add(&mut conn, &results, 1, GraphRequest::for_me().with_session(shared), ErrorBehavior::NONE);
    conn.start().await;

    assert_eq!(results.lock()[&1], Ok(json!({"id": "1"})));
    assert_eq!(session.access_token().as_deref(), Some("extended"));
    assert_eq!(session.state(), SessionState::OpenTokenExtended);
    assert!(!session.should_extend_access_token());

    let batch: Value =
        serde_json::from_str(mock.requests()[0].form_value("batch").unwrap()).unwrap();
    assert_eq!(batch[1]["relative_url"], "oauth/access_token_extend");
}

#[tokio::test]
async fn cached_response_skips_the_network() {
    let cache = Arc::new(ResponseCache::new(16, Duration::from_secs(60)));

    let first = Arc::new(MockTransport::new(vec![Ok(HttpResponse::json(
        200,
        &json!({"id": "1", "name": "Ada"}),
    ))]));
    let mut conn = RequestConnection::new(first.clone(), graph_url()).with_cache(cache.clone());
    conn.add_request(GraphRequest::for_me(), |_| {});
    let summary = conn.start_with_cache_identity("user-1", true).await;
    assert!(!summary.is_result_from_cache());
    assert_eq!(cache.len(), 1);

    let second = Arc::new(MockTransport::new(vec![]));
    let results: Results = Default::default();
    let mut conn = RequestConnection::new(second.clone(), graph_url()).with_cache(cache);
    add(&mut conn, &results, 1, GraphRequest::for_me(), ErrorBehavior::NONE);
    let summary = conn.start_with_cache_identity("user-1", true).await;

    assert!(summary.is_result_from_cache());
    assert_eq!(second.call_count(), 0);
    assert_eq!(results.lock()[&1], Ok(json!({"id": "1", "name": "Ada"})));
}

#[tokio::test]
async fn batch_over_http() {
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_string_contains("batch="))
        .and(body_string_contains("access_token=tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"code": 200, "body": "{\"id\":\"1\"}"},
            {"code": 404, "body": "{\"error\":{\"code\":803,\"message\":\"Unknown path\"}}"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(5)).unwrap());
    let base = Url::parse(&format!("{}/", server.uri())).unwrap();
    let results: Results = Default::default();

    let mut conn = RequestConnection::new(transport, base);
    add(&mut conn, &results, 1, GraphRequest::for_me().with_param("access_token", "tok"), ErrorBehavior::NONE);
    add(&mut conn, &results, 2, GraphRequest::get("nope").with_param("access_token", "tok"), ErrorBehavior::RETRY);
    let summary = conn.start().await;

    assert_eq!(summary.round_trips, 1);
    let results = results.lock();
    assert_eq!(results[&1], Ok(json!({"id": "1"})));
    assert!(matches!(
        results[&2],
        Err(RequestError::Api { status: 404, code: Some(803), .. })
    ));
}
