use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use mw_auth::{
    AbortController, ApiRequest, ApiResponse, AuthClient, AuthConfig, AuthError,
    AuthorizedRequestSender, Credential, CredentialStore, HttpTransport, RefreshCoordinator,
    RefreshError, RetryPolicy, Transport, TransportError,
};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tokio::time::Instant;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn old_credential() -> Credential {
    Credential {
        access_token: "old".to_string(),
        refresh_token: "old-refresh".to_string(),
        expires_at: Utc::now() + chrono::Duration::seconds(30),
        persistent: false,
    }
}

async fn signed_in_store() -> CredentialStore {
    let store = CredentialStore::in_memory().await.unwrap();
    store.set(old_credential()).await.unwrap();
    store
}

async fn http_sender(server: &MockServer, store: CredentialStore) -> AuthorizedRequestSender {
    let config = AuthConfig::new(Url::parse(&server.uri()).unwrap());
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config).unwrap());
    let client = AuthClient::new(config.clone(), transport.clone());
    let coordinator = RefreshCoordinator::new(Arc::new(client), store);
    AuthorizedRequestSender::new(transport, coordinator, config.retry)
}

async fn mount_refresh(server: &MockServer, template: ResponseTemplate, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/refresh-token"))
        .respond_with(template)
        .expect(expected)
        .mount(server)
        .await;
}

fn refreshed_tokens() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_json(serde_json::json!({
            "token": "new",
            "refreshToken": "new-refresh",
            "expiresIn": 900
        }))
        // Keep the exchange in flight while every caller piles up behind it
        .set_delay(Duration::from_millis(200))
}

#[tokio::test]
async fn concurrent_401s_share_one_refresh() {
    const CALLERS: u64 = 8;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/interviews"))
        .and(header("Authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/interviews"))
        .and(header("Authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(CALLERS)
        .mount(&server)
        .await;
    mount_refresh(&server, refreshed_tokens(), 1).await;

    let sender = http_sender(&server, signed_in_store().await).await;

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send(ApiRequest::get("interviews")).await })
        })
        .collect();

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, "[]");
    }

    assert_eq!(sender.coordinator().exchanges_started(), 1);
    let stored = sender.store().get().unwrap();
    assert_eq!(stored.access_token, "new");
    assert_eq!(stored.refresh_token, "new-refresh");
}

#[tokio::test]
async fn failed_refresh_expires_every_caller() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/interviews"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    mount_refresh(
        &server,
        ResponseTemplate::new(401)
            .set_body_string(r#"{"message":"refresh token expired"}"#)
            .set_delay(Duration::from_millis(200)),
        1,
    )
    .await;

    let sender = http_sender(&server, signed_in_store().await).await;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send(ApiRequest::get("interviews")).await })
        })
        .collect();

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(
            matches!(
                result,
                Err(AuthError::AuthExpired(RefreshError::Rejected { status: 401, .. }))
            ),
            "unexpected result: {result:?}"
        );
    }
    assert!(sender.store().get().is_none());
}

#[tokio::test]
async fn second_401_does_not_refresh_again() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    mount_refresh(&server, refreshed_tokens(), 1).await;

    let sender = http_sender(&server, signed_in_store().await).await;
    let result = sender.send(ApiRequest::get("me")).await;

    assert!(matches!(result, Err(AuthError::Unauthorized)));
    assert_eq!(sender.coordinator().exchanges_started(), 1);
}

#[tokio::test]
async fn rotated_token_resends_without_refreshing() {
    let server = MockServer::start().await;

    // Rejected only after the store has moved on to a newer token
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("Authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("Authorization", "Bearer rotated"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, refreshed_tokens(), 0).await;

    let sender = http_sender(&server, signed_in_store().await).await;
    let pending = {
        let sender = sender.clone();
        tokio::spawn(async move { sender.send(ApiRequest::get("me")).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    sender
        .store()
        .set(Credential {
            access_token: "rotated".to_string(),
            refresh_token: "rotated-refresh".to_string(),
            ..old_credential()
        })
        .await
        .unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(AuthError::Unauthorized)), "unexpected result: {result:?}");
    assert_eq!(sender.coordinator().exchanges_started(), 0);
    assert_eq!(sender.store().get().unwrap().access_token, "rotated");
}

#[tokio::test]
async fn server_errors_are_not_retried_or_refreshed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/interviews"))
        .respond_with(ResponseTemplate::new(422).set_body_string(r#"{"message":"title required"}"#))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/reports"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, refreshed_tokens(), 0).await;

    let sender = http_sender(&server, signed_in_store().await).await;

    let rejected = sender.send(ApiRequest::post("interviews")).await;
    match rejected {
        Err(AuthError::Http { status, body }) => {
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
            assert!(body.contains("title required"));
        }
        other => panic!("expected Http error, got {other:?}"),
    }

    let unavailable = sender.send(ApiRequest::get("reports")).await;
    assert!(matches!(
        unavailable,
        Err(AuthError::Http { status, .. }) if status == StatusCode::SERVICE_UNAVAILABLE
    ));
    assert_eq!(sender.coordinator().exchanges_started(), 0);
}

#[tokio::test]
async fn anonymous_401_expires_without_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, refreshed_tokens(), 0).await;

    let store = CredentialStore::in_memory().await.unwrap();
    let sender = http_sender(&server, store).await;

    let result = sender.send(ApiRequest::get("me")).await;
    assert!(matches!(
        result,
        Err(AuthError::AuthExpired(RefreshError::MissingRefreshToken))
    ));
}

/// Transport that replays a script of outcomes and records when it was called
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<ApiResponse, TransportError>>>,
    fallback: Result<ApiResponse, TransportError>,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    fn new(
        script: Vec<Result<ApiResponse, TransportError>>,
        fallback: Result<ApiResponse, TransportError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock().unwrap();
        calls.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, _request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.calls.lock().unwrap().push(Instant::now());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn ok() -> Result<ApiResponse, TransportError> {
    Ok(ApiResponse {
        status: StatusCode::OK,
        headers: HeaderMap::new(),
        body: "ok".to_string(),
    })
}

fn offline() -> Result<ApiResponse, TransportError> {
    Err(TransportError::Network("connection refused".to_string()))
}

fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        backoff_multiplier: 2,
        max_delay: Duration::from_secs(30),
    }
}

async fn scripted_sender(transport: Arc<ScriptedTransport>) -> AuthorizedRequestSender {
    let store = signed_in_store().await;
    let config = AuthConfig::new(Url::parse("http://unused.invalid/").unwrap());
    let client = AuthClient::new(config, transport.clone());
    let coordinator = RefreshCoordinator::new(Arc::new(client), store);
    AuthorizedRequestSender::new(transport, coordinator, retry_policy())
}

#[tokio::test(start_paused = true)]
async fn network_failures_back_off_then_succeed() {
    let transport = ScriptedTransport::new(vec![offline(), offline()], ok());
    let sender = scripted_sender(transport.clone()).await;

    let response = sender.send(ApiRequest::get("interviews")).await.unwrap();

    assert_eq!(response.body, "ok");
    assert_eq!(
        transport.gaps(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[tokio::test(start_paused = true)]
async fn network_retries_exhaust_on_fourth_failure() {
    let transport = ScriptedTransport::new(vec![], offline());
    let sender = scripted_sender(transport.clone()).await;

    let result = sender.send(ApiRequest::get("interviews")).await;

    assert!(matches!(
        result,
        Err(AuthError::NetworkExhausted { attempts: 4, .. })
    ));
    assert_eq!(
        transport.gaps(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn retry_budget_is_per_request() {
    let transport = ScriptedTransport::new(
        vec![offline(), offline(), offline(), ok(), offline(), offline(), offline()],
        ok(),
    );
    let sender = scripted_sender(transport.clone()).await;

    sender.send(ApiRequest::get("a")).await.unwrap();
    sender.send(ApiRequest::get("b")).await.unwrap();
    assert_eq!(transport.call_count(), 8);
}

#[tokio::test(start_paused = true)]
async fn abort_short_circuits_pending_retries() {
    let transport = ScriptedTransport::new(vec![], offline());
    let sender = scripted_sender(transport.clone()).await;
    let controller = AbortController::new();

    let handle = {
        let sender = sender.clone();
        let signal = controller.signal();
        tokio::spawn(async move {
            sender
                .send_with_abort(ApiRequest::get("interviews"), signal)
                .await
        })
    };

    // First attempt at t=0, second at t=100ms, then the abort lands mid-backoff
    tokio::time::sleep(Duration::from_millis(150)).await;
    controller.abort();

    assert!(matches!(handle.await.unwrap(), Err(AuthError::Cancelled)));
    assert_eq!(transport.call_count(), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn already_aborted_signal_sends_nothing() {
    let transport = ScriptedTransport::new(vec![], ok());
    let sender = scripted_sender(transport.clone()).await;
    let controller = AbortController::new();
    controller.abort();

    let result = sender
        .send_with_abort(ApiRequest::get("interviews"), controller.signal())
        .await;

    assert!(matches!(result, Err(AuthError::Cancelled)));
    assert_eq!(transport.call_count(), 0);
}
