//! End-to-end dispatch scenarios.
//!
//! Each scenario drives the real HTTP API against stubbed provider
//! endpoints and checks the literal wire reply the home server would see.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::config::{ApnsConfig, FcmConfig, HttpConfig};
use crate::metrics::Metrics;
use crate::push::apns::ApnsPushkin;
use crate::push::fcm::FcmPushkin;
use crate::push::{NotificationDispatcher, Pushkin, PushkinRegistry};
use crate::server::GatewayServer;

fn apns_config(max_connections: usize) -> ApnsConfig {
    ApnsConfig {
        certfile: String::new(),
        keyfile: String::new(),
        key_id: "K".to_string(),
        team_id: "T".to_string(),
        topic: "com.example.a".to_string(),
        platform: "sandbox".to_string(),
        max_connections,
        event_id_only: false,
        rate_limit: None,
    }
}

fn fcm_config() -> FcmConfig {
    FcmConfig {
        service_account_file: String::new(),
        api_key: String::new(),
        project_id: "test-project".to_string(),
        max_connections: 20,
        event_id_only: false,
        fcm_options: None,
        rate_limit: None,
    }
}

/// Boot the gateway on a loopback port over the given pushkins.
async fn start_gateway(registry: PushkinRegistry) -> (String, watch::Sender<bool>) {
    let dispatcher = Arc::new(NotificationDispatcher::new(
        registry,
        Arc::new(Metrics::new().unwrap()),
        Duration::from_secs(30),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let server = GatewayServer::new(
        HttpConfig {
            bind_addresses: vec![addr.ip().to_string()],
            port: addr.port(),
        },
        dispatcher,
        None,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = server.run(shutdown_rx).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    (format!("http://{addr}"), shutdown_tx)
}

async fn notify(base: &str, body: serde_json::Value) -> (u16, serde_json::Value) {
    let response = reqwest::Client::new()
        .post(format!("{base}/_matrix/push/v1/notify"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    let body = response
        .json()
        .await
        .unwrap_or(serde_json::Value::Null);
    (status, body)
}

#[tokio::test]
async fn apns_happy_path() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/3/device/AA"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&provider)
        .await;

    let mut registry = PushkinRegistry::new();
    registry.insert(
        "com.example.a".to_string(),
        Pushkin::Apns(ApnsPushkin::mock(
            "com.example.a",
            apns_config(20),
            provider.uri(),
        )),
    );
    let (base, shutdown) = start_gateway(registry).await;

    let (status, body) = notify(
        &base,
        serde_json::json!({
            "notification": {"devices": [{"app_id": "com.example.a", "pushkey": "AA"}]}
        }),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body, serde_json::json!({"rejected": []}));

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn apns_dead_token() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/3/device/DEAD"))
        .respond_with(
            ResponseTemplate::new(410).set_body_json(serde_json::json!({"reason": "Unregistered"})),
        )
        .expect(1)
        .mount(&provider)
        .await;

    let mut registry = PushkinRegistry::new();
    registry.insert(
        "com.example.a".to_string(),
        Pushkin::Apns(ApnsPushkin::mock(
            "com.example.a",
            apns_config(20),
            provider.uri(),
        )),
    );
    let (base, shutdown) = start_gateway(registry).await;

    let (status, body) = notify(
        &base,
        serde_json::json!({
            "notification": {"devices": [{"app_id": "com.example.a", "pushkey": "DEAD"}]}
        }),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body, serde_json::json!({"rejected": ["DEAD"]}));

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn fcm_canonical_id_swap() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "name": "projects/test-project/messages/1",
            "registration_id": "NEW"
        })))
        .expect(1)
        .mount(&provider)
        .await;

    let mut registry = PushkinRegistry::new();
    registry.insert(
        "com.example.android".to_string(),
        Pushkin::Gcm(FcmPushkin::mock_v1("com.example.android", fcm_config(), provider.uri()).await),
    );
    let (base, shutdown) = start_gateway(registry).await;

    let (status, body) = notify(
        &base,
        serde_json::json!({
            "notification": {"devices": [{"app_id": "com.example.android", "pushkey": "OLD"}]}
        }),
    )
    .await;

    // The caller must forget OLD and re-register under the canonical id.
    assert_eq!(status, 200);
    assert_eq!(body, serde_json::json!({"rejected": ["OLD"]}));

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn mixed_providers_one_transient_fails_the_batch() {
    let apns_provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&apns_provider)
        .await;

    let fcm_provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&fcm_provider)
        .await;

    let mut registry = PushkinRegistry::new();
    registry.insert(
        "com.example.ios".to_string(),
        Pushkin::Apns(ApnsPushkin::mock(
            "com.example.ios",
            apns_config(20),
            apns_provider.uri(),
        )),
    );
    registry.insert(
        "com.example.android".to_string(),
        Pushkin::Gcm(
            FcmPushkin::mock_v1("com.example.android", fcm_config(), fcm_provider.uri()).await,
        ),
    );
    let (base, shutdown) = start_gateway(registry).await;

    let (status, body) = notify(
        &base,
        serde_json::json!({
            "notification": {"devices": [
                {"app_id": "com.example.ios", "pushkey": "IOS"},
                {"app_id": "com.example.android", "pushkey": "AND"}
            ]}
        }),
    )
    .await;

    // No partial success is reportable: the caller retries the whole batch.
    assert_eq!(status, 502);
    assert_eq!(body["errcode"], "M_UNKNOWN");
    assert!(body.get("rejected").is_none());

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn unknown_app_id_is_ignored_without_outbound_request() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&provider)
        .await;

    let mut registry = PushkinRegistry::new();
    registry.insert(
        "com.example.a".to_string(),
        Pushkin::Apns(ApnsPushkin::mock(
            "com.example.a",
            apns_config(20),
            provider.uri(),
        )),
    );
    let (base, shutdown) = start_gateway(registry).await;

    let (status, body) = notify(
        &base,
        serde_json::json!({
            "notification": {"devices": [{"app_id": "com.unconfigured", "pushkey": "XX"}]}
        }),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body, serde_json::json!({"rejected": []}));

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn rejected_pushkeys_keep_device_order() {
    let provider = MockServer::start().await;
    for (key, status) in [("DEAD1", 410), ("OK", 200), ("DEAD2", 410)] {
        Mock::given(method("POST"))
            .and(path(format!("/3/device/{key}")))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&provider)
            .await;
    }

    let mut registry = PushkinRegistry::new();
    registry.insert(
        "com.example.a".to_string(),
        Pushkin::Apns(ApnsPushkin::mock(
            "com.example.a",
            apns_config(20),
            provider.uri(),
        )),
    );
    let (base, shutdown) = start_gateway(registry).await;

    let (status, body) = notify(
        &base,
        serde_json::json!({
            "notification": {"devices": [
                {"app_id": "com.example.a", "pushkey": "DEAD1"},
                {"app_id": "com.example.a", "pushkey": "OK"},
                {"app_id": "com.example.a", "pushkey": "DEAD2"}
            ]}
        }),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body, serde_json::json!({"rejected": ["DEAD1", "DEAD2"]}));

    let _ = shutdown.send(true);
}

/// Records when each request arrives and answers 200 after a fixed delay, so
/// the test can reconstruct how many requests the stub was holding at once.
struct RecordingResponder {
    arrivals: Arc<Mutex<Vec<Instant>>>,
    delay: Duration,
}

impl Respond for RecordingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.arrivals.lock().unwrap().push(Instant::now());
        ResponseTemplate::new(200).set_delay(self.delay)
    }
}

#[tokio::test]
async fn concurrency_never_exceeds_max_connections() {
    const DEVICES: usize = 30;
    const MAX_CONNECTIONS: usize = 5;
    const DELAY: Duration = Duration::from_millis(300);

    let arrivals = Arc::new(Mutex::new(Vec::new()));
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(RecordingResponder {
            arrivals: arrivals.clone(),
            delay: DELAY,
        })
        .expect(DEVICES as u64)
        .mount(&provider)
        .await;

    let mut registry = PushkinRegistry::new();
    registry.insert(
        "com.example.a".to_string(),
        Pushkin::Apns(ApnsPushkin::mock(
            "com.example.a",
            apns_config(MAX_CONNECTIONS),
            provider.uri(),
        )),
    );
    let (base, shutdown) = start_gateway(registry).await;

    let devices: Vec<serde_json::Value> = (0..DEVICES)
        .map(|i| serde_json::json!({"app_id": "com.example.a", "pushkey": format!("key{i}")}))
        .collect();

    let (status, body) = notify(
        &base,
        serde_json::json!({"notification": {"devices": devices}}),
    )
    .await;

    // Every device completes.
    assert_eq!(status, 200);
    assert_eq!(body, serde_json::json!({"rejected": []}));

    // Each request occupies the stub for at least DELAY after it arrives, so
    // the peak number of arrival windows overlapping any one arrival is a
    // lower bound on peak concurrency. It must stay within the permit count.
    let arrivals = arrivals.lock().unwrap();
    assert_eq!(arrivals.len(), DEVICES);
    let peak = arrivals
        .iter()
        .map(|&t| {
            arrivals
                .iter()
                .filter(|&&other| other <= t && t < other + DELAY)
                .count()
        })
        .max()
        .unwrap();
    assert!(
        peak <= MAX_CONNECTIONS,
        "peak concurrent requests {peak} exceeded the limit {MAX_CONNECTIONS}"
    );

    let _ = shutdown.send(true);
}
