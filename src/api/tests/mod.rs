use super::*;
use crate::config::RetryConfig;
use crate::orchestrator::Services;
use crate::testing::{FakeProbe, FakeProvider, FakeStorage, FakeTransfer, fast_relay_config};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use std::time::Duration;
use tempfile::NamedTempFile;
use tower::ServiceExt;


struct TestApp {
    _file: NamedTempFile,
    orchestrator: Arc<Orchestrator>,
    router: Router,
}

fn test_config(file: &NamedTempFile) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = file.path().to_path_buf();
    config.relay = fast_relay_config();
    config.monitor.poll_interval = Duration::from_millis(20);
    config.orchestrator.maintenance_interval = Duration::from_secs(3600);
    config.orchestrator.shutdown_timeout = Duration::from_secs(1);
    config.orchestrator.submit_retry = RetryConfig {
        max_attempts: 1,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

/// Orchestrator on in-memory collaborators plus the router in front of it
async fn create_test_app() -> TestApp {
    create_test_app_with(|_| {}).await
}

async fn create_test_app_with(edit: impl FnOnce(&mut Config)) -> TestApp {
    let file = NamedTempFile::new().unwrap();
    let mut config = test_config(&file);
    edit(&mut config);

    let services = Services {
        provider: FakeProvider::new(),
        probe: FakeProbe::new(),
        storage: FakeStorage::new(),
        transfer: FakeTransfer::new(),
    };
    let orchestrator = Orchestrator::with_services(config.clone(), services)
        .await
        .unwrap();
    orchestrator.start();

    let orchestrator = Arc::new(orchestrator);
    let router = create_router(orchestrator.clone(), Arc::new(config));
    TestApp {
        _file: file,
        orchestrator,
        router,
    }
}

/// Send one request and decode the JSON body (Null when empty)
async fn send(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn candidate(uri: &str) -> Value {
    json!({
        "uri": uri,
        "title": format!("title for {uri}"),
        "size_bytes": 4096,
        "source_chat_id": -100,
        "source_msg_id": 7
    })
}

#[tokio::test]
async fn health_reports_version() {
    let app = create_test_app().await;
    let (status, body) = send(&app, Method::GET, "/api/v1/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn cors_headers_present_when_enabled() {
    let app = create_test_app_with(|config| {
        config.api.cors_enabled = true;
        config.api.cors_origins = vec!["*".to_string()];
    })
    .await;

    let request = Request::builder()
        .uri("/api/v1/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin"),
        "CORS header should be present when CORS is enabled"
    );
}

#[tokio::test]
async fn cors_headers_absent_when_disabled() {
    let app = create_test_app_with(|config| config.api.cors_enabled = false).await;

    let request = Request::builder()
        .uri("/api/v1/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert!(
        !response
            .headers()
            .contains_key("access-control-allow-origin")
    );
}

#[tokio::test]
async fn openapi_json_is_served() {
    let app = create_test_app().await;
    let (status, body) = send(&app, Method::GET, "/api/v1/openapi.json", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "swipe-dl REST API");
    assert!(body["paths"]["/api/v1/tasks/{id}/decision"].is_object());
}

#[tokio::test]
async fn unknown_route_is_404() {
    let app = create_test_app().await;
    let (status, _) = send(&app, Method::GET, "/api/v1/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_server_stops_on_shutdown_signal() {
    let app = create_test_app().await;
    let mut config = (*app.orchestrator.get_config()).clone();
    config.api.bind_address = "127.0.0.1:0".parse().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(start_api_server(
        app.orchestrator.clone(),
        Arc::new(config),
        async move {
            let _ = rx.await;
        },
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server should stop")
        .unwrap();
    assert!(result.is_ok());
}
