use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use chrono::{TimeZone, Utc};
use gateway::config::Config;
use gateway::router::create_router;
use gateway::state::AppState;
use serde_json::{Value, json};
use telemetry::identity::StaticIdentity;
use telemetry::ledger::MemoryLedger;
use tower::ServiceExt;
use types::access::AccessLevel;
use types::document::{FieldValue, Fields, LedgerDocument};
use types::errors::LedgerError;
use types::ids::{CollectionId, DocumentId};

fn config() -> Config {
    Config::from_lookup(|key: &str| match key {
        "LEDGER_URL" => Some("http://ledger.invalid".to_string()),
        "LEDGER_API_KEY" => Some("key".to_string()),
        "IDENTITY_URL" => Some("http://identity.invalid".to_string()),
        _ => None,
    })
    .unwrap()
}

fn reading(id: &str, device: &str, data: &str, minute: u32) -> LedgerDocument {
    let mut fields = Fields::new();
    fields.insert("coreid".to_string(), FieldValue::from(device));
    fields.insert("data".to_string(), FieldValue::from(data));
    fields.insert("device_type".to_string(), FieldValue::from("temperature_sensor"));
    LedgerDocument {
        id: DocumentId::new(id),
        collection_id: None,
        fields,
        creation_time: None,
        update_time: Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()),
    }
}

struct TestApp {
    router: Router,
    ledger: Arc<MemoryLedger>,
}

fn app() -> TestApp {
    let ledger = Arc::new(MemoryLedger::new());
    let temperature = CollectionId::new("temperature");
    ledger.insert(&temperature, reading("a", "d1", "72.5", 0));
    ledger.insert(&temperature, reading("b", "d1", "75.0", 5));
    ledger.insert(&temperature, reading("c", "lobby", "21.0", 1));
    ledger.insert(&temperature, reading("d", "lobby", "22.0", 2));
    ledger.insert(&temperature, reading("e", "lobby", "23.0", 3));

    let identity = Arc::new(
        StaticIdentity::new()
            .with_grant("viewer-token", "u1", AccessLevel::VIEWER)
            .with_grant("manager-token", "u2", AccessLevel::MANAGER),
    );
    let state = AppState::new(ledger.clone(), identity, &config());

    TestApp {
        router: create_router(state),
        ledger,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = send(&app.router, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_api_requires_token() {
    let app = app();

    let (status, body) = send(&app.router, get("/api/devices", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "MISSING_TOKEN");

    let (status, body) = send(&app.router, get("/api/devices", Some("forged"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "INVALID_TOKEN");
}

#[tokio::test]
async fn test_ws_upgrade_requires_token() {
    let app = app();
    let (status, body) = send(&app.router, get("/ws", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "MISSING_TOKEN");
}

#[tokio::test]
async fn test_device_list_filtered_by_access_level() {
    let app = app();

    let (status, body) = send(&app.router, get("/api/devices", Some("viewer-token"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["devices"][0]["deviceId"], "lobby");
    assert_eq!(body["devices"][0]["temperature"], 23.0);

    let (_, body) = send(&app.router, get("/api/devices", Some("manager-token"))).await;
    assert_eq!(body["count"], 2);
}

#[tokio::test]
async fn test_device_detail_latest_reading() {
    let app = app();

    let (status, body) = send(&app.router, get("/api/devices/d1", Some("manager-token"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["temperature"], 75.0);
    assert_eq!(body["activeAlert"], Value::Null);

    let (status, body) = send(&app.router, get("/api/devices/d1", Some("viewer-token"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "INSUFFICIENT_ACCESS_LEVEL");

    let (status, _) = send(&app.router, get("/api/devices/ghost", Some("viewer-token"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_history_newest_first_with_limit() {
    let app = app();

    let (status, body) = send(
        &app.router,
        get("/api/devices/lobby/history?limit=2", Some("viewer-token")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let temps: Vec<f64> = body["readings"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["temperature"].as_f64().unwrap())
        .collect();
    assert_eq!(temps, vec![23.0, 22.0]);

    let (status, _) = send(
        &app.router,
        get("/api/devices/lobby/history?limit=0", Some("viewer-token")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_reading_appends_to_ledger() {
    let app = app();

    let (status, body) = send(
        &app.router,
        post(
            "/api/temperature/reading",
            "viewer-token",
            json!({ "deviceId": "lobby", "temperature": 24.5, "location": "Ground floor" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["id"].is_string());

    let docs = app.ledger.documents(&CollectionId::new("temperature"));
    let appended = docs.last().unwrap();
    assert_eq!(appended.text_field("coreid"), Some("lobby"));
    assert_eq!(appended.text_field("data"), Some("24.5"));
    assert_eq!(appended.text_field("location"), Some("Ground floor"));

    let (_, body) = send(&app.router, get("/api/devices/lobby", Some("viewer-token"))).await;
    assert_eq!(body["temperature"], 24.5);
}

#[tokio::test]
async fn test_submit_alert_becomes_active() {
    let app = app();

    let (status, _) = send(
        &app.router,
        post(
            "/api/temperature/alert",
            "viewer-token",
            json!({ "deviceId": "lobby", "currentValue": 55.0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app.router, get("/api/temperature/current", Some("viewer-token"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 40.0);
    assert_eq!(body["readings"].as_array().unwrap().len(), 1);
    let alerts = body["activeAlerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["deviceId"], "lobby");
    assert_eq!(alerts[0]["severity"], "critical");
}

#[tokio::test]
async fn test_submit_reading_for_restricted_device_forbidden() {
    let app = app();
    let (status, _) = send(
        &app.router,
        post(
            "/api/temperature/reading",
            "viewer-token",
            json!({ "deviceId": "d2", "temperature": 20.0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(app.ledger.documents(&CollectionId::new("temperature")).len() == 5);
}

#[tokio::test]
async fn test_ledger_failures_map_to_gateway_statuses() {
    let app = app();

    app.ledger.set_failure(Some(LedgerError::Unavailable {
        status: Some(500),
        body: "boom".to_string(),
    }));
    let (status, body) = send(&app.router, get("/api/devices", Some("viewer-token"))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "RECONCILIATION_UNAVAILABLE");

    app.ledger.set_failure(Some(LedgerError::Timeout));
    let (status, _) = send(&app.router, get("/api/temperature/current", Some("viewer-token"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    app.ledger.set_failure(Some(LedgerError::Rejected {
        status: 400,
        body: "bad fields".to_string(),
    }));
    let (status, body) = send(
        &app.router,
        post(
            "/api/temperature/reading",
            "viewer-token",
            json!({ "deviceId": "lobby", "temperature": 20.0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "LEDGER_REJECTED");
}
