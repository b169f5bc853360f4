//! Shared helpers for the integration tests: an in-process app built on
//! the per-test database, plus the enrollment flows most tests need.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use hubex_server::config::{JwtConfig, ServerConfig};
use hubex_server::router::build_router;
use hubex_server::state::AppState;

pub const TEST_PASSWORD: &str = "password123";

pub fn test_config() -> ServerConfig {
    ServerConfig {
        dev_tools: true,
        jwt: JwtConfig {
            secret: "integration-test-secret".to_string(),
            issuer: "hubex-test".to_string(),
            exp_minutes: 60,
        },
        ..Default::default()
    }
}

pub fn app(pool: sqlx::PgPool) -> (axum::Router, AppState) {
    app_with_config(pool, test_config())
}

pub fn app_with_config(pool: sqlx::PgPool, config: ServerConfig) -> (axum::Router, AppState) {
    let state = AppState::new(pool, config);
    (build_router(state.clone()), state)
}

pub struct RequestSpec<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub body: Option<Value>,
    pub bearer: Option<&'a str>,
    pub device_token: Option<&'a str>,
}

pub async fn send(app: &axum::Router, spec: RequestSpec<'_>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(spec.method).uri(spec.path);
    if let Some(token) = spec.bearer {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    if let Some(token) = spec.device_token {
        builder = builder.header("X-Device-Token", token);
    }
    let request = match spec.body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

pub async fn post_json(
    app: &axum::Router,
    path: &str,
    body: Value,
    bearer: Option<&str>,
) -> (StatusCode, Value) {
    send(
        app,
        RequestSpec {
            method: "POST",
            path,
            body: Some(body),
            bearer,
            device_token: None,
        },
    )
    .await
}

pub async fn get_json(app: &axum::Router, path: &str, bearer: Option<&str>) -> (StatusCode, Value) {
    send(
        app,
        RequestSpec {
            method: "GET",
            path,
            body: None,
            bearer,
            device_token: None,
        },
    )
    .await
}

pub async fn device_post(
    app: &axum::Router,
    path: &str,
    body: Value,
    device_token: &str,
) -> (StatusCode, Value) {
    send(
        app,
        RequestSpec {
            method: "POST",
            path,
            body: Some(body),
            bearer: None,
            device_token: Some(device_token),
        },
    )
    .await
}

pub async fn device_get(app: &axum::Router, path: &str, device_token: &str) -> (StatusCode, Value) {
    send(
        app,
        RequestSpec {
            method: "GET",
            path,
            body: None,
            bearer: None,
            device_token: Some(device_token),
        },
    )
    .await
}

/// The `detail.code` of an error envelope.
pub fn error_code(body: &Value) -> &str {
    body["detail"]["code"].as_str().unwrap_or("")
}

/// Register a fresh user and return its access token.
pub async fn register_user(app: &axum::Router, email: &str) -> String {
    let (status, body) = post_json(
        app,
        "/api/v1/auth/register",
        json!({ "email": email, "password": TEST_PASSWORD }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register failed: {body}");
    body["access_token"].as_str().unwrap().to_string()
}

/// Device hello: returns the device id.
pub async fn hello_device(app: &axum::Router, device_uid: &str) -> String {
    let (status, body) = post_json(
        app,
        "/api/v1/devices/hello",
        json!({ "device_uid": device_uid }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "hello failed: {body}");
    body["device_id"].as_str().unwrap().to_string()
}

/// Full enrollment: hello → start → confirm. Returns
/// (device_id, device_token plaintext).
pub async fn pair_device(app: &axum::Router, user_token: &str, device_uid: &str) -> (String, String) {
    let device_id = hello_device(app, device_uid).await;

    let (status, body) = post_json(
        app,
        "/api/v1/pairing/start",
        json!({ "device_uid": device_uid }),
        Some(user_token),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "pairing start failed: {body}");
    let code = body["pairing_code"].as_str().unwrap().to_string();

    let (status, body) = post_json(
        app,
        "/api/v1/pairing/confirm",
        json!({ "device_uid": device_uid, "pairing_code": code }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "pairing confirm failed: {body}");
    let token = body["device_token"].as_str().unwrap().to_string();
    assert_eq!(body["device_id"].as_str().unwrap(), device_id);

    (device_id, token)
}

/// Create a variable definition through the API (dev tools are on in the
/// default test config).
pub async fn create_definition(app: &axum::Router, user_token: &str, definition: Value) {
    let (status, body) = post_json(app, "/api/v1/variables/definitions", definition, Some(user_token)).await;
    assert_eq!(status, StatusCode::OK, "definition create failed: {body}");
}
