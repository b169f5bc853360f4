mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{
    app, app_with_config, device_get, device_post, error_code, get_json, pair_device,
    register_user, test_config,
};

async fn setup(pool: sqlx::PgPool) -> (axum::Router, String, String, String) {
    let (app, _state) = app(pool);
    let user_token = register_user(&app, "owner@example.com").await;
    let (device_id, device_token) = pair_device(&app, &user_token, "device-0001").await;
    (app, user_token, device_id, device_token)
}

#[sqlx::test]
async fn ingest_persists_and_touches_last_seen(pool: sqlx::PgPool) {
    let (app, _user_token, device_id, device_token) = setup(pool.clone()).await;

    let (status, body) = device_post(
        &app,
        "/api/v1/telemetry",
        json!({ "event_type": "temp", "payload": { "celsius": 21.5 } }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["telemetry_id"].is_string());
    assert!(body["received_at"].is_string());

    let count: i64 =
        sqlx::query_scalar("SELECT count(*) FROM device_telemetry WHERE device_id = $1::uuid")
            .bind(&device_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);

    let age: f64 = sqlx::query_scalar(
        "SELECT EXTRACT(EPOCH FROM now() - last_seen_at)::float8 FROM devices WHERE id = $1::uuid",
    )
    .bind(&device_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(age < 5.0);
}

#[sqlx::test]
async fn ingest_requires_device_token(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let (status, _) = device_post(
        &app,
        "/api/v1/telemetry",
        json!({ "payload": {} }),
        "not-a-real-token",
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[sqlx::test]
async fn payload_must_be_a_small_object_with_short_keys(pool: sqlx::PgPool) {
    let (app, _user_token, _device_id, device_token) = setup(pool).await;

    let (status, body) = device_post(
        &app,
        "/api/v1/telemetry",
        json!({ "payload": [1, 2, 3] }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "PAYLOAD_NOT_OBJECT");

    let long_key = "k".repeat(65);
    let (status, body) = device_post(
        &app,
        "/api/v1/telemetry",
        json!({ "payload": { "nested": { long_key: 1 } } }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "PAYLOAD_KEY_TOO_LONG");

    let blob = "x".repeat(17 * 1024);
    let (status, body) = device_post(
        &app,
        "/api/v1/telemetry",
        json!({ "payload": { "blob": blob } }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_code(&body), "PAYLOAD_TOO_LARGE");
}

#[sqlx::test]
async fn burst_over_the_window_limit_is_429(pool: sqlx::PgPool) {
    let mut config = test_config();
    config.telemetry.rate_per_minute = 5;
    let (app, _state) = app_with_config(pool, config);
    let user_token = register_user(&app, "owner@example.com").await;
    let (_device_id, device_token) = pair_device(&app, &user_token, "device-0001").await;

    for i in 0..5 {
        let (status, _) = device_post(
            &app,
            "/api/v1/telemetry",
            json!({ "payload": { "n": i } }),
            &device_token,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "event {i} should pass");
    }

    let (status, body) = device_post(
        &app,
        "/api/v1/telemetry",
        json!({ "payload": { "n": 5 } }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error_code(&body), "RATE_LIMITED");
    assert!(body["detail"]["meta"]["retry_after_seconds"].as_u64().unwrap() >= 1);
}

#[sqlx::test]
async fn recent_returns_latest_events_for_the_device(pool: sqlx::PgPool) {
    let (app, _user_token, _device_id, device_token) = setup(pool).await;
    for i in 0..3 {
        device_post(
            &app,
            "/api/v1/telemetry",
            json!({ "event_type": "tick", "payload": { "n": i } }),
            &device_token,
        )
        .await;
    }

    let (status, body) = device_get(&app, "/api/v1/telemetry/recent?limit=2", &device_token).await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 2);
    // Newest first.
    assert_eq!(events[0]["payload"]["n"], 2);
    assert_eq!(events[1]["payload"]["n"], 1);
}

#[sqlx::test]
async fn owner_views_are_scoped_to_ownership(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool).await;
    device_post(
        &app,
        "/api/v1/telemetry",
        json!({ "payload": { "n": 1 } }),
        &device_token,
    )
    .await;

    let (status, body) = get_json(
        &app,
        &format!("/api/v1/devices/{device_id}/telemetry/recent"),
        Some(&user_token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let stranger = register_user(&app, "stranger@example.com").await;
    let (status, _) = get_json(
        &app,
        &format!("/api/v1/devices/{device_id}/telemetry/recent"),
        Some(&stranger),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[sqlx::test]
async fn history_supports_before_cursor(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool.clone()).await;
    for i in 0..3 {
        device_post(
            &app,
            "/api/v1/telemetry",
            json!({ "payload": { "n": i } }),
            &device_token,
        )
        .await;
    }
    // Cursor before the newest row excludes it.
    let newest: chrono::DateTime<chrono::Utc> = sqlx::query_scalar(
        "SELECT max(received_at) FROM device_telemetry WHERE device_id = $1::uuid",
    )
    .bind(&device_id)
    .fetch_one(&pool)
    .await
    .unwrap();

    let cursor = newest.to_rfc3339().replace('+', "%2B");
    let (status, body) = get_json(
        &app,
        &format!("/api/v1/devices/{device_id}/telemetry?before={cursor}"),
        Some(&user_token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
}
