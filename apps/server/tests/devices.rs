mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{app, device_get, error_code, get_json, hello_device, pair_device, post_json, register_user};

#[sqlx::test]
async fn hello_creates_then_refreshes(pool: sqlx::PgPool) {
    let (app, _state) = app(pool.clone());

    let (status, body) = post_json(
        &app,
        "/api/v1/devices/hello",
        json!({ "device_uid": "device-0001", "firmware_version": "1.0.0" }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["claimed"], false);
    let first_id = body["device_id"].as_str().unwrap().to_string();

    let (status, body) = post_json(
        &app,
        "/api/v1/devices/hello",
        json!({ "device_uid": "device-0001", "firmware_version": "1.1.0", "capabilities": { "ota": true } }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"].as_str().unwrap(), first_id);

    let (firmware, count): (Option<String>, i64) = {
        let firmware = sqlx::query_scalar("SELECT firmware_version FROM devices WHERE device_uid = $1")
            .bind("device-0001")
            .fetch_one(&pool)
            .await
            .unwrap();
        let count = sqlx::query_scalar("SELECT count(*) FROM devices")
            .fetch_one(&pool)
            .await
            .unwrap();
        (firmware, count)
    };
    assert_eq!(firmware.as_deref(), Some("1.1.0"));
    assert_eq!(count, 1);
}

#[sqlx::test]
async fn hello_validates_uid_length(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let (status, body) = post_json(
        &app,
        "/api/v1/devices/hello",
        json!({ "device_uid": "abc" }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "VALIDATION_ERROR");
}

#[sqlx::test]
async fn hello_reports_claimed_after_pairing(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let token = register_user(&app, "owner@example.com").await;
    pair_device(&app, &token, "device-0001").await;

    let (_, body) = post_json(
        &app,
        "/api/v1/devices/hello",
        json!({ "device_uid": "device-0001" }),
        None,
    )
    .await;
    assert_eq!(body["claimed"], true);
}

#[sqlx::test]
async fn list_requires_user_auth(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let (status, _) = get_json(&app, "/api/v1/devices", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[sqlx::test]
async fn list_shows_owned_devices_with_health_and_state(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let token = register_user(&app, "owner@example.com").await;
    let (device_id, _) = pair_device(&app, &token, "device-0001").await;
    // A device owned by nobody stays invisible.
    hello_device(&app, "device-0002").await;

    let (status, body) = get_json(&app, "/api/v1/devices", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    let devices = body.as_array().unwrap();
    assert_eq!(devices.len(), 1);
    let entry = &devices[0];
    assert_eq!(entry["id"].as_str().unwrap(), device_id);
    assert_eq!(entry["claimed"], true);
    assert_eq!(entry["health"], "ok");
    assert_eq!(entry["online"], true);
    assert_eq!(entry["state"], "claimed");
    assert!(entry["last_seen_age_seconds"].as_i64().unwrap() <= 30);
}

#[sqlx::test]
async fn stale_device_health_degrades(pool: sqlx::PgPool) {
    let (app, _state) = app(pool.clone());
    let token = register_user(&app, "owner@example.com").await;
    pair_device(&app, &token, "device-0001").await;

    sqlx::query("UPDATE devices SET last_seen_at = now() - interval '60 seconds'")
        .execute(&pool)
        .await
        .unwrap();
    let (_, body) = get_json(&app, "/api/v1/devices", Some(&token)).await;
    assert_eq!(body[0]["health"], "stale");
    assert_eq!(body[0]["online"], false);

    sqlx::query("UPDATE devices SET last_seen_at = now() - interval '500 seconds'")
        .execute(&pool)
        .await
        .unwrap();
    let (_, body) = get_json(&app, "/api/v1/devices", Some(&token)).await;
    assert_eq!(body[0]["health"], "dead");
}

#[sqlx::test]
async fn claimed_wins_over_pairing_active_in_detail(pool: sqlx::PgPool) {
    let (app, _state) = app(pool.clone());
    let owner = register_user(&app, "owner@example.com").await;
    let (device_id, _) = pair_device(&app, &owner, "device-0001").await;

    // Leave an unexpired session behind: the claimed device still reads
    // as claimed, not pairing_active.
    sqlx::query(
        "INSERT INTO pairing_sessions (id, device_uid, pairing_code, user_id, expires_at, is_used) \
         SELECT $1, 'device-0001', 'ZZZZZZZZ', id, now() + interval '5 minutes', false FROM users LIMIT 1",
    )
    .bind(uuid::Uuid::now_v7())
    .execute(&pool)
    .await
    .unwrap();

    let (status, body) = get_json(&app, &format!("/api/v1/devices/{device_id}"), Some(&owner)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "claimed");
    assert_eq!(body["is_claimed"], true);
}

#[sqlx::test]
async fn detail_is_404_for_non_owned_device(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let owner = register_user(&app, "owner@example.com").await;
    let stranger = register_user(&app, "stranger@example.com").await;
    let (device_id, _) = pair_device(&app, &owner, "device-0001").await;

    let (status, _) = get_json(&app, &format!("/api/v1/devices/{device_id}"), Some(&stranger)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[sqlx::test]
async fn busy_state_reflects_live_lease(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let token = register_user(&app, "owner@example.com").await;
    let (device_id, device_token) = pair_device(&app, &token, "device-0001").await;

    post_json(
        &app,
        &format!("/api/v1/devices/{device_id}/tasks"),
        json!({ "type": "scan", "payload": {} }),
        Some(&token),
    )
    .await;
    common::device_post(&app, "/api/v1/tasks/poll", json!({}), &device_token).await;

    let (_, body) = get_json(&app, &format!("/api/v1/devices/{device_id}"), Some(&token)).await;
    assert_eq!(body["state"], "busy");
    // The poll refreshed last_seen_at, so the device is within the
    // active window.
    assert_eq!(body["active"], true);
}

#[sqlx::test]
async fn whoami_identifies_the_device(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let token = register_user(&app, "owner@example.com").await;
    let (device_id, device_token) = pair_device(&app, &token, "device-0001").await;

    let (status, body) = device_get(&app, "/api/v1/devices/whoami", &device_token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"].as_str().unwrap(), device_id);
    assert_eq!(body["device_uid"], "device-0001");
    assert!(body["owner_user_id"].is_string());
}

#[sqlx::test]
async fn inactive_device_token_is_rejected(pool: sqlx::PgPool) {
    let (app, _state) = app(pool.clone());
    let token = register_user(&app, "owner@example.com").await;
    let (_device_id, device_token) = pair_device(&app, &token, "device-0001").await;

    sqlx::query("UPDATE device_tokens SET is_active = false")
        .execute(&pool)
        .await
        .unwrap();

    let (status, _) = device_get(&app, "/api/v1/devices/whoami", &device_token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
