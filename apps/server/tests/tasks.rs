mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{app, device_post, error_code, pair_device, post_json, register_user};

async fn setup(pool: sqlx::PgPool) -> (axum::Router, String, String, String) {
    let (app, _state) = app(pool);
    let user_token = register_user(&app, "owner@example.com").await;
    let (device_id, device_token) = pair_device(&app, &user_token, "device-0001").await;
    (app, user_token, device_id, device_token)
}

async fn enqueue(
    app: &axum::Router,
    user_token: &str,
    device_id: &str,
    body: serde_json::Value,
) -> serde_json::Value {
    let (status, body) = post_json(
        app,
        &format!("/api/v1/devices/{device_id}/tasks"),
        body,
        Some(user_token),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "enqueue failed: {body}");
    body
}

#[sqlx::test]
async fn enqueue_poll_complete_roundtrip(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool).await;
    let created = enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "reboot", "payload": { "grace": 5 } }),
    )
    .await;
    assert_eq!(created["status"], "queued");
    let task_id = created["id"].as_str().unwrap().to_string();

    let (status, body) = device_post(&app, "/api/v1/tasks/poll", json!({}), &device_token).await;
    assert_eq!(status, StatusCode::OK);
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], task_id.as_str());
    assert_eq!(items[0]["type"], "reboot");
    let lease_token = items[0]["lease_token"].as_str().unwrap().to_string();
    assert!(!lease_token.is_empty());

    let (status, body) = device_post(
        &app,
        &format!("/api/v1/tasks/{task_id}/complete"),
        json!({ "status": "done", "result": { "ok": true }, "lease_token": lease_token }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "done");

    // Nothing left to hand out.
    let (_, body) = device_post(&app, "/api/v1/tasks/poll", json!({}), &device_token).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[sqlx::test]
async fn poll_claims_each_task_exactly_once(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool).await;
    enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "scan", "payload": {}, "priority": 5 }),
    )
    .await;

    let (_, first) = device_post(
        &app,
        "/api/v1/tasks/poll?limit=1",
        json!({}),
        &device_token,
    )
    .await;
    assert_eq!(first.as_array().unwrap().len(), 1);

    // The lease is live, so a second poll sees nothing.
    let (_, second) = device_post(
        &app,
        "/api/v1/tasks/poll?limit=1",
        json!({}),
        &device_token,
    )
    .await;
    assert!(second.as_array().unwrap().is_empty());
}

#[sqlx::test]
async fn poll_orders_by_priority_then_age(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool).await;
    enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "low", "payload": {}, "priority": 1 }),
    )
    .await;
    enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "high", "payload": {}, "priority": 5 }),
    )
    .await;

    let (_, body) = device_post(
        &app,
        "/api/v1/tasks/poll?limit=1",
        json!({}),
        &device_token,
    )
    .await;
    assert_eq!(body[0]["type"], "high");
}

#[sqlx::test]
async fn idempotent_enqueue_returns_first_task(pool: sqlx::PgPool) {
    let (app, user_token, device_id, _) = setup(pool.clone()).await;
    let body = json!({ "type": "reboot", "payload": {}, "idempotency_key": "once" });
    let first = enqueue(&app, &user_token, &device_id, body.clone()).await;
    let second = enqueue(&app, &user_token, &device_id, body).await;

    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["status"], second["status"]);
    assert_eq!(first["created_at"], second["created_at"]);

    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM tasks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test]
async fn expired_lease_is_reclaimed_with_fresh_token(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool.clone()).await;
    enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "scan", "payload": {} }),
    )
    .await;

    let (_, body) = device_post(&app, "/api/v1/tasks/poll", json!({}), &device_token).await;
    let first_token = body[0]["lease_token"].as_str().unwrap().to_string();
    let task_id = body[0]["id"].as_str().unwrap().to_string();

    sqlx::query("UPDATE tasks SET lease_expires_at = now() - interval '1 second'")
        .execute(&pool)
        .await
        .unwrap();

    let (_, body) = device_post(&app, "/api/v1/tasks/poll", json!({}), &device_token).await;
    assert_eq!(body[0]["id"], task_id.as_str());
    let second_token = body[0]["lease_token"].as_str().unwrap();
    assert_ne!(second_token, first_token);

    // The stale token no longer completes the task.
    let (status, body) = device_post(
        &app,
        &format!("/api/v1/tasks/{task_id}/complete"),
        json!({ "status": "done", "lease_token": first_token }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "TASK_LEASE_TOKEN_MISMATCH");
}

#[sqlx::test]
async fn renew_extends_live_lease_only(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool.clone()).await;
    enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "scan", "payload": {} }),
    )
    .await;
    let (_, body) = device_post(
        &app,
        "/api/v1/tasks/poll?lease_seconds=30",
        json!({}),
        &device_token,
    )
    .await;
    let task_id = body[0]["id"].as_str().unwrap().to_string();
    let lease_token = body[0]["lease_token"].as_str().unwrap().to_string();
    let before = body[0]["lease_expires_at"].as_str().unwrap().to_string();

    let (status, body) = device_post(
        &app,
        &format!("/api/v1/tasks/{task_id}/renew?lease_seconds=600&lease_token={lease_token}"),
        json!({}),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["lease_expires_at"].as_str().unwrap() > before.as_str());

    let (status, body) = device_post(
        &app,
        &format!("/api/v1/tasks/{task_id}/renew?lease_token=wrong-token"),
        json!({}),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "TASK_LEASE_TOKEN_MISMATCH");

    sqlx::query("UPDATE tasks SET lease_expires_at = now() - interval '1 second'")
        .execute(&pool)
        .await
        .unwrap();
    let (status, body) = device_post(
        &app,
        &format!("/api/v1/tasks/{task_id}/renew?lease_token={lease_token}"),
        json!({}),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "TASK_LEASE_EXPIRED");
}

#[sqlx::test]
async fn lease_seconds_are_clamped(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool).await;
    enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "scan", "payload": {} }),
    )
    .await;
    let (_, body) = device_post(
        &app,
        "/api/v1/tasks/poll?lease_seconds=9999",
        json!({}),
        &device_token,
    )
    .await;
    let expires = chrono::DateTime::parse_from_rfc3339(body[0]["lease_expires_at"].as_str().unwrap())
        .unwrap();
    let remaining = expires.signed_duration_since(chrono::Utc::now()).num_seconds();
    assert!(remaining <= 600, "lease not clamped: {remaining}s");
    assert!(remaining > 500);
}

#[sqlx::test]
async fn complete_requires_matching_live_lease(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool).await;
    let created = enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "scan", "payload": {} }),
    )
    .await;
    let task_id = created["id"].as_str().unwrap().to_string();

    // Not yet claimed.
    let (status, body) = device_post(
        &app,
        &format!("/api/v1/tasks/{task_id}/complete"),
        json!({ "status": "done", "lease_token": "anything" }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "TASK_NOT_IN_FLIGHT");

    let (_, body) = device_post(&app, "/api/v1/tasks/poll", json!({}), &device_token).await;
    let lease_token = body[0]["lease_token"].as_str().unwrap().to_string();

    let (status, body) = device_post(
        &app,
        &format!("/api/v1/tasks/{task_id}/complete"),
        json!({ "status": "done" }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "TASK_LEASE_TOKEN_REQUIRED");

    let (status, _) = device_post(
        &app,
        &format!("/api/v1/tasks/{task_id}/complete"),
        json!({ "status": "failed", "error": "boom", "lease_token": lease_token }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Terminal is immutable.
    let (status, body) = device_post(
        &app,
        &format!("/api/v1/tasks/{task_id}/complete"),
        json!({ "status": "done", "lease_token": lease_token }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "TASK_ALREADY_COMPLETED");
}

#[sqlx::test]
async fn cancel_matrix(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool).await;
    let created = enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "scan", "payload": {} }),
    )
    .await;
    let task_id = created["id"].as_str().unwrap().to_string();

    let (_, body) = device_post(&app, "/api/v1/tasks/poll", json!({}), &device_token).await;
    assert_eq!(body[0]["id"], task_id.as_str());

    // In flight without force is refused.
    let (status, body) = post_json(
        &app,
        &format!("/api/v1/devices/{device_id}/tasks/{task_id}/cancel"),
        json!({}),
        Some(&user_token),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "TASK_IN_FLIGHT");

    let (status, body) = post_json(
        &app,
        &format!("/api/v1/devices/{device_id}/tasks/{task_id}/cancel?force=true"),
        json!({}),
        Some(&user_token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "canceled");

    let (status, body) = post_json(
        &app,
        &format!("/api/v1/devices/{device_id}/tasks/{task_id}/cancel?force=true"),
        json!({}),
        Some(&user_token),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "TASK_ALREADY_COMPLETED");
}

#[sqlx::test]
async fn context_heartbeat_upserts_and_scopes_polling(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool).await;

    let (status, first) = device_post(
        &app,
        "/api/v1/tasks/context/heartbeat",
        json!({ "context_key": "camera", "capabilities": { "video": true } }),
        &device_token,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = device_post(
        &app,
        "/api/v1/tasks/context/heartbeat",
        json!({ "context_key": "camera", "capabilities": { "video": false } }),
        &device_token,
    )
    .await;
    assert_eq!(first["id"], second["id"]);

    enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "record", "payload": {}, "execution_context_key": "camera" }),
    )
    .await;
    enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "general", "payload": {} }),
    )
    .await;

    // Unknown context yields nothing; the bound context only its task.
    let (_, body) = device_post(
        &app,
        "/api/v1/tasks/poll?context_key=missing&limit=10",
        json!({}),
        &device_token,
    )
    .await;
    assert!(body.as_array().unwrap().is_empty());

    let (_, body) = device_post(
        &app,
        "/api/v1/tasks/poll?context_key=camera&limit=10",
        json!({}),
        &device_token,
    )
    .await;
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["type"], "record");
}

#[sqlx::test]
async fn enqueue_with_unknown_context_key_conflicts(pool: sqlx::PgPool) {
    let (app, user_token, device_id, _) = setup(pool).await;
    let (status, body) = post_json(
        &app,
        &format!("/api/v1/devices/{device_id}/tasks"),
        json!({ "type": "x", "payload": {}, "execution_context_key": "nope" }),
        Some(&user_token),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "EXECUTION_CONTEXT_NOT_FOUND");
}

#[sqlx::test]
async fn current_task_and_history_views(pool: sqlx::PgPool) {
    let (app, user_token, device_id, device_token) = setup(pool).await;

    let (_, body) = common::get_json(
        &app,
        &format!("/api/v1/devices/{device_id}/current-task"),
        Some(&user_token),
    )
    .await;
    assert_eq!(body["has_active_lease"], false);

    enqueue(
        &app,
        &user_token,
        &device_id,
        json!({ "type": "scan", "payload": {} }),
    )
    .await;
    let (_, polled) = device_post(&app, "/api/v1/tasks/poll", json!({}), &device_token).await;
    let lease_token = polled[0]["lease_token"].as_str().unwrap().to_string();
    let task_id = polled[0]["id"].as_str().unwrap().to_string();

    let (_, body) = common::get_json(
        &app,
        &format!("/api/v1/devices/{device_id}/current-task"),
        Some(&user_token),
    )
    .await;
    assert_eq!(body["has_active_lease"], true);
    assert_eq!(body["task_id"], task_id.as_str());
    // Only a short hint of the lease token is ever exposed to the owner.
    let hint = body["lease_token_hint"].as_str().unwrap();
    assert_eq!(hint.len(), 6);
    assert!(lease_token.starts_with(hint));

    let (_, _) = device_post(
        &app,
        &format!("/api/v1/tasks/{task_id}/complete"),
        json!({ "status": "done", "lease_token": lease_token }),
        &device_token,
    )
    .await;

    let (_, history) = common::get_json(
        &app,
        &format!("/api/v1/devices/{device_id}/task-history"),
        Some(&user_token),
    )
    .await;
    let entries = history.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["task_status"], "done");
}

#[sqlx::test]
async fn tasks_are_scoped_to_the_owner(pool: sqlx::PgPool) {
    let (app, _user_token, device_id, _device_token) = setup(pool).await;
    let stranger = register_user(&app, "stranger@example.com").await;
    let (status, body) = post_json(
        &app,
        &format!("/api/v1/devices/{device_id}/tasks"),
        json!({ "type": "x", "payload": {} }),
        Some(&stranger),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "DEVICE_NOT_FOUND");
}
