mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{app, error_code, post_json, register_user, TEST_PASSWORD};

#[sqlx::test]
async fn register_returns_bearer_token(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let (status, body) = post_json(
        &app,
        "/api/v1/auth/register",
        json!({ "email": "alice@example.com", "password": TEST_PASSWORD }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "bearer");
    assert!(!body["access_token"].as_str().unwrap().is_empty());
}

#[sqlx::test]
async fn register_duplicate_email_conflicts(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    register_user(&app, "alice@example.com").await;
    let (status, body) = post_json(
        &app,
        "/api/v1/auth/register",
        json!({ "email": "alice@example.com", "password": TEST_PASSWORD }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "AUTH_EMAIL_EXISTS");
}

#[sqlx::test]
async fn register_normalizes_email_case(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    register_user(&app, "Alice@Example.com").await;
    // Same address, different case: still a duplicate.
    let (status, _) = post_json(
        &app,
        "/api/v1/auth/register",
        json!({ "email": "alice@example.com", "password": TEST_PASSWORD }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[sqlx::test]
async fn login_roundtrip(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    register_user(&app, "bob@example.com").await;
    let (status, body) = post_json(
        &app,
        "/api/v1/auth/login",
        json!({ "email": "bob@example.com", "password": TEST_PASSWORD }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "bearer");
}

#[sqlx::test]
async fn login_rejects_wrong_password(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    register_user(&app, "bob@example.com").await;
    let (status, body) = post_json(
        &app,
        "/api/v1/auth/login",
        json!({ "email": "bob@example.com", "password": "wrong-password" }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "AUTH_INVALID_CREDENTIALS");
}

#[sqlx::test]
async fn login_rejects_unknown_email(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let (status, body) = post_json(
        &app,
        "/api/v1/auth/login",
        json!({ "email": "nobody@example.com", "password": TEST_PASSWORD }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "AUTH_INVALID_CREDENTIALS");
}

#[sqlx::test]
async fn register_validates_email_and_password(pool: sqlx::PgPool) {
    let (app, _state) = app(pool);
    let (status, body) = post_json(
        &app,
        "/api/v1/auth/register",
        json!({ "email": "not-an-email", "password": TEST_PASSWORD }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "VALIDATION_ERROR");

    let (status, body) = post_json(
        &app,
        "/api/v1/auth/register",
        json!({ "email": "ok@example.com", "password": "short" }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "VALIDATION_ERROR");
}

#[sqlx::test]
async fn password_is_stored_hashed(pool: sqlx::PgPool) {
    let (app, _state) = app(pool.clone());
    register_user(&app, "carol@example.com").await;
    let hash: String = sqlx::query_scalar("SELECT password_hash FROM users WHERE email = $1")
        .bind("carol@example.com")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_ne!(hash, TEST_PASSWORD);
    assert!(hash.starts_with("$argon2"));
}
