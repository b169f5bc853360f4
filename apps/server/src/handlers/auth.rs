use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::extract::State;
use axum::Json;

use hubex_shared::api::auth::{CredentialsRequest, TokenResponse};
use hubex_shared::caps::USER_CAPS;
use hubex_shared::error::ApiError;
use hubex_shared::ids::UserId;

use crate::error::ServerError;
use crate::state::AppState;

fn validate_email(email: &str) -> Result<String, ServerError> {
    let email = email.trim().to_lowercase();
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() || !parts[1].contains('.') {
        return Err(ApiError::unprocessable("VALIDATION_ERROR", "invalid email format").into());
    }
    Ok(email)
}

fn validate_password(password: &str) -> Result<(), ServerError> {
    if password.len() < 8 {
        return Err(ApiError::unprocessable(
            "VALIDATION_ERROR",
            "password must be at least 8 characters",
        )
        .into());
    }
    Ok(())
}

fn hash_password(password: &str) -> Result<String, ServerError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ServerError(ApiError::internal(format!("password hash error: {e}"))))
}

fn verify_password(password: &str, password_hash: &str) -> bool {
    PasswordHash::new(password_hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<TokenResponse>, ServerError> {
    let email = validate_email(&req.email)?;
    validate_password(&req.password)?;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
        .bind(&email)
        .fetch_one(&state.db)
        .await?;
    if exists {
        return Err(ApiError::conflict("AUTH_EMAIL_EXISTS", "email already registered").into());
    }

    let user_id = UserId::new();
    let password_hash = hash_password(&req.password)?;
    sqlx::query("INSERT INTO users (id, email, password_hash) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(&email)
        .bind(&password_hash)
        .execute(&state.db)
        .await?;

    let token = state.jwt.issue_access_token(&user_id, USER_CAPS)?;
    Ok(Json(TokenResponse::bearer(token)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<TokenResponse>, ServerError> {
    let email = req.email.trim().to_lowercase();
    let user: Option<(UserId, String)> =
        sqlx::query_as("SELECT id, password_hash FROM users WHERE email = $1")
            .bind(&email)
            .fetch_optional(&state.db)
            .await?;

    let (user_id, password_hash) = match user {
        Some(row) => row,
        None => {
            return Err(ApiError::unauthorized(
                "AUTH_INVALID_CREDENTIALS",
                "invalid credentials",
            )
            .into());
        }
    };

    if !verify_password(&req.password, &password_hash) {
        return Err(
            ApiError::unauthorized("AUTH_INVALID_CREDENTIALS", "invalid credentials").into(),
        );
    }

    let token = state.jwt.issue_access_token(&user_id, USER_CAPS)?;
    Ok(Json(TokenResponse::bearer(token)))
}
