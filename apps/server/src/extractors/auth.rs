use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};

use hubex_shared::error::ApiError;
use hubex_shared::ids::UserId;

use crate::error::ServerError;
use crate::models::Device;
use crate::revocation::is_token_revoked;
use crate::state::AppState;

pub const DEVICE_TOKEN_HEADER: &str = "x-device-token";

/// SHA-256 hex digest of a presented device token. Storage never holds
/// the plaintext.
pub fn hash_device_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Authenticated user extracted from a valid access JWT.
///
/// Use this as a handler parameter to require a user principal:
/// ```ignore
/// async fn my_handler(auth: AuthUser) -> impl IntoResponse { ... }
/// ```
#[derive(Debug)]
pub struct AuthUser {
    pub user_id: UserId,
    pub caps: Vec<String>,
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn resolve_user(parts: &Parts, state: &AppState) -> Result<AuthUser, ServerError> {
    let token = bearer_token(parts).ok_or_else(|| {
        tracing::debug!("auth: missing bearer token");
        ServerError(ApiError::unauthorized("AUTH_REQUIRED", "missing bearer token"))
    })?;

    let claims = state.jwt.validate_access_token(token).map_err(|e| {
        tracing::debug!(error = %e, "auth: token validation failed");
        ServerError(ApiError::unauthorized("AUTH_INVALID", e.to_string()))
    })?;

    if is_token_revoked(&state.db, &claims.jti)
        .await
        .map_err(ServerError::from)?
    {
        return Err(ServerError(ApiError::unauthorized(
            "AUTH_TOKEN_REVOKED",
            "token revoked",
        )));
    }

    let user_id: UserId = claims
        .sub
        .parse()
        .map_err(|_| ServerError(ApiError::unauthorized("AUTH_INVALID", "invalid token")))?;

    let exists: Option<UserId> = sqlx::query_scalar("SELECT id FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ServerError::from)?;
    if exists.is_none() {
        return Err(ServerError(ApiError::unauthorized(
            "AUTH_USER_NOT_FOUND",
            "user not found",
        )));
    }

    Ok(AuthUser {
        user_id,
        caps: claims.caps,
    })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        resolve_user(parts, state).await
    }
}

/// Authenticated device extracted from an `X-Device-Token` header.
/// The token is matched by SHA-256 hash against the active credential,
/// and the device must be claimed.
#[derive(Debug)]
pub struct AuthDevice(pub Device);

async fn resolve_device(parts: &Parts, state: &AppState) -> Result<AuthDevice, ServerError> {
    let token = parts
        .headers
        .get(DEVICE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ServerError(ApiError::unauthorized(
                "AUTH_DEVICE_TOKEN_REQUIRED",
                "missing device token",
            ))
        })?;

    let token_hash = hash_device_token(token);
    let device: Option<Device> = sqlx::query_as(
        "SELECT d.id, d.device_uid, d.name, d.firmware_version, d.capabilities, \
                d.last_seen_at, d.owner_user_id, d.is_claimed, d.created_at \
         FROM devices d \
         JOIN device_tokens t ON t.device_id = d.id \
         WHERE t.token_hash = $1 AND t.is_active = true",
    )
    .bind(&token_hash)
    .fetch_optional(&state.db)
    .await
    .map_err(ServerError::from)?;

    let device = device.ok_or_else(|| {
        tracing::debug!("auth: unknown or inactive device token");
        ServerError(ApiError::unauthorized(
            "AUTH_DEVICE_TOKEN_INVALID",
            "invalid device token",
        ))
    })?;

    if device.owner_user_id.is_none() {
        return Err(ServerError(ApiError::unauthorized(
            "AUTH_DEVICE_UNCLAIMED",
            "device unclaimed",
        )));
    }

    Ok(AuthDevice(device))
}

impl FromRequestParts<AppState> for AuthDevice {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        resolve_device(parts, state).await
    }
}

/// Either principal kind. A bearer token wins over a device token when
/// both are presented.
#[derive(Debug)]
pub enum Principal {
    User(AuthUser),
    Device(Device),
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if bearer_token(parts).is_some() {
            return Ok(Principal::User(resolve_user(parts, state).await?));
        }
        if parts.headers.contains_key(DEVICE_TOKEN_HEADER) {
            return Ok(Principal::Device(resolve_device(parts, state).await?.0));
        }
        Err(ServerError(ApiError::unauthorized(
            "AUTH_REQUIRED",
            "authentication required",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_device_token_is_sha256_hex() {
        // SHA-256 of the empty string, the canonical test vector.
        assert_eq!(
            hash_device_token(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(hash_device_token("abc").len(), 64);
    }

    #[test]
    fn hash_is_deterministic_and_distinct() {
        assert_eq!(hash_device_token("tok"), hash_device_token("tok"));
        assert_ne!(hash_device_token("tok"), hash_device_token("tok2"));
    }
}
