//! Pairing: a short-lived out-of-band code exchange that atomically
//! claims a device and mints exactly one long-lived device credential.

use axum::extract::State;
use axum::Json;
use chrono::{Duration, Utc};
use rand::Rng;

use hubex_shared::api::pairing::{
    PairingConfirmRequest, PairingConfirmResponse, PairingStartRequest, PairingStartResponse,
};
use hubex_shared::error::ApiError;

use crate::device_state::device_busy;
use crate::error::ServerError;
use crate::extractors::auth::{hash_device_token, AuthUser};
use crate::models::{Device, PairingSession, DEVICE_COLUMNS};
use crate::state::AppState;

const PAIRING_TTL_MINUTES: i64 = 10;

/// Human-enterable alphabet with the ambiguous glyphs (0/O, 1/I/L)
/// removed.
const PAIRING_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
const PAIRING_CODE_LENGTH: usize = 8;

fn generate_pairing_code() -> String {
    let mut rng = rand::rng();
    (0..PAIRING_CODE_LENGTH)
        .map(|_| PAIRING_ALPHABET[rng.random_range(0..PAIRING_ALPHABET.len())] as char)
        .collect()
}

/// 256-bit URL-safe plaintext for the device credential.
fn generate_device_token() -> String {
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub async fn start(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<PairingStartRequest>,
) -> Result<Json<PairingStartResponse>, ServerError> {
    let device: Option<Device> = sqlx::query_as(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_uid = $1"
    ))
    .bind(&req.device_uid)
    .fetch_optional(&state.db)
    .await?;

    let device = device
        .ok_or_else(|| ServerError(ApiError::not_found("DEVICE_NOT_FOUND", "device not found")))?;
    if device.last_seen_at.is_none() {
        return Err(
            ApiError::not_found("DEVICE_NOT_PROVISIONED", "device not provisioned").into(),
        );
    }
    if device.owner_user_id.is_some() || device.is_claimed {
        return Err(
            ApiError::conflict("DEVICE_ALREADY_CLAIMED", "device already claimed").into(),
        );
    }

    let now = Utc::now();
    let existing: Option<PairingSession> = sqlx::query_as(
        "SELECT id, device_uid, pairing_code, user_id, expires_at, is_used, created_at \
         FROM pairing_sessions \
         WHERE device_uid = $1 AND is_used = false AND expires_at > $2",
    )
    .bind(&device.device_uid)
    .bind(now)
    .fetch_optional(&state.db)
    .await?;
    if let Some(session) = existing {
        let ttl_seconds = (session.expires_at - now).num_seconds().max(0);
        return Err(ApiError::conflict("PAIRING_ALREADY_ACTIVE", "pairing already active")
            .with_meta(serde_json::json!({
                "expires_at": session.expires_at.to_rfc3339(),
                "ttl_seconds": ttl_seconds,
            }))
            .into());
    }

    if device_busy(&state.db, device.id, now).await? {
        return Err(ApiError::conflict("DEVICE_BUSY", "device busy").into());
    }

    let code = generate_pairing_code();
    let expires_at = now + Duration::minutes(PAIRING_TTL_MINUTES);
    sqlx::query(
        "INSERT INTO pairing_sessions (id, device_uid, pairing_code, user_id, expires_at, is_used) \
         VALUES ($1, $2, $3, $4, $5, false)",
    )
    .bind(uuid::Uuid::now_v7())
    .bind(&device.device_uid)
    .bind(&code)
    .bind(user.user_id)
    .bind(expires_at)
    .execute(&state.db)
    .await?;

    Ok(Json(PairingStartResponse {
        device_uid: device.device_uid,
        pairing_code: code,
        expires_at,
        ttl_seconds: (expires_at - now).num_seconds().max(0),
    }))
}

/// Device-side confirm, unauthenticated. One transaction with row locks
/// on the session and the device defeats replays and concurrent
/// confirms: the first commit flips `is_used` and claims the device, so
/// any rival fails its guard checks.
pub async fn confirm(
    State(state): State<AppState>,
    Json(req): Json<PairingConfirmRequest>,
) -> Result<Json<PairingConfirmResponse>, ServerError> {
    let now = Utc::now();
    let mut tx = state.db.begin().await?;

    let session: Option<PairingSession> = sqlx::query_as(
        "SELECT id, device_uid, pairing_code, user_id, expires_at, is_used, created_at \
         FROM pairing_sessions \
         WHERE device_uid = $1 AND pairing_code = $2 \
         FOR UPDATE",
    )
    .bind(&req.device_uid)
    .bind(&req.pairing_code)
    .fetch_optional(&mut *tx)
    .await?;
    let session = session.ok_or_else(|| {
        ServerError(ApiError::not_found(
            "PAIRING_CODE_NOT_FOUND",
            "pairing code not found",
        ))
    })?;
    if session.is_used {
        return Err(ApiError::conflict("PAIRING_CODE_USED", "pairing code already used").into());
    }
    if session.expires_at <= now {
        return Err(ApiError::gone("PAIRING_CODE_EXPIRED", "pairing code expired").into());
    }

    let device: Option<Device> = sqlx::query_as(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_uid = $1 FOR UPDATE"
    ))
    .bind(&session.device_uid)
    .fetch_optional(&mut *tx)
    .await?;
    let device = device
        .ok_or_else(|| ServerError(ApiError::not_found("DEVICE_NOT_FOUND", "device not found")))?;
    if device.last_seen_at.is_none() {
        return Err(
            ApiError::not_found("DEVICE_NOT_PROVISIONED", "device not provisioned").into(),
        );
    }
    if device.owner_user_id.is_some() || device.is_claimed {
        return Err(
            ApiError::conflict("DEVICE_ALREADY_CLAIMED", "device already claimed").into(),
        );
    }

    if device_busy(&mut *tx, device.id, now).await? {
        return Err(ApiError::conflict("DEVICE_BUSY", "device busy").into());
    }

    let active_tokens: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM device_tokens WHERE device_id = $1 AND is_active = true",
    )
    .bind(device.id)
    .fetch_one(&mut *tx)
    .await?;
    if active_tokens > 0 {
        return Err(ApiError::conflict(
            "DEVICE_TOKEN_ALREADY_ISSUED",
            "device token already issued",
        )
        .into());
    }

    sqlx::query("UPDATE devices SET owner_user_id = $1, is_claimed = true WHERE id = $2")
        .bind(session.user_id)
        .bind(device.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE pairing_sessions SET is_used = true WHERE id = $1")
        .bind(session.id)
        .execute(&mut *tx)
        .await?;

    // Plaintext leaves the process exactly once, in this response.
    let token_plain = generate_device_token();
    sqlx::query(
        "INSERT INTO device_tokens (id, device_id, token_hash, is_active) \
         VALUES ($1, $2, $3, true)",
    )
    .bind(uuid::Uuid::now_v7())
    .bind(device.id)
    .bind(hash_device_token(&token_plain))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Json(PairingConfirmResponse {
        device_id: device.id,
        owner_user_id: session.user_id,
        device_uid: device.device_uid,
        device_token: token_plain,
        claimed_at: now,
    }))
}
