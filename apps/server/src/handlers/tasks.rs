//! Device-side task loop: context heartbeat, lease-poll, renew, complete.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use hubex_shared::api::task::{
    ContextHeartbeatRequest, ContextHeartbeatResponse, TaskCompleteRequest, TaskCompleteResponse,
    TaskPollItem, TaskRenewResponse,
};
use hubex_shared::error::ApiError;
use hubex_shared::ids::{ContextId, TaskId};

use crate::error::ServerError;
use crate::extractors::auth::AuthDevice;
use crate::models::{Task, TASK_COLUMNS};
use crate::state::AppState;
use crate::validation::validate_json_object;

const MIN_LEASE_SECONDS: i64 = 5;
const MAX_LEASE_SECONDS: i64 = 600;
const MAX_POLL_LIMIT: i64 = 50;

fn clamp_lease_seconds(requested: Option<i64>) -> i64 {
    requested
        .unwrap_or(60)
        .clamp(MIN_LEASE_SECONDS, MAX_LEASE_SECONDS)
}

/// 128-bit URL-safe lease token, stored and returned verbatim.
fn generate_lease_token() -> String {
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub async fn context_heartbeat(
    State(state): State<AppState>,
    AuthDevice(device): AuthDevice,
    Json(req): Json<ContextHeartbeatRequest>,
) -> Result<Json<ContextHeartbeatResponse>, ServerError> {
    if req.context_key.is_empty() || req.context_key.len() > 128 {
        return Err(ApiError::unprocessable(
            "VALIDATION_ERROR",
            "context_key must be 1-128 characters",
        )
        .into());
    }
    let meta = req.meta.unwrap_or_else(|| serde_json::json!({}));
    validate_json_object(&req.capabilities, "capabilities")?;
    validate_json_object(&meta, "meta")?;

    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let (id, context_key, last_seen_at): (ContextId, String, DateTime<Utc>) = sqlx::query_as(
        "INSERT INTO execution_contexts (id, client_id, context_key, capabilities, meta, last_seen_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (client_id, context_key) DO UPDATE \
         SET capabilities = EXCLUDED.capabilities, meta = EXCLUDED.meta, \
             last_seen_at = EXCLUDED.last_seen_at \
         RETURNING id, context_key, last_seen_at",
    )
    .bind(ContextId::new())
    .bind(device.id)
    .bind(&req.context_key)
    .bind(&req.capabilities)
    .bind(&meta)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE devices SET last_seen_at = $1 WHERE id = $2")
        .bind(now)
        .bind(device.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(Json(ContextHeartbeatResponse {
        id,
        context_key,
        last_seen_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub limit: Option<i64>,
    pub context_key: Option<String>,
    pub lease_seconds: Option<i64>,
}

/// Claim up to `limit` runnable tasks for this device. Queued tasks and
/// in-flight tasks whose lease has lapsed are both eligible;
/// `FOR UPDATE SKIP LOCKED` serializes claim acquisition so concurrent
/// pollers never observe the same row.
pub async fn poll(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
    AuthDevice(device): AuthDevice,
) -> Result<Json<Vec<TaskPollItem>>, ServerError> {
    let limit = query.limit.unwrap_or(1).clamp(1, MAX_POLL_LIMIT);
    let lease_seconds = clamp_lease_seconds(query.lease_seconds);
    let now = Utc::now();

    let mut tx = state.db.begin().await?;

    let context_id: Option<ContextId> = match &query.context_key {
        Some(key) => {
            let found: Option<ContextId> = sqlx::query_scalar(
                "SELECT id FROM execution_contexts WHERE client_id = $1 AND context_key = $2",
            )
            .bind(device.id)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            match found {
                Some(id) => Some(id),
                // Unknown context: nothing to hand out.
                None => return Ok(Json(vec![])),
            }
        }
        None => None,
    };

    let candidates: Vec<Task> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks \
         WHERE client_id = $1 \
           AND (status = 'queued' \
                OR (status = 'in_flight' AND lease_expires_at < $2)) \
           AND ($3::uuid IS NULL OR execution_context_id = $3) \
         ORDER BY priority DESC, created_at ASC \
         LIMIT $4 \
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(device.id)
    .bind(now)
    .bind(context_id)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;

    let lease_expires_at = now + Duration::seconds(lease_seconds);
    let mut items = Vec::with_capacity(candidates.len());
    for task in candidates {
        let lease_token = generate_lease_token();
        sqlx::query(
            "UPDATE tasks SET status = 'in_flight', claimed_at = $1, lease_expires_at = $2, \
                              lease_token = $3 \
             WHERE id = $4",
        )
        .bind(now)
        .bind(lease_expires_at)
        .bind(&lease_token)
        .bind(task.id)
        .execute(&mut *tx)
        .await?;

        items.push(TaskPollItem {
            id: task.id,
            task_type: task.task_type,
            payload: task.payload,
            created_at: task.created_at,
            lease_expires_at,
            execution_context_id: task.execution_context_id,
            lease_token,
        });
    }

    sqlx::query("UPDATE devices SET last_seen_at = $1 WHERE id = $2")
        .bind(now)
        .bind(device.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
pub struct RenewQuery {
    pub lease_seconds: Option<i64>,
    pub lease_token: Option<String>,
}

pub async fn renew(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    Query(query): Query<RenewQuery>,
    AuthDevice(device): AuthDevice,
) -> Result<Json<TaskRenewResponse>, ServerError> {
    let lease_seconds = clamp_lease_seconds(query.lease_seconds);
    let now = Utc::now();

    let mut tx = state.db.begin().await?;
    let task: Option<Task> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND client_id = $2 FOR UPDATE"
    ))
    .bind(task_id)
    .bind(device.id)
    .fetch_optional(&mut *tx)
    .await?;
    let task =
        task.ok_or_else(|| ServerError(ApiError::not_found("TASK_NOT_FOUND", "task not found")))?;

    if task.status != "in_flight" {
        return Err(ApiError::conflict("TASK_NOT_IN_FLIGHT", "task not in flight").into());
    }
    if task.lease_expires_at.is_none_or(|expiry| expiry <= now) {
        return Err(ApiError::conflict("TASK_LEASE_EXPIRED", "task lease expired").into());
    }
    if let Some(token) = &query.lease_token {
        if task.lease_token.as_deref() != Some(token.as_str()) {
            return Err(ApiError::conflict(
                "TASK_LEASE_TOKEN_MISMATCH",
                "task lease token mismatch",
            )
            .into());
        }
    }

    let lease_expires_at = now + Duration::seconds(lease_seconds);
    sqlx::query("UPDATE tasks SET lease_expires_at = $1 WHERE id = $2")
        .bind(lease_expires_at)
        .bind(task.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(Json(TaskRenewResponse {
        id: task.id,
        lease_expires_at,
    }))
}

pub async fn complete(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    AuthDevice(device): AuthDevice,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, ServerError> {
    if !matches!(req.status.as_str(), "done" | "failed" | "canceled") {
        return Err(ApiError::unprocessable(
            "VALIDATION_ERROR",
            "status must be done, failed, or canceled",
        )
        .into());
    }
    if let Some(result) = &req.result {
        validate_json_object(result, "result")?;
    }

    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let task: Option<Task> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND client_id = $2 FOR UPDATE"
    ))
    .bind(task_id)
    .bind(device.id)
    .fetch_optional(&mut *tx)
    .await?;
    let task =
        task.ok_or_else(|| ServerError(ApiError::not_found("TASK_NOT_FOUND", "task not found")))?;

    if matches!(task.status.as_str(), "done" | "failed" | "canceled") {
        return Err(
            ApiError::conflict("TASK_ALREADY_COMPLETED", "task already completed").into(),
        );
    }
    if task.status != "in_flight" {
        return Err(ApiError::conflict("TASK_NOT_IN_FLIGHT", "task not in flight").into());
    }
    if task.lease_expires_at.is_none_or(|expiry| expiry <= now) {
        return Err(ApiError::conflict("TASK_LEASE_EXPIRED", "task lease expired").into());
    }
    let token = req.lease_token.as_deref().filter(|t| !t.is_empty());
    let token = token.ok_or_else(|| {
        ServerError(ApiError::conflict(
            "TASK_LEASE_TOKEN_REQUIRED",
            "task lease token required",
        ))
    })?;
    if task.lease_token.as_deref() != Some(token) {
        return Err(ApiError::conflict(
            "TASK_LEASE_TOKEN_MISMATCH",
            "task lease token mismatch",
        )
        .into());
    }

    sqlx::query(
        "UPDATE tasks SET status = $1, completed_at = $2, result = $3, error = $4 WHERE id = $5",
    )
    .bind(&req.status)
    .bind(now)
    .bind(&req.result)
    .bind(&req.error)
    .bind(task.id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Json(TaskCompleteResponse {
        id: task.id,
        status: req.status,
        completed_at: now,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_seconds_clamped_to_bounds() {
        assert_eq!(clamp_lease_seconds(None), 60);
        assert_eq!(clamp_lease_seconds(Some(1)), MIN_LEASE_SECONDS);
        assert_eq!(clamp_lease_seconds(Some(10_000)), MAX_LEASE_SECONDS);
        assert_eq!(clamp_lease_seconds(Some(120)), 120);
    }

    #[test]
    fn lease_token_is_128_bits_urlsafe() {
        let token = generate_lease_token();
        // 16 bytes -> 22 base64url chars, no padding.
        assert_eq!(token.len(), 22);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn lease_tokens_never_repeat() {
        let a = generate_lease_token();
        let b = generate_lease_token();
        assert_ne!(a, b);
    }
}
