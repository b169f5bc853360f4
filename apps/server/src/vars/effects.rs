//! Side-effect jobs derived from variable audits, executed by a
//! lease-based worker with exponential backoff.

use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgExecutor, PgPool};

use hubex_shared::error::ApiError;
use hubex_shared::ids::{DeviceId, EffectId};

use crate::error::ServerError;
use crate::models::{Device, VariableAudit, VariableDefinition, VariableEffect};

pub const EFFECT_COLUMNS: &str = "id, status, kind, scope, device_id, device_uid, \
     trigger_audit_id, payload, error, attempts, next_attempt_at, locked_until, locked_by, \
     correlation_id, created_at, updated_at";

pub const KIND_TELEMETRY_RESCHEDULE: &str = "telemetry.reschedule";
pub const KIND_DEVICE_LABEL_SYNC: &str = "device.label.sync";

const LOCK_SECONDS: i64 = 30;
const MAX_ATTEMPTS: i32 = 5;

/// Backoff after `attempts` failures: min(300, 2^min(attempts, 6)) seconds.
pub fn backoff_seconds(attempts: i32) -> i64 {
    let exponent = attempts.clamp(0, 6) as u32;
    300.min(2i64.pow(exponent))
}

#[derive(Debug, Clone)]
pub struct EffectSpec {
    pub kind: &'static str,
    pub payload: Value,
}

/// Declaratively derive effect jobs from a committed variable change.
/// Only device-scope changes trigger effects today.
pub fn derive_effects_from_change(
    definition: &VariableDefinition,
    device: Option<&Device>,
    new_value: Option<&Value>,
) -> Vec<EffectSpec> {
    if definition.scope != "device" || device.is_none() {
        return vec![];
    }

    let mut specs = vec![];
    if definition.key == "device.telemetry_interval_ms" {
        if let Some(interval) = new_value.and_then(|v| v.as_i64()) {
            specs.push(EffectSpec {
                kind: KIND_TELEMETRY_RESCHEDULE,
                payload: serde_json::json!({ "interval_ms": interval }),
            });
        }
    }
    if definition.key == "device.label" {
        let label = new_value
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        specs.push(EffectSpec {
            kind: KIND_DEVICE_LABEL_SYNC,
            payload: serde_json::json!({ "label": label }),
        });
    }
    specs
}

/// Persist derived effects as pending jobs correlated to their audit.
pub async fn enqueue_effects(
    tx: &mut PgConnection,
    specs: &[EffectSpec],
    audit: &VariableAudit,
    device: &Device,
) -> Result<Vec<EffectId>, sqlx::Error> {
    let now = Utc::now();
    let mut ids = Vec::with_capacity(specs.len());
    for spec in specs {
        let id = EffectId::new();
        sqlx::query(
            "INSERT INTO variable_effects \
                 (id, status, kind, scope, device_id, device_uid, trigger_audit_id, payload, \
                  attempts, next_attempt_at, correlation_id, created_at, updated_at) \
             VALUES ($1, 'pending', $2, 'device', $3, $4, $5, $6, 0, $7, $8, $7, $7)",
        )
        .bind(id)
        .bind(spec.kind)
        .bind(device.id)
        .bind(&device.device_uid)
        .bind(audit.id)
        .bind(&spec.payload)
        .bind(now)
        .bind(format!("audit:{}", audit.id))
        .execute(&mut *tx)
        .await?;
        ids.push(id);
    }
    Ok(ids)
}

async fn apply_telemetry_reschedule(
    tx: &mut PgConnection,
    device_id: DeviceId,
    payload: Option<&Value>,
) -> Result<(), ServerError> {
    let interval_ms = payload
        .and_then(|p| p.get("interval_ms"))
        .and_then(|v| v.as_i64())
        .ok_or_else(|| {
            ServerError(ApiError::unprocessable(
                "EFFECT_INVALID_PAYLOAD",
                "interval_ms missing",
            ))
        })?;
    sqlx::query(
        "INSERT INTO device_runtime_settings (device_id, telemetry_interval_ms, updated_at) \
         VALUES ($1, $2, now()) \
         ON CONFLICT (device_id) DO UPDATE \
         SET telemetry_interval_ms = $2, updated_at = now()",
    )
    .bind(device_id)
    .bind(interval_ms as i32)
    .execute(tx)
    .await?;
    Ok(())
}

async fn apply_label_sync(
    tx: &mut PgConnection,
    device_id: DeviceId,
    payload: Option<&Value>,
) -> Result<(), ServerError> {
    let label = payload
        .and_then(|p| p.get("label"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let result = sqlx::query("UPDATE devices SET name = $1 WHERE id = $2")
        .bind(label)
        .bind(device_id)
        .execute(tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("DEVICE_NOT_FOUND", "device not found").into());
    }
    Ok(())
}

async fn execute_effect(tx: &mut PgConnection, effect: &VariableEffect) -> Result<(), ServerError> {
    let device_id = effect.device_id.ok_or_else(|| {
        ServerError(ApiError::unprocessable(
            "EFFECT_INVALID_PAYLOAD",
            "effect has no device",
        ))
    })?;
    match effect.kind.as_str() {
        KIND_TELEMETRY_RESCHEDULE => {
            apply_telemetry_reschedule(tx, device_id, effect.payload.as_ref()).await
        }
        KIND_DEVICE_LABEL_SYNC => apply_label_sync(tx, device_id, effect.payload.as_ref()).await,
        _ => Err(ApiError::unprocessable("EFFECT_UNKNOWN_KIND", "unknown effect kind").into()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EffectRunSummary {
    pub processed: i64,
    pub done: i64,
    pub failed: i64,
}

/// One worker pass: lease up to `limit` due effects with
/// `FOR UPDATE SKIP LOCKED`, execute each, and record the outcome.
/// Failures back off exponentially; an effect that has failed
/// `MAX_ATTEMPTS` times is buried as `dead` and no longer polled.
pub async fn run_effects_once(
    db: &PgPool,
    limit: i64,
    locked_by: &str,
) -> Result<EffectRunSummary, ServerError> {
    let mut tx = db.begin().await?;
    let now = Utc::now();

    let effects: Vec<VariableEffect> = sqlx::query_as(&format!(
        "SELECT {EFFECT_COLUMNS} FROM variable_effects \
         WHERE status IN ('pending', 'failed') \
           AND (next_attempt_at IS NULL OR next_attempt_at <= $1) \
           AND (locked_until IS NULL OR locked_until <= $1) \
         ORDER BY created_at \
         LIMIT $2 \
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;

    let mut leased = Vec::with_capacity(effects.len());
    for effect in effects {
        let attempts = effect.attempts + 1;
        sqlx::query(
            "UPDATE variable_effects \
             SET status = 'in_flight', attempts = $1, locked_by = $2, locked_until = $3, \
                 updated_at = $4 \
             WHERE id = $5",
        )
        .bind(attempts)
        .bind(locked_by)
        .bind(now + Duration::seconds(LOCK_SECONDS))
        .bind(now)
        .bind(effect.id)
        .execute(&mut *tx)
        .await?;
        leased.push(VariableEffect { attempts, ..effect });
    }

    let mut summary = EffectRunSummary::default();
    for effect in &leased {
        summary.processed += 1;
        match execute_effect(&mut tx, effect).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE variable_effects \
                     SET status = 'done', error = NULL, locked_until = NULL, updated_at = $1 \
                     WHERE id = $2",
                )
                .bind(now)
                .bind(effect.id)
                .execute(&mut *tx)
                .await?;
                summary.done += 1;
            }
            Err(err) => {
                let status = if effect.attempts >= MAX_ATTEMPTS {
                    "dead"
                } else {
                    "failed"
                };
                let backoff = backoff_seconds(effect.attempts);
                sqlx::query(
                    "UPDATE variable_effects \
                     SET status = $1, error = $2, locked_until = NULL, \
                         next_attempt_at = $3, updated_at = $4 \
                     WHERE id = $5",
                )
                .bind(status)
                .bind(serde_json::json!({ "message": err.0.to_string() }))
                .bind(now + Duration::seconds(backoff))
                .bind(now)
                .bind(effect.id)
                .execute(&mut *tx)
                .await?;
                summary.failed += 1;
                tracing::warn!(
                    effect_id = %effect.id,
                    kind = %effect.kind,
                    attempts = effect.attempts,
                    %status,
                    "effect execution failed"
                );
            }
        }
    }

    tx.commit().await?;
    Ok(summary)
}

pub async fn list_effects<'e>(
    executor: impl PgExecutor<'e>,
    status: Option<&str>,
    kind: Option<&str>,
    limit: i64,
) -> Result<Vec<VariableEffect>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {EFFECT_COLUMNS} FROM variable_effects \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR kind = $2) \
         ORDER BY created_at DESC \
         LIMIT $3"
    ))
    .bind(status)
    .bind(kind)
    .bind(limit)
    .fetch_all(executor)
    .await
}

pub async fn get_effect<'e>(
    executor: impl PgExecutor<'e>,
    effect_id: EffectId,
) -> Result<Option<VariableEffect>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {EFFECT_COLUMNS} FROM variable_effects WHERE id = $1"
    ))
    .bind(effect_id)
    .fetch_optional(executor)
    .await
}
