//! Definitions, layered values, optimistic-versioned writes, audits, and
//! apply acknowledgments.
//!
//! Lock order inside a transaction: variable_definitions →
//! variable_values → variable_audits → variable_effects. The value row is
//! locked `FOR UPDATE` during read-modify-write, so version sequences per
//! target are contiguous.

use chrono::Utc;
use serde_json::Value;
use sqlx::{PgConnection, PgExecutor};

use hubex_shared::api::variable::{AppliedEntry, DefinitionCreateRequest, FailedEntry};
use hubex_shared::error::ApiError;
use hubex_shared::ids::{AuditId, DeviceId, SnapshotId, UserId};

use crate::device_state::{device_busy, pairing_active};
use crate::error::ServerError;
use crate::models::{
    Device, VariableAppliedAck, VariableAudit, VariableDefinition, VariableSnapshot, VariableValue,
    DEVICE_COLUMNS,
};
use crate::vars::coerce::{mask_if_secret, validate_against_definition};

pub const DEFINITION_COLUMNS: &str = "key, scope, value_type, default_value, description, unit, \
     min_value, max_value, enum_values, regex, is_secret, is_readonly, user_writable, \
     device_writable, allow_device_override, created_at, updated_at";

pub const VALUE_COLUMNS: &str = "id, variable_key, scope, device_id, user_id, value_json, \
     version, updated_at, updated_by_user_id, updated_by_device_id";

pub const AUDIT_COLUMNS: &str = "id, created_at, variable_key, scope, device_id, old_value_json, \
     new_value_json, old_version, new_version, actor_type, actor_user_id, actor_device_id, \
     request_id, note";

#[derive(Debug, Clone, Copy)]
pub enum WriteActor {
    User(UserId),
    Device(DeviceId),
}

#[derive(Debug)]
pub struct WriteRequest<'a> {
    pub key: &'a str,
    pub scope: &'a str,
    pub device_uid: Option<&'a str>,
    pub value: Value,
    pub expected_version: Option<i32>,
    pub actor: WriteActor,
    pub force: bool,
    pub dev_tools: bool,
}

#[derive(Debug)]
pub struct WriteOutcome {
    pub definition: VariableDefinition,
    pub value: VariableValue,
    pub device: Option<Device>,
    pub audit: VariableAudit,
}

pub async fn get_definition<'e>(
    executor: impl PgExecutor<'e>,
    key: &str,
) -> Result<Option<VariableDefinition>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {DEFINITION_COLUMNS} FROM variable_definitions WHERE key = $1"
    ))
    .bind(key)
    .fetch_optional(executor)
    .await
}

pub async fn list_definitions<'e>(
    executor: impl PgExecutor<'e>,
    scope: Option<&str>,
) -> Result<Vec<VariableDefinition>, sqlx::Error> {
    match scope {
        Some(scope) => {
            sqlx::query_as(&format!(
                "SELECT {DEFINITION_COLUMNS} FROM variable_definitions \
                 WHERE scope = $1 ORDER BY key"
            ))
            .bind(scope)
            .fetch_all(executor)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {DEFINITION_COLUMNS} FROM variable_definitions ORDER BY key"
            ))
            .fetch_all(executor)
            .await
        }
    }
}

const SCOPES: &[&str] = &["global", "user", "device"];
const VALUE_TYPES: &[&str] = &["string", "int", "float", "bool", "json"];

/// Create a definition. The default value, when given, must satisfy the
/// definition's own type and constraints.
pub async fn create_definition(
    tx: &mut PgConnection,
    req: &DefinitionCreateRequest,
) -> Result<VariableDefinition, ServerError> {
    if !SCOPES.contains(&req.scope.as_str()) {
        return Err(ApiError::unprocessable("VAR_INVALID_SCOPE", "invalid scope").into());
    }
    if !VALUE_TYPES.contains(&req.value_type.as_str()) {
        return Err(
            ApiError::unprocessable("VAR_INVALID_TYPE", "unsupported value type").into(),
        );
    }
    if get_definition(&mut *tx, &req.key).await?.is_some() {
        return Err(ApiError::conflict(
            "VAR_DEF_EXISTS",
            "variable definition already exists",
        )
        .into());
    }

    let now = Utc::now();
    let probe = VariableDefinition {
        key: req.key.clone(),
        scope: req.scope.clone(),
        value_type: req.value_type.clone(),
        default_value: None,
        description: req.description.clone(),
        unit: req.unit.clone(),
        min_value: req.min_value,
        max_value: req.max_value,
        enum_values: req.enum_values.clone().map(Value::from),
        regex: req.regex.clone(),
        is_secret: req.is_secret,
        is_readonly: req.is_readonly,
        user_writable: req.user_writable,
        device_writable: req.device_writable,
        allow_device_override: req.allow_device_override,
        created_at: now,
        updated_at: now,
    };
    let default_value = match &req.default_value {
        Some(value) if !value.is_null() => Some(validate_against_definition(&probe, value)?),
        _ => None,
    };

    let definition: VariableDefinition = sqlx::query_as(&format!(
        "INSERT INTO variable_definitions \
             (key, scope, value_type, default_value, description, unit, min_value, max_value, \
              enum_values, regex, is_secret, is_readonly, user_writable, device_writable, \
              allow_device_override) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         RETURNING {DEFINITION_COLUMNS}"
    ))
    .bind(&req.key)
    .bind(&req.scope)
    .bind(&req.value_type)
    .bind(&default_value)
    .bind(&req.description)
    .bind(&req.unit)
    .bind(req.min_value)
    .bind(req.max_value)
    .bind(req.enum_values.clone().map(Value::from))
    .bind(&req.regex)
    .bind(req.is_secret)
    .bind(req.is_readonly)
    .bind(req.user_writable)
    .bind(req.device_writable)
    .bind(req.allow_device_override)
    .fetch_one(&mut *tx)
    .await?;

    Ok(definition)
}

/// Device lookup for variable reads: unknown is 404, never-seen is 404.
pub async fn resolve_device<'e>(
    executor: impl PgExecutor<'e>,
    device_uid: &str,
) -> Result<Device, ServerError> {
    let device: Option<Device> = sqlx::query_as(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_uid = $1"
    ))
    .bind(device_uid)
    .fetch_optional(executor)
    .await?;
    let device = device
        .ok_or_else(|| ServerError(ApiError::not_found("DEVICE_NOT_FOUND", "device not found")))?;
    if device.last_seen_at.is_none() {
        return Err(
            ApiError::not_found("DEVICE_NOT_PROVISIONED", "device not provisioned").into(),
        );
    }
    Ok(device)
}

/// Device lookup for variable writes: never-seen is a conflict, since the
/// write is valid once the device checks in.
pub async fn resolve_device_for_vars<'e>(
    executor: impl PgExecutor<'e>,
    device_uid: &str,
) -> Result<Device, ServerError> {
    let device: Option<Device> = sqlx::query_as(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_uid = $1"
    ))
    .bind(device_uid)
    .fetch_optional(executor)
    .await?;
    let device = device
        .ok_or_else(|| ServerError(ApiError::not_found("DEVICE_NOT_FOUND", "device not found")))?;
    if device.last_seen_at.is_none() {
        return Err(ApiError::conflict(
            "VAR_DEVICE_NOT_PROVISIONED",
            "device not provisioned",
        )
        .into());
    }
    Ok(device)
}

async fn fetch_value<'e>(
    executor: impl PgExecutor<'e>,
    key: &str,
    scope: &str,
    device_id: Option<DeviceId>,
    user_id: Option<UserId>,
    for_update: bool,
) -> Result<Option<VariableValue>, sqlx::Error> {
    let suffix = if for_update { " FOR UPDATE" } else { "" };
    sqlx::query_as(&format!(
        "SELECT {VALUE_COLUMNS} FROM variable_values \
         WHERE variable_key = $1 AND scope = $2 \
           AND device_id IS NOT DISTINCT FROM $3 \
           AND user_id IS NOT DISTINCT FROM $4{suffix}"
    ))
    .bind(key)
    .bind(scope)
    .bind(device_id)
    .bind(user_id)
    .fetch_optional(executor)
    .await
}

/// Read one value row under the definition's scope rules. Returns the
/// definition, the stored row if any, and the device for device scope.
pub async fn get_value(
    conn: &mut PgConnection,
    key: &str,
    scope: &str,
    device_uid: Option<&str>,
    user_id: UserId,
) -> Result<(VariableDefinition, Option<VariableValue>, Option<Device>), ServerError> {
    let definition = get_definition(&mut *conn, key)
        .await?
        .ok_or_else(|| {
            ServerError(ApiError::not_found(
                "VAR_DEF_NOT_FOUND",
                "variable definition not found",
            ))
        })?;
    if definition.scope != scope {
        return Err(ApiError::conflict("VAR_SCOPE_MISMATCH", "scope mismatch").into());
    }

    let mut device = None;
    let mut device_id = None;
    let mut target_user = None;
    match scope {
        "device" => {
            let uid = device_uid.ok_or_else(|| {
                ServerError(ApiError::unprocessable(
                    "VAR_DEVICE_UID_REQUIRED",
                    "device_uid required",
                ))
            })?;
            let resolved = resolve_device(&mut *conn, uid).await?;
            device_id = Some(resolved.id);
            device = Some(resolved);
        }
        "user" => {
            target_user = Some(user_id);
        }
        _ => {
            if device_uid.is_some() {
                return Err(ApiError::conflict(
                    "VAR_SCOPE_MISMATCH",
                    "device_uid not allowed for global scope",
                )
                .into());
            }
        }
    }

    let value = fetch_value(&mut *conn, key, scope, device_id, target_user, false).await?;
    Ok((definition, value, device))
}

/// The write engine: policy checks, optimistic concurrency, the
/// version bump, and the audit row, all against a locked value row.
/// Runs inside the caller's transaction; the caller derives effects and
/// invalidates the snapshot cache after a successful return.
pub async fn write_value(
    tx: &mut PgConnection,
    req: WriteRequest<'_>,
) -> Result<WriteOutcome, ServerError> {
    let definition = get_definition(&mut *tx, req.key)
        .await?
        .ok_or_else(|| {
            ServerError(ApiError::not_found(
                "VAR_DEF_NOT_FOUND",
                "variable definition not found",
            ))
        })?;
    if definition.scope != req.scope {
        return Err(ApiError::conflict("VAR_SCOPE_MISMATCH", "scope mismatch").into());
    }
    if definition.is_readonly {
        return Err(ApiError::conflict("VAR_READONLY", "variable is read-only").into());
    }

    let (actor_user, actor_device) = match req.actor {
        WriteActor::User(id) => (Some(id), None),
        WriteActor::Device(id) => (None, Some(id)),
    };

    if matches!(req.scope, "user" | "global") && actor_user.is_none() {
        return Err(ApiError::forbidden(
            "VAR_NOT_ALLOWED",
            format!("{} scope requires user auth", req.scope),
        )
        .into());
    }
    if actor_user.is_some() && !definition.user_writable {
        return Err(
            ApiError::forbidden("VAR_NOT_ALLOWED", "variable not user writable").into(),
        );
    }
    if actor_device.is_some() && !definition.device_writable {
        return Err(
            ApiError::forbidden("VAR_NOT_ALLOWED", "variable not device writable").into(),
        );
    }

    let now = Utc::now();
    let mut device = None;
    let mut device_id = None;
    let mut user_id = None;
    match req.scope {
        "device" => {
            let uid = req.device_uid.ok_or_else(|| {
                ServerError(ApiError::unprocessable(
                    "VAR_DEVICE_UID_REQUIRED",
                    "device_uid required",
                ))
            })?;
            let resolved = resolve_device_for_vars(&mut *tx, uid).await?;
            if !definition.allow_device_override {
                return Err(ApiError::conflict(
                    "VAR_NOT_ALLOWED",
                    "device override not allowed",
                )
                .into());
            }
            if let Some(actor_id) = actor_device {
                if resolved.id != actor_id {
                    return Err(
                        ApiError::forbidden("VAR_NOT_ALLOWED", "device token mismatch").into(),
                    );
                }
            }
            if resolved.owner_user_id.is_none() && !req.dev_tools {
                return Err(
                    ApiError::forbidden("VAR_NOT_ALLOWED", "device not claimed").into(),
                );
            }
            if let (Some(owner), Some(actor_id)) = (resolved.owner_user_id, actor_user) {
                if owner != actor_id {
                    return Err(
                        ApiError::not_found("DEVICE_NOT_OWNED", "device not owned").into(),
                    );
                }
            }
            if !req.force {
                if device_busy(&mut *tx, resolved.id, now).await? {
                    return Err(ApiError::conflict("VAR_DEVICE_BUSY", "device busy").into());
                }
                if pairing_active(&mut *tx, &resolved.device_uid, now).await? {
                    return Err(ApiError::conflict(
                        "VAR_DEVICE_PAIRING_ACTIVE",
                        "pairing active",
                    )
                    .into());
                }
            }
            device_id = Some(resolved.id);
            device = Some(resolved);
        }
        "user" => {
            user_id = actor_user;
        }
        "global" => {
            if req.device_uid.is_some() {
                return Err(ApiError::conflict(
                    "VAR_SCOPE_MISMATCH",
                    "device_uid not allowed for global scope",
                )
                .into());
            }
        }
        _ => {
            return Err(ApiError::conflict("VAR_SCOPE_MISMATCH", "scope mismatch").into());
        }
    }

    let current = fetch_value(&mut *tx, req.key, req.scope, device_id, user_id, true).await?;
    let current_version = current.as_ref().map(|v| v.version);

    if req.expected_version.is_some() && req.expected_version != current_version {
        return Err(ApiError::conflict(
            "VAR_VERSION_CONFLICT",
            "variable version conflict",
        )
        .with_meta(serde_json::json!({ "current_version": current_version }))
        .into());
    }

    let coerced = validate_against_definition(&definition, &req.value)?;

    let old_value = current.as_ref().and_then(|v| v.value_json.clone());
    let old_version = current_version;

    let value: VariableValue = match current {
        None => {
            sqlx::query_as(&format!(
                "INSERT INTO variable_values \
                     (id, variable_key, scope, device_id, user_id, value_json, version, \
                      updated_at, updated_by_user_id, updated_by_device_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $8, $9) \
                 RETURNING {VALUE_COLUMNS}"
            ))
            .bind(uuid::Uuid::now_v7())
            .bind(req.key)
            .bind(req.scope)
            .bind(device_id)
            .bind(user_id)
            .bind(&coerced)
            .bind(now)
            .bind(actor_user)
            .bind(actor_device)
            .fetch_one(&mut *tx)
            .await?
        }
        Some(existing) => {
            sqlx::query_as(&format!(
                "UPDATE variable_values \
                 SET value_json = $1, version = version + 1, updated_at = $2, \
                     updated_by_user_id = $3, updated_by_device_id = $4 \
                 WHERE id = $5 \
                 RETURNING {VALUE_COLUMNS}"
            ))
            .bind(&coerced)
            .bind(now)
            .bind(actor_user)
            .bind(actor_device)
            .bind(existing.id)
            .fetch_one(&mut *tx)
            .await?
        }
    };

    let masked_old = mask_if_secret(&definition, old_value);
    let masked_new = mask_if_secret(&definition, Some(coerced));
    let actor_type = if actor_user.is_some() { "user" } else { "device" };
    let audit: VariableAudit = sqlx::query_as(&format!(
        "INSERT INTO variable_audits \
             (id, variable_key, scope, device_id, old_value_json, new_value_json, \
              old_version, new_version, actor_type, actor_user_id, actor_device_id, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         RETURNING {AUDIT_COLUMNS}"
    ))
    .bind(AuditId::new())
    .bind(req.key)
    .bind(req.scope)
    .bind(device_id)
    .bind(masked_old)
    .bind(masked_new)
    .bind(old_version)
    .bind(value.version)
    .bind(actor_type)
    .bind(actor_user)
    .bind(actor_device)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    Ok(WriteOutcome {
        definition,
        value,
        device,
        audit,
    })
}

/// Audit row plus the resolved device uid for the view layer.
#[derive(Debug, sqlx::FromRow)]
pub struct AuditRow {
    #[sqlx(flatten)]
    pub audit: VariableAudit,
    pub device_uid: Option<String>,
}

pub async fn list_audit<'e>(
    executor: impl PgExecutor<'e>,
    key: &str,
    scope: Option<&str>,
    device_id: Option<DeviceId>,
    limit: i64,
    offset: i64,
) -> Result<Vec<AuditRow>, sqlx::Error> {
    sqlx::query_as(
        "SELECT a.id, a.created_at, a.variable_key, a.scope, a.device_id, a.old_value_json, \
                a.new_value_json, a.old_version, a.new_version, a.actor_type, a.actor_user_id, \
                a.actor_device_id, a.request_id, a.note, d.device_uid \
         FROM variable_audits a \
         LEFT JOIN devices d ON d.id = a.device_id \
         WHERE a.variable_key = $1 \
           AND ($2::text IS NULL OR a.scope = $2) \
           AND ($3::uuid IS NULL OR a.device_id = $3) \
         ORDER BY a.created_at DESC \
         LIMIT $4 OFFSET $5",
    )
    .bind(key)
    .bind(scope)
    .bind(device_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(executor)
    .await
}

pub async fn fetch_snapshot<'e>(
    executor: impl PgExecutor<'e>,
    snapshot_id: &SnapshotId,
) -> Result<Option<VariableSnapshot>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, device_id, user_id, resolved_at, effective_version, effective_rev \
         FROM variable_snapshots WHERE id = $1",
    )
    .bind(snapshot_id)
    .fetch_optional(executor)
    .await
}

#[derive(Debug)]
pub struct AckCounts {
    pub applied: i64,
    pub failed: i64,
}

/// Record device-side apply results against a snapshot. Every entry must
/// name an item of the snapshot; duplicates are silently ignored via the
/// unique key and do not count. Once every non-secret item carries an
/// ack, the device rev watermarks advance to the snapshot's rev.
pub async fn record_applied(
    tx: &mut PgConnection,
    snapshot_id: &SnapshotId,
    device_id: DeviceId,
    applied: &[AppliedEntry],
    failed: &[FailedEntry],
) -> Result<AckCounts, ServerError> {
    let snapshot = fetch_snapshot(&mut *tx, snapshot_id)
        .await?
        .ok_or_else(|| {
            ServerError(ApiError::not_found(
                "VAR_SNAPSHOT_NOT_FOUND",
                "snapshot not found",
            ))
        })?;
    if snapshot.device_id != Some(device_id) {
        return Err(ApiError::forbidden("VAR_NOT_ALLOWED", "snapshot device mismatch").into());
    }

    let items: Vec<(String, Option<i32>)> = sqlx::query_as(
        "SELECT variable_key, version FROM variable_snapshot_items WHERE snapshot_id = $1",
    )
    .bind(snapshot_id)
    .fetch_all(&mut *tx)
    .await?;
    let known: std::collections::HashSet<(String, Option<i32>)> = items.into_iter().collect();

    let mut counts = AckCounts {
        applied: 0,
        failed: 0,
    };

    for entry in applied {
        if !known.contains(&(entry.key.clone(), entry.version)) {
            return Err(ApiError::conflict(
                "VAR_APPLIED_MISMATCH",
                "entry does not match snapshot item",
            )
            .with_meta(serde_json::json!({ "key": entry.key, "version": entry.version }))
            .into());
        }
        counts.applied += insert_ack(
            &mut *tx,
            snapshot_id,
            device_id,
            &entry.key,
            entry.version,
            "applied",
            None,
        )
        .await?;
    }
    for entry in failed {
        if !known.contains(&(entry.key.clone(), entry.version)) {
            return Err(ApiError::conflict(
                "VAR_APPLIED_MISMATCH",
                "entry does not match snapshot item",
            )
            .with_meta(serde_json::json!({ "key": entry.key, "version": entry.version }))
            .into());
        }
        counts.failed += insert_ack(
            &mut *tx,
            snapshot_id,
            device_id,
            &entry.key,
            entry.version,
            "failed",
            entry.reason.as_deref(),
        )
        .await?;
    }

    if let Some(rev) = snapshot.effective_rev {
        advance_rev_watermarks(&mut *tx, &snapshot, device_id, rev).await?;
    }

    Ok(counts)
}

async fn insert_ack(
    tx: &mut PgConnection,
    snapshot_id: &SnapshotId,
    device_id: DeviceId,
    key: &str,
    version: Option<i32>,
    status: &str,
    reason: Option<&str>,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO variable_applied_acks \
             (id, snapshot_id, device_id, variable_key, version, status, reason) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT ON CONSTRAINT uq_variable_applied_ack DO NOTHING",
    )
    .bind(uuid::Uuid::now_v7())
    .bind(snapshot_id)
    .bind(device_id)
    .bind(key)
    .bind(version)
    .bind(status)
    .bind(reason)
    .execute(tx)
    .await?;
    Ok(result.rows_affected() as i64)
}

async fn advance_rev_watermarks(
    tx: &mut PgConnection,
    snapshot: &VariableSnapshot,
    device_id: DeviceId,
    rev: i64,
) -> Result<(), sqlx::Error> {
    let unacked: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM variable_snapshot_items i \
         WHERE i.snapshot_id = $1 AND i.is_secret = false \
           AND NOT EXISTS ( \
               SELECT 1 FROM variable_applied_acks a \
               WHERE a.snapshot_id = i.snapshot_id AND a.device_id = $2 \
                 AND a.variable_key = i.variable_key \
                 AND a.version IS NOT DISTINCT FROM i.version)",
    )
    .bind(&snapshot.id)
    .bind(device_id)
    .fetch_one(&mut *tx)
    .await?;
    if unacked > 0 {
        return Ok(());
    }

    let failed: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM variable_applied_acks \
         WHERE snapshot_id = $1 AND device_id = $2 AND status = 'failed'",
    )
    .bind(&snapshot.id)
    .bind(device_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO device_runtime_settings (device_id, last_acked_rev, updated_at) \
         VALUES ($1, $2, now()) \
         ON CONFLICT (device_id) DO UPDATE \
         SET last_acked_rev = GREATEST(COALESCE(device_runtime_settings.last_acked_rev, 0), $2), \
             updated_at = now()",
    )
    .bind(device_id)
    .bind(rev)
    .execute(&mut *tx)
    .await?;

    if failed == 0 {
        sqlx::query(
            "UPDATE device_runtime_settings \
             SET last_applied_rev = GREATEST(COALESCE(last_applied_rev, 0), $2), \
                 updated_at = now() \
             WHERE device_id = $1",
        )
        .bind(device_id)
        .bind(rev)
        .execute(&mut *tx)
        .await?;
    }

    Ok(())
}

pub async fn list_applied_acks<'e>(
    executor: impl PgExecutor<'e>,
    device_id: DeviceId,
    limit: i64,
) -> Result<Vec<VariableAppliedAck>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, snapshot_id, device_id, variable_key, version, status, reason, created_at \
         FROM variable_applied_acks \
         WHERE device_id = $1 \
         ORDER BY created_at DESC \
         LIMIT $2",
    )
    .bind(device_id)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// All values stored at one scope, keyed by variable key.
pub async fn value_map<'e>(
    executor: impl PgExecutor<'e>,
    scope: &str,
    device_id: Option<DeviceId>,
    user_id: Option<UserId>,
) -> Result<std::collections::HashMap<String, VariableValue>, sqlx::Error> {
    let rows: Vec<VariableValue> = sqlx::query_as(&format!(
        "SELECT {VALUE_COLUMNS} FROM variable_values \
         WHERE scope = $1 \
           AND device_id IS NOT DISTINCT FROM $2 \
           AND user_id IS NOT DISTINCT FROM $3"
    ))
    .bind(scope)
    .bind(device_id)
    .bind(user_id)
    .fetch_all(executor)
    .await?;
    Ok(rows
        .into_iter()
        .map(|v| (v.variable_key.clone(), v))
        .collect())
}

/// Everything the layered resolver needs for one (device, user) pair:
/// all definitions plus the global, device, and user value maps.
pub struct EffectiveInputs {
    pub definitions: Vec<VariableDefinition>,
    pub global_values: std::collections::HashMap<String, VariableValue>,
    pub device_values: std::collections::HashMap<String, VariableValue>,
    pub user_values: std::collections::HashMap<String, VariableValue>,
}

pub async fn load_effective_inputs(
    conn: &mut PgConnection,
    device_id: DeviceId,
    user_id: UserId,
) -> Result<EffectiveInputs, sqlx::Error> {
    let definitions = list_definitions(&mut *conn, None).await?;
    let global_values = value_map(&mut *conn, "global", None, None).await?;
    let device_values = value_map(&mut *conn, "device", Some(device_id), None).await?;
    let user_values = value_map(&mut *conn, "user", None, Some(user_id)).await?;
    Ok(EffectiveInputs {
        definitions,
        global_values,
        device_values,
        user_values,
    })
}
