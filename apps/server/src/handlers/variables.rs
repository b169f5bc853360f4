use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use hubex_shared::api::variable::{
    AppliedAckView, AppliedRequest, AppliedResponse, AuditView, DefinitionCreateRequest,
    DefinitionView, EffectRunRequest, EffectRunResponse, EffectView, EffectiveResponse,
    SetValueRequest, SnapshotResponse, ValueView, ValueWriteRequest, DeviceVariablesResponse,
};
use hubex_shared::error::ApiError;
use hubex_shared::ids::{DeviceId, EffectId, UserId};

use crate::error::ServerError;
use crate::extractors::auth::{AuthUser, Principal};
use crate::models::{Device, VariableDefinition, VariableEffect, DEVICE_COLUMNS};
use crate::state::AppState;
use crate::vars::coerce::{effective_value, mask_if_secret};
use crate::vars::effects::{
    derive_effects_from_change, enqueue_effects, get_effect, list_effects, run_effects_once,
};
use crate::vars::snapshot::{compute_effective, resolve_effective_snapshot};
use crate::vars::store::{self, value_map, write_value, WriteActor, WriteOutcome, WriteRequest};

fn require_dev_tools(state: &AppState) -> Result<(), ServerError> {
    if !state.config.dev_tools {
        return Err(ApiError::forbidden("DEV_TOOLS_DISABLED", "dev tools disabled").into());
    }
    Ok(())
}

fn definition_view(def: VariableDefinition) -> DefinitionView {
    let enum_values = def.enum_list();
    DefinitionView {
        key: def.key,
        scope: def.scope,
        value_type: def.value_type,
        default_value: def.default_value,
        description: def.description,
        unit: def.unit,
        min_value: def.min_value,
        max_value: def.max_value,
        enum_values,
        regex: def.regex,
        is_secret: def.is_secret,
        is_readonly: def.is_readonly,
        user_writable: def.user_writable,
        device_writable: def.device_writable,
        allow_device_override: def.allow_device_override,
        created_at: def.created_at,
        updated_at: def.updated_at,
    }
}

// ─── Definitions ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ScopeQuery {
    pub scope: Option<String>,
}

pub async fn list_definitions(
    State(state): State<AppState>,
    Query(query): Query<ScopeQuery>,
    _user: AuthUser,
) -> Result<Json<Vec<DefinitionView>>, ServerError> {
    let definitions = store::list_definitions(&state.db, query.scope.as_deref()).await?;
    Ok(Json(definitions.into_iter().map(definition_view).collect()))
}

pub async fn create_definition(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(req): Json<DefinitionCreateRequest>,
) -> Result<Json<DefinitionView>, ServerError> {
    require_dev_tools(&state)?;
    if req.key.len() < 3 || req.key.len() > 128 {
        return Err(ApiError::unprocessable(
            "VALIDATION_ERROR",
            "key must be 3-128 characters",
        )
        .into());
    }

    let mut tx = state.db.begin().await?;
    let definition = store::create_definition(&mut tx, &req).await?;
    tx.commit().await?;
    state.snapshot_cache.invalidate_all();
    Ok(Json(definition_view(definition)))
}

// ─── Values ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ValueQuery {
    pub key: String,
    pub scope: String,
    #[serde(alias = "deviceUid")]
    pub device_uid: Option<String>,
}

pub async fn get_value(
    State(state): State<AppState>,
    Query(query): Query<ValueQuery>,
    user: AuthUser,
) -> Result<Json<ValueView>, ServerError> {
    let mut conn = state.db.acquire().await?;
    let (definition, value, _device) = store::get_value(
        &mut conn,
        &query.key,
        &query.scope,
        query.device_uid.as_deref(),
        user.user_id,
    )
    .await?;

    let effective = effective_value(&definition, value.as_ref().and_then(|v| v.value_json.as_ref()));
    let masked = mask_if_secret(&definition, effective);
    Ok(Json(ValueView {
        key: definition.key,
        scope: definition.scope,
        device_uid: query.device_uid,
        value: masked,
        version: value.as_ref().map(|v| v.version),
        updated_at: value.as_ref().map(|v| v.updated_at),
        is_secret: definition.is_secret,
    }))
}

/// Run the write engine in one transaction, derive and enqueue effects
/// from the committed audit, and invalidate the snapshot cache.
async fn perform_write(
    state: &AppState,
    req: WriteRequest<'_>,
) -> Result<WriteOutcome, ServerError> {
    let mut tx = state.db.begin().await?;
    let outcome = write_value(&mut tx, req).await?;
    if let Some(device) = &outcome.device {
        let specs = derive_effects_from_change(
            &outcome.definition,
            Some(device),
            outcome.value.value_json.as_ref(),
        );
        if !specs.is_empty() {
            enqueue_effects(&mut tx, &specs, &outcome.audit, device).await?;
        }
    }
    tx.commit().await?;
    state.snapshot_cache.invalidate_all();
    Ok(outcome)
}

fn value_view_from_outcome(outcome: &WriteOutcome, device_uid: Option<String>) -> ValueView {
    let masked = mask_if_secret(&outcome.definition, outcome.value.value_json.clone());
    ValueView {
        key: outcome.definition.key.clone(),
        scope: outcome.definition.scope.clone(),
        device_uid,
        value: masked,
        version: Some(outcome.value.version),
        updated_at: Some(outcome.value.updated_at),
        is_secret: outcome.definition.is_secret,
    }
}

pub async fn put_value(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ValueWriteRequest>,
) -> Result<Json<ValueView>, ServerError> {
    let outcome = perform_write(
        &state,
        WriteRequest {
            key: &req.key,
            scope: &req.scope,
            device_uid: req.device_uid.as_deref(),
            value: req.value,
            expected_version: req.expected_version,
            actor: WriteActor::User(user.user_id),
            force: false,
            dev_tools: state.config.dev_tools,
        },
    )
    .await?;
    Ok(Json(value_view_from_outcome(&outcome, req.device_uid)))
}

pub async fn set_value(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<SetValueRequest>,
) -> Result<Json<ValueView>, ServerError> {
    let actor = match &principal {
        Principal::User(user) => WriteActor::User(user.user_id),
        Principal::Device(device) => WriteActor::Device(device.id),
    };
    let outcome = perform_write(
        &state,
        WriteRequest {
            key: &req.key,
            scope: &req.scope,
            device_uid: req.device_uid.as_deref(),
            value: req.value,
            expected_version: req.expected_version,
            actor,
            force: req.force,
            dev_tools: state.config.dev_tools,
        },
    )
    .await?;
    Ok(Json(value_view_from_outcome(&outcome, req.device_uid)))
}

// ─── Per-device listing ──────────────────────────────────────

pub async fn list_device_variables(
    State(state): State<AppState>,
    Path(device_uid): Path<String>,
    _user: AuthUser,
) -> Result<Json<DeviceVariablesResponse>, ServerError> {
    let mut conn = state.db.acquire().await?;
    let device = store::resolve_device(&mut *conn, &device_uid).await?;
    let definitions = store::list_definitions(&mut *conn, None).await?;
    let global_values = value_map(&mut *conn, "global", None, None).await?;
    let device_values = value_map(&mut *conn, "device", Some(device.id), None).await?;

    let mut globals = vec![];
    let mut device_out = vec![];
    for definition in definitions {
        let (stored, bucket, uid) = match definition.scope.as_str() {
            "global" => (global_values.get(&definition.key), &mut globals, None),
            "device" => (
                device_values.get(&definition.key),
                &mut device_out,
                Some(device_uid.clone()),
            ),
            _ => continue,
        };
        let effective =
            effective_value(&definition, stored.and_then(|v| v.value_json.as_ref()));
        bucket.push(ValueView {
            key: definition.key.clone(),
            scope: definition.scope.clone(),
            device_uid: uid,
            value: mask_if_secret(&definition, effective),
            version: stored.map(|v| v.version),
            updated_at: stored.map(|v| v.updated_at),
            is_secret: definition.is_secret,
        });
    }

    Ok(Json(DeviceVariablesResponse {
        device_uid,
        globals,
        device: device_out,
    }))
}

// ─── Effective view & snapshots ──────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EffectiveQuery {
    #[serde(alias = "deviceUid")]
    pub device_uid: Option<String>,
    #[serde(default, alias = "includeSecrets")]
    pub include_secrets: bool,
}

async fn owned_device_by_uid(
    state: &AppState,
    device_uid: &str,
    user_id: UserId,
) -> Result<Device, ServerError> {
    let device: Option<Device> = sqlx::query_as(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_uid = $1"
    ))
    .bind(device_uid)
    .fetch_optional(&state.db)
    .await?;
    let device = device.ok_or_else(|| {
        ServerError(ApiError::not_found("DEVICE_UNKNOWN_UID", "unknown device UID"))
    })?;
    if device.owner_user_id != Some(user_id) {
        return Err(ApiError::not_found("DEVICE_NOT_OWNED", "device not owned").into());
    }
    Ok(device)
}

pub async fn effective(
    State(state): State<AppState>,
    Query(query): Query<EffectiveQuery>,
    user: AuthUser,
) -> Result<Json<EffectiveResponse>, ServerError> {
    let device_uid = query.device_uid.as_deref().ok_or_else(|| {
        ServerError(ApiError::unprocessable(
            "VAR_DEVICE_UID_REQUIRED",
            "deviceUid required",
        ))
    })?;
    let device = owned_device_by_uid(&state, device_uid, user.user_id).await?;

    let mut conn = state.db.acquire().await?;
    let (computed_at, effective_version, items) = compute_effective(
        &mut conn,
        device.id,
        user.user_id,
        query.include_secrets,
    )
    .await?;

    Ok(Json(EffectiveResponse {
        device_uid: device.device_uid,
        computed_at,
        effective_version,
        items,
    }))
}

pub async fn snapshot(
    State(state): State<AppState>,
    Query(query): Query<EffectiveQuery>,
    principal: Principal,
) -> Result<Json<SnapshotResponse>, ServerError> {
    let (device, user_id, include_secrets) = match principal {
        Principal::User(user) => {
            let device_uid = query.device_uid.as_deref().ok_or_else(|| {
                ServerError(ApiError::unprocessable(
                    "VAR_DEVICE_UID_REQUIRED",
                    "deviceUid required",
                ))
            })?;
            let device = owned_device_by_uid(&state, device_uid, user.user_id).await?;
            (device, user.user_id, query.include_secrets)
        }
        Principal::Device(device) => {
            if query
                .device_uid
                .as_deref()
                .is_some_and(|uid| uid != device.device_uid)
            {
                return Err(
                    ApiError::forbidden("VAR_NOT_ALLOWED", "device uid mismatch").into(),
                );
            }
            // The device extractor guarantees a claimed device. Devices
            // never see secret plaintext.
            let owner = device.owner_user_id.ok_or_else(|| {
                ServerError(ApiError::unauthorized("AUTH_DEVICE_UNCLAIMED", "device unclaimed"))
            })?;
            (device, owner, false)
        }
    };

    let resolved = resolve_effective_snapshot(
        &state.db,
        &state.snapshot_cache,
        &device,
        user_id,
        include_secrets,
    )
    .await?;

    Ok(Json(SnapshotResponse {
        snapshot_id: resolved.snapshot_id,
        device_uid: device.device_uid,
        resolved_at: resolved.resolved_at,
        effective_version: resolved.effective_version,
        effective_rev: resolved.effective_rev,
        items: resolved.items,
    }))
}

// ─── Apply acknowledgments ───────────────────────────────────

pub async fn applied(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<AppliedRequest>,
) -> Result<Json<AppliedResponse>, ServerError> {
    let device = match principal {
        Principal::Device(device) => {
            if req
                .device_uid
                .as_deref()
                .is_some_and(|uid| uid != device.device_uid)
            {
                return Err(
                    ApiError::conflict("VAR_NOT_ALLOWED", "device uid mismatch").into(),
                );
            }
            device
        }
        Principal::User(user) => {
            // A user acks on behalf of a device it owns; the snapshot
            // names the device.
            let snapshot = store::fetch_snapshot(&state.db, &req.snapshot_id)
                .await?
                .ok_or_else(|| {
                    ServerError(ApiError::not_found(
                        "VAR_SNAPSHOT_NOT_FOUND",
                        "snapshot not found",
                    ))
                })?;
            let device_id = snapshot.device_id.ok_or_else(|| {
                ServerError(ApiError::conflict(
                    "VAR_NOT_ALLOWED",
                    "snapshot has no device",
                ))
            })?;
            let device: Option<Device> = sqlx::query_as(&format!(
                "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1 AND owner_user_id = $2"
            ))
            .bind(device_id)
            .bind(user.user_id)
            .fetch_optional(&state.db)
            .await?;
            device.ok_or_else(|| {
                ServerError(ApiError::not_found("DEVICE_NOT_OWNED", "device not owned"))
            })?
        }
    };

    let mut tx = state.db.begin().await?;
    let counts =
        store::record_applied(&mut tx, &req.snapshot_id, device.id, &req.applied, &req.failed)
            .await?;
    tx.commit().await?;

    Ok(Json(AppliedResponse {
        applied: counts.applied,
        failed: counts.failed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AppliedListQuery {
    #[serde(alias = "deviceUid")]
    pub device_uid: String,
    pub limit: Option<i64>,
}

pub async fn list_applied(
    State(state): State<AppState>,
    Query(query): Query<AppliedListQuery>,
    _user: AuthUser,
) -> Result<Json<Vec<AppliedAckView>>, ServerError> {
    let mut conn = state.db.acquire().await?;
    let device = store::resolve_device(&mut *conn, &query.device_uid).await?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let acks = store::list_applied_acks(&mut *conn, device.id, limit).await?;
    Ok(Json(
        acks.into_iter()
            .map(|ack| AppliedAckView {
                snapshot_id: ack.snapshot_id,
                key: ack.variable_key,
                version: ack.version,
                status: ack.status,
                reason: ack.reason,
                created_at: ack.created_at,
            })
            .collect(),
    ))
}

// ─── Audit trail ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub key: String,
    pub scope: Option<String>,
    #[serde(alias = "deviceUid")]
    pub device_uid: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
    _user: AuthUser,
) -> Result<Json<Vec<AuditView>>, ServerError> {
    let device_id: Option<DeviceId> = match query.device_uid.as_deref() {
        Some(uid) => {
            let found: Option<DeviceId> =
                sqlx::query_scalar("SELECT id FROM devices WHERE device_uid = $1")
                    .bind(uid)
                    .fetch_optional(&state.db)
                    .await?;
            Some(found.ok_or_else(|| {
                ServerError(ApiError::not_found("DEVICE_NOT_FOUND", "device not found"))
            })?)
        }
        None => None,
    };

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);
    let rows = store::list_audit(
        &state.db,
        &query.key,
        query.scope.as_deref(),
        device_id,
        limit,
        offset,
    )
    .await?;

    Ok(Json(
        rows.into_iter()
            .map(|row| AuditView {
                variable_key: row.audit.variable_key,
                scope: row.audit.scope,
                device_uid: row.device_uid,
                old_value: row.audit.old_value_json,
                new_value: row.audit.new_value_json,
                old_version: row.audit.old_version,
                new_version: row.audit.new_version,
                actor_type: row.audit.actor_type,
                actor_user_id: row.audit.actor_user_id,
                actor_device_id: row.audit.actor_device_id,
                created_at: row.audit.created_at,
            })
            .collect(),
    ))
}

// ─── Effects ─────────────────────────────────────────────────

fn effect_view(effect: VariableEffect) -> EffectView {
    EffectView {
        id: effect.id,
        status: effect.status,
        kind: effect.kind,
        scope: effect.scope,
        device_uid: effect.device_uid,
        trigger_audit_id: effect.trigger_audit_id,
        payload: effect.payload,
        error: effect.error,
        attempts: effect.attempts,
        next_attempt_at: effect.next_attempt_at,
        correlation_id: effect.correlation_id,
        created_at: effect.created_at,
    }
}

#[derive(Debug, Deserialize)]
pub struct EffectListQuery {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<i64>,
}

pub async fn effects_list(
    State(state): State<AppState>,
    Query(query): Query<EffectListQuery>,
    _user: AuthUser,
) -> Result<Json<Vec<EffectView>>, ServerError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let effects = list_effects(
        &state.db,
        query.status.as_deref(),
        query.kind.as_deref(),
        limit,
    )
    .await?;
    Ok(Json(effects.into_iter().map(effect_view).collect()))
}

pub async fn effects_get(
    State(state): State<AppState>,
    Path(effect_id): Path<EffectId>,
    _user: AuthUser,
) -> Result<Json<EffectView>, ServerError> {
    let effect = get_effect(&state.db, effect_id)
        .await?
        .ok_or_else(|| ServerError(ApiError::not_found("EFFECT_NOT_FOUND", "effect not found")))?;
    Ok(Json(effect_view(effect)))
}

pub async fn effects_run_once(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(req): Json<EffectRunRequest>,
) -> Result<Json<EffectRunResponse>, ServerError> {
    require_dev_tools(&state)?;
    let limit = req.limit.unwrap_or(10).clamp(1, 100);
    let locked_by = req.locked_by.as_deref().unwrap_or("api");
    let summary = run_effects_once(&state.db, limit, locked_by).await?;
    Ok(Json(EffectRunResponse {
        processed: summary.processed,
        done: summary.done,
        failed: summary.failed,
    }))
}
