use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use hubex_shared::api::device::{
    DeviceDetail, DeviceListItem, HelloRequest, HelloResponse, WhoamiResponse,
};
use hubex_shared::api::task::{
    CurrentTaskResponse, TaskCancelResponse, TaskCreateRequest, TaskCreateResponse,
    TaskHistoryItem, TaskView,
};
use hubex_shared::api::telemetry::TelemetryEvent;
use hubex_shared::error::ApiError;
use hubex_shared::ids::{ContextId, DeviceId, TaskId, UserId};

use crate::device_state::{
    derive_state, device_busy, fetch_busy_device_ids, fetch_pairing_active_uids, health_for,
    is_active, pairing_active,
};
use crate::error::ServerError;
use crate::extractors::auth::{AuthDevice, AuthUser};
use crate::models::{Device, DeviceTelemetry, Task, DEVICE_COLUMNS, TASK_COLUMNS};
use crate::state::AppState;
use crate::validation::validate_json_object;

const ONLINE_WINDOW_SECONDS: i64 = 30;

pub async fn hello(
    State(state): State<AppState>,
    Json(req): Json<HelloRequest>,
) -> Result<Json<HelloResponse>, ServerError> {
    if req.device_uid.len() < 4 || req.device_uid.len() > 128 {
        return Err(ApiError::unprocessable(
            "VALIDATION_ERROR",
            "device_uid must be 4-128 characters",
        )
        .into());
    }

    let now = Utc::now();
    let (device_id, owner_user_id): (DeviceId, Option<UserId>) = sqlx::query_as(
        "INSERT INTO devices (id, device_uid, firmware_version, capabilities, last_seen_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (device_uid) DO UPDATE \
         SET firmware_version = EXCLUDED.firmware_version, \
             capabilities = EXCLUDED.capabilities, \
             last_seen_at = EXCLUDED.last_seen_at, \
             is_claimed = (devices.owner_user_id IS NOT NULL) \
         RETURNING id, owner_user_id",
    )
    .bind(DeviceId::new())
    .bind(&req.device_uid)
    .bind(&req.firmware_version)
    .bind(&req.capabilities)
    .bind(now)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(HelloResponse {
        device_id,
        claimed: owner_user_id.is_some(),
    }))
}

pub async fn whoami(
    State(state): State<AppState>,
    AuthDevice(device): AuthDevice,
) -> Result<Json<WhoamiResponse>, ServerError> {
    sqlx::query("UPDATE devices SET last_seen_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(device.id)
        .execute(&state.db)
        .await?;
    Ok(Json(WhoamiResponse {
        id: device.id,
        device_uid: device.device_uid,
        owner_user_id: device.owner_user_id,
    }))
}

pub async fn list_devices(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<DeviceListItem>>, ServerError> {
    let now = Utc::now();
    let devices: Vec<Device> = sqlx::query_as(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE owner_user_id = $1 ORDER BY created_at"
    ))
    .bind(user.user_id)
    .fetch_all(&state.db)
    .await?;

    let uids: Vec<String> = devices.iter().map(|d| d.device_uid.clone()).collect();
    let ids: Vec<DeviceId> = devices.iter().map(|d| d.id).collect();
    let pairing = fetch_pairing_active_uids(&state.db, &uids, now).await?;
    let busy = fetch_busy_device_ids(&state.db, &ids, now).await?;

    let out = devices
        .into_iter()
        .map(|device| {
            let (health, age) = health_for(device.last_seen_at, now);
            let online = device
                .last_seen_at
                .is_some_and(|seen| now - seen <= Duration::seconds(ONLINE_WINDOW_SECONDS));
            let state = derive_state(
                &device,
                pairing.contains(&device.device_uid),
                busy.contains(&device.id),
            );
            DeviceListItem {
                id: device.id,
                device_uid: device.device_uid,
                claimed: device.owner_user_id.is_some(),
                last_seen: device.last_seen_at,
                online,
                health: health.to_string(),
                last_seen_age_seconds: age,
                state: state.to_string(),
            }
        })
        .collect();

    Ok(Json(out))
}

async fn get_owned_device(
    state: &AppState,
    device_id: DeviceId,
    user_id: UserId,
) -> Result<Device, ServerError> {
    let device: Option<Device> = sqlx::query_as(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1 AND owner_user_id = $2"
    ))
    .bind(device_id)
    .bind(user_id)
    .fetch_optional(&state.db)
    .await?;
    device.ok_or_else(|| ServerError(ApiError::not_found("DEVICE_NOT_FOUND", "device not found")))
}

pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    user: AuthUser,
) -> Result<Json<DeviceDetail>, ServerError> {
    let device = get_owned_device(&state, device_id, user.user_id).await?;
    let now = Utc::now();
    let (health, age) = health_for(device.last_seen_at, now);
    let busy = device_busy(&state.db, device.id, now).await?;
    let pairing = pairing_active(&state.db, &device.device_uid, now).await?;
    let state_tag = derive_state(&device, pairing, busy);

    let active = is_active(
        device.last_seen_at,
        state.config.device_active_window_seconds,
        now,
    );

    Ok(Json(DeviceDetail {
        id: device.id,
        device_uid: device.device_uid,
        name: device.name,
        firmware_version: device.firmware_version,
        capabilities: device.capabilities,
        last_seen_at: device.last_seen_at,
        owner_user_id: device.owner_user_id,
        is_claimed: device.is_claimed,
        created_at: device.created_at,
        health: health.to_string(),
        last_seen_age_seconds: age,
        state: state_tag.to_string(),
        active,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TelemetryHistoryQuery {
    pub limit: Option<i64>,
    pub before: Option<DateTime<Utc>>,
}

fn telemetry_view(row: DeviceTelemetry) -> TelemetryEvent {
    TelemetryEvent {
        id: row.id,
        received_at: row.received_at,
        event_type: row.event_type,
        payload: row.payload,
    }
}

pub async fn device_telemetry_recent(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Query(query): Query<TelemetryHistoryQuery>,
    user: AuthUser,
) -> Result<Json<Vec<TelemetryEvent>>, ServerError> {
    get_owned_device(&state, device_id, user.user_id).await?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let rows: Vec<DeviceTelemetry> = sqlx::query_as(
        "SELECT id, device_id, received_at, event_type, payload FROM device_telemetry \
         WHERE device_id = $1 ORDER BY received_at DESC LIMIT $2",
    )
    .bind(device_id)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(rows.into_iter().map(telemetry_view).collect()))
}

pub async fn device_telemetry_history(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Query(query): Query<TelemetryHistoryQuery>,
    user: AuthUser,
) -> Result<Json<Vec<TelemetryEvent>>, ServerError> {
    get_owned_device(&state, device_id, user.user_id).await?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let rows: Vec<DeviceTelemetry> = sqlx::query_as(
        "SELECT id, device_id, received_at, event_type, payload FROM device_telemetry \
         WHERE device_id = $1 AND ($2::timestamptz IS NULL OR received_at < $2) \
         ORDER BY received_at DESC LIMIT $3",
    )
    .bind(device_id)
    .bind(query.before)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(rows.into_iter().map(telemetry_view).collect()))
}

pub async fn create_task(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    user: AuthUser,
    Json(req): Json<TaskCreateRequest>,
) -> Result<Json<TaskCreateResponse>, ServerError> {
    get_owned_device(&state, device_id, user.user_id).await?;
    validate_json_object(&req.payload, "payload")?;
    if req.task_type.is_empty() || req.task_type.len() > 64 {
        return Err(ApiError::unprocessable(
            "VALIDATION_ERROR",
            "type must be 1-64 characters",
        )
        .into());
    }

    let context_id: Option<ContextId> = match &req.execution_context_key {
        Some(key) => {
            let found: Option<ContextId> = sqlx::query_scalar(
                "SELECT id FROM execution_contexts WHERE client_id = $1 AND context_key = $2",
            )
            .bind(device_id)
            .bind(key)
            .fetch_optional(&state.db)
            .await?;
            Some(found.ok_or_else(|| {
                ServerError(ApiError::conflict(
                    "EXECUTION_CONTEXT_NOT_FOUND",
                    "execution context not found",
                ))
            })?)
        }
        None => None,
    };

    // Idempotent enqueue: the partial unique index arbitrates concurrent
    // inserts; losing the insert means the task already exists.
    let inserted: Option<(TaskId, String, DateTime<Utc>)> = sqlx::query_as(
        "INSERT INTO tasks (id, client_id, execution_context_id, type, payload, status, \
                            priority, idempotency_key) \
         VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7) \
         ON CONFLICT (client_id, idempotency_key) WHERE idempotency_key IS NOT NULL \
         DO NOTHING \
         RETURNING id, status, created_at",
    )
    .bind(TaskId::new())
    .bind(device_id)
    .bind(context_id)
    .bind(&req.task_type)
    .bind(&req.payload)
    .bind(req.priority.unwrap_or(0))
    .bind(&req.idempotency_key)
    .fetch_optional(&state.db)
    .await?;

    let (id, status, created_at) = match inserted {
        Some(row) => row,
        None => {
            sqlx::query_as(
                "SELECT id, status, created_at FROM tasks \
                 WHERE client_id = $1 AND idempotency_key = $2",
            )
            .bind(device_id)
            .bind(&req.idempotency_key)
            .fetch_one(&state.db)
            .await?
        }
    };

    Ok(Json(TaskCreateResponse {
        id,
        status,
        created_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_device_tasks(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Query(query): Query<TaskListQuery>,
    user: AuthUser,
) -> Result<Json<Vec<TaskView>>, ServerError> {
    get_owned_device(&state, device_id, user.user_id).await?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let tasks: Vec<Task> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks \
         WHERE client_id = $1 AND ($2::text IS NULL OR status = $2) \
         ORDER BY created_at DESC LIMIT $3"
    ))
    .bind(device_id)
    .bind(&query.status)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;

    let out = tasks
        .into_iter()
        .map(|task| TaskView {
            id: task.id,
            task_type: task.task_type,
            status: task.status,
            priority: task.priority,
            created_at: task.created_at,
            completed_at: task.completed_at,
            execution_context_id: task.execution_context_id,
            idempotency_key: task.idempotency_key,
        })
        .collect();
    Ok(Json(out))
}

pub async fn current_task(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    user: AuthUser,
) -> Result<Json<CurrentTaskResponse>, ServerError> {
    get_owned_device(&state, device_id, user.user_id).await?;
    let now = Utc::now();

    #[derive(sqlx::FromRow)]
    struct Row {
        #[sqlx(flatten)]
        task: Task,
        context_key: Option<String>,
    }

    // If multiple leases exist (should not), pick the latest expiry.
    let row: Option<Row> = sqlx::query_as(
        "SELECT t.id, t.client_id, t.execution_context_id, t.type, t.payload, t.status, \
                t.priority, t.idempotency_key, t.claimed_at, t.lease_expires_at, t.lease_token, \
                t.created_at, t.completed_at, t.result, t.error, c.context_key \
         FROM tasks t \
         LEFT JOIN execution_contexts c ON c.id = t.execution_context_id \
         WHERE t.client_id = $1 AND t.status = 'in_flight' \
           AND t.lease_expires_at IS NOT NULL AND t.lease_expires_at > $2 \
           AND t.lease_token IS NOT NULL \
         ORDER BY t.lease_expires_at DESC \
         LIMIT 1",
    )
    .bind(device_id)
    .bind(now)
    .fetch_optional(&state.db)
    .await?;

    let response = match row {
        None => CurrentTaskResponse {
            has_active_lease: false,
            device_id,
            task_id: None,
            task_type: None,
            task_status: None,
            claimed_at: None,
            lease_expires_at: None,
            lease_seconds_remaining: None,
            lease_token_hint: None,
            context_key: None,
        },
        Some(Row { task, context_key }) => {
            let remaining = task
                .lease_expires_at
                .map(|expiry| (expiry - now).num_seconds().max(0));
            CurrentTaskResponse {
                has_active_lease: true,
                device_id,
                task_id: Some(task.id),
                task_type: Some(task.task_type),
                task_status: Some(task.status),
                claimed_at: task.claimed_at,
                lease_expires_at: task.lease_expires_at,
                lease_seconds_remaining: remaining,
                lease_token_hint: task.lease_token.map(|t| t.chars().take(6).collect()),
                context_key,
            }
        }
    };
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

pub async fn task_history(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Query(query): Query<HistoryQuery>,
    user: AuthUser,
) -> Result<Json<Vec<TaskHistoryItem>>, ServerError> {
    get_owned_device(&state, device_id, user.user_id).await?;
    let limit = query.limit.unwrap_or(5).clamp(1, 20);
    let tasks: Vec<Task> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE client_id = $1 \
         ORDER BY completed_at DESC, claimed_at DESC, created_at DESC LIMIT $2"
    ))
    .bind(device_id)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;

    let out = tasks
        .into_iter()
        .map(|task| TaskHistoryItem {
            task_id: task.id,
            task_type: task.task_type,
            task_status: task.status,
            claimed_at: task.claimed_at,
            finished_at: task.completed_at,
        })
        .collect();
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path((device_id, task_id)): Path<(DeviceId, TaskId)>,
    Query(query): Query<CancelQuery>,
    user: AuthUser,
) -> Result<Json<TaskCancelResponse>, ServerError> {
    get_owned_device(&state, device_id, user.user_id).await?;

    let mut tx = state.db.begin().await?;
    let task: Option<Task> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND client_id = $2 FOR UPDATE"
    ))
    .bind(task_id)
    .bind(device_id)
    .fetch_optional(&mut *tx)
    .await?;

    let task =
        task.ok_or_else(|| ServerError(ApiError::not_found("TASK_NOT_FOUND", "task not found")))?;
    if matches!(task.status.as_str(), "done" | "failed" | "canceled") {
        return Err(
            ApiError::conflict("TASK_ALREADY_COMPLETED", "task already completed").into(),
        );
    }
    if task.status == "in_flight" && !query.force {
        return Err(ApiError::conflict("TASK_IN_FLIGHT", "task in flight").into());
    }

    let was_in_flight = task.status == "in_flight";
    let now = Utc::now();
    let error = if was_in_flight {
        "canceled by owner (force)"
    } else {
        "canceled by owner"
    };
    sqlx::query(
        "UPDATE tasks SET status = 'canceled', completed_at = $1, error = $2 WHERE id = $3",
    )
    .bind(now)
    .bind(error)
    .bind(task.id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Json(TaskCancelResponse {
        id: task.id,
        status: "canceled".to_string(),
        completed_at: now,
    }))
}
