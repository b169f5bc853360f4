//! Telemetry ingest with per-device rate limiting, history views, and
//! the per-device WebSocket stream.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use hubex_shared::api::telemetry::{TelemetryEvent, TelemetryIngestRequest, TelemetryIngestResponse};
use hubex_shared::error::ApiError;
use hubex_shared::ids::{DeviceId, TelemetryId, UserId};

use crate::error::ServerError;
use crate::extractors::auth::AuthDevice;
use crate::models::DeviceTelemetry;
use crate::state::AppState;
use crate::validation::validate_telemetry_payload;

const WS_BACKLOG: i64 = 5;

/// WebSocket close codes: policy violation (bad auth) and try-again-later
/// (connection cap).
const WS_CLOSE_POLICY: u16 = 1008;
const WS_CLOSE_OVERLOADED: u16 = 1013;

fn event_view(row: DeviceTelemetry) -> TelemetryEvent {
    TelemetryEvent {
        id: row.id,
        received_at: row.received_at,
        event_type: row.event_type,
        payload: row.payload,
    }
}

pub async fn ingest(
    State(state): State<AppState>,
    AuthDevice(device): AuthDevice,
    Json(req): Json<TelemetryIngestRequest>,
) -> Result<Json<TelemetryIngestResponse>, ServerError> {
    if !state.telemetry_limiter.check_and_record(device.id) {
        let retry_after = state.telemetry_limiter.retry_after_seconds(device.id);
        return Err(ApiError::rate_limited(retry_after).into());
    }
    validate_telemetry_payload(&req.payload)?;
    if req.event_type.as_ref().is_some_and(|t| t.len() > 64) {
        return Err(ApiError::unprocessable(
            "VALIDATION_ERROR",
            "event_type must be at most 64 characters",
        )
        .into());
    }

    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let row: DeviceTelemetry = sqlx::query_as(
        "INSERT INTO device_telemetry (id, device_id, received_at, event_type, payload) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING id, device_id, received_at, event_type, payload",
    )
    .bind(TelemetryId::new())
    .bind(device.id)
    .bind(now)
    .bind(&req.event_type)
    .bind(&req.payload)
    .fetch_one(&mut *tx)
    .await?;
    sqlx::query("UPDATE devices SET last_seen_at = $1 WHERE id = $2")
        .bind(now)
        .bind(device.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let event = event_view(row);
    state
        .hub
        .broadcast(device.id, &serde_json::to_value(&event).unwrap_or_default());

    Ok(Json(TelemetryIngestResponse {
        telemetry_id: event.id,
        received_at: event.received_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

pub async fn recent(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
    AuthDevice(device): AuthDevice,
) -> Result<Json<Vec<TelemetryEvent>>, ServerError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let rows: Vec<DeviceTelemetry> = sqlx::query_as(
        "SELECT id, device_id, received_at, event_type, payload FROM device_telemetry \
         WHERE device_id = $1 ORDER BY received_at DESC LIMIT $2",
    )
    .bind(device.id)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(rows.into_iter().map(event_view).collect()))
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

enum WsDecision {
    Reject(u16),
    Accept { backlog: Vec<TelemetryEvent> },
}

async fn authorize_ws(
    state: &AppState,
    device_id: DeviceId,
    token: Option<&str>,
) -> Result<WsDecision, sqlx::Error> {
    let token = match token {
        Some(token) => token,
        None => return Ok(WsDecision::Reject(WS_CLOSE_POLICY)),
    };
    let claims = match state.jwt.validate_access_token(token) {
        Ok(claims) => claims,
        Err(_) => return Ok(WsDecision::Reject(WS_CLOSE_POLICY)),
    };
    let user_id: UserId = match claims.sub.parse() {
        Ok(id) => id,
        Err(_) => return Ok(WsDecision::Reject(WS_CLOSE_POLICY)),
    };

    let owned: Option<DeviceId> =
        sqlx::query_scalar("SELECT id FROM devices WHERE id = $1 AND owner_user_id = $2")
            .bind(device_id)
            .bind(user_id)
            .fetch_optional(&state.db)
            .await?;
    if owned.is_none() {
        return Ok(WsDecision::Reject(WS_CLOSE_POLICY));
    }

    if state.hub.connection_count() >= state.config.telemetry.max_ws_connections {
        return Ok(WsDecision::Reject(WS_CLOSE_OVERLOADED));
    }

    let mut backlog: Vec<DeviceTelemetry> = sqlx::query_as(
        "SELECT id, device_id, received_at, event_type, payload FROM device_telemetry \
         WHERE device_id = $1 ORDER BY received_at DESC LIMIT $2",
    )
    .bind(device_id)
    .bind(WS_BACKLOG)
    .fetch_all(&state.db)
    .await?;
    backlog.reverse();

    Ok(WsDecision::Accept {
        backlog: backlog.into_iter().map(event_view).collect(),
    })
}

pub async fn telemetry_ws(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let decision = authorize_ws(&state, device_id, query.token.as_deref()).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, device_id, decision, socket)))
}

async fn close_with(mut socket: WebSocket, code: u16) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
}

async fn handle_socket(
    state: AppState,
    device_id: DeviceId,
    decision: WsDecision,
    mut socket: WebSocket,
) {
    let backlog = match decision {
        WsDecision::Reject(code) => {
            close_with(socket, code).await;
            return;
        }
        WsDecision::Accept { backlog } => backlog,
    };

    // Initial frame: up to 5 most recent events, oldest first.
    let initial = serde_json::to_string(&backlog).unwrap_or_else(|_| "[]".to_string());
    if socket.send(Message::Text(initial.into())).await.is_err() {
        return;
    }

    let (conn_id, mut rx) = state.hub.register(device_id);
    tracing::info!(
        %device_id,
        active = state.hub.connection_count(),
        "telemetry ws connect"
    );

    loop {
        tokio::select! {
            broadcast = rx.recv() => {
                match broadcast {
                    Some(frame) => {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    // Subscribers only listen; anything but close/ping is
                    // ignored.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.remove(device_id, conn_id);
    tracing::info!(%device_id, "telemetry ws disconnect");
}
