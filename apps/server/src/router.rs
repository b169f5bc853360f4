use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Builds the application router with all middleware and routes.
pub fn build_router(state: AppState) -> axum::Router {
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            "x-device-token".parse().expect("valid header name"),
        ]);

    let pairing_routes = axum::Router::new()
        .route("/start", post(handlers::pairing::start))
        .route("/confirm", post(handlers::pairing::confirm));

    let api = axum::Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/devices/hello", post(handlers::devices::hello))
        .route("/devices/whoami", get(handlers::devices::whoami))
        .route("/devices", get(handlers::devices::list_devices))
        .route("/devices/{device_id}", get(handlers::devices::get_device))
        .route(
            "/devices/{device_id}/telemetry/recent",
            get(handlers::devices::device_telemetry_recent),
        )
        .route(
            "/devices/{device_id}/telemetry",
            get(handlers::devices::device_telemetry_history),
        )
        .route(
            "/devices/{device_id}/tasks",
            post(handlers::devices::create_task).get(handlers::devices::list_device_tasks),
        )
        .route(
            "/devices/{device_id}/current-task",
            get(handlers::devices::current_task),
        )
        .route(
            "/devices/{device_id}/task-history",
            get(handlers::devices::task_history),
        )
        .route(
            "/devices/{device_id}/tasks/{task_id}/cancel",
            post(handlers::devices::cancel_task),
        )
        .nest("/pairing", pairing_routes.clone())
        // Legacy alias kept for clients that pair through the devices
        // namespace.
        .nest("/devices/pairing", pairing_routes)
        .route("/telemetry", post(handlers::telemetry::ingest))
        .route("/telemetry/recent", get(handlers::telemetry::recent))
        .route(
            "/tasks/context/heartbeat",
            post(handlers::tasks::context_heartbeat),
        )
        .route("/tasks/poll", post(handlers::tasks::poll))
        .route("/tasks/{task_id}/renew", post(handlers::tasks::renew))
        .route("/tasks/{task_id}/complete", post(handlers::tasks::complete))
        .route(
            "/variables/definitions",
            get(handlers::variables::list_definitions).post(handlers::variables::create_definition),
        )
        .route(
            "/variables/value",
            get(handlers::variables::get_value).put(handlers::variables::put_value),
        )
        .route("/variables/set", post(handlers::variables::set_value))
        .route(
            "/variables/device/{device_uid}",
            get(handlers::variables::list_device_variables),
        )
        .route("/variables/effective", get(handlers::variables::effective))
        .route("/variables/snapshot", get(handlers::variables::snapshot))
        .route(
            "/variables/applied",
            post(handlers::variables::applied).get(handlers::variables::list_applied),
        )
        .route("/variables/audit", get(handlers::variables::list_audit))
        .route(
            "/variables/effects",
            get(handlers::variables::effects_list),
        )
        .route(
            "/variables/effects/{effect_id}",
            get(handlers::variables::effects_get),
        )
        .route(
            "/variables/effects/run-once",
            post(handlers::variables::effects_run_once),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::rate_limit::rate_limit_guard,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::caps_guard::capability_guard,
        ))
        // The WebSocket route authenticates via its token query param and
        // sits outside the capability guard, like the rest of the
        // realtime surface.
        .route(
            "/devices/{device_id}/telemetry/ws",
            get(handlers::telemetry::telemetry_ws),
        );

    axum::Router::new()
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .nest("/api/v1", api)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn liveness() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn readiness(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<axum::Json<serde_json::Value>, axum::http::StatusCode> {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&state.db).await {
        Ok(_) => Ok(axum::Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            Err(axum::http::StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn request_id_middleware(
    request: axum::extract::Request,
    next: middleware::Next,
) -> axum::response::Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    tracing::Span::current().record("request_id", request_id.as_str());
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("x-request-id", HeaderValue::from_str(&request_id).unwrap());
    response
}
