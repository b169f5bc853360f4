//! Per-user request rate limit: a fixed window keyed by
//! `subject:METHOD:path`. Applies only to requests that carry a valid
//! bearer token; everything else passes through untouched.

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use hubex_shared::error::ApiError;

use crate::error::ServerError;
use crate::state::AppState;

const WINDOW_SECONDS: u64 = 60;

pub async fn rate_limit_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.rate_limit.enabled {
        return next.run(request).await;
    }

    let subject = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| state.jwt.validate_access_token(token).ok())
        .map(|claims| claims.sub);

    let subject = match subject {
        Some(subject) => subject,
        None => return next.run(request).await,
    };

    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let key = format!("{subject}:{}:{path}", request.method());

    let limit = state.config.rate_limit.per_minute;
    let (ok, retry_after) = state.request_limiter.allow(&key, limit, WINDOW_SECONDS);
    if !ok {
        return ServerError(ApiError::rate_limited(retry_after.max(1))).into_response();
    }

    next.run(request).await
}
