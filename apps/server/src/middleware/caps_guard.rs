//! Capability guard. Each route declares a required capability set; the
//! guard resolves at most one principal per request and checks coverage.
//! Enforcement is controlled by a process flag; off-mode allows unmapped
//! routes and missing caps but still logs.

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use hubex_shared::caps::{covers, unknown_caps, DEVICE_CAPS};
use hubex_shared::error::ApiError;

use crate::error::ServerError;
use crate::extractors::auth::DEVICE_TOKEN_HEADER;
use crate::revocation::is_token_revoked;
use crate::state::AppState;

/// Route -> required capability set, keyed by (method, path template).
/// Single source of truth for the guarded surface.
const ROUTE_CAPS: &[((&str, &str), &[&str])] = &[
    (("POST", "/api/v1/auth/register"), &["core.auth.register"]),
    (("POST", "/api/v1/auth/login"), &["core.auth.login"]),
    (("POST", "/api/v1/devices/hello"), &["devices.hello"]),
    (("GET", "/api/v1/devices/whoami"), &["devices.read"]),
    (("GET", "/api/v1/devices"), &["devices.read"]),
    (("GET", "/api/v1/devices/{device_id}"), &["devices.read"]),
    (
        ("GET", "/api/v1/devices/{device_id}/telemetry/recent"),
        &["telemetry.read"],
    ),
    (
        ("GET", "/api/v1/devices/{device_id}/telemetry"),
        &["telemetry.read"],
    ),
    (
        ("POST", "/api/v1/devices/{device_id}/tasks"),
        &["tasks.write"],
    ),
    (
        ("GET", "/api/v1/devices/{device_id}/tasks"),
        &["tasks.read"],
    ),
    (
        ("GET", "/api/v1/devices/{device_id}/current-task"),
        &["tasks.read"],
    ),
    (
        ("GET", "/api/v1/devices/{device_id}/task-history"),
        &["tasks.read"],
    ),
    (
        ("POST", "/api/v1/devices/{device_id}/tasks/{task_id}/cancel"),
        &["tasks.write"],
    ),
    (("POST", "/api/v1/pairing/start"), &["pairing.start"]),
    (("POST", "/api/v1/pairing/confirm"), &["pairing.confirm"]),
    (("POST", "/api/v1/devices/pairing/start"), &["pairing.start"]),
    (
        ("POST", "/api/v1/devices/pairing/confirm"),
        &["pairing.confirm"],
    ),
    (("POST", "/api/v1/telemetry"), &["telemetry.emit"]),
    (("GET", "/api/v1/telemetry/recent"), &["telemetry.read"]),
    (
        ("POST", "/api/v1/tasks/context/heartbeat"),
        &["tasks.write"],
    ),
    (("POST", "/api/v1/tasks/poll"), &["tasks.read"]),
    (
        ("POST", "/api/v1/tasks/{task_id}/complete"),
        &["tasks.write"],
    ),
    (("POST", "/api/v1/tasks/{task_id}/renew"), &["tasks.write"]),
    (("GET", "/api/v1/variables/definitions"), &["vars.read"]),
    (("POST", "/api/v1/variables/definitions"), &["vars.write"]),
    (("GET", "/api/v1/variables/value"), &["vars.read"]),
    (("PUT", "/api/v1/variables/value"), &["vars.write"]),
    (("POST", "/api/v1/variables/set"), &["vars.write"]),
    (
        ("GET", "/api/v1/variables/device/{device_uid}"),
        &["vars.read"],
    ),
    (("GET", "/api/v1/variables/effective"), &["vars.read"]),
    (("GET", "/api/v1/variables/snapshot"), &["vars.read"]),
    (("POST", "/api/v1/variables/applied"), &["vars.ack"]),
    (("GET", "/api/v1/variables/applied"), &["vars.read"]),
    (("GET", "/api/v1/variables/audit"), &["vars.read"]),
    (("GET", "/api/v1/variables/effects"), &["vars.read"]),
    (
        ("GET", "/api/v1/variables/effects/{effect_id}"),
        &["vars.read"],
    ),
    (
        ("POST", "/api/v1/variables/effects/run-once"),
        &["vars.write"],
    ),
];

/// Routes reachable without any principal. Minimal and static.
const PUBLIC_WHITELIST: &[(&str, &str)] = &[
    ("POST", "/api/v1/devices/hello"),
    ("POST", "/api/v1/pairing/confirm"),
    ("POST", "/api/v1/devices/pairing/confirm"),
];

pub fn resolve_required_caps(method: &str, path: &str) -> Option<&'static [&'static str]> {
    ROUTE_CAPS
        .iter()
        .find(|((m, p), _)| *m == method && *p == path)
        .map(|(_, caps)| *caps)
}

pub fn is_public_route(method: &str, path: &str) -> bool {
    PUBLIC_WHITELIST.contains(&(method, path))
}

fn deny(enforce: bool, err: ApiError) -> Option<Response> {
    if enforce {
        Some(ServerError(err).into_response())
    } else {
        None
    }
}

pub async fn capability_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_owned();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());

    let enforce = state.config.caps_enforce;

    let required = match resolve_required_caps(&method, &path) {
        Some(required) => required,
        None => {
            tracing::warn!(%method, %path, "CAP_MAPPING_MISSING");
            if let Some(resp) = deny(
                enforce,
                ApiError::forbidden("CAP_MAPPING_MISSING", "capability mapping missing"),
            ) {
                return resp;
            }
            return next.run(request).await;
        }
    };

    if is_public_route(&method, &path) {
        return next.run(request).await;
    }

    // A device principal implicitly holds the device-capability set; the
    // token itself is verified by the handler's extractor.
    let has_device_token = request.headers().contains_key(DEVICE_TOKEN_HEADER);
    if has_device_token && covers(required, DEVICE_CAPS) {
        return next.run(request).await;
    }

    let bearer = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let token = match bearer {
        Some(token) => token,
        None => {
            tracing::warn!(%method, %path, "CAP_AUTH_MISSING");
            if let Some(resp) = deny(
                enforce,
                ApiError::unauthorized("CAP_AUTH_REQUIRED", "missing bearer token"),
            ) {
                return resp;
            }
            return next.run(request).await;
        }
    };

    let claims = match state.jwt.validate_access_token(token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(%method, %path, error = %e, "CAP_AUTH_INVALID");
            if let Some(resp) = deny(
                enforce,
                ApiError::unauthorized("CAP_AUTH_INVALID", e.to_string()),
            ) {
                return resp;
            }
            return next.run(request).await;
        }
    };

    // Revocation short-circuits regardless of the enforcement flag.
    match is_token_revoked(&state.db, &claims.jti).await {
        Ok(true) => {
            return ServerError(ApiError::unauthorized("CAP_TOKEN_REVOKED", "token revoked"))
                .into_response();
        }
        Ok(false) => {}
        Err(e) => return ServerError::from(e).into_response(),
    }

    let unknown = unknown_caps(&claims.caps);
    if !unknown.is_empty() {
        tracing::warn!(%method, %path, ?unknown, "CAP_UNKNOWN");
        if let Some(resp) = deny(
            enforce,
            ApiError::forbidden("CAP_UNKNOWN", "unknown capability"),
        ) {
            return resp;
        }
        return next.run(request).await;
    }

    if !covers(required, &claims.caps) {
        tracing::warn!(%method, %path, ?required, "CAP_FORBIDDEN");
        if let Some(resp) = deny(
            enforce,
            ApiError::forbidden("CAP_FORBIDDEN", "insufficient capability"),
        ) {
            return resp;
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubex_shared::caps::REGISTRY;

    #[test]
    fn every_mapped_cap_is_registered() {
        for ((method, path), caps) in ROUTE_CAPS {
            for cap in *caps {
                assert!(
                    REGISTRY.contains(cap),
                    "unregistered cap {cap} on {method} {path}"
                );
            }
        }
    }

    #[test]
    fn public_routes_are_mapped() {
        for (method, path) in PUBLIC_WHITELIST {
            assert!(
                resolve_required_caps(method, path).is_some(),
                "public route {method} {path} missing from capability map"
            );
        }
    }

    #[test]
    fn resolve_known_route() {
        assert_eq!(
            resolve_required_caps("POST", "/api/v1/tasks/poll"),
            Some(&["tasks.read"][..])
        );
    }

    #[test]
    fn resolve_unknown_route_is_none() {
        assert!(resolve_required_caps("GET", "/api/v1/nope").is_none());
    }

    #[test]
    fn confirm_is_public_but_start_is_not() {
        assert!(is_public_route("POST", "/api/v1/pairing/confirm"));
        assert!(!is_public_route("POST", "/api/v1/pairing/start"));
    }

    #[test]
    fn device_caps_cover_the_device_surface() {
        for (method, path) in [
            ("POST", "/api/v1/telemetry"),
            ("POST", "/api/v1/tasks/poll"),
            ("POST", "/api/v1/tasks/{task_id}/complete"),
            ("GET", "/api/v1/variables/snapshot"),
            ("POST", "/api/v1/variables/applied"),
        ] {
            let required = resolve_required_caps(method, path).unwrap();
            assert!(
                covers(required, DEVICE_CAPS),
                "device caps do not cover {method} {path}"
            );
        }
    }
}
