use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hubex_shared::error::ApiError;

/// Newtype wrapper for `ApiError` that implements `IntoResponse`.
///
/// Needed because of the orphan rule — neither the trait (`IntoResponse`)
/// nor the type (`ApiError`) is defined in this crate. Renders the
/// `{"detail": {"code", "message", "meta"?}}` envelope.
#[derive(Debug)]
pub struct ServerError(pub ApiError);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut detail = serde_json::json!({
            "code": self.0.code,
            "message": self.0.message,
        });
        let retry_after = self.0.meta.as_ref().and_then(|m| {
            m.get("retry_after_seconds").and_then(|v| v.as_u64())
        });
        if let Some(meta) = self.0.meta {
            detail["meta"] = meta;
        }

        let mut response =
            (status, Json(serde_json::json!({ "detail": detail }))).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            if let Some(secs) = retry_after {
                if let Ok(value) = secs.max(1).to_string().parse() {
                    response.headers_mut().insert("Retry-After", value);
                }
            }
        }
        response
    }
}

impl From<ApiError> for ServerError {
    fn from(e: ApiError) -> Self {
        ServerError(e)
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!(error = %e, "database error");
        ServerError(ApiError::internal("database error"))
    }
}
