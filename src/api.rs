//! Response envelope and error taxonomy shared by every REST handler.
//!
//! All pull operations answer `{ "success": bool, "data": ..., "errors": [...] }`
//! so the client can branch on one shape. Failures carry a machine-readable
//! code plus a human message in `errors`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::moderation::gate::DenyReason;

/// Success envelope for REST responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            errors: None,
        })
    }
}

/// Empty success body for operations with nothing to return.
#[derive(Debug, Serialize)]
pub struct Empty {}

pub fn ok_empty() -> Json<ApiResponse<Empty>> {
    ApiResponse::ok(Empty {})
}

/// Request-level failure, mapped onto the error taxonomy.
///
/// Every failed or denied action surfaces one of these — nothing is
/// silently dropped.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Bad request shape or values — rejected before reaching the core.
    #[error("validation_error: {0}")]
    Validation(String),

    /// Moderation gate denial with a typed reason.
    #[error("permission_denied: {0}")]
    PermissionDenied(DenyReason),

    /// Unknown room, user, entity, or event range.
    #[error("not_found: {0}")]
    NotFound(String),

    /// Duplicate idempotency token with different content, or stale state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backpressure or overflow — the client must resync.
    #[error("transient_unavailable: {0}")]
    Transient(String),

    /// Unexpected server-side failure (DB, task join). Logged, not detailed
    /// to the client.
    #[error("internal")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code string for the client, independent of the message text.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::PermissionDenied(_) => "permission_denied",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Transient(_) => "transient_unavailable",
            ApiError::Internal => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let errors = match &self {
            // Denials carry the typed reason as its own entry so the client
            // can display it without parsing the message.
            ApiError::PermissionDenied(reason) => {
                vec![reason.as_str().to_string()]
            }
            ApiError::Internal => vec!["internal server error".to_string()],
            other => vec![other.to_string()],
        };

        let body = ApiResponse::<Empty> {
            success: false,
            data: None,
            errors: Some(errors),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Shorthand for the `spawn_blocking` + DB-lock dance used by handlers.
/// Maps a task join failure onto `ApiError::Internal`.
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| ApiError::Internal)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_success() {
        let json = serde_json::to_value(&ApiResponse {
            success: true,
            data: Some("x"),
            errors: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "data": "x"}));
    }

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("room".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Conflict("token".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Transient("overflow".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
