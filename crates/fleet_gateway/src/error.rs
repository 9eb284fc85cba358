use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_core::FleetError;

/// Error returned by every gateway route.
///
/// Rendered as `{"error": kind, "message": text}` with a status that
/// follows the error kind.
#[derive(Debug)]
pub enum ApiError {
    /// No usable caller identity on the request.
    Unauthenticated(String),
    Fleet(FleetError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Fleet(e) => match e {
                FleetError::Validation(_) => StatusCode::BAD_REQUEST,
                FleetError::Authorization { .. } => StatusCode::FORBIDDEN,
                FleetError::NotFound(_) => StatusCode::NOT_FOUND,
                FleetError::Conflict(_) => StatusCode::CONFLICT,
                FleetError::ServerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated(_) => "unauthenticated",
            ApiError::Fleet(e) => e.kind(),
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        ApiError::Fleet(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Fleet(FleetError::Validation(format!("invalid request body: {}", e.body_text())))
    }
}

impl From<PathRejection> for ApiError {
    fn from(e: PathRejection) -> Self {
        ApiError::Fleet(FleetError::Validation(format!("invalid path: {}", e.body_text())))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::Fleet(FleetError::Validation(format!("invalid query string: {}", e.body_text())))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Unauthenticated(msg) => msg.clone(),
            // Internal details stay in the log
            ApiError::Fleet(FleetError::Internal(e)) => {
                tracing::error!("Request failed: {:#}", e);
                "internal error".to_string()
            }
            ApiError::Fleet(e) => e.to_string(),
        };
        let body = serde_json::json!({ "error": self.kind(), "message": message });
        (status, Json(body)).into_response()
    }
}
