use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Failures surfaced by the lifecycle engine. Validation and not-found are
/// expected and cheap; the rest carry enough context to diagnose without
/// leaking storage detail to the caller.
#[derive(Debug)]
pub enum LifecycleError {
    Validation(String),
    /// Concurrent-mutation races that survived the bounded local retry.
    Conflict,
    Dependency(anyhow::Error),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::Validation(msg) => write!(f, "validation failed: {}", msg),
            LifecycleError::Conflict => write!(f, "concurrent update conflict"),
            LifecycleError::Dependency(e) => write!(f, "dependency failure: {}", e),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<sqlx::Error> for LifecycleError {
    fn from(e: sqlx::Error) -> Self {
        LifecycleError::Dependency(e.into())
    }
}

/// Error type for the HTTP edge.
#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    Validation(String),
    PayloadTooLarge(String),
    Transient,
    Internal(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what.to_string()),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            ApiError::Transient => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Temporarily busy, retry the request".to_string(),
            ),
            ApiError::Internal(what) => (StatusCode::INTERNAL_SERVER_ERROR, what.to_string()),
        }
        .into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::Validation(msg) => ApiError::Validation(msg),
            LifecycleError::Conflict => ApiError::Transient,
            LifecycleError::Dependency(_) => ApiError::Internal("Storage failure"),
        }
    }
}
