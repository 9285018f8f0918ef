use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use ember_db::writer::WriteError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors a handler can return. Each maps to one status code; the body is
/// `{"error": <message>}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    /// Also used for rooms that don't exist, so room ids can't be discovered.
    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    /// The store is unavailable; the client may retry.
    #[error("try again")]
    Storage,

    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Storage => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<WriteError> for ApiError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::NotFound => Self::NotFound,
            WriteError::Conflict(detail) => {
                warn!("Write rejected: {}", detail);
                Self::Conflict("conflict".into())
            }
            WriteError::Storage(detail) => {
                error!("Write failed: {}", detail);
                Self::Storage
            }
            WriteError::Closed => {
                error!("Write failed: writer is not running");
                Self::Storage
            }
        }
    }
}

/// Read-side failures from the store.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!("Store read failed: {:#}", err);
        Self::Storage
    }
}
