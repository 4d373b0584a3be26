use crate::dto::ErrorRes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use consent_core::{ConsentError, ErrorKind};

/// A handler failure, rendered as `{ "error": ..., "retriable": ... }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retriable: bool,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retriable: false,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
            retriable: false,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
            retriable: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidState | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::ExternalService => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ConsentError> for ApiError {
    fn from(err: ConsentError) -> Self {
        let status = status_for(err.kind());
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        } else {
            tracing::debug!(error = %err, "request refused");
        }
        Self {
            status,
            // Storage failures can carry filesystem paths.
            message: if err.kind() == ErrorKind::Storage {
                "Internal error".to_string()
            } else {
                err.to_string()
            },
            retriable: err.is_retriable(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorRes {
            error: self.message,
            retriable: self.retriable,
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;
