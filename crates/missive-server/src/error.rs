use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use missive_shared::protocol::ErrorBody;
use missive_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Request envelope could not be opened")]
    Unreadable,

    #[error("Token expired or invalid")]
    Unauthorized,

    #[error("Unknown user")]
    NotFound,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) | ServerError::Unreadable => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::NotFound => StatusCode::NOT_FOUND,
            ServerError::Store(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            ServerError::Store(e) => {
                tracing::error!(error = %e, "Store failure");
                "Store error".to_string()
            }
            ServerError::Internal(e) => {
                tracing::error!(error = %e, "Internal failure");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = ErrorBody {
            code: status.as_u16(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}
