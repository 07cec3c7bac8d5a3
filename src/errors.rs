use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Error surface for the router. Internal services return `anyhow::Result`
/// like the rest of the crate; only handler/task boundaries convert into
/// this type.
#[allow(dead_code)]
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("transient error: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Helper for mapping any unknown error into an internal error.
pub fn internal_error<E: ToString>(err: E) -> RouterError {
    RouterError::Internal(err.to_string())
}

impl From<anyhow::Error> for RouterError {
    fn from(err: anyhow::Error) -> Self {
        RouterError::Internal(err.to_string())
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            RouterError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RouterError::NotFound(_) => StatusCode::NOT_FOUND,
            RouterError::DependencyUnavailable(_) => StatusCode::BAD_GATEWAY,
            RouterError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "message": self.to_string()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_categories() {
        assert_eq!(
            RouterError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RouterError::InvalidInput("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RouterError::Internal("x".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
