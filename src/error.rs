//! Engine error type and its HTTP mapping.
//!
//! Every fallible engine path returns [`EngineError`]; the axum layer turns it
//! into `status + {"error": "..."}` responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Request shape or value-range violation. No state change.
    #[error("{0}")]
    BadRequest(String),

    /// Caller does not own the resource.
    #[error("forbidden")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    /// Cancel/amend against an order that is no longer mutable.
    #[error("cannot {0} order in this status")]
    InvalidState(&'static str),

    #[error("insufficient {0} balance")]
    InsufficientFunds(&'static str),

    #[error("post-only order would take liquidity")]
    PostOnlyWouldTake,

    /// Transient or unexpected database failure. The transaction is aborted;
    /// the caller may retry.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        EngineError::BadRequest(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            EngineError::BadRequest(_)
            | EngineError::InsufficientFunds(_)
            | EngineError::PostOnlyWouldTake => StatusCode::BAD_REQUEST,
            EngineError::Forbidden => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidState(_) => StatusCode::CONFLICT,
            EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            EngineError::bad_request("amount must be > 0").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(EngineError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(EngineError::NotFound("market").status(), StatusCode::NOT_FOUND);
        assert_eq!(EngineError::InvalidState("cancel").status(), StatusCode::CONFLICT);
        assert_eq!(
            EngineError::InsufficientFunds("quote").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(EngineError::PostOnlyWouldTake.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            EngineError::Database(sqlx::Error::PoolClosed).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            EngineError::InsufficientFunds("quote").to_string(),
            "insufficient quote balance"
        );
        assert_eq!(
            EngineError::InvalidState("cancel").to_string(),
            "cannot cancel order in this status"
        );
    }
}
