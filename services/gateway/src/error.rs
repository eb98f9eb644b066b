use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};
use types::errors::{AuthorizationError, LedgerError, ReconciliationError};

/// Central error type for the Gateway application
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error")]
    InternalError(#[from] anyhow::Error),
}

impl AppError {
    /// Status code and stable kind tag for the response body.
    pub fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Authorization(e) => (authorization_status(e), e.kind()),
            AppError::Ledger(e) => (ledger_status(e), e.kind()),
            AppError::Reconciliation(e) => (ledger_status(e.ledger_error()), e.kind()),
            AppError::RateLimitExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXCEEDED"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

fn authorization_status(error: &AuthorizationError) -> StatusCode {
    match error {
        AuthorizationError::MissingToken | AuthorizationError::InvalidToken(_) => {
            StatusCode::UNAUTHORIZED
        }
        AuthorizationError::InsufficientAccessLevel { .. } => StatusCode::FORBIDDEN,
        AuthorizationError::IdentityUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AuthorizationError::UnknownConnection(_) => StatusCode::GONE,
    }
}

fn ledger_status(error: &LedgerError) -> StatusCode {
    match error {
        LedgerError::Unavailable { .. } | LedgerError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        LedgerError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::Rejected { status: 400, .. } => StatusCode::BAD_REQUEST,
        LedgerError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_kind();

        let message = match &self {
            AppError::InternalError(e) => {
                error!(error = %e, "Internal error");
                "Internal server error".to_string()
            }
            other => {
                if status.is_server_error() {
                    warn!(kind = code, error = %other, "Upstream failure");
                }
                other.to_string()
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}
