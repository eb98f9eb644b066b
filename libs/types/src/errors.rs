//! Error taxonomy for the telemetry pipeline
//!
//! Each variant carries a stable kind tag (`kind()`) that the HTTP and
//! realtime boundaries expose to callers.

use thiserror::Error;

use crate::access::AccessLevel;
use crate::ids::{ConnectionId, DeviceId};

/// Failures talking to the remote document ledger
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Transport failure or 5xx. `status` is `None` when no response arrived.
    #[error("Ledger unavailable (status {status:?}): {body}")]
    Unavailable { status: Option<u16>, body: String },

    /// 4xx from the ledger; status and body are passed through verbatim.
    #[error("Ledger rejected request (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Ledger request timed out")]
    Timeout,

    /// The response body had no recognisable document shape.
    #[error("Malformed ledger response: {0}")]
    MalformedResponse(String),
}

impl LedgerError {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Unavailable { .. } => "LEDGER_UNAVAILABLE",
            LedgerError::Rejected { .. } => "LEDGER_REJECTED",
            LedgerError::Timeout => "LEDGER_TIMEOUT",
            LedgerError::MalformedResponse(_) => "LEDGER_MALFORMED_RESPONSE",
        }
    }

    /// Whether a caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable { .. } | LedgerError::Timeout)
    }
}

/// A reconciliation pass could not obtain its snapshot
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconciliationError {
    #[error("Reconciliation unavailable: {0}")]
    Unavailable(#[from] LedgerError),
}

impl ReconciliationError {
    pub fn kind(&self) -> &'static str {
        "RECONCILIATION_UNAVAILABLE"
    }

    pub fn ledger_error(&self) -> &LedgerError {
        match self {
            ReconciliationError::Unavailable(e) => e,
        }
    }
}

/// Subscription or route access denied
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthorizationError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Insufficient access level for device {device_id}: required {required}, granted {granted}")]
    InsufficientAccessLevel {
        device_id: DeviceId,
        required: AccessLevel,
        granted: AccessLevel,
    },

    #[error("Identity service unavailable: {0}")]
    IdentityUnavailable(String),

    /// The connection closed before authorization finished.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

impl AuthorizationError {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthorizationError::MissingToken => "MISSING_TOKEN",
            AuthorizationError::InvalidToken(_) => "INVALID_TOKEN",
            AuthorizationError::InsufficientAccessLevel { .. } => "INSUFFICIENT_ACCESS_LEVEL",
            AuthorizationError::IdentityUnavailable(_) => "IDENTITY_UNAVAILABLE",
            AuthorizationError::UnknownConnection(_) => "UNKNOWN_CONNECTION",
        }
    }
}

/// Writing an access-log event failed. Never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Audit log failure for device {device_id}: {source}")]
pub struct AuditLogFailure {
    pub device_id: DeviceId,
    #[source]
    pub source: LedgerError,
}
