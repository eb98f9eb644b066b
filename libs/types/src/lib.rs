//! Types library for the building telemetry backend
//!
//! Shared definitions for ledger documents, derived device state, alerts
//! and access grants, used by the telemetry pipeline and the gateway.
//!
//! # Modules
//! - `ids`: Identifiers (DeviceId, UserId, ConnectionId, CollectionId, DocumentId)
//! - `document`: Ledger documents and field values
//! - `reading`: Derived per-device temperature readings
//! - `alert`: Alert records, active alerts and transitions
//! - `access`: Access levels and authorization grants
//! - `errors`: Error taxonomy

pub mod access;
pub mod alert;
pub mod document;
pub mod errors;
pub mod ids;
pub mod reading;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::access::*;
    pub use crate::alert::*;
    pub use crate::document::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::reading::*;
}
