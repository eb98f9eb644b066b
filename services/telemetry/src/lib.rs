//! Telemetry Service
//!
//! Derives current device state from the ledger and distributes it to
//! realtime observers:
//! - Ledger client (fetch-all / append over HTTP)
//! - Reconciliation of the unordered document log into per-device readings
//! - Alert evaluation with resolution tracking
//! - Access-gated channel registry (identity re-validation, audit events)
//! - Broadcasting with per-connection backpressure
//!
//! # Architecture
//!
//! ```text
//!      Ledger (fetch_all snapshot)
//!             │
//!       ┌─────▼─────┐
//!       │ Reconcile │  ← pure fold, latest observed time wins
//!       └─────┬─────┘
//!             │
//!       ┌─────▼─────┐
//!       │  Alerts   │  → alert records appended back to the ledger
//!       └─────┬─────┘
//!             │
//!       ┌─────▼─────┐      ┌──────────┐
//!       │ Broadcast │ ───▶ │ Registry │ ← identity service, audit log
//!       └─────┬─────┘      └──────────┘
//!             │
//!   per-connection bounded queues
//! ```

pub mod alerts;
pub mod audit;
pub mod broadcast;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod pipeline;
pub mod reconcile;
pub mod registry;

// Library version
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
