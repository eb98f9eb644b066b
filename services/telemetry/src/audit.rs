//! Access audit collaborator
//!
//! Every admitted monitoring subscription is recorded as an access-log
//! document in the ledger.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use types::document::{FieldValue, Fields};
use types::errors::AuditLogFailure;
use types::ids::{CollectionId, DeviceId, UserId};

use crate::ledger::DocumentStore;

/// Action recorded when a user starts monitoring a device.
pub const MONITORING_ACCESS: &str = "monitoring_access";

/// One access-log event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEvent {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub action: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl AccessEvent {
    pub fn monitoring(device_id: DeviceId, user_id: UserId) -> Self {
        Self {
            device_id,
            user_id,
            action: MONITORING_ACCESS,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AccessAudit: Send + Sync {
    async fn record(&self, event: AccessEvent) -> Result<(), AuditLogFailure>;
}

/// Writes access events to a ledger collection.
pub struct LedgerAccessLog {
    store: Arc<dyn DocumentStore>,
    collection: CollectionId,
}

impl LedgerAccessLog {
    pub fn new(store: Arc<dyn DocumentStore>, collection: CollectionId) -> Self {
        Self { store, collection }
    }
}

#[async_trait]
impl AccessAudit for LedgerAccessLog {
    async fn record(&self, event: AccessEvent) -> Result<(), AuditLogFailure> {
        let mut fields = Fields::new();
        fields.insert("device_id".into(), FieldValue::from(event.device_id.as_str()));
        fields.insert("user_id".into(), FieldValue::from(event.user_id.as_str()));
        fields.insert("action".into(), FieldValue::from(event.action));
        fields.insert("timestamp".into(), FieldValue::from(event.timestamp.to_rfc3339()));

        self.store
            .append(&self.collection, fields)
            .await
            .map(|_| ())
            .map_err(|source| AuditLogFailure {
                device_id: event.device_id,
                source,
            })
    }
}
