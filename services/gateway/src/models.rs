use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use types::alert::{ActiveAlert, AlertRecord, Severity};
use types::document::LedgerDocument;
use types::ids::{CollectionId, DeviceId, DocumentId};
use types::reading::DeviceReading;

/// A device's current reading and its active alert, if any.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    #[serde(flatten)]
    pub reading: DeviceReading,
    pub active_alert: Option<ActiveAlert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceStatus>,
    pub count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub device_id: DeviceId,
    pub readings: Vec<DeviceReading>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentTemperatureResponse {
    pub readings: Vec<DeviceReading>,
    pub active_alerts: Vec<ActiveAlert>,
    pub limit: f64,
}

/// Manually raised alert.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSubmission {
    pub device_id: DeviceId,
    pub current_value: f64,
    #[serde(default)]
    pub limit: Option<f64>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AlertSubmission {
    pub fn into_record(self, default_limit: f64, default_severity: Severity) -> AlertRecord {
        let limit = self.limit.unwrap_or(default_limit);
        let message = self.message.unwrap_or_else(|| {
            format!(
                "Temperature {:.1} exceeds limit {:.1} on device {}",
                self.current_value, limit, self.device_id
            )
        });
        AlertRecord {
            device_id: self.device_id,
            severity: self.severity.unwrap_or(default_severity),
            message,
            limit,
            current_value: self.current_value,
            resolved: false,
            timestamp: Utc::now(),
            resolves: None,
        }
    }
}

/// Acknowledgement of an appended ledger document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResponse {
    pub id: DocumentId,
    pub collection_id: Option<CollectionId>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<LedgerDocument> for AppendResponse {
    fn from(document: LedgerDocument) -> Self {
        Self {
            id: document.id,
            collection_id: document.collection_id,
            created_at: document.creation_time,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
}
