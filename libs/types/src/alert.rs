//! Alert types
//!
//! Alert records are appended to the ledger, never updated. A device's
//! "currently active" alert is reconstructed by folding its records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{DeviceId, DocumentId};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Resolution notices
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// Parse a stored severity, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warning" | "warn" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One alert record as appended to the alert collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub device_id: DeviceId,
    pub severity: Severity,
    pub message: String,
    pub limit: f64,
    pub current_value: f64,
    pub resolved: bool,
    pub timestamp: DateTime<Utc>,
    /// Ledger id of the triggering record this resolution closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolves: Option<DocumentId>,
}

/// The unresolved alert currently in force for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAlert {
    /// `None` while the triggering record has not been re-observed in the ledger.
    pub document_id: Option<DocumentId>,
    pub device_id: DeviceId,
    pub severity: Severity,
    pub limit: f64,
    pub current_value: f64,
    pub triggered_at: DateTime<Utc>,
}

/// Outcome of evaluating one reading against the alert limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum AlertTransition {
    /// Normal -> Triggered; the record must be appended unresolved.
    Triggered(AlertRecord),
    /// Triggered -> Resolved; the record must be appended resolved.
    Resolved(AlertRecord),
    /// No state change (repeat over-limit, or normal and still normal).
    Unchanged,
    /// The reading predates the active alert and was ignored.
    Stale,
}

impl AlertTransition {
    /// The record to append, if this transition produces one.
    pub fn record(&self) -> Option<&AlertRecord> {
        match self {
            AlertTransition::Triggered(record) | AlertTransition::Resolved(record) => Some(record),
            AlertTransition::Unchanged | AlertTransition::Stale => None,
        }
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self, AlertTransition::Triggered(_))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, AlertTransition::Resolved(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse("warn"), Some(Severity::Warning));
        assert_eq!(Severity::parse("meltdown"), None);
    }

    #[test]
    fn test_transition_serialization_is_tagged() {
        let record = AlertRecord {
            device_id: DeviceId::new("d1"),
            severity: Severity::Warning,
            message: "Temperature 45.5 exceeds limit 40".to_string(),
            limit: 40.0,
            current_value: 45.5,
            resolved: false,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            resolves: None,
        };
        let json = serde_json::to_value(AlertTransition::Triggered(record)).unwrap();
        assert_eq!(json["transition"], "triggered");
        assert_eq!(json["deviceId"], "d1");
        assert_eq!(json["currentValue"], 45.5);
        assert!(json.get("resolves").is_none());
    }
}
