//! Derived device state
//!
//! Readings are never stored by this system. They are recomputed from the
//! ledger on each reconciliation pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;

/// `device_type` value that marks a temperature sensor document.
pub const TEMPERATURE_SENSOR: &str = "temperature_sensor";

/// Current (or historical) temperature reading of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReading {
    pub device_id: DeviceId,
    /// Degrees, as reported by the device. Unparsable payloads read as 0.0.
    pub temperature: f64,
    pub location: Option<String>,
    pub name: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl DeviceReading {
    /// Whether this reading is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &DeviceReading) -> bool {
        self.observed_at > other.observed_at
    }
}
