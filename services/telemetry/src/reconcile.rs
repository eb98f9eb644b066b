//! State reconciler
//!
//! Folds an unordered snapshot of ledger documents into the current reading
//! per device. `reconcile` is a pure function of its input: the ledger has no
//! "latest per key" query, so current state is always recomputed from the
//! full log rather than maintained incrementally.
//!
//! Selection rule per device: the temperature document with the greatest
//! observed time wins. When two documents share an identical observed time
//! the one later in iteration order wins, so for such ties the result depends
//! on the order the ledger returned them in.

use std::collections::BTreeMap;

use tracing::warn;
use types::document::{FieldValue, LedgerDocument};
use types::ids::DeviceId;
use types::reading::{DeviceReading, TEMPERATURE_SENSOR};

/// Field holding the device identifier.
pub const DEVICE_FIELD: &str = "coreid";
/// Field holding the device type discriminator.
pub const DEVICE_TYPE_FIELD: &str = "device_type";
/// Field holding the raw temperature payload.
pub const DATA_FIELD: &str = "data";
pub const NAME_FIELD: &str = "name";
pub const LOCATION_FIELD: &str = "location";

/// Reconciliation options.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Treat documents without a `device_type` as temperature readings.
    /// Older firmware did not send the field.
    pub untyped_as_temperature: bool,
}

/// Current reading per device.
pub type DeviceStates = BTreeMap<DeviceId, DeviceReading>;

/// Derive the current reading for every device in `documents`.
pub fn reconcile(documents: &[LedgerDocument], options: &ReconcileOptions) -> DeviceStates {
    let mut current: DeviceStates = BTreeMap::new();

    for reading in documents.iter().filter_map(|doc| to_reading(doc, options)) {
        match current.get(&reading.device_id) {
            // Strictly older loses; equal timestamps go to the later document.
            Some(existing) if reading.observed_at < existing.observed_at => {}
            _ => {
                current.insert(reading.device_id.clone(), reading);
            }
        }
    }

    current
}

/// Every reading of one device, newest first.
pub fn history(
    documents: &[LedgerDocument],
    device_id: &DeviceId,
    options: &ReconcileOptions,
) -> Vec<DeviceReading> {
    let mut readings: Vec<DeviceReading> = documents
        .iter()
        .filter(|doc| doc.text_field(DEVICE_FIELD).map(str::trim) == Some(device_id.as_str()))
        .filter_map(|doc| to_reading(doc, options))
        .collect();

    // Stable sort keeps ledger order among equal timestamps.
    readings.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
    readings
}

/// Whether a document is a temperature sensor record under `options`.
pub fn is_temperature_document(document: &LedgerDocument, options: &ReconcileOptions) -> bool {
    match document.field(DEVICE_TYPE_FIELD) {
        Some(value) => value.as_text() == Some(TEMPERATURE_SENSOR),
        None => options.untyped_as_temperature,
    }
}

/// Interpret one document as a reading. Returns `None` for non-temperature
/// documents and for documents with no usable device id.
fn to_reading(document: &LedgerDocument, options: &ReconcileOptions) -> Option<DeviceReading> {
    if !is_temperature_document(document, options) {
        return None;
    }

    let device_id = match document.text_field(DEVICE_FIELD).and_then(DeviceId::try_new) {
        Some(id) => id,
        None => {
            warn!(document_id = %document.id, "Skipping temperature document without coreid");
            return None;
        }
    };

    Some(DeviceReading {
        temperature: parse_temperature(document),
        location: document.text_field(LOCATION_FIELD).map(str::to_string),
        name: document.text_field(NAME_FIELD).map(str::to_string),
        observed_at: document.observed_at(),
        device_id,
    })
}

fn parse_temperature(document: &LedgerDocument) -> f64 {
    match document.field(DATA_FIELD).and_then(FieldValue::as_f64) {
        Some(value) if value.is_finite() => value,
        _ => {
            warn!(
                document_id = %document.id,
                data = ?document.field(DATA_FIELD),
                "Unparsable temperature payload, reading as 0.0"
            );
            0.0
        }
    }
}
