//! Alert evaluation
//!
//! Per-device state machine: `Normal -> Triggered -> Resolved -> Normal`.
//! The evaluator is stateless; the "previously active" alert is rebuilt from
//! the ledger's alert collection the same way readings are.
//!
//! [`AlertMonitor`] wraps the evaluator for the polling pipeline. It keeps a
//! per-device watermark so that a pass working from an older snapshot cannot
//! regress a newer transition, and remembers the last transition it emitted
//! until the ledger catches up with the append.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use types::alert::{ActiveAlert, AlertRecord, AlertTransition, Severity};
use types::document::{timestamp, FieldValue, Fields, LedgerDocument};
use types::ids::{DeviceId, DocumentId};
use types::reading::DeviceReading;

pub const DEVICE_ID_FIELD: &str = "device_id";
pub const SEVERITY_FIELD: &str = "severity";
pub const MESSAGE_FIELD: &str = "message";
pub const LIMIT_FIELD: &str = "limit";
pub const CURRENT_VALUE_FIELD: &str = "current_value";
pub const RESOLVED_FIELD: &str = "resolved";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const RESOLVES_FIELD: &str = "resolves";

/// Alert thresholds.
#[derive(Debug, Clone)]
pub struct AlertPolicy {
    /// Readings strictly above this trigger an alert.
    pub limit: f64,
    /// Excess over `limit` at which a trigger is critical rather than a warning.
    pub critical_margin: f64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            limit: 40.0,
            critical_margin: 10.0,
        }
    }
}

impl AlertPolicy {
    pub fn severity_for(&self, value: f64) -> Severity {
        if value - self.limit >= self.critical_margin {
            Severity::Critical
        } else {
            Severity::Warning
        }
    }
}

/// Evaluate one reading against the policy and the device's active alert.
pub fn evaluate(
    reading: &DeviceReading,
    policy: &AlertPolicy,
    previous: Option<&ActiveAlert>,
) -> AlertTransition {
    let over_limit = reading.temperature > policy.limit;

    match previous {
        Some(active) if reading.observed_at < active.triggered_at => AlertTransition::Stale,
        Some(_) if over_limit => AlertTransition::Unchanged,
        Some(active) => AlertTransition::Resolved(AlertRecord {
            device_id: reading.device_id.clone(),
            severity: Severity::Info,
            message: format!(
                "Temperature {:.1} back within limit {:.1}",
                reading.temperature, policy.limit
            ),
            limit: policy.limit,
            current_value: reading.temperature,
            resolved: true,
            timestamp: reading.observed_at,
            resolves: active.document_id.clone(),
        }),
        None if over_limit => AlertTransition::Triggered(AlertRecord {
            device_id: reading.device_id.clone(),
            severity: policy.severity_for(reading.temperature),
            message: format!(
                "Temperature {:.1} exceeds limit {:.1}",
                reading.temperature, policy.limit
            ),
            limit: policy.limit,
            current_value: reading.temperature,
            resolved: false,
            timestamp: reading.observed_at,
            resolves: None,
        }),
        None => AlertTransition::Unchanged,
    }
}

/// Ledger fields for an alert record.
pub fn record_fields(record: &AlertRecord) -> Fields {
    let mut fields = Fields::new();
    fields.insert(DEVICE_ID_FIELD.into(), FieldValue::from(record.device_id.as_str()));
    fields.insert(SEVERITY_FIELD.into(), FieldValue::from(record.severity.as_str()));
    fields.insert(MESSAGE_FIELD.into(), FieldValue::from(record.message.clone()));
    fields.insert(LIMIT_FIELD.into(), FieldValue::Number(record.limit));
    fields.insert(CURRENT_VALUE_FIELD.into(), FieldValue::Number(record.current_value));
    fields.insert(RESOLVED_FIELD.into(), FieldValue::Bool(record.resolved));
    fields.insert(TIMESTAMP_FIELD.into(), FieldValue::from(record.timestamp.to_rfc3339()));
    if let Some(resolves) = &record.resolves {
        fields.insert(RESOLVES_FIELD.into(), FieldValue::from(resolves.as_str()));
    }
    fields
}

/// Decode an alert document. Returns `None` when no device id is present.
pub fn parse_record(document: &LedgerDocument) -> Option<AlertRecord> {
    let device_id = [DEVICE_ID_FIELD, "deviceId", "coreid"]
        .iter()
        .find_map(|key| document.text_field(key))
        .and_then(DeviceId::try_new)?;

    let resolved = document
        .field(RESOLVED_FIELD)
        .and_then(FieldValue::as_bool)
        .unwrap_or(false);
    let number = |key: &str| document.field(key).and_then(FieldValue::as_f64).unwrap_or(0.0);

    Some(AlertRecord {
        device_id,
        severity: document
            .text_field(SEVERITY_FIELD)
            .and_then(Severity::parse)
            .unwrap_or(if resolved { Severity::Info } else { Severity::Warning }),
        message: document.text_field(MESSAGE_FIELD).unwrap_or_default().to_string(),
        limit: number(LIMIT_FIELD),
        current_value: document
            .field(CURRENT_VALUE_FIELD)
            .or_else(|| document.field("currentValue"))
            .and_then(FieldValue::as_f64)
            .unwrap_or(0.0),
        resolved,
        timestamp: document
            .text_field(TIMESTAMP_FIELD)
            .and_then(timestamp::parse_text)
            .unwrap_or_else(|| document.observed_at()),
        resolves: document
            .text_field(RESOLVES_FIELD)
            .map(DocumentId::new),
    })
}

/// Alert state of one device as recorded in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertView {
    pub active: Option<ActiveAlert>,
    /// Timestamp of the newest alert record for the device.
    pub as_of: DateTime<Utc>,
}

/// Rebuild per-device alert state from the alert collection.
///
/// The active alert is the most recent unresolved record, unless it has
/// been closed. A resolution naming a record (`resolves`) closes exactly that
/// record. A resolution without a reference closes unresolved records
/// strictly older than itself; on identical timestamps the unresolved record
/// stays active.
pub fn alert_views(documents: &[LedgerDocument]) -> BTreeMap<DeviceId, AlertView> {
    struct Fold {
        latest_unresolved: Option<(DocumentId, AlertRecord)>,
        closed: HashSet<DocumentId>,
        latest_unreferenced_resolution: Option<DateTime<Utc>>,
        as_of: DateTime<Utc>,
    }

    let mut folds: BTreeMap<DeviceId, Fold> = BTreeMap::new();

    for document in documents {
        let Some(record) = parse_record(document) else {
            continue;
        };
        let fold = folds.entry(record.device_id.clone()).or_insert_with(|| Fold {
            latest_unresolved: None,
            closed: HashSet::new(),
            latest_unreferenced_resolution: None,
            as_of: record.timestamp,
        });
        fold.as_of = fold.as_of.max(record.timestamp);

        if record.resolved {
            match &record.resolves {
                Some(target) => {
                    fold.closed.insert(target.clone());
                }
                None => {
                    fold.latest_unreferenced_resolution = Some(
                        fold.latest_unreferenced_resolution
                            .map_or(record.timestamp, |t| t.max(record.timestamp)),
                    );
                }
            }
        } else {
            let newer = match &fold.latest_unresolved {
                Some((_, current)) => record.timestamp >= current.timestamp,
                None => true,
            };
            if newer {
                fold.latest_unresolved = Some((document.id.clone(), record));
            }
        }
    }

    folds
        .into_iter()
        .map(|(device_id, fold)| {
            let active = fold.latest_unresolved.and_then(|(document_id, record)| {
                let closed_by_reference = fold.closed.contains(&document_id);
                let closed_by_time = fold
                    .latest_unreferenced_resolution
                    .is_some_and(|resolved_at| resolved_at > record.timestamp);
                if closed_by_reference || closed_by_time {
                    None
                } else {
                    Some(ActiveAlert {
                        document_id: Some(document_id),
                        device_id: record.device_id,
                        severity: record.severity,
                        limit: record.limit,
                        current_value: record.current_value,
                        triggered_at: record.timestamp,
                    })
                }
            });
            (device_id, AlertView { active, as_of: fold.as_of })
        })
        .collect()
}

/// Active alert per device, from the alert collection.
pub fn active_alerts(documents: &[LedgerDocument]) -> BTreeMap<DeviceId, ActiveAlert> {
    alert_views(documents)
        .into_iter()
        .filter_map(|(device_id, view)| view.active.map(|active| (device_id, active)))
        .collect()
}

#[derive(Debug, Clone)]
struct DeviceWatch {
    /// Observed time of the newest reading evaluated for this device.
    evaluated_at: DateTime<Utc>,
    /// Last transition emitted by this process, as (record time, resulting state).
    emitted: Option<(DateTime<Utc>, Option<ActiveAlert>)>,
}

/// Evaluator state shared by concurrent reconciliation passes.
pub struct AlertMonitor {
    policy: AlertPolicy,
    devices: DashMap<DeviceId, DeviceWatch>,
}

impl AlertMonitor {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            policy,
            devices: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    /// Evaluate `reading` against the ledger's view of the device.
    ///
    /// Readings not newer than the last one evaluated for the device are
    /// `Stale`. The previous state is whichever is newer of the ledger view
    /// and this monitor's last emitted transition; on a tie the ledger wins.
    pub fn observe(&self, reading: &DeviceReading, ledger: Option<&AlertView>) -> AlertTransition {
        let mut watch = self
            .devices
            .entry(reading.device_id.clone())
            .or_insert_with(|| DeviceWatch {
                evaluated_at: DateTime::<Utc>::MIN_UTC,
                emitted: None,
            });

        if reading.observed_at <= watch.evaluated_at {
            return AlertTransition::Stale;
        }

        let ledger_as_of = ledger.map(|view| view.as_of);
        let previous = match (&watch.emitted, ledger) {
            (Some((emitted_at, state)), _) if ledger_as_of.map_or(true, |t| *emitted_at > t) => {
                state.clone()
            }
            (_, Some(view)) => view.active.clone(),
            (_, None) => None,
        };

        let transition = evaluate(reading, &self.policy, previous.as_ref());
        watch.evaluated_at = reading.observed_at;

        match &transition {
            AlertTransition::Triggered(record) => {
                let active = ActiveAlert {
                    document_id: None,
                    device_id: record.device_id.clone(),
                    severity: record.severity,
                    limit: record.limit,
                    current_value: record.current_value,
                    triggered_at: record.timestamp,
                };
                watch.emitted = Some((record.timestamp, Some(active)));
            }
            AlertTransition::Resolved(record) => {
                watch.emitted = Some((record.timestamp, None));
            }
            AlertTransition::Unchanged | AlertTransition::Stale => {}
        }

        transition
    }

    /// Drop the transition emitted at `emitted_at` after its append failed.
    ///
    /// The device falls back to the ledger view, and the reading that caused
    /// the transition may be evaluated again. A newer transition is kept.
    pub fn forget(&self, device_id: &DeviceId, emitted_at: DateTime<Utc>) {
        let Some(mut watch) = self.devices.get_mut(device_id) else {
            return;
        };
        if !matches!(&watch.emitted, Some((at, _)) if *at == emitted_at) {
            return;
        }
        watch.emitted = None;
        if watch.evaluated_at >= emitted_at {
            watch.evaluated_at = emitted_at - chrono::Duration::nanoseconds(1);
        }
    }
}
