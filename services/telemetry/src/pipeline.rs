//! Reconciliation pipeline
//!
//! One pass: fetch the temperature and alert collections, reconcile current
//! readings, publish readings newer than the last ones published, evaluate
//! alerts and publish the resulting transitions. Alert records are appended
//! to the ledger in the background; they reach other instances through the
//! same read path on later passes. A failed append is forgotten by the
//! monitor, so a later pass evaluates the device against the ledger again.
//!
//! Passes are independent and may overlap. Each works from its own
//! `fetch_all` snapshot; monotonic per-device checks keep an older pass from
//! overriding the effects of a newer one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use types::alert::{ActiveAlert, AlertRecord, AlertTransition};
use types::document::{FieldValue, Fields, LedgerDocument};
use types::errors::{LedgerError, ReconciliationError};
use types::ids::{CollectionId, DeviceId};
use types::reading::{DeviceReading, TEMPERATURE_SENSOR};

use crate::alerts::{self, AlertMonitor, AlertPolicy};
use crate::broadcast::Broadcaster;
use crate::events::Delta;
use crate::ledger::DocumentStore;
use crate::reconcile::{
    self, DeviceStates, ReconcileOptions, DATA_FIELD, DEVICE_FIELD, DEVICE_TYPE_FIELD,
    LOCATION_FIELD, NAME_FIELD,
};

/// Ledger collections the pipeline reads and writes.
#[derive(Debug, Clone)]
pub struct Collections {
    pub temperature: CollectionId,
    pub alerts: CollectionId,
    pub access_log: CollectionId,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            temperature: CollectionId::new("temperature"),
            alerts: CollectionId::new("alerts"),
            access_log: CollectionId::new("access_logs"),
        }
    }
}

/// A new reading submitted through the REST surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSubmission {
    pub device_id: DeviceId,
    pub temperature: f64,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Summary of one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub devices: usize,
    pub readings_published: usize,
    pub transitions: Vec<AlertTransition>,
}

pub struct Pipeline {
    store: Arc<dyn DocumentStore>,
    collections: Collections,
    options: ReconcileOptions,
    monitor: Arc<AlertMonitor>,
    broadcaster: Arc<Broadcaster>,
    last_published: DashMap<DeviceId, DeviceReading>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collections: Collections,
        options: ReconcileOptions,
        policy: AlertPolicy,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            store,
            collections,
            options,
            monitor: Arc::new(AlertMonitor::new(policy)),
            broadcaster,
            last_published: DashMap::new(),
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn policy(&self) -> &AlertPolicy {
        self.monitor.policy()
    }

    /// Reconcile current readings from a fresh snapshot, without publishing.
    pub async fn current_states(&self) -> Result<DeviceStates, ReconciliationError> {
        let documents = self.store.fetch_all(&self.collections.temperature).await?;
        Ok(reconcile::reconcile(&documents, &self.options))
    }

    /// Readings of one device, newest first, at most `limit` of them.
    pub async fn device_history(
        &self,
        device_id: &DeviceId,
        limit: Option<usize>,
    ) -> Result<Vec<DeviceReading>, ReconciliationError> {
        let documents = self.store.fetch_all(&self.collections.temperature).await?;
        let mut readings = reconcile::history(&documents, device_id, &self.options);
        if let Some(limit) = limit {
            readings.truncate(limit);
        }
        Ok(readings)
    }

    /// Active alert per device, from a fresh snapshot of the alert collection.
    pub async fn active_alerts(&self) -> Result<BTreeMap<DeviceId, ActiveAlert>, ReconciliationError> {
        let documents = self.store.fetch_all(&self.collections.alerts).await?;
        Ok(alerts::active_alerts(&documents))
    }

    /// Last reading published for a device, if any.
    pub fn last_reading(&self, device_id: &DeviceId) -> Option<DeviceReading> {
        self.last_published.get(device_id).map(|r| r.value().clone())
    }

    /// Append a temperature document. Subscribers see it on a later pass.
    pub async fn submit_reading(
        &self,
        submission: ReadingSubmission,
    ) -> Result<LedgerDocument, LedgerError> {
        let mut fields = Fields::new();
        fields.insert(DEVICE_FIELD.into(), FieldValue::from(submission.device_id.as_str()));
        fields.insert(DATA_FIELD.into(), FieldValue::from(submission.temperature.to_string()));
        fields.insert(DEVICE_TYPE_FIELD.into(), FieldValue::from(TEMPERATURE_SENSOR));
        fields.insert("published_at".into(), FieldValue::from(Utc::now().to_rfc3339()));
        if let Some(name) = submission.name {
            fields.insert(NAME_FIELD.into(), FieldValue::from(name));
        }
        if let Some(location) = submission.location {
            fields.insert(LOCATION_FIELD.into(), FieldValue::from(location));
        }

        self.store
            .append(&self.collections.temperature, fields)
            .await
    }

    /// Append an alert record and wait for the ledger's answer.
    pub async fn submit_alert(&self, record: &AlertRecord) -> Result<LedgerDocument, LedgerError> {
        self.store
            .append(&self.collections.alerts, alerts::record_fields(record))
            .await
    }

    /// Run one reconciliation pass.
    pub async fn run_pass(&self) -> Result<PassReport, ReconciliationError> {
        let documents = self.store.fetch_all(&self.collections.temperature).await?;
        let alert_documents = self.store.fetch_all(&self.collections.alerts).await?;

        let states = reconcile::reconcile(&documents, &self.options);
        let views = alerts::alert_views(&alert_documents);
        let mut report = PassReport {
            devices: states.len(),
            ..PassReport::default()
        };

        for reading in states.values() {
            if self.mark_published(reading) {
                self.broadcaster
                    .publish(&reading.device_id, Delta::Reading(reading.clone()));
                report.readings_published += 1;
            }

            let transition = self.monitor.observe(reading, views.get(&reading.device_id));
            if let Some(record) = transition.record() {
                info!(
                    device_id = %record.device_id,
                    severity = %record.severity,
                    resolved = record.resolved,
                    value = record.current_value,
                    "Alert transition"
                );
                self.broadcaster
                    .publish(&reading.device_id, Delta::Alert(transition.clone()));
                self.append_alert_in_background(record.clone());
                report.transitions.push(transition);
            }
        }

        Ok(report)
    }

    /// Record `reading` as published unless an equal or newer one already was.
    fn mark_published(&self, reading: &DeviceReading) -> bool {
        match self.last_published.entry(reading.device_id.clone()) {
            Entry::Occupied(mut current) => {
                if reading.is_newer_than(current.get()) {
                    current.insert(reading.clone());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(reading.clone());
                true
            }
        }
    }

    fn append_alert_in_background(&self, record: AlertRecord) {
        let store = self.store.clone();
        let monitor = self.monitor.clone();
        let collection = self.collections.alerts.clone();
        tokio::spawn(async move {
            let fields = alerts::record_fields(&record);
            match store.append(&collection, fields).await {
                Ok(document) => {
                    debug!(device_id = %record.device_id, id = %document.id, "Alert record appended");
                }
                Err(e) => {
                    error!(
                        device_id = %record.device_id,
                        kind = e.kind(),
                        error = %e,
                        "Failed to append alert record"
                    );
                    monitor.forget(&record.device_id, record.timestamp);
                }
            }
        });
    }
}

/// Exponential backoff between failed passes.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

/// Polling schedule.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub backoff: Backoff,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            backoff: Backoff::default(),
        }
    }
}

/// Run passes until `shutdown` flips to true or its sender is dropped.
///
/// Transient ledger failures back off exponentially; rejections wait for the
/// regular interval since retrying sooner would not change the answer.
pub fn spawn_poller(
    pipeline: Arc<Pipeline>,
    config: PollerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = config.interval.as_millis() as u64, "Reconciliation poller started");
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match pipeline.run_pass().await {
                Ok(report) => {
                    failures = 0;
                    debug!(
                        devices = report.devices,
                        published = report.readings_published,
                        transitions = report.transitions.len(),
                        "Reconciliation pass complete"
                    );
                    config.interval
                }
                Err(e) if e.ledger_error().is_transient() => {
                    failures = failures.saturating_add(1);
                    let delay = config.backoff.delay_for_attempt(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Reconciliation pass failed, backing off"
                    );
                    delay
                }
                Err(e) => {
                    failures = 0;
                    error!(error = %e, kind = e.ledger_error().kind(), "Reconciliation pass rejected");
                    config.interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Reconciliation poller stopped");
    })
}
