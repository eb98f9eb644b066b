//! Realtime broadcaster with per-connection backpressure
//!
//! Each connection owns one bounded FIFO queue drained by its writer task.
//! Publishing serialises a delta once and offers it to every subscriber's
//! queue without waiting, so a slow or dead connection only ever affects
//! itself. Per-connection ordering follows publish order because every
//! delivery goes through that single queue.
//!
//! Nothing is persisted or replayed: a connection that subscribes after a
//! publish does not receive it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use types::ids::{ConnectionId, DeviceId};

use crate::events::{Delta, Published, ServerEvent};
use crate::registry::ChannelRegistry;

/// Drop policy when a connection's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the lagging connection.
    Disconnect,
    /// Drop the new delta for that connection only.
    DropNewest,
}

/// A queued outbound message for a connection.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Serialized event, shared by every recipient of a publish.
    pub payload: Arc<str>,
    /// Publish sequence; `None` for control events.
    pub sequence: Option<u64>,
    pub queued_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn control(event: &ServerEvent) -> Self {
        Self {
            payload: Arc::from(event.to_json()),
            sequence: None,
            queued_at: Utc::now(),
        }
    }
}

/// Send path of one connection.
#[derive(Debug, Clone)]
pub struct Outlet {
    connection_id: ConnectionId,
    sender: mpsc::Sender<OutboundMessage>,
    evicted: Arc<Notify>,
}

impl Outlet {
    pub fn new(
        connection_id: ConnectionId,
        sender: mpsc::Sender<OutboundMessage>,
        evicted: Arc<Notify>,
    ) -> Self {
        Self {
            connection_id,
            sender,
            evicted,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue without waiting.
    pub fn try_deliver(&self, message: OutboundMessage) -> Result<(), TrySendError<OutboundMessage>> {
        self.sender.try_send(message)
    }

    /// Queue a control event without waiting.
    pub fn reply(&self, event: &ServerEvent) -> Result<(), TrySendError<OutboundMessage>> {
        self.try_deliver(OutboundMessage::control(event))
    }

    /// Signal the connection's task to shut down.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }
}

/// Configuration for the broadcaster.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Outbound queue size per connection.
    pub queue_capacity: usize,
    pub drop_policy: DropPolicy,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            drop_policy: DropPolicy::Disconnect,
        }
    }
}

/// Outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub sequence: u64,
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Fans deltas out to the subscribers of a device.
pub struct Broadcaster {
    registry: Arc<ChannelRegistry>,
    config: BroadcastConfig,
    sequence: AtomicU64,
    /// Total backpressure incidents since creation.
    incidents: AtomicU64,
}

impl Broadcaster {
    pub fn new(registry: Arc<ChannelRegistry>, config: BroadcastConfig) -> Self {
        Self {
            registry,
            config,
            sequence: AtomicU64::new(0),
            incidents: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn total_incidents(&self) -> u64 {
        self.incidents.load(Ordering::Relaxed)
    }

    /// Deliver `delta` to every current subscriber of `device_id`.
    pub fn publish(&self, device_id: &DeviceId, delta: Delta) -> PublishReport {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let subscribers = self.registry.subscribers(device_id);
        let mut report = PublishReport {
            sequence,
            ..PublishReport::default()
        };
        if subscribers.is_empty() {
            return report;
        }

        let published = Published {
            sequence,
            event: delta.into_event(),
        };
        let payload: Arc<str> = match serde_json::to_string(&published) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Failed to serialize delta");
                return report;
            }
        };
        let queued_at = Utc::now();

        for subscriber in subscribers.iter() {
            let message = OutboundMessage {
                payload: payload.clone(),
                sequence: Some(sequence),
                queued_at,
            };
            match subscriber.outlet.try_deliver(message) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let incidents = self.incidents.fetch_add(1, Ordering::Relaxed) + 1;
                    let connection_id = subscriber.outlet.connection_id();
                    match self.config.drop_policy {
                        DropPolicy::Disconnect => {
                            warn!(
                                connection_id = %connection_id,
                                total_incidents = incidents,
                                "Backpressure: disconnecting lagging connection"
                            );
                            self.registry.close(connection_id);
                            subscriber.outlet.evict();
                            report.evicted.push(connection_id);
                        }
                        DropPolicy::DropNewest => {
                            debug!(
                                connection_id = %connection_id,
                                sequence,
                                total_incidents = incidents,
                                "Backpressure: dropping delta for lagging connection"
                            );
                            report.dropped += 1;
                        }
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    // Writer task already gone; its close will follow.
                    debug!(
                        connection_id = %subscriber.outlet.connection_id(),
                        "Skipping delivery to closed connection"
                    );
                    report.dropped += 1;
                }
            }
        }

        report
    }
}
