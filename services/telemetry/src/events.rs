//! Realtime wire protocol
//!
//! Clients send `type`-tagged JSON messages; the server answers with
//! `event`-tagged JSON events. Broadcast deltas additionally carry the
//! broadcaster's publish sequence so a client can notice dropped deltas.

use serde::{Deserialize, Serialize};
use types::alert::AlertTransition;
use types::errors::AuthorizationError;
use types::ids::DeviceId;
use types::reading::DeviceReading;

/// Message sent by a realtime client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeTemperature {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    UnsubscribeTemperature {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    Ping,
}

impl ClientMessage {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Event sent to a realtime client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Subscribed {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    Unsubscribed {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    /// Sent instead of `Subscribed` when authorization fails.
    SubscriptionRejected {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        kind: String,
        message: String,
    },
    /// Last published reading, sent once right after subscribing.
    Snapshot { reading: DeviceReading },
    TemperatureUpdate { reading: DeviceReading },
    TemperatureAlert { alert: AlertTransition },
    Error { message: String },
    Pong,
}

impl ServerEvent {
    pub fn rejected(device_id: DeviceId, error: &AuthorizationError) -> Self {
        ServerEvent::SubscriptionRejected {
            device_id,
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: all keys are strings and
        // floats are emitted as JSON numbers (non-finite ones as null).
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"event":"error"}"#))
    }
}

/// A state or alert change for one device.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Reading(DeviceReading),
    Alert(AlertTransition),
}

impl Delta {
    pub fn into_event(self) -> ServerEvent {
        match self {
            Delta::Reading(reading) => ServerEvent::TemperatureUpdate { reading },
            Delta::Alert(alert) => ServerEvent::TemperatureAlert { alert },
        }
    }
}

/// A broadcast event with its publish sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Published {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: ServerEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe_message() {
        let msg = ClientMessage::parse(r#"{"type":"subscribe_temperature","deviceId":"d1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubscribeTemperature {
                device_id: DeviceId::new("d1")
            }
        );
        assert!(ClientMessage::parse(r#"{"type":"subscribe_humidity","deviceId":"d1"}"#).is_err());
    }

    #[test]
    fn test_rejection_event_shape() {
        let event = ServerEvent::rejected(DeviceId::new("d1"), &AuthorizationError::MissingToken);
        let json: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(json["event"], "subscription_rejected");
        assert_eq!(json["deviceId"], "d1");
        assert_eq!(json["kind"], "MISSING_TOKEN");
    }

    #[test]
    fn test_published_flattens_event() {
        let published = Published {
            sequence: 7,
            event: ServerEvent::Pong,
        };
        let json = serde_json::to_value(&published).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["event"], "pong");
    }
}
