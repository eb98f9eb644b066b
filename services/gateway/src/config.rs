use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use telemetry::alerts::AlertPolicy;
use telemetry::broadcast::{BroadcastConfig, DropPolicy};
use telemetry::ledger::LedgerConfig;
use telemetry::pipeline::{Backoff, Collections, PollerConfig};
use telemetry::reconcile::ReconcileOptions;
use telemetry::registry::AccessPolicy;
use thiserror::Error;
use tracing::info;
use types::access::AccessLevel;
use types::ids::{CollectionId, DeviceId};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Environment variable {0} is required")]
    Missing(&'static str),

    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub ledger: LedgerConfig,
    pub identity_url: String,
    pub collections: Collections,
    pub poller: PollerConfig,
    pub alert_policy: AlertPolicy,
    pub reconcile: ReconcileOptions,
    pub access_policy: AccessPolicy,
    pub broadcast: BroadcastConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset optional keys fall back to their
    /// defaults, logged at info.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let timeout = Duration::from_secs(env.load("LEDGER_TIMEOUT_SECS", "10")?);
        let ledger = LedgerConfig {
            base_url: env.required("LEDGER_URL")?,
            api_key: env.required("LEDGER_API_KEY")?,
            clearance: env.optional("LEDGER_CLEARANCE"),
            timeout,
        };

        let collections = Collections {
            temperature: CollectionId::new(env.text("TEMPERATURE_COLLECTION_ID", "temperature")),
            alerts: CollectionId::new(env.text("ALERT_COLLECTION_ID", "alerts")),
            access_log: CollectionId::new(env.text("ACCESS_LOG_COLLECTION_ID", "access_logs")),
        };

        let poller = PollerConfig {
            interval: Duration::from_secs(env.load("POLL_INTERVAL_SECS", "5")?),
            backoff: Backoff::default(),
        };

        let alert_policy = AlertPolicy {
            limit: env.load("TEMPERATURE_LIMIT", "40.0")?,
            critical_margin: env.load("CRITICAL_MARGIN", "10.0")?,
        };

        let reconcile = ReconcileOptions {
            untyped_as_temperature: env.load("UNTYPED_AS_TEMPERATURE", "false")?,
        };

        let min_level = env.text("MONITORING_MIN_ACCESS_LEVEL", "viewer");
        let access_policy = AccessPolicy {
            default_level: AccessLevel::parse(&min_level).ok_or_else(|| ConfigError::Invalid {
                key: "MONITORING_MIN_ACCESS_LEVEL",
                value: min_level.clone(),
                reason: "unknown access level".to_string(),
            })?,
            device_levels: parse_device_levels(&env.text("DEVICE_ACCESS_LEVELS", "d1=manager,d2=admin"))?,
        };

        let drop_policy = env.text("WS_DROP_POLICY", "disconnect");
        let broadcast = BroadcastConfig {
            queue_capacity: env.load("WS_QUEUE_CAPACITY", "256")?,
            drop_policy: parse_drop_policy(&drop_policy)?,
        };

        Ok(Self {
            port: env.load("PORT", "8080")?,
            ledger,
            identity_url: env.required("IDENTITY_URL")?,
            collections,
            poller,
            alert_policy,
            reconcile,
            access_policy,
            broadcast,
        })
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn text(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
    }

    fn load<T: FromStr>(&self, key: &'static str, default: &str) -> Result<T, ConfigError>
    where
        T::Err: Display,
    {
        let value = self.text(key, default);
        value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        })
    }
}

/// Parse `device=level` pairs separated by commas.
fn parse_device_levels(raw: &str) -> Result<HashMap<DeviceId, AccessLevel>, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key: "DEVICE_ACCESS_LEVELS",
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut levels = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (device, level) = pair
            .split_once('=')
            .ok_or_else(|| invalid("expected device=level"))?;
        let device = DeviceId::try_new(device).ok_or_else(|| invalid("empty device id"))?;
        let level = AccessLevel::parse(level).ok_or_else(|| invalid("unknown access level"))?;
        levels.insert(device, level);
    }
    Ok(levels)
}

fn parse_drop_policy(raw: &str) -> Result<DropPolicy, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "disconnect" => Ok(DropPolicy::Disconnect),
        "drop_newest" | "drop-newest" => Ok(DropPolicy::DropNewest),
        _ => Err(ConfigError::Invalid {
            key: "WS_DROP_POLICY",
            value: raw.to_string(),
            reason: "expected disconnect or drop_newest".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("LEDGER_URL", "http://ledger.local"),
        ("LEDGER_API_KEY", "key"),
        ("IDENTITY_URL", "http://identity.local"),
    ];

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.ledger.timeout, Duration::from_secs(10));
        assert_eq!(config.ledger.clearance, None);
        assert_eq!(config.collections.alerts.as_str(), "alerts");
        assert_eq!(config.poller.interval, Duration::from_secs(5));
        assert_eq!(config.alert_policy.limit, 40.0);
        assert!(!config.reconcile.untyped_as_temperature);
        assert_eq!(config.access_policy.default_level, AccessLevel::VIEWER);
        assert_eq!(
            config.access_policy.required_for(&DeviceId::new("d2")),
            AccessLevel::ADMIN
        );
        assert_eq!(config.broadcast.queue_capacity, 256);
        assert_eq!(config.broadcast.drop_policy, DropPolicy::Disconnect);
    }

    #[test]
    fn test_missing_required() {
        let err = Config::from_lookup(lookup(&REQUIRED[..2])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("IDENTITY_URL"));
    }

    #[test]
    fn test_overrides() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("PORT", "9000"),
            ("TEMPERATURE_LIMIT", "35.5"),
            ("DEVICE_ACCESS_LEVELS", "lab=operator"),
            ("WS_DROP_POLICY", "drop_newest"),
            ("UNTYPED_AS_TEMPERATURE", "true"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.alert_policy.limit, 35.5);
        assert_eq!(config.access_policy.device_levels.len(), 1);
        assert_eq!(config.broadcast.drop_policy, DropPolicy::DropNewest);
        assert!(config.reconcile.untyped_as_temperature);
    }

    #[test]
    fn test_invalid_values() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("PORT", "eighty"));
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::Invalid { key: "PORT", .. })
        ));

        assert!(parse_device_levels("d1").is_err());
        assert!(parse_device_levels("d1=superuser").is_err());
        assert!(parse_drop_policy("drop_oldest").is_err());
    }
}
