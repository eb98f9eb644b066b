//! Access-gated channel registry
//!
//! Tracks open realtime connections and the device channels each one is
//! admitted to. Admission re-validates the caller's token with the identity
//! service on every request and checks the device's required access level.
//!
//! The registry is the only shared mutable structure of the pipeline. Its
//! tables live behind an `Arc` that mutations replace (copy-on-write), so a
//! publisher iterates an immutable snapshot and never sees a half-applied
//! subscribe or close.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use types::access::AccessLevel;
use types::errors::AuthorizationError;
use types::ids::{ConnectionId, DeviceId, UserId};

use crate::audit::{AccessAudit, AccessEvent};
use crate::broadcast::{OutboundMessage, Outlet};
use crate::identity::IdentityVerifier;

/// Access levels required to monitor devices.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    /// Required level for devices without an override.
    pub default_level: AccessLevel,
    pub device_levels: HashMap<DeviceId, AccessLevel>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            default_level: AccessLevel::VIEWER,
            device_levels: HashMap::new(),
        }
    }
}

impl AccessPolicy {
    pub fn required_for(&self, device_id: &DeviceId) -> AccessLevel {
        self.device_levels
            .get(device_id)
            .copied()
            .unwrap_or(self.default_level)
    }
}

/// Request to join one device channel.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub connection_id: ConnectionId,
    pub device_id: DeviceId,
    /// Bearer token to re-validate; `None` when the client sent none.
    pub token: Option<String>,
}

/// An admitted (connection, device) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub connection_id: ConnectionId,
    pub device_id: DeviceId,
    pub authorized_user_id: UserId,
}

/// A subscription together with the connection's send path.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub subscription: Subscription,
    pub outlet: Outlet,
}

/// Receiving side of a registered connection.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    /// Send path for control events addressed to this connection only.
    pub outlet: Outlet,
    pub receiver: mpsc::Receiver<OutboundMessage>,
    /// Notified when the broadcaster evicts this connection.
    pub evicted: Arc<Notify>,
}

#[derive(Debug, Clone)]
struct ConnectionEntry {
    user_id: UserId,
    outlet: Outlet,
    devices: BTreeSet<DeviceId>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    connections: BTreeMap<ConnectionId, ConnectionEntry>,
    channels: BTreeMap<DeviceId, Arc<[Subscriber]>>,
}

impl Tables {
    fn remove_subscriber(&mut self, device_id: &DeviceId, connection_id: ConnectionId) {
        let Some(current) = self.channels.get(device_id) else {
            return;
        };
        let remaining: Vec<Subscriber> = current
            .iter()
            .filter(|s| s.subscription.connection_id != connection_id)
            .cloned()
            .collect();
        if remaining.is_empty() {
            self.channels.remove(device_id);
        } else {
            self.channels.insert(device_id.clone(), remaining.into());
        }
    }
}

pub struct ChannelRegistry {
    identity: Arc<dyn IdentityVerifier>,
    audit: Arc<dyn AccessAudit>,
    policy: AccessPolicy,
    tables: RwLock<Arc<Tables>>,
}

impl ChannelRegistry {
    pub fn new(
        identity: Arc<dyn IdentityVerifier>,
        audit: Arc<dyn AccessAudit>,
        policy: AccessPolicy,
    ) -> Self {
        Self {
            identity,
            audit,
            policy,
            tables: RwLock::new(Arc::new(Tables::default())),
        }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    fn snapshot(&self) -> Arc<Tables> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Apply a mutation to a private copy of the tables and swap it in.
    fn mutate<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut guard = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let tables = Arc::make_mut(&mut *guard);
        f(tables)
    }

    /// Register a new connection for an authenticated user.
    pub fn open(&self, user_id: UserId, queue_capacity: usize) -> Connection {
        let id = ConnectionId::new();
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let evicted = Arc::new(Notify::new());
        let outlet = Outlet::new(id, sender, evicted.clone());

        self.mutate(|tables| {
            tables.connections.insert(
                id,
                ConnectionEntry {
                    user_id: user_id.clone(),
                    outlet: outlet.clone(),
                    devices: BTreeSet::new(),
                },
            );
        });
        debug!(connection_id = %id, user_id = %user_id, "Connection registered");

        Connection {
            id,
            user_id,
            outlet,
            receiver,
            evicted,
        }
    }

    /// Admit a connection to a device channel.
    ///
    /// The token is verified with the identity service on every call. On
    /// success the access event is handed to the audit collaborator in the
    /// background; its failure is logged and does not affect admission.
    /// Re-subscribing to a channel the connection already holds succeeds
    /// without a second audit event.
    pub async fn authorize(
        &self,
        request: SubscriptionRequest,
    ) -> Result<Subscription, AuthorizationError> {
        let token = request
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthorizationError::MissingToken)?;

        let connection_user = self
            .snapshot()
            .connections
            .get(&request.connection_id)
            .map(|entry| entry.user_id.clone())
            .ok_or(AuthorizationError::UnknownConnection(request.connection_id))?;

        let grant = self.identity.verify(token).await?;

        if grant.user_id != connection_user {
            return Err(AuthorizationError::InvalidToken(
                "token belongs to a different user than the connection".to_string(),
            ));
        }

        let required = self.policy.required_for(&request.device_id);
        if !grant.access_level.satisfies(required) {
            return Err(AuthorizationError::InsufficientAccessLevel {
                device_id: request.device_id,
                required,
                granted: grant.access_level,
            });
        }

        let subscription = Subscription {
            connection_id: request.connection_id,
            device_id: request.device_id,
            authorized_user_id: grant.user_id,
        };

        // The connection may have closed while the identity call was in flight.
        let admitted = self.mutate(|tables| {
            let entry = tables
                .connections
                .get_mut(&subscription.connection_id)
                .ok_or(AuthorizationError::UnknownConnection(subscription.connection_id))?;
            if !entry.devices.insert(subscription.device_id.clone()) {
                return Ok(false);
            }
            let subscriber = Subscriber {
                subscription: subscription.clone(),
                outlet: entry.outlet.clone(),
            };

            let mut members: Vec<Subscriber> = tables
                .channels
                .get(&subscription.device_id)
                .map(|current| current.to_vec())
                .unwrap_or_default();
            members.push(subscriber);
            tables
                .channels
                .insert(subscription.device_id.clone(), members.into());
            Ok(true)
        })?;

        if !admitted {
            debug!(
                connection_id = %subscription.connection_id,
                device_id = %subscription.device_id,
                "Subscription already active"
            );
            return Ok(subscription);
        }

        info!(
            connection_id = %subscription.connection_id,
            device_id = %subscription.device_id,
            user_id = %subscription.authorized_user_id,
            "Subscription admitted"
        );

        let audit = self.audit.clone();
        let event = AccessEvent::monitoring(
            subscription.device_id.clone(),
            subscription.authorized_user_id.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = audit.record(event).await {
                warn!(error = %e, "Access log write failed");
            }
        });

        Ok(subscription)
    }

    /// Leave one device channel. Returns whether the subscription existed.
    pub fn unsubscribe(&self, connection_id: ConnectionId, device_id: &DeviceId) -> bool {
        self.mutate(|tables| {
            let removed = tables
                .connections
                .get_mut(&connection_id)
                .is_some_and(|entry| entry.devices.remove(device_id));
            if removed {
                tables.remove_subscriber(device_id, connection_id);
            }
            removed
        })
    }

    /// Remove a connection and all of its subscriptions.
    ///
    /// Returns the devices it was subscribed to.
    pub fn close(&self, connection_id: ConnectionId) -> Vec<DeviceId> {
        let devices = self.mutate(|tables| {
            let Some(entry) = tables.connections.remove(&connection_id) else {
                return Vec::new();
            };
            for device_id in &entry.devices {
                tables.remove_subscriber(device_id, connection_id);
            }
            entry.devices.into_iter().collect::<Vec<_>>()
        });
        debug!(connection_id = %connection_id, subscriptions = devices.len(), "Connection closed");
        devices
    }

    /// Current subscribers of a device channel, as an immutable snapshot.
    pub fn subscribers(&self, device_id: &DeviceId) -> Arc<[Subscriber]> {
        self.snapshot()
            .channels
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    pub fn is_subscribed(&self, connection_id: ConnectionId, device_id: &DeviceId) -> bool {
        self.snapshot()
            .connections
            .get(&connection_id)
            .is_some_and(|entry| entry.devices.contains(device_id))
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.snapshot().connections.len()
    }

    /// Number of subscriptions across all devices.
    pub fn subscription_count(&self) -> usize {
        self.snapshot()
            .channels
            .values()
            .map(|members| members.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LedgerAccessLog;
    use crate::identity::StaticIdentity;
    use crate::ledger::MemoryLedger;
    use types::errors::LedgerError;
    use types::ids::CollectionId;

    struct Fixture {
        registry: ChannelRegistry,
        identity: Arc<StaticIdentity>,
        ledger: Arc<MemoryLedger>,
    }

    fn fixture(policy: AccessPolicy) -> Fixture {
        let identity = Arc::new(
            StaticIdentity::new()
                .with_grant("viewer-token", "u1", AccessLevel::VIEWER)
                .with_grant("admin-token", "u2", AccessLevel::ADMIN),
        );
        let ledger = Arc::new(MemoryLedger::new());
        let audit = Arc::new(LedgerAccessLog::new(
            ledger.clone(),
            CollectionId::new("access_logs"),
        ));
        Fixture {
            registry: ChannelRegistry::new(identity.clone(), audit, policy),
            identity,
            ledger,
        }
    }

    fn request(connection: &Connection, device: &str, token: Option<&str>) -> SubscriptionRequest {
        SubscriptionRequest {
            connection_id: connection.id,
            device_id: DeviceId::new(device),
            token: token.map(str::to_string),
        }
    }

    async fn wait_for_audit(ledger: &MemoryLedger, count: usize) {
        for _ in 0..50 {
            if ledger.documents(&CollectionId::new("access_logs")).len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_authorized_subscription_admitted_and_audited() {
        let fx = fixture(AccessPolicy::default());
        let conn = fx.registry.open(UserId::new("u1"), 8);

        let sub = fx
            .registry
            .authorize(request(&conn, "d1", Some("viewer-token")))
            .await
            .unwrap();

        assert_eq!(sub.authorized_user_id, UserId::new("u1"));
        assert_eq!(fx.registry.subscribers(&DeviceId::new("d1")).len(), 1);
        assert!(fx.registry.is_subscribed(conn.id, &DeviceId::new("d1")));

        wait_for_audit(&fx.ledger, 1).await;
        let logs = fx.ledger.documents(&CollectionId::new("access_logs"));
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].text_field("device_id"), Some("d1"));
    }

    #[tokio::test]
    async fn test_repeated_subscribe_is_audited_once() {
        let fx = fixture(AccessPolicy::default());
        let conn = fx.registry.open(UserId::new("u1"), 8);

        for _ in 0..2 {
            fx.registry
                .authorize(request(&conn, "d1", Some("viewer-token")))
                .await
                .unwrap();
        }

        wait_for_audit(&fx.ledger, 2).await;
        assert_eq!(fx.ledger.documents(&CollectionId::new("access_logs")).len(), 1);
        assert_eq!(fx.registry.subscribers(&DeviceId::new("d1")).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let fx = fixture(AccessPolicy::default());
        let conn = fx.registry.open(UserId::new("u1"), 8);

        let err = fx.registry.authorize(request(&conn, "d1", None)).await.unwrap_err();
        assert_eq!(err, AuthorizationError::MissingToken);

        let err = fx
            .registry
            .authorize(request(&conn, "d1", Some("  ")))
            .await
            .unwrap_err();
        assert_eq!(err, AuthorizationError::MissingToken);
        assert_eq!(fx.registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected_without_subscription() {
        let fx = fixture(AccessPolicy::default());
        let conn = fx.registry.open(UserId::new("u1"), 8);

        let err = fx
            .registry
            .authorize(request(&conn, "d1", Some("forged")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorizationError::InvalidToken(_)));
        assert!(fx.registry.subscribers(&DeviceId::new("d1")).is_empty());
    }

    #[tokio::test]
    async fn test_token_revalidated_on_every_request() {
        let fx = fixture(AccessPolicy::default());
        let conn = fx.registry.open(UserId::new("u1"), 8);

        fx.registry
            .authorize(request(&conn, "d1", Some("viewer-token")))
            .await
            .unwrap();
        fx.identity.revoke("viewer-token");

        let err = fx
            .registry
            .authorize(request(&conn, "d2", Some("viewer-token")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorizationError::InvalidToken(_)));
        assert_eq!(fx.identity.verifications(), 2);
    }

    #[tokio::test]
    async fn test_per_device_access_level() {
        let mut policy = AccessPolicy::default();
        policy
            .device_levels
            .insert(DeviceId::new("server-room"), AccessLevel::MANAGER);
        let fx = fixture(policy);

        let viewer = fx.registry.open(UserId::new("u1"), 8);
        let err = fx
            .registry
            .authorize(request(&viewer, "server-room", Some("viewer-token")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INSUFFICIENT_ACCESS_LEVEL");

        let admin = fx.registry.open(UserId::new("u2"), 8);
        assert!(fx
            .registry
            .authorize(request(&admin, "server-room", Some("admin-token")))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_token_for_other_user_rejected() {
        let fx = fixture(AccessPolicy::default());
        let conn = fx.registry.open(UserId::new("u1"), 8);

        let err = fx
            .registry
            .authorize(request(&conn, "d1", Some("admin-token")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorizationError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_closed_connection_cannot_subscribe() {
        let fx = fixture(AccessPolicy::default());
        let conn = fx.registry.open(UserId::new("u1"), 8);
        fx.registry.close(conn.id);

        let err = fx
            .registry
            .authorize(request(&conn, "d1", Some("viewer-token")))
            .await
            .unwrap_err();
        assert_eq!(err, AuthorizationError::UnknownConnection(conn.id));
    }

    #[tokio::test]
    async fn test_close_removes_all_subscriptions() {
        let fx = fixture(AccessPolicy::default());
        let conn = fx.registry.open(UserId::new("u1"), 8);
        let other = fx.registry.open(UserId::new("u1"), 8);

        for device in ["d1", "d2"] {
            fx.registry
                .authorize(request(&conn, device, Some("viewer-token")))
                .await
                .unwrap();
        }
        fx.registry
            .authorize(request(&other, "d1", Some("viewer-token")))
            .await
            .unwrap();

        // A publisher holding a snapshot keeps its view.
        let held = fx.registry.subscribers(&DeviceId::new("d1"));

        let mut removed = fx.registry.close(conn.id);
        removed.sort();
        assert_eq!(removed, vec![DeviceId::new("d1"), DeviceId::new("d2")]);
        assert_eq!(fx.registry.connection_count(), 1);
        assert_eq!(fx.registry.subscribers(&DeviceId::new("d1")).len(), 1);
        assert!(fx.registry.subscribers(&DeviceId::new("d2")).is_empty());
        assert_eq!(held.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_idempotent() {
        let fx = fixture(AccessPolicy::default());
        let conn = fx.registry.open(UserId::new("u1"), 8);
        for _ in 0..2 {
            fx.registry
                .authorize(request(&conn, "d1", Some("viewer-token")))
                .await
                .unwrap();
        }
        assert_eq!(fx.registry.subscription_count(), 1);

        assert!(fx.registry.unsubscribe(conn.id, &DeviceId::new("d1")));
        assert!(!fx.registry.unsubscribe(conn.id, &DeviceId::new("d1")));
        assert_eq!(fx.registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_block_admission() {
        let fx = fixture(AccessPolicy::default());
        fx.ledger.set_failure(Some(LedgerError::Timeout));
        let conn = fx.registry.open(UserId::new("u1"), 8);

        assert!(fx
            .registry
            .authorize(request(&conn, "d1", Some("viewer-token")))
            .await
            .is_ok());
        assert_eq!(fx.registry.subscription_count(), 1);
    }
}
