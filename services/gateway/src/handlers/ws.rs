use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::rate_limit::Quota;
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use telemetry::broadcast::Outlet;
use telemetry::events::{ClientMessage, ServerEvent};
use telemetry::registry::{Connection, SubscriptionRequest};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use types::ids::{ConnectionId, DeviceId};

/// Upgrade to a realtime connection. The token is verified before the
/// upgrade and again for every subscription.
pub async fn ws_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    state
        .rate_limiter
        .check(&user.grant.user_id, Quota::WS_CONNECTIONS)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: AuthenticatedUser) {
    let (sink, stream) = socket.split();
    serve_connection(sink, stream, state, user).await;
}

/// Run one realtime connection until the client leaves, the writer fails or
/// the connection is evicted. The registry entry is closed on every exit.
async fn serve_connection<S, R, E>(
    mut sink: S,
    mut stream: R,
    state: AppState,
    user: AuthenticatedUser,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let Connection {
        id,
        outlet,
        mut receiver,
        evicted,
        ..
    } = state
        .registry
        .open(user.grant.user_id.clone(), state.ws_queue_capacity);
    info!(connection_id = %id, user_id = %user.grant.user_id, "Realtime connection opened");

    // Drains the connection's queue in order; the broadcaster never waits on it.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            if sink
                .send(Message::Text(message.payload.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = evicted.notified() => {
                warn!(connection_id = %id, "Connection evicted for lagging");
                break;
            }
            _ = &mut writer => {
                debug!(connection_id = %id, "Socket writer finished");
                break;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let replies = handle_message(&state, &user, id, text.as_str()).await;
                    if !deliver(&outlet, &replies) {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %id, error = %e, "Socket read failed");
                    break;
                }
            },
        }
    }

    let devices = state.registry.close(id);
    writer.abort();
    info!(connection_id = %id, subscriptions = devices.len(), "Realtime connection closed");
}

async fn handle_message(
    state: &AppState,
    user: &AuthenticatedUser,
    connection_id: ConnectionId,
    text: &str,
) -> Vec<ServerEvent> {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::SubscribeTemperature { device_id }) => {
            match state
                .rate_limiter
                .check(&user.grant.user_id, Quota::WS_SUBSCRIPTIONS)
            {
                Ok(()) => subscribe(state, user, connection_id, device_id).await,
                Err(e) => vec![ServerEvent::Error {
                    message: e.to_string(),
                }],
            }
        }
        Ok(ClientMessage::UnsubscribeTemperature { device_id }) => {
            state.registry.unsubscribe(connection_id, &device_id);
            vec![ServerEvent::Unsubscribed { device_id }]
        }
        Ok(ClientMessage::Ping) => vec![ServerEvent::Pong],
        Err(e) => vec![ServerEvent::Error {
            message: format!("invalid message: {e}"),
        }],
    }
}

/// Queue replies without waiting. Returns false once the connection should close.
fn deliver(outlet: &Outlet, replies: &[ServerEvent]) -> bool {
    for event in replies {
        match outlet.reply(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %outlet.connection_id(), "Reply queue full, closing connection");
                return false;
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %outlet.connection_id(), "Reply dropped, queue closed");
                return false;
            }
        }
    }
    true
}

async fn subscribe(
    state: &AppState,
    user: &AuthenticatedUser,
    connection_id: ConnectionId,
    device_id: DeviceId,
) -> Vec<ServerEvent> {
    let request = SubscriptionRequest {
        connection_id,
        device_id: device_id.clone(),
        token: Some(user.token.clone()),
    };

    match state.registry.authorize(request).await {
        Ok(_) => {
            let mut events = vec![ServerEvent::Subscribed {
                device_id: device_id.clone(),
            }];
            if let Some(reading) = state.pipeline.last_reading(&device_id) {
                events.push(ServerEvent::Snapshot { reading });
            }
            events
        }
        Err(e) => {
            debug!(
                connection_id = %connection_id,
                device_id = %device_id,
                kind = e.kind(),
                "Subscription rejected"
            );
            vec![ServerEvent::rejected(device_id, &e)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::{TimeZone, Utc};
    use futures::channel::mpsc;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use telemetry::identity::{IdentityVerifier, StaticIdentity};
    use telemetry::ledger::MemoryLedger;
    use types::access::AccessLevel;
    use types::document::{FieldValue, Fields, LedgerDocument};
    use types::ids::DocumentId;

    async fn state() -> AppState {
        let config = Config::from_lookup(|key: &str| match key {
            "LEDGER_URL" => Some("http://ledger.invalid".to_string()),
            "LEDGER_API_KEY" => Some("key".to_string()),
            "IDENTITY_URL" => Some("http://identity.invalid".to_string()),
            _ => None,
        })
        .unwrap();

        let ledger = Arc::new(MemoryLedger::new());
        let mut fields = Fields::new();
        fields.insert("coreid".to_string(), FieldValue::from("d1"));
        fields.insert("data".to_string(), FieldValue::from("75.0"));
        fields.insert("device_type".to_string(), FieldValue::from("temperature_sensor"));
        ledger.insert(
            &config.collections.temperature,
            LedgerDocument {
                id: DocumentId::new("a"),
                collection_id: None,
                fields,
                creation_time: None,
                update_time: Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()),
            },
        );

        let identity = Arc::new(StaticIdentity::new().with_grant(
            "manager-token",
            "u2",
            AccessLevel::MANAGER,
        ));
        let state = AppState::new(ledger, identity, &config);
        state.pipeline.run_pass().await.unwrap();
        state
    }

    async fn user(state: &AppState, token: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            grant: state.identity.verify(token).await.unwrap(),
            token: token.to_string(),
        }
    }

    fn text(json: &str) -> Result<Message, axum::Error> {
        Ok(Message::Text(json.into()))
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        let message = tokio::time::timeout(Duration::from_secs(1), rx.next())
            .await
            .unwrap()
            .unwrap();
        let Message::Text(text) = message else {
            panic!("expected text frame, got {message:?}");
        };
        serde_json::from_str(text.as_str()).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_reject_unsubscribe_and_teardown() {
        let state = state().await;
        let user = user(&state, "manager-token").await;
        let (client_tx, server_rx) = mpsc::unbounded();
        let (server_tx, mut client_rx) = mpsc::unbounded();
        let connection = tokio::spawn(serve_connection(server_tx, server_rx, state.clone(), user));

        client_tx
            .unbounded_send(text(r#"{"type":"subscribe_temperature","deviceId":"d1"}"#))
            .unwrap();
        let subscribed = next_event(&mut client_rx).await;
        assert_eq!(subscribed["event"], "subscribed");
        assert_eq!(subscribed["deviceId"], "d1");
        let snapshot = next_event(&mut client_rx).await;
        assert_eq!(snapshot["event"], "snapshot");
        assert_eq!(snapshot["reading"]["temperature"], 75.0);
        assert_eq!(state.registry.subscription_count(), 1);

        // d2 needs admin.
        client_tx
            .unbounded_send(text(r#"{"type":"subscribe_temperature","deviceId":"d2"}"#))
            .unwrap();
        let rejected = next_event(&mut client_rx).await;
        assert_eq!(rejected["event"], "subscription_rejected");
        assert_eq!(rejected["deviceId"], "d2");
        assert_eq!(rejected["kind"], "INSUFFICIENT_ACCESS_LEVEL");
        assert_eq!(state.registry.subscription_count(), 1);

        client_tx
            .unbounded_send(text(r#"{"type":"unsubscribe_temperature","deviceId":"d1"}"#))
            .unwrap();
        let unsubscribed = next_event(&mut client_rx).await;
        assert_eq!(unsubscribed["event"], "unsubscribed");
        assert_eq!(state.registry.subscription_count(), 0);

        client_tx.unbounded_send(text("not json")).unwrap();
        assert_eq!(next_event(&mut client_rx).await["event"], "error");
        client_tx.unbounded_send(text(r#"{"type":"ping"}"#)).unwrap();
        assert_eq!(next_event(&mut client_rx).await["event"], "pong");

        client_tx
            .unbounded_send(text(r#"{"type":"subscribe_temperature","deviceId":"d1"}"#))
            .unwrap();
        assert_eq!(next_event(&mut client_rx).await["event"], "subscribed");
        assert_eq!(state.registry.connection_count(), 1);

        // Client goes away: the registry entry and its subscriptions are gone.
        drop(client_tx);
        tokio::time::timeout(Duration::from_secs(1), connection)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.registry.connection_count(), 0);
        assert_eq!(state.registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_client_is_disconnected_instead_of_blocking() {
        let mut state = state().await;
        state.ws_queue_capacity = 1;
        let user = user(&state, "manager-token").await;
        let (client_tx, server_rx) = mpsc::unbounded();
        // Never read: the socket accepts one frame and then stalls.
        let (server_tx, _client_rx) = mpsc::channel::<Message>(0);
        let connection = tokio::spawn(serve_connection(server_tx, server_rx, state.clone(), user));

        for _ in 0..8 {
            client_tx.unbounded_send(text(r#"{"type":"ping"}"#)).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), connection)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.registry.connection_count(), 0);
    }
}
