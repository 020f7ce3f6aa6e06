//! The notification gateway: terminates client WebSocket connections and
//! bridges them to Redis Pub/Sub through the membership registry.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use dashmap::DashMap;
use futures_util::{
    SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::UserId;
use crate::envelope::NotificationEnvelope;
use crate::pubsub::PubSubCommand;
use crate::registry::{ConnectionId, MembershipRegistry};
use crate::routing::routing_key;

/// Capacity of a single connection's outbound frame buffer. A client that
/// falls this far behind starts losing frames rather than stalling the room.
const OUTBOUND_BUFFER: usize = 64;

/// Capacity of the registry -> listener command channel.
const COMMAND_BUFFER: usize = 256;

/// Delay before retrying a failed Redis Pub/Sub connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// The single frame shape pushed to clients: the event kind configured at
/// startup, carrying the envelope's payload.
#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    event: &'a str,
    data: &'a Value,
}

/// Terminates WebSocket connections, owns the membership registry and the
/// Redis Pub/Sub listener, and fans inbound pub/sub messages out to the
/// local connections of the matching room.
pub struct NotificationGateway {
    registry: MembershipRegistry,
    connections: DashMap<ConnectionId, mpsc::Sender<Message>>,
    event_name: String,
}

impl NotificationGateway {
    /// Create the gateway and spawn its Redis Pub/Sub listener task.
    pub fn new(redis_url: &str, event_name: String) -> Result<Arc<Self>, redis::RedisError> {
        let sub_client = redis::Client::open(redis_url)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let gateway = Arc::new(Self::with_command_channel(cmd_tx, event_name));

        info!("spawning redis pub/sub listener task");
        let listener = Arc::clone(&gateway);
        tokio::spawn(async move {
            listener.run_pubsub_listener(sub_client, cmd_rx).await;
        });

        Ok(gateway)
    }

    fn with_command_channel(cmd_tx: mpsc::Sender<PubSubCommand>, event_name: String) -> Self {
        Self {
            registry: MembershipRegistry::new(cmd_tx),
            connections: DashMap::new(),
            event_name,
        }
    }

    /// Entry point called by the upgrade handler for each authenticated
    /// connection.
    #[instrument(skip(self, socket), fields(conn_id, user_id = %user_id))]
    pub async fn handle_connection(self: Arc<Self>, socket: WebSocket, user_id: UserId) {
        let connection_id = ConnectionId::new_v4();
        tracing::Span::current().record("conn_id", tracing::field::display(connection_id));

        let key = routing_key(&user_id);
        let (sink, stream) = socket.split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);

        // Delivery resolves room members first and outbound channels second,
        // so the channel must be installed before `join` makes the
        // connection visible as a member.
        self.connections.insert(connection_id, out_tx);

        match self.registry.join(connection_id, key.clone()) {
            Ok(subscribed_now) => {
                info!(routing_key = %key, subscribed_now, "client connected");
            }
            Err(err) => {
                error!(%err, routing_key = %key, "membership join failed; closing connection");
                self.connections.remove(&connection_id);
                // Dropping both socket halves closes the connection.
                return;
            }
        }

        tokio::spawn(pump_outbound(out_rx, sink));

        let gateway = Arc::clone(&self);
        tokio::spawn(async move {
            gateway.run_client_receiver(stream, connection_id).await;
        });
    }

    /// Drains one client's inbound frames until the connection ends. The
    /// notification socket is one-way, so inbound frames are ignored.
    #[instrument(skip(self, stream), fields(conn_id = %connection_id))]
    async fn run_client_receiver(
        &self,
        mut stream: SplitStream<WebSocket>,
        connection_id: ConnectionId,
    ) {
        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                Message::Close(_) => {
                    debug!("received close frame from client");
                    break;
                }
                Message::Text(text) => {
                    debug!(len = text.len(), "ignoring inbound frame on one-way socket");
                }
                _ => {}
            }
        }
        self.on_disconnect(connection_id);
    }

    /// Cleanup for any disconnect cause. Idempotent: the registry treats an
    /// unknown connection as a no-op, so a repeated notification cannot
    /// double-decrement membership.
    fn on_disconnect(&self, connection_id: ConnectionId) {
        if let Some(outcome) = self.registry.leave(connection_id) {
            info!(
                routing_key = %outcome.routing_key,
                unsubscribed_now = outcome.unsubscribed_now,
                "client disconnected"
            );
        }
        self.connections.remove(&connection_id);
    }

    /// Handle one message delivered by Redis for `channel`: parse the
    /// envelope and broadcast its payload to the local room. Malformed
    /// payloads are dropped without affecting anything else.
    fn dispatch(&self, channel: &str, payload: &str) {
        let Some(envelope) = NotificationEnvelope::parse(payload) else {
            warn!(%channel, payload, "dropping malformed envelope");
            return;
        };

        let members = self.registry.members_of(channel);
        if members.is_empty() {
            return;
        }

        let frame = OutboundFrame {
            event: &self.event_name,
            data: &envelope.data,
        };
        let wire = match serde_json::to_string(&frame) {
            Ok(wire) => wire,
            Err(err) => {
                error!(%channel, %err, "failed to serialize outbound frame");
                return;
            }
        };

        debug!(%channel, count = members.len(), "broadcasting to local room");
        let message = Message::Text(Utf8Bytes::from(wire));
        for connection_id in members {
            if let Some(sender) = self.connections.get(&connection_id) {
                if sender.try_send(message.clone()).is_err() {
                    warn!(%connection_id, "outbound buffer full or closed; dropping frame");
                }
            }
        }
    }

    /// Background task owning the subscribing Redis connection. Reconnects
    /// on failure and restores the subscriptions the registry holds, so a
    /// subscribe that failed on the wire is retried before any further
    /// membership change for that key is applied to the connection.
    async fn run_pubsub_listener(
        self: Arc<Self>,
        client: redis::Client,
        mut cmd_rx: mpsc::Receiver<PubSubCommand>,
    ) {
        'reconnect: loop {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(conn) => {
                    info!("redis pub/sub listener connected");
                    conn
                }
                Err(err) => {
                    error!(%err, "pub/sub connect failed; retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            let keys = self.registry.active_keys();
            if !keys.is_empty() {
                info!(count = keys.len(), "restoring pub/sub subscriptions");
                if let Err(err) = pubsub.subscribe(&keys).await {
                    error!(%err, "failed to restore subscriptions; reconnecting");
                    continue;
                }
            }

            'session: loop {
                let mut messages = pubsub.on_message();
                loop {
                    tokio::select! {
                        biased;
                        command = cmd_rx.recv() => {
                            let Some(command) = command else {
                                warn!("command channel closed; stopping pub/sub listener");
                                return;
                            };
                            drop(messages);
                            if let Err(err) = self.apply_command(&mut pubsub, command).await {
                                error!(%err, "pub/sub command failed; reconnecting");
                                continue 'reconnect;
                            }
                            continue 'session;
                        }
                        message = messages.next() => {
                            match message {
                                Some(msg) => self.handle_pubsub_message(msg),
                                None => {
                                    warn!("pub/sub connection lost; reconnecting");
                                    continue 'reconnect;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn apply_command(
        &self,
        pubsub: &mut redis::aio::PubSub,
        command: PubSubCommand,
    ) -> Result<(), redis::RedisError> {
        match command {
            PubSubCommand::Subscribe(key) => {
                info!(routing_key = %key, "listener subscribing");
                pubsub.subscribe(&key).await
            }
            PubSubCommand::Unsubscribe(key) => {
                info!(routing_key = %key, "listener unsubscribing");
                pubsub.unsubscribe(&key).await
            }
        }
    }

    fn handle_pubsub_message(&self, msg: redis::Msg) {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                error!(%channel, %err, "failed to read pub/sub payload");
                return;
            }
        };
        self.dispatch(&channel, &payload);
    }
}

/// Per-connection writer task: forwards buffered outbound frames into the
/// WebSocket sink until either side goes away.
async fn pump_outbound(mut frames: mpsc::Receiver<Message>, mut sink: SplitSink<WebSocket, Message>) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = sink.send(frame).await {
            debug!(%err, "client sink closed while sending");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_gateway() -> (Arc<NotificationGateway>, mpsc::Receiver<PubSubCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let gateway = Arc::new(NotificationGateway::with_command_channel(
            cmd_tx,
            "notification".to_string(),
        ));
        (gateway, cmd_rx)
    }

    /// Registers a connection the way `handle_connection` does, with a bare
    /// channel standing in for the socket.
    fn attach(gateway: &NotificationGateway, user_id: &str) -> (ConnectionId, mpsc::Receiver<Message>) {
        let connection_id = ConnectionId::new_v4();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        gateway.connections.insert(connection_id, out_tx);
        gateway
            .registry
            .join(connection_id, routing_key(user_id))
            .unwrap();
        (connection_id, out_rx)
    }

    fn recv_frame(rx: &mut mpsc::Receiver<Message>) -> Option<Value> {
        match rx.try_recv().ok()? {
            Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
            _ => None,
        }
    }

    fn envelope_wire(user_id: &str, data: Value) -> String {
        serde_json::to_string(&NotificationEnvelope::new(routing_key(user_id), data)).unwrap()
    }

    #[test]
    fn delivers_payload_to_the_matching_room_only() {
        let (gateway, _cmd_rx) = test_gateway();
        let (_c1, mut rx1) = attach(&gateway, "u1");
        let (_c2, mut rx2) = attach(&gateway, "u2");

        gateway.dispatch("user.u1", &envelope_wire("u1", json!({"message": "hi"})));

        let frame = recv_frame(&mut rx1).expect("u1 should receive the frame");
        assert_eq!(frame["event"], "notification");
        assert_eq!(frame["data"], json!({"message": "hi"}));
        assert!(recv_frame(&mut rx1).is_none(), "u1 must receive exactly once");
        assert!(recv_frame(&mut rx2).is_none(), "u2 must receive nothing");
    }

    #[test]
    fn both_tabs_of_one_user_receive_exactly_once() {
        let (gateway, _cmd_rx) = test_gateway();
        let (_tab1, mut rx1) = attach(&gateway, "u1");
        let (_tab2, mut rx2) = attach(&gateway, "u1");

        gateway.dispatch("user.u1", &envelope_wire("u1", json!({"n": 7})));

        for rx in [&mut rx1, &mut rx2] {
            let frame = recv_frame(rx).expect("every tab receives the frame");
            assert_eq!(frame["data"], json!({"n": 7}));
            assert!(recv_frame(rx).is_none());
        }
    }

    #[test]
    fn malformed_payload_is_dropped_and_later_deliveries_still_work() {
        let (gateway, _cmd_rx) = test_gateway();
        let (_c1, mut rx1) = attach(&gateway, "u1");

        gateway.dispatch("user.u1", "definitely { not json");
        gateway.dispatch("user.u1", r#"{"missing":"pattern and data"}"#);
        assert!(recv_frame(&mut rx1).is_none(), "malformed envelopes must not deliver");

        gateway.dispatch("user.u1", &envelope_wire("u1", json!("still alive")));
        let frame = recv_frame(&mut rx1).expect("valid delivery after malformed ones");
        assert_eq!(frame["data"], json!("still alive"));
    }

    #[test]
    fn disconnected_connection_receives_nothing_and_room_unwinds() {
        let (gateway, mut cmd_rx) = test_gateway();
        let (conn, mut rx) = attach(&gateway, "u1");

        gateway.on_disconnect(conn);
        assert_eq!(
            cmd_rx.try_recv().unwrap(),
            PubSubCommand::Subscribe("user.u1".into())
        );
        assert_eq!(
            cmd_rx.try_recv().unwrap(),
            PubSubCommand::Unsubscribe("user.u1".into())
        );

        gateway.dispatch("user.u1", &envelope_wire("u1", json!({"late": true})));
        assert!(recv_frame(&mut rx).is_none());

        // A second disconnect notification is a no-op.
        gateway.on_disconnect(conn);
        assert!(cmd_rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_to_an_empty_room_is_harmless() {
        let (gateway, _cmd_rx) = test_gateway();
        gateway.dispatch("user.nobody", &envelope_wire("nobody", json!(1)));
    }
}
