//! Connection membership and the subscribe/unsubscribe decision.
//!
//! The registry is the single source of truth for "does this instance need a
//! Redis subscription for routing key K". A key is present in the room map
//! if and only if at least one local connection is bound to it, and presence
//! of the key is exactly the proxy for an active pub/sub subscription.

use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::pubsub::PubSubCommand;
use crate::routing::RoutingKey;

/// A unique, instance-local identifier for a single WebSocket connection.
pub type ConnectionId = Uuid;

/// Result of removing a connection from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The routing key the connection was bound to.
    pub routing_key: RoutingKey,
    /// True when this was the last member and the key's subscription was
    /// torn down.
    pub unsubscribed_now: bool,
}

/// Maps routing key -> member connections and connection -> routing key.
///
/// Mutations are atomic per key: the first-member / last-member check, the
/// set mutation, and the enqueue of the matching [`PubSubCommand`] all happen
/// while the key's map entry is held. Commands therefore arrive on the
/// listener's channel in decision order, and the single listener task
/// executes them in that order: two concurrent first-joins for a key
/// produce exactly one `Subscribe`, and a last-leave racing a fresh join can
/// never order its `Unsubscribe` after the join's `Subscribe`.
pub struct MembershipRegistry {
    rooms: DashMap<RoutingKey, HashSet<ConnectionId>>,
    connections: DashMap<ConnectionId, RoutingKey>,
    commands: mpsc::Sender<PubSubCommand>,
}

impl MembershipRegistry {
    pub fn new(commands: mpsc::Sender<PubSubCommand>) -> Self {
        Self {
            rooms: DashMap::new(),
            connections: DashMap::new(),
            commands,
        }
    }

    /// Add a connection under a routing key.
    ///
    /// Returns `Ok(true)` when this was the key's first member and a
    /// `Subscribe` command was enqueued for the listener. If the command
    /// cannot be enqueued the join fails with no membership written, so the
    /// caller can close the connection instead of admitting it without a
    /// subscription.
    pub fn join(
        &self,
        connection_id: ConnectionId,
        routing_key: RoutingKey,
    ) -> Result<bool, DeliveryError> {
        match self.rooms.entry(routing_key.clone()) {
            Entry::Occupied(mut members) => {
                members.get_mut().insert(connection_id);
                self.connections.insert(connection_id, routing_key);
                Ok(false)
            }
            Entry::Vacant(slot) => {
                self.commands
                    .try_send(PubSubCommand::Subscribe(routing_key.clone()))
                    .map_err(|_| DeliveryError::ListenerUnavailable {
                        channel: routing_key.clone(),
                    })?;
                slot.insert(HashSet::from([connection_id]));
                self.connections.insert(connection_id, routing_key);
                Ok(true)
            }
        }
    }

    /// Remove a connection, tearing down the key's subscription when it was
    /// the last member.
    ///
    /// Unknown connection IDs return `None` and have no effect: disconnect
    /// handlers may run for connections that never completed `join`, or run
    /// twice for the same connection.
    pub fn leave(&self, connection_id: ConnectionId) -> Option<LeaveOutcome> {
        let (_, routing_key) = self.connections.remove(&connection_id)?;

        let mut unsubscribed_now = false;
        if let Entry::Occupied(mut members) = self.rooms.entry(routing_key.clone()) {
            members.get_mut().remove(&connection_id);
            if members.get().is_empty() {
                if self
                    .commands
                    .try_send(PubSubCommand::Unsubscribe(routing_key.clone()))
                    .is_err()
                {
                    // The listener is gone or hopelessly backed up. Drop the
                    // entry anyway: the stale Redis subscription delivers to
                    // an empty room until the listener's reconnect resync
                    // clears it.
                    tracing::error!(
                        routing_key = %routing_key,
                        "failed to enqueue Unsubscribe; relying on listener resync"
                    );
                }
                members.remove();
                unsubscribed_now = true;
            }
        }

        Some(LeaveOutcome {
            routing_key,
            unsubscribed_now,
        })
    }

    /// Snapshot of the connections currently bound to a routing key.
    pub fn members_of(&self, routing_key: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(routing_key)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every routing key this instance currently holds. The
    /// listener replays these as subscriptions after a Redis reconnect.
    pub fn active_keys(&self) -> Vec<RoutingKey> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl fmt::Debug for MembershipRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipRegistry")
            .field("rooms", &self.rooms.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}
