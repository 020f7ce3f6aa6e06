//! Routing-key derivation shared by the relay and the gateway.
//!
//! The routing key names both the Redis Pub/Sub channel and the local
//! broadcast room. The two namespaces must stay identical or cross-instance
//! delivery breaks silently, which is why this is the single place the name
//! is computed.

/// A per-user channel/room name, derived from the user's ID.
pub type RoutingKey = String;

/// Derive the routing key for a user.
///
/// One key per user: the mapping is injective, stable across calls, and
/// accepts any non-empty user ID without an error path.
pub fn routing_key(user_id: &str) -> RoutingKey {
    format!("user.{user_id}")
}
