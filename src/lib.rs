//! # notify-gateway
//!
//! Relays per-user notification events from a Kafka topic to browser
//! clients over WebSockets, with Redis Pub/Sub as the fan-out layer so any
//! number of stateless gateway instances can serve any client.
//!
//! Data flow: Kafka record -> [`relay`] -> Redis channel (named by the
//! record key's [`routing::routing_key`]) -> every subscribed gateway
//! instance -> local connections of the matching room.
//!
//! The [`registry::MembershipRegistry`] keeps one Redis subscription per
//! routing key with at least one local member: first member in subscribes,
//! last member out unsubscribes.

pub mod auth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod pubsub;
pub mod registry;
pub mod relay;
pub mod routing;

use std::sync::Arc;

use auth::Authenticator;
use config::Config;
use gateway::NotificationGateway;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<NotificationGateway>,
    pub auth: Arc<dyn Authenticator>,
    pub config: Arc<Config>,
}
