//! Error types for the relay and gateway.

use std::time::Duration;

use thiserror::Error;

/// A transient fault on the Redis Pub/Sub delivery path.
///
/// For the relay this means the broker record must not be acknowledged, so
/// the consumer group redelivers it; for the gateway it means the connection
/// setup fails and the socket is closed rather than admitted inconsistently.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The publish was not accepted by Redis within the configured timeout.
    #[error("publish to '{channel}' timed out after {timeout:?}")]
    PublishTimeout { channel: String, timeout: Duration },

    /// Redis connection or command error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The envelope could not be serialized for the wire.
    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The pub/sub listener's command channel is full or closed, so a
    /// subscribe/unsubscribe could not be issued.
    #[error("pub/sub listener unavailable, command for '{channel}' not enqueued")]
    ListenerUnavailable { channel: String },
}

/// Errors surfaced by the broker-consumption side.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("kafka error: {0}")]
    Broker(#[from] rdkafka::error::KafkaError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Authentication failure at connect time. The connection is rejected with
/// no membership side effects.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential presented")]
    MissingToken,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("authentication timed out")]
    Timeout,
}
