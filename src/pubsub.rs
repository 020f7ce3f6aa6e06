//! Thin adapters over the Redis Pub/Sub primitives.

use std::time::Duration;

use redis::AsyncCommands;
use tracing::debug;

use crate::envelope::NotificationEnvelope;
use crate::error::DeliveryError;
use crate::routing::RoutingKey;

/// Commands the membership registry sends to the gateway's Pub/Sub listener
/// task. The single listener executes them in channel order, which is what
/// serializes subscription changes against the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubCommand {
    Subscribe(RoutingKey),
    Unsubscribe(RoutingKey),
}

/// Publishes notification envelopes to Redis channels.
///
/// Every publish is bounded by the configured timeout; a timeout or
/// connection error is a transient delivery fault surfaced to the caller,
/// which for the relay means the broker record stays unacknowledged.
#[derive(Clone)]
pub struct EventPublisher {
    client: redis::Client,
    timeout: Duration,
}

impl EventPublisher {
    pub fn new(client: redis::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Publish an envelope to the channel named by its routing key.
    pub async fn publish(&self, envelope: &NotificationEnvelope) -> Result<(), DeliveryError> {
        let channel = envelope.pattern.clone();
        let wire = serde_json::to_string(envelope)?;

        let publish = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let receivers: usize = conn.publish(&channel, &wire).await?;
            Ok::<usize, redis::RedisError>(receivers)
        };

        let receivers = tokio::time::timeout(self.timeout, publish)
            .await
            .map_err(|_| DeliveryError::PublishTimeout {
                channel: channel.clone(),
                timeout: self.timeout,
            })??;

        debug!(%channel, receivers, "published notification envelope");
        Ok(())
    }
}
