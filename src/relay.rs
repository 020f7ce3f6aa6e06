//! The relay: bridges notification records from the Kafka topic onto
//! per-user Redis channels.

use std::time::Duration;

use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::envelope::NotificationEnvelope;
use crate::error::RelayError;
use crate::pubsub::EventPublisher;
use crate::routing::routing_key;

/// Delay before recreating the consumer after a failure.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Why a record was dropped instead of relayed. These are permanent
/// producer-side faults: the record is still acknowledged so the partition
/// does not stall on a poison message.
#[derive(Debug, PartialEq, Eq)]
enum Discard {
    MissingKey,
    UndecodablePayload,
}

/// Build the envelope for one broker record, or decide to discard it.
///
/// The record key carries the user ID; an absent or empty key cannot be
/// routed. A missing payload relays as JSON `null`, matching what the
/// upstream producer's tombstones decode to.
fn envelope_for_record(
    key: Option<&[u8]>,
    payload: Option<&[u8]>,
) -> Result<NotificationEnvelope, Discard> {
    let user_id = match key {
        Some(key) if !key.is_empty() => String::from_utf8_lossy(key).into_owned(),
        _ => return Err(Discard::MissingKey),
    };
    let data = match payload {
        Some(bytes) => serde_json::from_slice(bytes).map_err(|_| Discard::UndecodablePayload)?,
        None => serde_json::Value::Null,
    };
    Ok(NotificationEnvelope::new(routing_key(&user_id), data))
}

/// Consumes the notification topic and republishes each record to the Redis
/// channel derived from its key. Stateless: every record is handled
/// independently.
pub struct NotificationRelay {
    consumer: StreamConsumer,
    publisher: EventPublisher,
}

impl NotificationRelay {
    pub fn new(config: &KafkaConfig, publisher: EventPublisher) -> Result<Self, RelayError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", config.client_id.as_str())
            .set("group.id", config.group_id.as_str())
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set(
                "allow.auto.create.topics",
                if config.allow_topic_creation { "true" } else { "false" },
            )
            .create()?;
        consumer.subscribe(&[config.topic.as_str()])?;
        Ok(Self { consumer, publisher })
    }

    /// Consume records until an error surfaces.
    ///
    /// The offset is committed only after the publish was accepted, so a
    /// transient delivery fault leaves the record unacknowledged and the
    /// consumer group's own redelivery retries it. No retry loop lives here.
    pub async fn run(&self) -> Result<(), RelayError> {
        info!("notification relay consuming");
        loop {
            let record = self.consumer.recv().await?;
            self.process(&record).await?;
            self.consumer.commit_message(&record, CommitMode::Async)?;
        }
    }

    async fn process(&self, record: &BorrowedMessage<'_>) -> Result<(), RelayError> {
        debug!(
            partition = record.partition(),
            offset = record.offset(),
            "notification received for processing"
        );

        match envelope_for_record(record.key(), record.payload()) {
            Ok(envelope) => {
                self.publisher.publish(&envelope).await?;
                Ok(())
            }
            Err(reason) => {
                warn!(
                    ?reason,
                    key = ?record.key().map(String::from_utf8_lossy),
                    payload = ?record.payload().map(String::from_utf8_lossy),
                    "discarding unroutable record"
                );
                Ok(())
            }
        }
    }
}

/// Run the relay forever, recreating the consumer after a failure. The new
/// consumer resumes from the last committed offset, which redelivers any
/// record whose publish failed.
pub async fn run_relay(config: KafkaConfig, publisher: EventPublisher) {
    loop {
        match NotificationRelay::new(&config, publisher.clone()) {
            Ok(relay) => {
                if let Err(err) = relay.run().await {
                    error!(%err, "relay stopped; restarting");
                }
            }
            Err(err) => {
                error!(%err, "failed to create kafka consumer; retrying");
            }
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routable_record_becomes_an_envelope_on_the_user_channel() {
        let envelope =
            envelope_for_record(Some(b"u1"), Some(br#"{"message":"hi"}"#)).unwrap();
        assert_eq!(envelope.pattern, "user.u1");
        assert_eq!(envelope.data, json!({"message": "hi"}));
    }

    #[test]
    fn absent_key_is_discarded() {
        assert_eq!(
            envelope_for_record(None, Some(br#"{"message":"hi"}"#)),
            Err(Discard::MissingKey)
        );
    }

    #[test]
    fn empty_key_is_discarded() {
        assert_eq!(
            envelope_for_record(Some(b""), Some(br#"{"message":"hi"}"#)),
            Err(Discard::MissingKey)
        );
    }

    #[test]
    fn undecodable_payload_is_discarded() {
        assert_eq!(
            envelope_for_record(Some(b"u1"), Some(b"\xff\xfe not json")),
            Err(Discard::UndecodablePayload)
        );
    }

    #[test]
    fn tombstone_payload_relays_as_null() {
        let envelope = envelope_for_record(Some(b"u1"), None).unwrap();
        assert_eq!(envelope.data, serde_json::Value::Null);
    }
}
