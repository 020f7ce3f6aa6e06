//! The payload unit crossing the Redis Pub/Sub boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A routing-key-tagged payload, serialized as JSON text on the wire:
/// `{"pattern": <routing key>, "data": <payload>}`.
///
/// Produced by the relay, carried verbatim through Redis, consumed by the
/// gateway. Both fields are required; unknown extra fields are tolerated.
/// Anything that does not parse to this shape is dropped by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// The routing key the payload is addressed to.
    pub pattern: String,
    /// The notification payload, opaque to the pipeline.
    pub data: Value,
}

impl NotificationEnvelope {
    pub fn new(pattern: impl Into<String>, data: Value) -> Self {
        Self {
            pattern: pattern.into(),
            data,
        }
    }

    /// Parse a wire payload. `None` means a malformed envelope, which the
    /// caller logs and drops.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}
