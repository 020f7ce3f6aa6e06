//! Service configuration, loaded from environment variables.

use std::time::Duration;

/// Kafka consumer settings.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Bootstrap broker list.
    pub brokers: Vec<String>,
    /// Client ID reported to the brokers.
    pub client_id: String,
    /// Consumer group ID. Offset commits against this group are the relay's
    /// acknowledgment mechanism.
    pub group_id: String,
    /// Topic carrying the per-user notification records.
    pub topic: String,
    /// Whether consuming may auto-create the topic.
    pub allow_topic_creation: bool,
}

/// Notify-gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Event name carried on frames pushed to clients.
    pub ws_event_name: String,
    /// Secret for validating internal HS256 JWTs.
    pub jwt_secret: String,
    /// Upper bound on a single authentication call.
    pub auth_timeout: Duration,
    /// Redis connection URL.
    pub redis_url: String,
    /// Upper bound on a single pub/sub publish.
    pub publish_timeout: Duration,
    pub kafka: KafkaConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let redis_host = var_or("REDIS_HOST", "localhost");
        let redis_port: u16 = parsed_var_or("REDIS_PORT", 6379);

        Self {
            port: parsed_var_or("HTTP_PORT", 3040),
            ws_event_name: var_or("WS_EVENT_NAME", "notification"),
            jwt_secret: required_var("INTERNAL_JWT_SECRET"),
            auth_timeout: Duration::from_millis(parsed_var_or("AUTH_TIMEOUT", 5000)),
            redis_url: format!("redis://{redis_host}:{redis_port}"),
            publish_timeout: Duration::from_millis(parsed_var_or("REDIS_EMIT_TIMEOUT", 5000)),
            kafka: KafkaConfig {
                brokers: var_or("KAFKA_BROKERS", "localhost:9092")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                client_id: var_or("KAFKA_CLIENT_ID", "notify-gateway"),
                group_id: var_or("KAFKA_CONSUMER_GROUP_ID", "notify-gateway"),
                topic: var_or("KAFKA_NOTIFICATION_TOPIC", "user-notifications"),
                allow_topic_creation: parsed_var_or("KAFKA_CONSUMER_ALLOW_TOPIC_CREATION", true),
            },
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn parsed_var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
