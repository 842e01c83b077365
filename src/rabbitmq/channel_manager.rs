use uuid::Uuid;

use crate::config::BrokerConfig;

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            confirm_mode: true,
            id: short_id("channel"),
        }
    }
}

impl ChannelConfig {
    pub fn from_broker(config: &BrokerConfig) -> Self {
        Self {
            prefetch_count: config.prefetch_count,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// `prefix-xxxxxxxx` with the first eight hex digits of a v4 UUID.
pub(crate) fn short_id(prefix: &str) -> String {
    format!("{}-{}", prefix, &Uuid::new_v4().simple().to_string()[..8])
}
