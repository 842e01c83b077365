use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::InvalidNameError;

/// Prefix the broker keeps for its own queues and exchanges.
pub const RESERVED_PREFIX: &str = "amq.";

const MAX_NAME_BYTES: usize = 255;

/// A queue name that passed client-side validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();

        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.len() > MAX_NAME_BYTES {
            return Err(InvalidNameError::TooLong(name));
        }
        if name.starts_with(RESERVED_PREFIX) {
            return Err(InvalidNameError::ReservedPrefix(name));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for QueueName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        QueueName::new(value)
    }
}

impl TryFrom<&str> for QueueName {
    type Error = InvalidNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        QueueName::new(value)
    }
}

impl From<QueueName> for String {
    fn from(name: QueueName) -> Self {
        name.0
    }
}

/// Routes rejected messages from `source` into `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    source: QueueName,
    target: QueueName,
}

impl DeadLetterPolicy {
    pub fn new(source: QueueName, target: QueueName) -> Result<Self, InvalidNameError> {
        if source == target {
            return Err(InvalidNameError::DeadLetterLoop(source.into()));
        }
        Ok(Self { source, target })
    }

    pub fn source(&self) -> &QueueName {
        &self.source
    }

    pub fn target(&self) -> &QueueName {
        &self.target
    }
}

/// Declaration arguments for a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub dead_letter: Option<QueueName>,
    /// Ready-message cap; publishes beyond it are nacked (reject-publish overflow).
    pub max_length: Option<u32>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            dead_letter: None,
            max_length: None,
        }
    }
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self::default()
    }

    pub fn transient() -> Self {
        Self {
            durable: false,
            ..Self::default()
        }
    }

    pub fn with_dead_letter(mut self, target: QueueName) -> Self {
        self.dead_letter = Some(target);
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        let name = QueueName::new("orders").unwrap();
        assert_eq!(name.as_str(), "orders");
        assert_eq!(name.to_string(), "orders");

        assert!(QueueName::new("orders.dlq").is_ok());
        assert!(QueueName::new("amq").is_ok());
        assert!(QueueName::new("my.amq.queue").is_ok());
    }

    #[test]
    fn rejects_reserved_prefix() {
        assert_eq!(
            QueueName::new("amq.direct"),
            Err(InvalidNameError::ReservedPrefix("amq.direct".into()))
        );
    }

    #[test]
    fn rejects_empty_and_oversized_names() {
        assert_eq!(QueueName::new(""), Err(InvalidNameError::Empty));

        let long = "q".repeat(256);
        assert!(matches!(QueueName::new(long), Err(InvalidNameError::TooLong(_))));
        assert!(QueueName::new("q".repeat(255)).is_ok());
    }

    #[test]
    fn dead_letter_policy_refuses_self_loop() {
        let orders = QueueName::new("orders").unwrap();
        let dlq = QueueName::new("orders.dlq").unwrap();

        let policy = DeadLetterPolicy::new(orders.clone(), dlq.clone()).unwrap();
        assert_eq!(policy.source(), &orders);
        assert_eq!(policy.target(), &dlq);

        assert_eq!(
            DeadLetterPolicy::new(orders.clone(), orders),
            Err(InvalidNameError::DeadLetterLoop("orders".into()))
        );
    }

    #[test]
    fn deserializing_validates_names() {
        let name: QueueName = serde_json::from_str("\"orders\"").unwrap();
        assert_eq!(name.as_str(), "orders");

        assert!(serde_json::from_str::<QueueName>("\"amq.gen-1\"").is_err());
    }
}
