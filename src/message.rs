use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::rabbitmq::QueueName;

/// A unit of work travelling through the broker.
///
/// Publishers build one with [`Message::new`]; consumers receive one with the
/// delivery fields filled in by the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    body: Vec<u8>,
    pub persistent: bool,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub delivery_tag: Option<u64>,
    pub redelivered: bool,
    pub redelivery_count: u32,
}

impl Message {
    /// Creates a persistent message with a fresh UUID and the current timestamp.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Message {
            body: body.into(),
            persistent: true,
            message_id: Some(Uuid::new_v4().to_string()),
            content_type: None,
            timestamp: Some(Utc::now()),
            delivery_tag: None,
            redelivered: false,
            redelivery_count: 0,
        }
    }

    pub fn text(body: &str) -> Self {
        Self::new(body.as_bytes().to_vec()).with_content_type("text/plain")
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?).with_content_type("application/json"))
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// The body as UTF-8, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub(crate) fn delivered(mut self, delivery_tag: u64, redelivered: bool, redelivery_count: u32) -> Self {
        self.delivery_tag = Some(delivery_tag);
        self.redelivered = redelivered;
        self.redelivery_count = redelivery_count;
        self
    }
}

/// Proof that the broker confirmed a published message.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryReceipt {
    pub queue: QueueName,
    pub message_id: Option<String>,
    pub persistent: bool,
    pub confirmed_at: DateTime<Utc>,
}
