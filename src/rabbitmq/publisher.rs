use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::amqp_client::{ChannelError, PublishOutcome};
use super::connection::{Connection, ConnectionManager};
use super::errors::{ConnectionError, PublishError};
use super::queue::QueueName;
use crate::message::{DeliveryReceipt, Message};

/// Publishes onto a channel it owns exclusively, in publisher-confirms mode.
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    connection: Connection,
    confirm_timeout: Duration,
}

impl Publisher {
    pub async fn new(manager: Arc<ConnectionManager>) -> Result<Self, ConnectionError> {
        let mut channel_config = manager.channel_config();
        channel_config.confirm_mode = true;
        let connection = manager.connect_with(channel_config).await?;
        let confirm_timeout = manager.config().confirm_timeout();

        Ok(Publisher {
            manager,
            connection,
            confirm_timeout,
        })
    }

    pub fn with_confirm_timeout(mut self, confirm_timeout: Duration) -> Self {
        self.confirm_timeout = confirm_timeout;
        self
    }

    /// Publishes `message` to `queue` and waits for the broker's confirm.
    ///
    /// With `durable` the message is marked persistent, so a confirm means it
    /// reached disk on a durable queue. The wait is bounded by the confirm
    /// timeout and never retried.
    pub async fn publish(
        &mut self,
        queue: &str,
        mut message: Message,
        durable: bool,
    ) -> Result<DeliveryReceipt, PublishError> {
        let queue = QueueName::new(queue)?;
        message.persistent = durable;

        if !self.connection.is_open() {
            warn!(queue = %queue, "Publisher channel is down, reopening before publish");
            self.manager
                .reconnect(&mut self.connection)
                .await
                .map_err(|e| PublishError::ConnectionLost(e.to_string()))?;
        }
        let channel = self
            .connection
            .channel()
            .map_err(|e| PublishError::ConnectionLost(e.to_string()))?;

        let outcome = match timeout(self.confirm_timeout, channel.publish(&queue, &message)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(queue = %queue, timeout = ?self.confirm_timeout, "Publisher confirm timed out");
                return Err(PublishError::Timeout(self.confirm_timeout));
            }
        };

        match outcome {
            Ok(PublishOutcome::Confirmed) | Ok(PublishOutcome::Unconfirmed) => {}
            Ok(PublishOutcome::Nacked(reason)) => return Err(PublishError::Rejected { reason }),
            Ok(PublishOutcome::Returned { code, text }) => {
                return Err(PublishError::Rejected {
                    reason: format!("{} {}: no queue named '{}'", code, text, queue),
                })
            }
            Err(ChannelError::NotFound(q)) => {
                return Err(PublishError::Rejected {
                    reason: format!("queue '{}' does not exist", q),
                })
            }
            Err(ChannelError::PreconditionFailed(reason)) => {
                return Err(PublishError::Rejected { reason })
            }
            Err(ChannelError::Closed(reason)) | Err(ChannelError::Protocol(reason)) => {
                return Err(PublishError::ConnectionLost(reason))
            }
        }

        info!(
            queue = %queue,
            message_id = ?message.message_id,
            body_length = message.body().len(),
            persistent = durable,
            "Published message"
        );

        Ok(DeliveryReceipt {
            queue,
            message_id: message.message_id,
            persistent: durable,
            confirmed_at: Utc::now(),
        })
    }

    pub async fn publish_text(&mut self, queue: &str, body: &str) -> Result<DeliveryReceipt, PublishError> {
        self.publish(queue, Message::text(body), true).await
    }

    pub async fn publish_json<T: Serialize>(
        &mut self,
        queue: &str,
        value: &T,
    ) -> Result<DeliveryReceipt, PublishError> {
        let message = Message::json(value)?;
        self.publish(queue, message, true).await
    }

    pub fn is_alive(&self) -> bool {
        self.manager.is_alive(&self.connection)
    }

    pub async fn close(mut self) -> Result<(), ConnectionError> {
        debug!(connection = %self.connection.id(), "Closing publisher");
        self.manager.disconnect(&mut self.connection).await
    }
}
