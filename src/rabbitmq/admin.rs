use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::channel_manager::{short_id, ChannelConfig};
use super::connection::{Connection, ConnectionManager};
use super::errors::{AdminError, ConnectionError, InvalidNameError};
use super::queue::{DeadLetterPolicy, QueueName, QueueOptions};
use crate::message::Message;

/// Declare, purge and peek, for fixtures and assertions.
///
/// Keeps one connection handle; a channel the broker closes after an error
/// (a missing queue, a conflicting declaration) is reopened on the next call.
pub struct QueueAdmin {
    manager: Arc<ConnectionManager>,
    connection: Mutex<Connection>,
}

impl QueueAdmin {
    pub async fn new(manager: Arc<ConnectionManager>) -> Result<Self, ConnectionError> {
        let channel_config = ChannelConfig {
            prefetch_count: 0,
            confirm_mode: false,
            ..ChannelConfig::default()
        }
        .with_id(short_id("admin"));
        let connection = manager.connect_with(channel_config).await?;

        Ok(QueueAdmin {
            manager,
            connection: Mutex::new(connection),
        })
    }

    async fn open_connection(&self) -> Result<MutexGuard<'_, Connection>, AdminError> {
        let mut connection = self.connection.lock().await;
        if !connection.is_open() {
            debug!(connection = %connection.id(), "Admin channel closed, reopening");
            self.manager.reconnect(&mut connection).await?;
        }
        Ok(connection)
    }

    /// Declares `queue` if missing; returns its ready message count.
    pub async fn declare(&self, queue: &str, options: QueueOptions) -> Result<u32, AdminError> {
        let queue = QueueName::new(queue)?;
        if options.dead_letter.as_ref() == Some(&queue) {
            return Err(InvalidNameError::DeadLetterLoop(queue.into()).into());
        }

        let connection = self.open_connection().await?;
        let ready = connection.channel()?.declare_queue(&queue, &options).await?;
        debug!(queue = %queue, durable = options.durable, ready, "Queue declared");
        Ok(ready)
    }

    /// Declares the dead-letter target, then the source queue routing rejects into it.
    pub async fn declare_dead_lettered(&self, policy: &DeadLetterPolicy, durable: bool) -> Result<(), AdminError> {
        let base = if durable {
            QueueOptions::durable()
        } else {
            QueueOptions::transient()
        };

        self.declare(policy.target().as_str(), base.clone()).await?;
        self.declare(
            policy.source().as_str(),
            base.with_dead_letter(policy.target().clone()),
        )
        .await?;
        Ok(())
    }

    /// Removes every ready message; returns how many were removed.
    pub async fn purge(&self, queue: &str) -> Result<u32, AdminError> {
        let queue = QueueName::new(queue)?;
        let connection = self.open_connection().await?;
        let purged = connection.channel()?.purge(&queue).await?;

        info!(queue = %queue, purged, "Queue purged");
        Ok(purged)
    }

    /// Takes one message off `queue` and acknowledges it straight away.
    pub async fn peek(&self, queue: &str) -> Result<Option<Message>, AdminError> {
        let queue = QueueName::new(queue)?;
        let connection = self.open_connection().await?;
        let channel = connection.channel()?;

        let Some(message) = channel.get(&queue).await? else {
            return Ok(None);
        };
        if let Some(tag) = message.delivery_tag {
            channel.ack(tag).await?;
        }

        debug!(queue = %queue, message_id = ?message.message_id, "Peeked message");
        Ok(Some(message))
    }

    pub async fn close(self) -> Result<(), ConnectionError> {
        let mut connection = self.connection.into_inner();
        self.manager.disconnect(&mut connection).await
    }
}
