// src/rabbitmq/amqp_client.rs

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use super::channel_manager::ChannelConfig;
use super::errors::{AdminError, ConnectionError, NotFoundError};
use super::queue::{QueueName, QueueOptions};
use crate::config::{BackendKind, BrokerConfig};
use crate::message::Message;

/// Failure of a single channel operation, before it is mapped onto the
/// error of the public operation that issued it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("queue '{0}' does not exist")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("channel closed: {0}")]
    Closed(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<ChannelError> for AdminError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::NotFound(queue) => AdminError::NotFound(NotFoundError { queue }),
            ChannelError::PreconditionFailed(reason) => AdminError::PreconditionFailed(reason),
            ChannelError::Closed(reason) | ChannelError::Protocol(reason) => {
                AdminError::Connection(ConnectionError::Channel(reason))
            }
        }
    }
}

/// What the broker said about a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Stored by the broker (persisted first, for persistent messages to durable queues).
    Confirmed,
    /// Refused by the broker, e.g. queue full under reject-publish overflow.
    Nacked(String),
    /// Handed back because no queue matched the routing key.
    Returned { code: u16, text: String },
    /// The channel is not in confirm mode, so nothing was awaited.
    Unconfirmed,
}

pub type DeliveryStream = BoxStream<'static, Result<Message, ChannelError>>;

/// Opens transport sessions to a broker.
#[async_trait]
pub trait AmqpClient: Send + Sync {
    fn backend(&self) -> BackendKind;

    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn AmqpConnection>, ConnectionError>;
}

/// A live transport session, shareable between the channels opened on it.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn open_channel(&self, config: &ChannelConfig) -> Result<Box<dyn AmqpChannel>, ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// A channel. Owned by exactly one worker for its lifetime.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Declares the queue if missing and returns its ready message count.
    async fn declare_queue(&self, queue: &QueueName, options: &QueueOptions) -> Result<u32, ChannelError>;

    /// Publishes to the default exchange with the queue name as routing key.
    async fn publish(&self, queue: &QueueName, message: &Message) -> Result<PublishOutcome, ChannelError>;

    async fn subscribe(&self, queue: &QueueName, consumer_tag: &str) -> Result<DeliveryStream, ChannelError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ChannelError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError>;

    /// Fetches one message without auto-ack; the caller settles it.
    async fn get(&self, queue: &QueueName) -> Result<Option<Message>, ChannelError>;

    async fn purge(&self, queue: &QueueName) -> Result<u32, ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;
}

/// The client implementation named by the config.
pub fn client_for(config: &BrokerConfig) -> Arc<dyn AmqpClient> {
    match config.backend {
        BackendKind::Lapin => Arc::new(super::lapin_client::LapinClient::new()),
        BackendKind::Memory => Arc::new(super::memory_client::InMemoryBroker::global()),
    }
}
