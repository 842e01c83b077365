// src/rabbitmq/mod.rs
// RabbitMQ client: connections, publishing, consuming and queue administration

pub mod errors;
pub mod connection;

mod admin;
mod amqp_client;
mod channel_manager;
mod consumer;
mod lapin_client;
mod memory_client;
mod publisher;
mod queue;

pub use admin::QueueAdmin;
pub use amqp_client::{
    client_for, AmqpChannel, AmqpClient, AmqpConnection, ChannelError, DeliveryStream, PublishOutcome,
};
pub use channel_manager::ChannelConfig;
pub use connection::{Connection, ConnectionManager};
pub use consumer::{ConsumeReport, Consumer, ConsumerHandle, ConsumerState, MessageHandler};
pub use errors::{
    AdminError, ConnectionError, ConsumeError, HandlerError, InvalidNameError, NotFoundError, PublishError,
};
pub use lapin_client::LapinClient;
pub use memory_client::InMemoryBroker;
pub use publisher::Publisher;
pub use queue::{DeadLetterPolicy, QueueName, QueueOptions, RESERVED_PREFIX};
