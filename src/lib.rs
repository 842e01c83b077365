//! Reliable RabbitMQ messaging: publisher confirms, explicit acknowledgement
//! with dead-lettering, and queue administration for tests and tooling.
//!
//! Every component talks to the broker through [`rabbitmq::AmqpClient`].
//! The `lapin` backend reaches a real node; the in-memory backend
//! ([`rabbitmq::InMemoryBroker`]) runs the same semantics in-process.

pub mod config;
pub mod message;
pub mod rabbitmq;

pub use config::{BackendKind, BrokerConfig, ConfigError};
pub use message::{DeliveryReceipt, Message};
pub use rabbitmq::{
    ConnectionManager, ConsumeReport, Consumer, ConsumerHandle, ConsumerState, HandlerError, MessageHandler,
    Publisher, QueueAdmin, QueueName, QueueOptions,
};
