// src/rabbitmq/lapin_client.rs
// AMQP 0-9-1 over the network, through lapin.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::*,
    protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, Error as LapinError,
};
use tracing::{debug, info};

use super::amqp_client::{
    AmqpChannel, AmqpClient, AmqpConnection, ChannelError, DeliveryStream, PublishOutcome,
};
use super::channel_manager::ChannelConfig;
use super::errors::ConnectionError;
use super::queue::{QueueName, QueueOptions};
use crate::config::{BackendKind, BrokerConfig};
use crate::message::Message;

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

#[derive(Debug, Default, Clone, Copy)]
pub struct LapinClient;

impl LapinClient {
    pub fn new() -> Self {
        LapinClient
    }
}

fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.userinfo.username = config.username.clone();
    uri.authority.userinfo.password = config.password.clone();
    uri.authority.host = config.host.clone();
    uri.authority.port = config.port;
    uri.vhost = config.vhost.clone();
    uri.query.heartbeat = Some(config.heartbeat_seconds);
    uri
}

fn connect_error(error: LapinError, config: &BrokerConfig) -> ConnectionError {
    if let LapinError::ProtocolError(amqp) = &error {
        match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
                return ConnectionError::Auth {
                    username: config.username.clone(),
                }
            }
            AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED) => {
                return ConnectionError::VhostNotAllowed(config.vhost.clone())
            }
            _ => {}
        }
    }

    ConnectionError::Network {
        address: config.address(),
        reason: error.to_string(),
    }
}

// NOT_FOUND and PRECONDITION_FAILED close the channel broker-side.
fn channel_error(error: LapinError, queue: Option<&QueueName>) -> ChannelError {
    match &error {
        LapinError::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => ChannelError::NotFound(
                queue.map_or_else(|| amqp.get_message().as_str().to_string(), |q| q.to_string()),
            ),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                ChannelError::PreconditionFailed(amqp.get_message().as_str().to_string())
            }
            _ => ChannelError::Protocol(error.to_string()),
        },
        LapinError::InvalidChannelState(_)
        | LapinError::InvalidConnectionState(_)
        | LapinError::IOError(_) => ChannelError::Closed(error.to_string()),
        _ => ChannelError::Protocol(error.to_string()),
    }
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut args = FieldTable::default();

    if let Some(dead_letter) = &options.dead_letter {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(String::new().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dead_letter.to_string().into()),
        );
    }
    if let Some(max_length) = options.max_length {
        args.insert("x-max-length".into(), AMQPValue::LongLongInt(i64::from(max_length)));
        args.insert(
            "x-overflow".into(),
            AMQPValue::LongString("reject-publish".to_string().into()),
        );
    }

    args
}

fn properties(message: &Message) -> BasicProperties {
    let mut properties = BasicProperties::default().with_delivery_mode(if message.persistent {
        PERSISTENT
    } else {
        TRANSIENT
    });

    if let Some(id) = &message.message_id {
        properties = properties.with_message_id(id.clone().into());
    }
    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    if let Some(timestamp) = message.timestamp {
        properties = properties.with_timestamp(timestamp.timestamp().max(0) as u64);
    }
    properties
}

/// Quorum queues count deliveries in `x-delivery-count`; classic queues only flag redelivery.
fn redelivery_count(delivery: &Delivery) -> u32 {
    let header = delivery.properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == "x-delivery-count")
            .map(|(_, value)| value.clone())
    });

    match header {
        Some(AMQPValue::LongLongInt(count)) => count.max(0) as u32,
        Some(AMQPValue::LongInt(count)) => count.max(0) as u32,
        Some(AMQPValue::LongUInt(count)) => count,
        _ => u32::from(delivery.redelivered),
    }
}

fn into_message(delivery: Delivery) -> Message {
    let count = redelivery_count(&delivery);
    let properties = &delivery.properties;

    let mut message = Message::new(delivery.data.clone());
    message.persistent = *properties.delivery_mode() == Some(PERSISTENT);
    message.message_id = properties.message_id().as_ref().map(|id| id.as_str().to_string());
    message.content_type = properties.content_type().as_ref().map(|ct| ct.as_str().to_string());
    message.timestamp =
        (*properties.timestamp()).and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));

    message.delivered(delivery.delivery_tag, delivery.redelivered, count)
}

#[async_trait]
impl AmqpClient for LapinClient {
    fn backend(&self) -> BackendKind {
        BackendKind::Lapin
    }

    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn AmqpConnection>, ConnectionError> {
        info!(uri = %config.redacted_uri(), "Attempting to connect to RabbitMQ");

        let connection = Connection::connect_uri(amqp_uri(config), ConnectionProperties::default())
            .await
            .map_err(|e| connect_error(e, config))?;

        info!("Successfully connected to RabbitMQ");
        Ok(Arc::new(LapinConnection { inner: connection }))
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn open_channel(&self, config: &ChannelConfig) -> Result<Box<dyn AmqpChannel>, ConnectionError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| ConnectionError::Channel(e.to_string()))?;

        if config.prefetch_count > 0 {
            debug!("Setting channel QoS to {}", config.prefetch_count);
            channel
                .basic_qos(config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| ConnectionError::Channel(format!("Failed to set QoS: {}", e)))?;
        }

        if config.confirm_mode {
            debug!("Enabling confirm mode for channel {}", config.id);
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    ConnectionError::Channel(format!("Failed to enable confirm mode: {}", e))
                })?;
        }

        info!(channel_id = %config.id, amqp_channel = channel.id(), "Channel created and configured");
        Ok(Box::new(LapinChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.inner.status().connected() {
            info!("Closing RabbitMQ connection gracefully");
            self.inner
                .close(200, "OK")
                .await
                .map_err(|e| ConnectionError::Channel(e.to_string()))?;
        }
        Ok(())
    }
}

struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_queue(&self, queue: &QueueName, options: &QueueOptions) -> Result<u32, ChannelError> {
        let declared = self
            .inner
            .queue_declare(
                queue.as_str(),
                QueueDeclareOptions {
                    durable: options.durable,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(options),
            )
            .await
            .map_err(|e| channel_error(e, Some(queue)))?;

        Ok(declared.message_count())
    }

    async fn publish(&self, queue: &QueueName, message: &Message) -> Result<PublishOutcome, ChannelError> {
        let confirm = self
            .inner
            .basic_publish(
                "",
                queue.as_str(),
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                message.body(),
                properties(message),
            )
            .await
            .map_err(|e| channel_error(e, Some(queue)))?
            .await
            .map_err(|e| channel_error(e, Some(queue)))?;

        Ok(match confirm {
            Confirmation::Ack(None) => PublishOutcome::Confirmed,
            Confirmation::Ack(Some(returned)) => PublishOutcome::Returned {
                code: returned.reply_code,
                text: returned.reply_text.as_str().to_string(),
            },
            Confirmation::Nack(Some(returned)) => {
                PublishOutcome::Nacked(returned.reply_text.as_str().to_string())
            }
            Confirmation::Nack(None) => PublishOutcome::Nacked("nacked by broker".into()),
            Confirmation::NotRequested => PublishOutcome::Unconfirmed,
        })
    }

    async fn subscribe(&self, queue: &QueueName, consumer_tag: &str) -> Result<DeliveryStream, ChannelError> {
        let consumer = self
            .inner
            .basic_consume(
                queue.as_str(),
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| channel_error(e, Some(queue)))?;

        Ok(consumer
            .map(|delivery| delivery.map(into_message).map_err(|e| channel_error(e, None)))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ChannelError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| channel_error(e, None))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| channel_error(e, None))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| channel_error(e, None))
    }

    async fn get(&self, queue: &QueueName) -> Result<Option<Message>, ChannelError> {
        let fetched = self
            .inner
            .basic_get(queue.as_str(), BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| channel_error(e, Some(queue)))?;

        Ok(fetched.map(|get| into_message(get.delivery)))
    }

    async fn purge(&self, queue: &QueueName) -> Result<u32, ChannelError> {
        self.inner
            .queue_purge(queue.as_str(), QueuePurgeOptions::default())
            .await
            .map_err(|e| channel_error(e, Some(queue)))
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.inner.status().connected() {
            self.inner
                .close(200, "OK")
                .await
                .map_err(|e| channel_error(e, None))?;
        }
        Ok(())
    }
}
