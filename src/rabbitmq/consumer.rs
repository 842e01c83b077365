use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpChannel, DeliveryStream};
use super::channel_manager::{short_id, ChannelConfig};
use super::connection::{Connection, ConnectionManager};
use super::errors::{AdminError, ConsumeError, HandlerError};
use super::queue::{DeadLetterPolicy, QueueName, QueueOptions};
use crate::message::Message;

/// Processes one delivery. `Ok` acknowledges it; an error or a panic
/// dead-letters it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self(message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Consuming,
    Disconnecting,
}

/// Counters for one run of [`Consumer::consume`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub delivered: u64,
    pub acknowledged: u64,
    pub dead_lettered: u64,
}

/// Cancels a running consumer and watches its state from another task.
#[derive(Clone)]
pub struct ConsumerHandle {
    cancel: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConsumerState>,
}

impl ConsumerHandle {
    /// Asks the loop to stop. The delivery being handled is settled first.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Waits until the consumer reaches `target`. Returns false if the
    /// consumer was dropped first.
    pub async fn wait_for(&mut self, target: ConsumerState) -> bool {
        self.state.wait_for(|state| *state == target).await.is_ok()
    }
}

/// Runs a handler over a queue with explicit acknowledgement, routing
/// failures to a dead-letter queue.
pub struct Consumer {
    manager: Arc<ConnectionManager>,
    prefetch_count: u16,
    declare_topology: bool,
    durable: bool,
    running: AtomicBool,
    cancel: Arc<watch::Sender<bool>>,
    state: watch::Sender<ConsumerState>,
}

impl Consumer {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let prefetch_count = manager.config().prefetch_count;
        let (cancel, _) = watch::channel(false);
        let (state, _) = watch::channel(ConsumerState::Idle);

        Consumer {
            manager,
            prefetch_count,
            declare_topology: true,
            durable: true,
            running: AtomicBool::new(false),
            cancel: Arc::new(cancel),
            state,
        }
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Skip queue declaration; the queues must already exist.
    pub fn without_topology(mut self) -> Self {
        self.declare_topology = false;
        self
    }

    /// Declare the queues non-durable instead.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            cancel: Arc::clone(&self.cancel),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Consumes `queue` until cancelled or until the broker ends the
    /// subscription, handing each delivery to `handler` one at a time.
    /// Rejected deliveries go to `dead_letter_queue`.
    pub async fn consume<H>(
        &self,
        queue: &str,
        handler: &H,
        dead_letter_queue: &str,
    ) -> Result<ConsumeReport, ConsumeError>
    where
        H: MessageHandler + ?Sized,
    {
        let policy = DeadLetterPolicy::new(QueueName::new(queue)?, QueueName::new(dead_letter_queue)?)?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConsumeError::AlreadyRunning);
        }
        let result = self.run(&policy, handler).await;
        self.running.store(false, Ordering::SeqCst);
        self.cancel.send_replace(false);

        result
    }

    async fn run<H>(&self, policy: &DeadLetterPolicy, handler: &H) -> Result<ConsumeReport, ConsumeError>
    where
        H: MessageHandler + ?Sized,
    {
        self.state.send_replace(ConsumerState::Connecting);
        let channel_config = ChannelConfig {
            prefetch_count: self.prefetch_count,
            confirm_mode: false,
            ..ChannelConfig::default()
        }
        .with_id(short_id("consumer"));

        let mut connection = match self.manager.connect_with(channel_config).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(queue = %policy.source(), error = %e, "Consumer failed to connect");
                self.state.send_replace(ConsumerState::Idle);
                return Err(e.into());
            }
        };

        let result = self.consume_on(&connection, policy, handler).await;

        self.state.send_replace(ConsumerState::Disconnecting);
        if let Err(e) = self.manager.disconnect(&mut connection).await {
            warn!(queue = %policy.source(), error = %e, "Consumer disconnect failed");
        }
        self.state.send_replace(ConsumerState::Idle);

        if let Ok(report) = &result {
            info!(
                queue = %policy.source(),
                delivered = report.delivered,
                acknowledged = report.acknowledged,
                dead_lettered = report.dead_lettered,
                "Consumer stopped"
            );
        }
        result
    }

    async fn consume_on<H>(
        &self,
        connection: &Connection,
        policy: &DeadLetterPolicy,
        handler: &H,
    ) -> Result<ConsumeReport, ConsumeError>
    where
        H: MessageHandler + ?Sized,
    {
        let channel = connection.channel()?;
        if self.declare_topology {
            self.declare(channel, policy).await?;
        }

        let consumer_tag = short_id("consumer");
        let mut deliveries = channel
            .subscribe(policy.source(), &consumer_tag)
            .await
            .map_err(|e| ConsumeError::from(AdminError::from(e)))?;

        self.state.send_replace(ConsumerState::Consuming);
        info!(
            queue = %policy.source(),
            dead_letter_queue = %policy.target(),
            consumer_tag = %consumer_tag,
            "Started consuming"
        );

        let result = self.deliver(channel, &mut deliveries, handler).await;

        if channel.is_open() {
            if let Err(e) = channel.cancel(&consumer_tag).await {
                debug!(consumer_tag = %consumer_tag, error = %e, "Consumer cancel failed");
            }
        }
        result
    }

    async fn declare(&self, channel: &dyn AmqpChannel, policy: &DeadLetterPolicy) -> Result<(), ConsumeError> {
        let base = if self.durable {
            QueueOptions::durable()
        } else {
            QueueOptions::transient()
        };

        channel
            .declare_queue(policy.target(), &base)
            .await
            .map_err(AdminError::from)?;
        channel
            .declare_queue(policy.source(), &base.with_dead_letter(policy.target().clone()))
            .await
            .map_err(AdminError::from)?;

        debug!(queue = %policy.source(), dead_letter_queue = %policy.target(), "Topology declared");
        Ok(())
    }

    async fn deliver<H>(
        &self,
        channel: &dyn AmqpChannel,
        deliveries: &mut DeliveryStream,
        handler: &H,
    ) -> Result<ConsumeReport, ConsumeError>
    where
        H: MessageHandler + ?Sized,
    {
        let mut report = ConsumeReport::default();
        let mut cancel = self.cancel.subscribe();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    info!("Consumer cancelled");
                    return Ok(report);
                }
                next = deliveries.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    error!(error = %e, "Channel lost while consuming");
                    return Err(ConsumeError::ChannelLost(e.to_string()));
                }
                // an open channel means the broker cancelled the subscription
                None if channel.is_open() => {
                    info!("Subscription ended by the broker");
                    return Ok(report);
                }
                None => {
                    error!("Channel closed while consuming");
                    return Err(ConsumeError::ChannelLost("channel closed while consuming".into()));
                }
            };

            let tag = delivery_tag(&message)?;
            report.delivered += 1;

            let outcome = AssertUnwindSafe(handler.handle(&message))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)));

            match outcome {
                Ok(()) => match channel.ack(tag).await {
                    Ok(()) => {
                        report.acknowledged += 1;
                        debug!(delivery_tag = tag, message_id = ?message.message_id, "Message acknowledged");
                    }
                    Err(e) => error!(delivery_tag = tag, error = %e, "Failed to acknowledge message"),
                },
                Err(handler_error) => {
                    warn!(
                        delivery_tag = tag,
                        message_id = ?message.message_id,
                        panicked = handler_error.is_panic(),
                        error = %handler_error,
                        "Handler failed, dead-lettering message"
                    );
                    match channel.nack(tag, false).await {
                        Ok(()) => report.dead_lettered += 1,
                        Err(e) => error!(delivery_tag = tag, error = %e, "Failed to negatively acknowledge message"),
                    }
                }
            }
        }
    }
}

/// A delivery that cannot be settled means the channel state is unusable.
fn delivery_tag(message: &Message) -> Result<u64, ConsumeError> {
    message.delivery_tag.ok_or_else(|| {
        error!(message_id = ?message.message_id, "Delivery without a tag");
        ConsumeError::ChannelLost("delivery without a delivery tag".into())
    })
}

/// Resolves once the flag is set; never resolves if every sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
