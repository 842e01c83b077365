//! An in-process broker with the observable semantics of a RabbitMQ node:
//! default-exchange routing, publisher confirms, prefetch, explicit
//! acknowledgement, dead-lettering and durability across a restart.
//!
//! Every `InMemoryBroker` clone shares the same state. Fault switches
//! (`refuse_connections`, `withhold_confirms`, `drop_connections`,
//! `crash_and_restart`) let tests drive the failure paths.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::amqp_client::{
    AmqpChannel, AmqpClient, AmqpConnection, ChannelError, DeliveryStream, PublishOutcome,
};
use super::channel_manager::ChannelConfig;
use super::errors::ConnectionError;
use super::queue::{QueueName, QueueOptions};
use crate::config::{BackendKind, BrokerConfig};
use crate::message::Message;

type QueueKey = (String, String);
type ChannelKey = (u64, u16);
type DeliverySender = mpsc::UnboundedSender<Result<Message, ChannelError>>;

const NO_ROUTE: u16 = 312;

#[derive(Clone)]
struct StoredMessage {
    message: Message,
    redelivered: bool,
    redelivery_count: u32,
}

impl StoredMessage {
    fn requeued(mut self) -> Self {
        self.redelivered = true;
        self.redelivery_count += 1;
        self
    }
}

struct ConsumerSlot {
    channel: ChannelKey,
    tag: String,
    tx: DeliverySender,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    consumers: VecDeque<ConsumerSlot>,
}

struct Unacked {
    queue: QueueKey,
    stored: StoredMessage,
}

struct ChannelState {
    prefetch: u16,
    confirm: bool,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }

    fn next_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }
}

struct ConnectionState {
    vhost: String,
    next_channel_id: u16,
}

#[derive(Default)]
struct Faults {
    refuse_connections: bool,
    withhold_confirms: bool,
}

struct BrokerState {
    users: HashMap<String, String>,
    vhosts: HashSet<String>,
    queues: HashMap<QueueKey, QueueState>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<ChannelKey, ChannelState>,
    next_connection_id: u64,
    faults: Faults,
}

impl BrokerState {
    fn new() -> Self {
        let mut users = HashMap::new();
        users.insert("guest".to_string(), "guest".to_string());
        let mut vhosts = HashSet::new();
        vhosts.insert("/".to_string());

        BrokerState {
            users,
            vhosts,
            queues: HashMap::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            next_connection_id: 0,
            faults: Faults::default(),
        }
    }

    /// Hands ready messages to consumers round-robin, within each channel's prefetch.
    fn dispatch(&mut self, key: &QueueKey) {
        let BrokerState { queues, channels, .. } = self;
        let Some(queue) = queues.get_mut(key) else {
            return;
        };

        let mut idle = 0;
        while !queue.ready.is_empty() && idle < queue.consumers.len() {
            let Some(slot) = queue.consumers.pop_front() else {
                break;
            };
            let Some(channel) = channels.get_mut(&slot.channel) else {
                continue;
            };
            if !channel.has_capacity() {
                queue.consumers.push_back(slot);
                idle += 1;
                continue;
            }

            let Some(stored) = queue.ready.pop_front() else {
                queue.consumers.push_back(slot);
                break;
            };
            let tag = channel.next_tag();
            let delivery = stored
                .message
                .clone()
                .delivered(tag, stored.redelivered, stored.redelivery_count);

            if slot.tx.unbounded_send(Ok(delivery)).is_err() {
                // receiver gone, the subscription with it
                queue.ready.push_front(stored);
                continue;
            }

            channel.unacked.insert(
                tag,
                Unacked {
                    queue: key.clone(),
                    stored,
                },
            );
            queue.consumers.push_back(slot);
            idle = 0;
        }
    }

    /// Removes the channel, requeues its unacked messages in tag order and
    /// returns the queues that got messages back.
    fn close_channel(&mut self, key: ChannelKey, reason: Option<&str>) -> HashSet<QueueKey> {
        let mut touched = HashSet::new();
        let Some(channel) = self.channels.remove(&key) else {
            return touched;
        };

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|slot| {
                if slot.channel != key {
                    return true;
                }
                if let Some(reason) = reason {
                    let _ = slot
                        .tx
                        .unbounded_send(Err(ChannelError::Closed(reason.to_string())));
                }
                false
            });
        }

        for (_, unacked) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(unacked.stored.requeued());
                touched.insert(unacked.queue);
            }
        }

        touched
    }

    fn close_connection(&mut self, id: u64, reason: Option<&str>) -> HashSet<QueueKey> {
        let keys: Vec<ChannelKey> = self
            .channels
            .keys()
            .filter(|(conn, _)| *conn == id)
            .copied()
            .collect();

        let mut touched = HashSet::new();
        for key in keys {
            touched.extend(self.close_channel(key, reason));
        }
        self.connections.remove(&id);
        touched
    }

    fn settle(&mut self, key: ChannelKey, delivery_tag: u64) -> Result<Unacked, ChannelError> {
        let channel = self
            .channels
            .get_mut(&key)
            .ok_or_else(|| ChannelError::Closed("channel is closed".into()))?;

        channel.unacked.remove(&delivery_tag).ok_or_else(|| {
            ChannelError::PreconditionFailed(format!("unknown delivery tag {}", delivery_tag))
        })
    }
}

/// Shared handle to an in-process broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    /// The process-wide broker used when a config selects the memory backend.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<InMemoryBroker> = OnceLock::new();
        GLOBAL.get_or_init(InMemoryBroker::new).clone()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_user(&self, username: &str, password: &str) {
        self.state()
            .users
            .insert(username.to_string(), password.to_string());
    }

    pub fn add_vhost(&self, vhost: &str) {
        self.state().vhosts.insert(vhost.to_string());
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().faults.refuse_connections = refuse;
    }

    /// Publishes on confirm-mode channels stall without enqueueing.
    pub fn withhold_confirms(&self, withhold: bool) {
        self.state().faults.withhold_confirms = withhold;
    }

    /// Kills every connection as a network failure would. Queues survive.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();

        let mut touched = HashSet::new();
        for id in ids {
            touched.extend(state.close_connection(id, Some("connection reset by peer")));
        }
        for key in touched {
            state.dispatch(&key);
        }
        warn!("in-memory broker dropped all connections");
    }

    /// Simulates a node crash and restart: connections die, transient queues
    /// vanish, and durable queues keep only their persistent messages.
    pub fn crash_and_restart(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id, Some("broker restarted"));
        }

        state.queues.retain(|_, queue| queue.options.durable);
        for queue in state.queues.values_mut() {
            queue.ready.retain(|stored| stored.message.persistent);
        }
        info!(queues = state.queues.len(), "in-memory broker restarted");
    }

    /// Ready messages in a queue on the default vhost.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state()
            .queues
            .get(&("/".to_string(), queue.to_string()))
            .map(|q| q.ready.len())
    }

    /// Delivered-but-unsettled messages from a queue on the default vhost.
    pub fn unacked_count(&self, queue: &str) -> usize {
        let key = ("/".to_string(), queue.to_string());
        self.state()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|unacked| unacked.queue == key)
            .count()
    }

    /// Cancels every consumer of a queue on the default vhost from the broker
    /// side, as a queue deletion or an operator would. Their streams end
    /// without an error; their channels stay open.
    pub fn cancel_consumers(&self, queue: &str) {
        let key = ("/".to_string(), queue.to_string());
        let mut state = self.state();
        if let Some(target) = state.queues.get_mut(&key) {
            let cancelled = target.consumers.len();
            target.consumers.clear();
            info!(queue, cancelled, "in-memory broker cancelled consumers");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }
}

#[async_trait]
impl AmqpClient for InMemoryBroker {
    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn AmqpConnection>, ConnectionError> {
        let mut state = self.state();

        if state.faults.refuse_connections {
            return Err(ConnectionError::Network {
                address: config.address(),
                reason: "connection refused".into(),
            });
        }
        if state.users.get(&config.username) != Some(&config.password) {
            return Err(ConnectionError::Auth {
                username: config.username.clone(),
            });
        }
        if !state.vhosts.contains(&config.vhost) {
            return Err(ConnectionError::VhostNotAllowed(config.vhost.clone()));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(
            id,
            ConnectionState {
                vhost: config.vhost.clone(),
                next_channel_id: 0,
            },
        );
        debug!(connection_id = id, vhost = %config.vhost, "in-memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.broker.state().connections.contains_key(&self.id)
    }

    async fn open_channel(&self, config: &ChannelConfig) -> Result<Box<dyn AmqpChannel>, ConnectionError> {
        let mut state = self.broker.state();
        let connection = state
            .connections
            .get_mut(&self.id)
            .ok_or(ConnectionError::Closed)?;

        connection.next_channel_id += 1;
        let channel_id = connection.next_channel_id;
        let vhost = connection.vhost.clone();

        state.channels.insert(
            (self.id, channel_id),
            ChannelState {
                prefetch: config.prefetch_count,
                confirm: config.confirm_mode,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            key: (self.id, channel_id),
            vhost,
        }))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let mut state = self.broker.state();
        let touched = state.close_connection(self.id, None);
        for key in touched {
            state.dispatch(&key);
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    key: ChannelKey,
    vhost: String,
}

impl MemoryChannel {
    fn queue_key(&self, queue: &QueueName) -> QueueKey {
        (self.vhost.clone(), queue.as_str().to_string())
    }

    fn with_open<T>(
        &self,
        f: impl FnOnce(&mut BrokerState) -> Result<T, ChannelError>,
    ) -> Result<T, ChannelError> {
        let mut state = self.broker.state();
        if !state.channels.contains_key(&self.key) {
            return Err(ChannelError::Closed("channel is closed".into()));
        }

        let result = f(&mut state);
        // channel-level exceptions close the channel, as on a real node
        if let Err(error @ (ChannelError::NotFound(_) | ChannelError::PreconditionFailed(_))) = &result {
            let reason = error.to_string();
            debug!(channel = ?self.key, reason = %reason, "in-memory channel closed by exception");
            let touched = state.close_channel(self.key, Some(&reason));
            for key in touched {
                state.dispatch(&key);
            }
        }
        result
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.key.1
    }

    fn is_open(&self) -> bool {
        self.broker.state().channels.contains_key(&self.key)
    }

    async fn declare_queue(&self, queue: &QueueName, options: &QueueOptions) -> Result<u32, ChannelError> {
        let key = self.queue_key(queue);
        self.with_open(|state| {
            if let Some(existing) = state.queues.get(&key) {
                if existing.options != *options {
                    return Err(ChannelError::PreconditionFailed(format!(
                        "inequivalent arguments for queue '{}'",
                        queue
                    )));
                }
                return Ok(existing.ready.len() as u32);
            }

            state.queues.insert(
                key,
                QueueState {
                    options: options.clone(),
                    ready: VecDeque::new(),
                    consumers: VecDeque::new(),
                },
            );
            Ok(0)
        })
    }

    async fn publish(&self, queue: &QueueName, message: &Message) -> Result<PublishOutcome, ChannelError> {
        let stall = self.with_open(|state| {
            let confirm = state.channels.get(&self.key).map_or(false, |c| c.confirm);
            Ok(confirm && state.faults.withhold_confirms)
        })?;
        if stall {
            std::future::pending::<()>().await;
        }

        let key = self.queue_key(queue);
        self.with_open(|state| {
            let confirm = state.channels.get(&self.key).map_or(false, |c| c.confirm);
            let Some(target) = state.queues.get_mut(&key) else {
                return Ok(PublishOutcome::Returned {
                    code: NO_ROUTE,
                    text: "NO_ROUTE".into(),
                });
            };

            if let Some(max) = target.options.max_length {
                if target.ready.len() >= max as usize {
                    return Ok(PublishOutcome::Nacked(format!(
                        "queue '{}' is at its max length of {}",
                        queue, max
                    )));
                }
            }

            target.ready.push_back(StoredMessage {
                message: message.clone(),
                redelivered: false,
                redelivery_count: 0,
            });
            state.dispatch(&key);

            Ok(if confirm {
                PublishOutcome::Confirmed
            } else {
                PublishOutcome::Unconfirmed
            })
        })
    }

    async fn subscribe(&self, queue: &QueueName, consumer_tag: &str) -> Result<DeliveryStream, ChannelError> {
        let key = self.queue_key(queue);
        self.with_open(|state| {
            let (tx, rx) = mpsc::unbounded();
            let target = state
                .queues
                .get_mut(&key)
                .ok_or_else(|| ChannelError::NotFound(queue.to_string()))?;

            target.consumers.push_back(ConsumerSlot {
                channel: self.key,
                tag: consumer_tag.to_string(),
                tx,
            });
            state.dispatch(&key);

            Ok(rx.boxed())
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), ChannelError> {
        self.with_open(|state| {
            for queue in state.queues.values_mut() {
                queue
                    .consumers
                    .retain(|slot| !(slot.channel == self.key && slot.tag == consumer_tag));
            }
            Ok(())
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        self.with_open(|state| {
            let settled = state.settle(self.key, delivery_tag)?;
            state.dispatch(&settled.queue);
            Ok(())
        })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.with_open(|state| {
            let settled = state.settle(self.key, delivery_tag)?;
            let source = settled.queue.clone();

            if requeue {
                if let Some(queue) = state.queues.get_mut(&source) {
                    queue.ready.push_front(settled.stored.requeued());
                }
            } else {
                let target = state
                    .queues
                    .get(&source)
                    .and_then(|q| q.options.dead_letter.clone())
                    .map(|dlq| (source.0.clone(), dlq.as_str().to_string()));

                let dead_lettered = match target {
                    Some(key) => match state.queues.get_mut(&key) {
                        Some(queue) => {
                            queue.ready.push_back(StoredMessage {
                                message: settled.stored.message,
                                redelivered: false,
                                redelivery_count: 0,
                            });
                            Some(key)
                        }
                        None => None,
                    },
                    None => None,
                };

                match dead_lettered {
                    Some(key) => {
                        debug!(source = %source.1, target = %key.1, "message dead-lettered");
                        state.dispatch(&key);
                    }
                    None => debug!(source = %source.1, "rejected message dropped, no dead-letter target"),
                }
            }

            state.dispatch(&source);
            Ok(())
        })
    }

    async fn get(&self, queue: &QueueName) -> Result<Option<Message>, ChannelError> {
        let key = self.queue_key(queue);
        self.with_open(|state| {
            let BrokerState { queues, channels, .. } = state;
            let target = queues
                .get_mut(&key)
                .ok_or_else(|| ChannelError::NotFound(queue.to_string()))?;
            let Some(stored) = target.ready.pop_front() else {
                return Ok(None);
            };

            let channel = channels
                .get_mut(&self.key)
                .ok_or_else(|| ChannelError::Closed("channel is closed".into()))?;
            let tag = channel.next_tag();
            let message = stored
                .message
                .clone()
                .delivered(tag, stored.redelivered, stored.redelivery_count);
            channel.unacked.insert(tag, Unacked { queue: key, stored });

            Ok(Some(message))
        })
    }

    async fn purge(&self, queue: &QueueName) -> Result<u32, ChannelError> {
        let key = self.queue_key(queue);
        self.with_open(|state| {
            let target = state
                .queues
                .get_mut(&key)
                .ok_or_else(|| ChannelError::NotFound(queue.to_string()))?;
            let purged = target.ready.len() as u32;
            target.ready.clear();
            Ok(purged)
        })
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let mut state = self.broker.state();
        let touched = state.close_channel(self.key, None);
        for key in touched {
            state.dispatch(&key);
        }
        Ok(())
    }
}
