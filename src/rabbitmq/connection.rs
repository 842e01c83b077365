use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::amqp_client::{client_for, AmqpChannel, AmqpClient, AmqpConnection};
use super::channel_manager::{short_id, ChannelConfig};
use super::errors::ConnectionError;
use crate::config::BrokerConfig;

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// A shared transport paired with a channel owned by this handle alone.
///
/// Obtained from [`ConnectionManager::connect`] and given back through
/// [`ConnectionManager::disconnect`]. A handle dropped without being
/// disconnected closes its channel in the background.
pub struct Connection {
    id: String,
    channel_config: ChannelConfig,
    transport: Option<Arc<dyn AmqpConnection>>,
    channel: Option<Box<dyn AmqpChannel>>,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel_id(&self) -> Option<u16> {
        self.channel.as_ref().map(|channel| channel.id())
    }

    pub fn is_open(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.is_open())
            && self.channel.as_ref().map_or(false, |c| c.is_open())
    }

    pub(crate) fn channel(&self) -> Result<&dyn AmqpChannel, ConnectionError> {
        self.channel.as_deref().ok_or(ConnectionError::Closed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if !channel.is_open() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let id = self.id.clone();
                handle.spawn(async move {
                    if let Err(e) = channel.close().await {
                        warn!(connection = %id, error = %e, "Failed to release dropped channel");
                    }
                });
            }
            Err(_) => warn!(connection = %self.id, "Channel dropped outside a runtime, left for the broker to reap"),
        }
    }
}

/// Owns the broker transport and hands out channels on it.
///
/// One transport is pooled per manager; every [`connect`](Self::connect)
/// reuses it while it is open and opens a fresh channel on it.
pub struct ConnectionManager {
    config: Arc<BrokerConfig>,
    client: Arc<dyn AmqpClient>,
    pooled: Mutex<Option<Arc<dyn AmqpConnection>>>,
    max_reconnect_attempts: u32,
    reconnect_delay_ms: u64,
}

impl ConnectionManager {
    /// A manager whose client follows `config.backend`.
    pub fn new(config: BrokerConfig) -> Self {
        let client = client_for(&config);
        Self::with_client(config, client)
    }

    pub fn with_client(config: BrokerConfig, client: Arc<dyn AmqpClient>) -> Self {
        ConnectionManager {
            config: Arc::new(config),
            client,
            pooled: Mutex::new(None),
            max_reconnect_attempts: 1,
            reconnect_delay_ms: 1000,
        }
    }

    /// Retry failed connects up to `max_attempts` times with exponential backoff.
    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.reconnect_delay_ms = initial_delay_ms;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::from_broker(&self.config)
    }

    /// Opens a channel on the pooled transport, connecting first if needed.
    pub async fn connect(&self) -> Result<Connection, ConnectionError> {
        self.connect_with(self.channel_config()).await
    }

    pub async fn connect_with(&self, channel_config: ChannelConfig) -> Result<Connection, ConnectionError> {
        let transport = self.transport().await?;
        let channel = transport.open_channel(&channel_config).await?;

        let connection = Connection {
            id: short_id("conn"),
            channel_config,
            transport: Some(transport),
            channel: Some(channel),
        };
        debug!(
            connection = %connection.id,
            channel_id = ?connection.channel_id(),
            prefetch = connection.channel_config.prefetch_count,
            "Connection handle opened"
        );
        Ok(connection)
    }

    /// Replaces a dead channel (and the transport under it, if that died too).
    pub async fn reconnect(&self, connection: &mut Connection) -> Result<(), ConnectionError> {
        if connection.is_open() {
            return Ok(());
        }
        if let Some(channel) = connection.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(connection = %connection.id, error = %e, "Stale channel close failed");
            }
        }

        let transport = self.transport().await?;
        connection.channel = Some(transport.open_channel(&connection.channel_config).await?);
        connection.transport = Some(transport);
        info!(connection = %connection.id, channel_id = ?connection.channel_id(), "Connection handle reopened");
        Ok(())
    }

    /// Closes the channel, then the transport if no other handle shares it.
    /// Calling it again on the same handle does nothing.
    pub async fn disconnect(&self, connection: &mut Connection) -> Result<(), ConnectionError> {
        let channel_result = match connection.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };
        let Some(transport) = connection.transport.take() else {
            return Ok(());
        };

        let mut pooled = self.pooled.lock().await;
        let in_pool = pooled.as_ref().map_or(false, |p| Arc::ptr_eq(p, &transport));
        // the pool holds one reference, this handle another
        let last_user = Arc::strong_count(&transport) <= if in_pool { 2 } else { 1 };

        if last_user {
            if in_pool {
                *pooled = None;
            }
            transport.close().await?;
            info!(connection = %connection.id, "Connection closed");
        } else {
            debug!(connection = %connection.id, "Channel closed, transport still shared");
        }

        channel_result.map_err(|e| ConnectionError::Channel(e.to_string()))
    }

    pub fn is_alive(&self, connection: &Connection) -> bool {
        connection.is_open()
    }

    /// Closes the pooled transport. Channels still open on it die with it.
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        if let Some(transport) = self.pooled.lock().await.take() {
            info!("Closing RabbitMQ connection gracefully");
            transport.close().await?;
        }
        Ok(())
    }

    async fn transport(&self) -> Result<Arc<dyn AmqpConnection>, ConnectionError> {
        let mut pooled = self.pooled.lock().await;
        if let Some(transport) = pooled.as_ref() {
            if transport.is_open() {
                return Ok(Arc::clone(transport));
            }
        }

        let transport = self.establish().await?;
        *pooled = Some(Arc::clone(&transport));
        Ok(transport)
    }

    async fn establish(&self) -> Result<Arc<dyn AmqpConnection>, ConnectionError> {
        let mut attempts = 0;
        let mut delay = self.reconnect_delay_ms;

        loop {
            let result = match timeout(self.config.connect_timeout(), self.client.connect(&self.config)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(self.config.connect_timeout())),
            };

            match result {
                Ok(transport) => return Ok(transport),
                Err(err) => {
                    attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempts, self.max_reconnect_attempts, err
                    );

                    // credentials and vhost don't fix themselves between attempts
                    let retryable = matches!(
                        err,
                        ConnectionError::Network { .. } | ConnectionError::Timeout(_)
                    );
                    if !retryable || attempts >= self.max_reconnect_attempts {
                        return Err(err);
                    }

                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                    let sleep_time = (delay as f64 + jitter).max(0.0) as u64;
                    info!("Waiting {}ms before next reconnect attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = std::cmp::min(delay.saturating_mul(2), MAX_RECONNECT_DELAY_MS);
                }
            }
        }
    }
}
