//! Publishes a handful of orders, then consumes them until Ctrl+C.
//! Orders that fail validation end up in `orders.dlq`.
//!
//! Runs against a live broker by default; `RABBITMQ_BACKEND=memory` uses the
//! in-process one.

use std::sync::Arc;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rabbit_courier::rabbitmq::QueueAdmin;
use rabbit_courier::{
    BrokerConfig, ConnectionManager, Consumer, ConsumerState, HandlerError, Message, Publisher,
};

const QUEUE: &str = "orders";
const DEAD_LETTER_QUEUE: &str = "orders.dlq";

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    order_id: u32,
    customer_id: String,
    items: Vec<String>,
    total: f64,
}

fn process_order(message: &Message) -> anyhow::Result<()> {
    let order: Order = serde_json::from_slice(message.body()).context("order is not valid JSON")?;
    if order.items.is_empty() {
        bail!("order {} has no items", order.order_id);
    }
    if order.total <= 0.0 {
        bail!("order {} has a non-positive total", order.order_id);
    }

    info!(order_id = order.order_id, customer = %order.customer_id, total = order.total, "Processed order");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BrokerConfig::from_env().context("invalid RABBITMQ_* configuration")?;
    info!(uri = %config.redacted_uri(), backend = ?config.backend, "Starting orders worker");

    let manager = Arc::new(ConnectionManager::new(config).with_reconnect_policy(5, 2000));
    let consumer = Arc::new(Consumer::new(manager.clone()));
    let handle = consumer.handle();

    let mut worker = tokio::spawn({
        let consumer = consumer.clone();
        async move {
            let handler = |message: &Message| -> Result<(), HandlerError> { Ok(process_order(message)?) };
            consumer.consume(QUEUE, &handler, DEAD_LETTER_QUEUE).await
        }
    });

    let mut state = consumer.handle();
    tokio::select! {
        _ = state.wait_for(ConsumerState::Consuming) => {}
        finished = &mut worker => {
            finished?.context("consumer failed to start")?;
            bail!("consumer stopped before it started consuming");
        }
    }

    let mut publisher = Publisher::new(manager.clone()).await?;
    for order_id in 1..=5 {
        let order = Order {
            order_id,
            customer_id: format!("customer-{}", order_id % 2),
            items: if order_id == 3 { Vec::new() } else { vec!["widget".to_string()] },
            total: 9.99 * f64::from(order_id),
        };
        let receipt = publisher.publish_json(QUEUE, &order).await?;
        info!(order_id, message_id = ?receipt.message_id, "Order published");
    }
    publisher.publish(QUEUE, Message::text("not an order"), true).await?;
    publisher.close().await?;

    info!("Worker running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;
    handle.cancel();

    match worker.await? {
        Ok(report) => info!(?report, "Worker stopped"),
        Err(e) => warn!(error = %e, "Worker stopped with an error"),
    }

    let admin = QueueAdmin::new(manager.clone()).await?;
    let dead_lettered = admin.purge(DEAD_LETTER_QUEUE).await?;
    info!(dead_lettered, "Cleared dead-letter queue");
    admin.close().await?;
    manager.shutdown().await?;

    Ok(())
}
