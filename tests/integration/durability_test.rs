use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rabbit_courier::rabbitmq::{AdminError, ConsumeError};
use rabbit_courier::{Consumer, HandlerError, Message, MessageHandler, Publisher, QueueOptions};

use crate::common::{dead_letter_policy, eventually, memory_stack};

#[tokio::test]
async fn durable_publish_survives_a_broker_restart() {
    let stack = memory_stack().await;
    stack.admin.declare("orders", QueueOptions::durable()).await.unwrap();

    let mut publisher = Publisher::new(stack.manager.clone()).await.unwrap();
    let receipt = publisher
        .publish("orders", Message::text("order:42"), true)
        .await
        .unwrap();
    assert!(receipt.persistent);
    publisher
        .publish("orders", Message::text("order:43"), false)
        .await
        .unwrap();

    stack.broker.crash_and_restart();

    let message = stack.admin.peek("orders").await.unwrap().unwrap();
    assert_eq!(message.body_str(), Some("order:42"));
    assert_eq!(message.message_id, receipt.message_id);
    assert!(stack.admin.peek("orders").await.unwrap().is_none());

    // the publisher reopens its channel on the next call
    publisher.publish_text("orders", "order:44").await.unwrap();
    assert_eq!(stack.broker.queue_depth("orders"), Some(1));
}

#[tokio::test]
async fn transient_queues_do_not_survive_a_restart() {
    let stack = memory_stack().await;
    stack.admin.declare("scratch", QueueOptions::transient()).await.unwrap();

    let mut publisher = Publisher::new(stack.manager.clone()).await.unwrap();
    publisher.publish_text("scratch", "temp").await.unwrap();

    stack.broker.crash_and_restart();

    let err = stack.admin.peek("scratch").await.unwrap_err();
    assert!(matches!(err, AdminError::NotFound(ref e) if e.queue == "scratch"));
}

struct SlowHandler;

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

#[tokio::test]
async fn unacknowledged_message_is_redelivered_after_a_crash() {
    let stack = memory_stack().await;
    stack
        .admin
        .declare_dead_lettered(&dead_letter_policy("orders", "orders.dlq"), true)
        .await
        .unwrap();

    let mut publisher = Publisher::new(stack.manager.clone()).await.unwrap();
    publisher.publish_text("orders", "order:7").await.unwrap();

    let consumer = Arc::new(Consumer::new(stack.manager.clone()));
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.consume("orders", &SlowHandler, "orders.dlq").await }
    });

    let broker = stack.broker.clone();
    eventually(|| broker.unacked_count("orders") == 1).await;
    stack.broker.crash_and_restart();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ConsumeError::ChannelLost(_)));

    let message = stack.admin.peek("orders").await.unwrap().unwrap();
    assert_eq!(message.body_str(), Some("order:7"));
    assert!(message.redelivered);
    assert_eq!(message.redelivery_count, 1);
    assert_eq!(stack.broker.queue_depth("orders.dlq"), Some(0));
}
