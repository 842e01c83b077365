use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rabbit_courier::rabbitmq::ConsumeError;
use rabbit_courier::{Consumer, ConsumerState, HandlerError, Message, MessageHandler, Publisher};

use crate::common::{dead_letter_policy, eventually, memory_stack};

struct RejectBad;

#[async_trait]
impl MessageHandler for RejectBad {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        if message.body_str() == Some("bad") {
            return Err(anyhow::anyhow!("order rejected").context("validating order").into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn bad_order_lands_in_the_dead_letter_queue() {
    let stack = memory_stack().await;
    let consumer = Arc::new(Consumer::new(stack.manager.clone()));
    let mut handle = consumer.handle();

    let handler: Box<dyn MessageHandler> = Box::new(RejectBad);
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.consume("orders", handler.as_ref(), "orders.dlq").await }
    });
    // topology is declared by the consumer before it subscribes
    assert!(handle.wait_for(ConsumerState::Consuming).await);

    let mut publisher = Publisher::new(stack.manager.clone()).await.unwrap();
    publisher.publish_text("orders", "bad").await.unwrap();

    let broker = stack.broker.clone();
    eventually(|| broker.queue_depth("orders.dlq") == Some(1) && broker.unacked_count("orders") == 0).await;
    handle.cancel();
    let report = task.await.unwrap().unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(stack.broker.queue_depth("orders"), Some(0));
    let dead = stack.admin.peek("orders.dlq").await.unwrap().unwrap();
    assert_eq!(dead.body_str(), Some("bad"));
    assert!(stack.admin.peek("orders.dlq").await.unwrap().is_none());
}

#[tokio::test]
async fn successful_handler_acks_each_message_once() {
    let stack = memory_stack().await;
    stack
        .admin
        .declare_dead_lettered(&dead_letter_policy("orders", "orders.dlq"), true)
        .await
        .unwrap();

    let mut publisher = Publisher::new(stack.manager.clone()).await.unwrap();
    for i in 0..10 {
        publisher.publish_text("orders", &format!("order:{}", i)).await.unwrap();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = move |_: &Message| -> Result<(), HandlerError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };

    let consumer = Arc::new(Consumer::new(stack.manager.clone()));
    let handle = consumer.handle();
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.consume("orders", &handler, "orders.dlq").await }
    });

    let broker = stack.broker.clone();
    eventually(|| broker.queue_depth("orders") == Some(0) && broker.unacked_count("orders") == 0).await;
    handle.cancel();
    let report = task.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert_eq!(report.acknowledged, 10);
    assert_eq!(stack.broker.queue_depth("orders.dlq"), Some(0));
}

#[tokio::test]
async fn consumers_on_one_queue_split_the_work() {
    let stack = memory_stack().await;
    stack
        .admin
        .declare_dead_lettered(&dead_letter_policy("orders", "orders.dlq"), true)
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let consumer = Arc::new(Consumer::new(stack.manager.clone()).with_prefetch(1));
        let mut handle = consumer.handle();
        let counter = calls.clone();
        tasks.push(tokio::spawn(async move {
            let handler = move |_: &Message| -> Result<(), HandlerError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            };
            consumer.consume("orders", &handler, "orders.dlq").await
        }));
        assert!(handle.wait_for(ConsumerState::Consuming).await);
        handles.push(handle);
    }

    let mut publisher = Publisher::new(stack.manager.clone()).await.unwrap();
    for i in 0..12 {
        publisher.publish_text("orders", &format!("order:{}", i)).await.unwrap();
    }

    let broker = stack.broker.clone();
    eventually(|| calls.load(Ordering::SeqCst) == 12 && broker.unacked_count("orders") == 0).await;
    for handle in &handles {
        handle.cancel();
    }

    let mut delivered = Vec::new();
    for task in tasks {
        delivered.push(task.await.unwrap().unwrap().delivered);
    }
    assert_eq!(delivered.iter().sum::<u64>(), 12);
    assert!(delivered.iter().all(|&n| n > 0), "work was not shared: {:?}", delivered);
}

#[tokio::test]
async fn broker_failure_ends_the_loop_with_channel_lost() {
    let stack = memory_stack().await;
    let consumer = Arc::new(Consumer::new(stack.manager.clone()));
    let mut handle = consumer.handle();
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.consume("orders", &RejectBad, "orders.dlq").await }
    });
    assert!(handle.wait_for(ConsumerState::Consuming).await);

    stack.broker.drop_connections();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ConsumeError::ChannelLost(_)));
    assert!(handle.wait_for(ConsumerState::Idle).await);
}
