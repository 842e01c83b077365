use rabbit_courier::rabbitmq::{AdminError, InvalidNameError};
use rabbit_courier::{Message, Publisher, QueueOptions};

use crate::common::memory_stack;

#[tokio::test]
async fn order_42_round_trips_through_peek() {
    let stack = memory_stack().await;
    stack.admin.declare("orders", QueueOptions::durable()).await.unwrap();

    let mut publisher = Publisher::new(stack.manager.clone()).await.unwrap();
    publisher.publish_text("orders", "order:42").await.unwrap();

    let message = stack.admin.peek("orders").await.unwrap().unwrap();
    assert_eq!(message.body_str(), Some("order:42"));
    assert!(stack.admin.peek("orders").await.unwrap().is_none());
}

#[tokio::test]
async fn peek_returns_byte_identical_bodies() {
    let stack = memory_stack().await;
    let long_name = "q".repeat(255);
    let names = ["orders", "a", "billing.invoices-v2", "amq", "ünïcødé", long_name.as_str()];
    let body: Vec<u8> = (0..=255).collect();

    let mut publisher = Publisher::new(stack.manager.clone()).await.unwrap();
    for name in names {
        stack.admin.declare(name, QueueOptions::durable()).await.unwrap();
        publisher
            .publish(name, Message::new(body.clone()), true)
            .await
            .unwrap();

        let message = stack.admin.peek(name).await.unwrap().unwrap();
        assert_eq!(message.body(), body.as_slice(), "queue {}", name);
    }
}

#[tokio::test]
async fn purge_on_empty_queue_returns_zero() {
    let stack = memory_stack().await;
    stack.admin.declare("orders", QueueOptions::durable()).await.unwrap();

    assert_eq!(stack.admin.purge("orders").await.unwrap(), 0);
}

#[tokio::test]
async fn purge_counts_messages_and_empties_the_queue() {
    let stack = memory_stack().await;
    stack.admin.declare("orders", QueueOptions::durable()).await.unwrap();

    let mut publisher = Publisher::new(stack.manager.clone()).await.unwrap();
    for n in [1_u32, 4, 16] {
        for i in 0..n {
            publisher
                .publish_json("orders", &serde_json::json!({ "order_id": i }))
                .await
                .unwrap();
        }
        assert_eq!(stack.admin.purge("orders").await.unwrap(), n);
        assert!(stack.admin.peek("orders").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn bad_names_fail_before_any_io() {
    let stack = memory_stack().await;
    stack.broker.drop_connections();
    stack.broker.refuse_connections(true);

    let err = stack.admin.purge("").await.unwrap_err();
    assert!(matches!(err, AdminError::InvalidName(InvalidNameError::Empty)));

    let err = stack.admin.peek(&"x".repeat(256)).await.unwrap_err();
    assert!(matches!(err, AdminError::InvalidName(InvalidNameError::TooLong(_))));
}
