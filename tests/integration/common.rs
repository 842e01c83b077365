use std::sync::Arc;
use std::time::Duration;

use rabbit_courier::rabbitmq::{ConnectionManager, DeadLetterPolicy, InMemoryBroker, QueueAdmin, QueueName};
use rabbit_courier::BrokerConfig;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A private in-memory broker with a manager and an admin on top of it.
pub struct Stack {
    pub broker: InMemoryBroker,
    pub manager: Arc<ConnectionManager>,
    pub admin: QueueAdmin,
}

pub async fn memory_stack() -> Stack {
    init_tracing();
    let broker = InMemoryBroker::new();
    let manager = Arc::new(ConnectionManager::with_client(
        BrokerConfig::in_memory(),
        Arc::new(broker.clone()),
    ));
    let admin = QueueAdmin::new(manager.clone())
        .await
        .expect("admin connects to the in-memory broker");

    Stack {
        broker,
        manager,
        admin,
    }
}

pub fn dead_letter_policy(source: &str, target: &str) -> DeadLetterPolicy {
    DeadLetterPolicy::new(QueueName::new(source).unwrap(), QueueName::new(target).unwrap()).unwrap()
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
