//! Shared helpers for the integration tests
#![allow(dead_code)]

use rabbitrpc::{MemoryBroker, RabbitMqConfig, RetryPolicy, RpcClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Install a test log writer once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A disconnected client on the loopback broker, retrying without backoff
pub fn loopback_client(broker: &MemoryBroker, config: RabbitMqConfig) -> RpcClient {
    RpcClient::new(config, Arc::new(broker.connector()))
        .expect("valid config")
        .with_retry_policy(RetryPolicy::immediate())
}

/// A connected client for `localhost` on the loopback broker
pub async fn connected_client(broker: &MemoryBroker) -> Arc<RpcClient> {
    init_tracing();
    let client = loopback_client(broker, RabbitMqConfig::new("localhost"));
    client.connect().await.expect("connect to loopback broker");
    Arc::new(client)
}

/// Wait up to a second for the next item
pub async fn recv_soon<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .ok()
        .flatten()
}
