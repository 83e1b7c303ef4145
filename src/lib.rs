//! rabbitrpc - resilient RPC and publish/subscribe client for AMQP brokers
//!
//! One [`RpcClient`] per broker endpoint, shared through an
//! [`EndpointRegistry`]. Every remote operation checks connectivity first,
//! then runs under a deadline with bounded retries of transient failures.
//!
//! # Example
//!
//! ```no_run
//! use rabbitrpc::{AmqpConnector, CallOptions, EndpointRegistry, PublishOptions, RabbitMqConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = EndpointRegistry::new();
//!     let config = RabbitMqConfig::from_env()?.default_timeout(Duration::from_secs(5));
//!     let client = registry
//!         .acquire_with(&config, Arc::new(AmqpConnector::new()))
//!         .await?;
//!
//!     // Call a remote method
//!     let user = client
//!         .call("users.get", &serde_json::json!({"id": 7}), CallOptions::default())
//!         .await?;
//!     println!("user: {}", user);
//!
//!     // Publish an event
//!     client
//!         .publish_event(
//!             "orders",
//!             "orders.created",
//!             &serde_json::json!({"id": 42}),
//!             PublishOptions::default(),
//!         )
//!         .await?;
//!
//!     registry.close_all().await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod payload;
mod registry;
pub mod retry;
pub mod rpc;
pub mod transport;

pub use client::{ConnectionState, PublishOptions, RpcClient, SubscribeOptions, Subscription};
pub use config::{normalize_url, ConfigError, RabbitMqConfig};
pub use error::{Cause, Error, Result, TransportError};
pub use payload::{to_kwargs, Kwargs};
pub use registry::EndpointRegistry;
pub use retry::{with_retry_and_timeout, RetryError, RetryPolicy};
pub use rpc::{CallOptions, MethodHandler, RegisterOptions};
pub use transport::{
    AmqpConnector, Delivery, DeliveryMode, ExchangeKind, MemoryBroker, MemoryConnector,
};
