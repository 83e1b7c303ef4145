//! Broker transport abstraction
//!
//! The client drives a broker through three object-safe traits: a [`Connector`]
//! opens [`Connection`]s, which open [`Channel`]s. [`amqp`] implements them on
//! top of `lapin`; [`memory`] is an in-process loopback used by tests and local
//! development.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;

pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, MemoryConnector};

/// Content type used for every JSON body this crate produces
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Exchange routing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Route on exact routing key equality
    Direct,
    /// Route to every bound queue
    Fanout,
    /// Route on dot-separated patterns (`*` one word, `#` zero or more)
    Topic,
    /// Route on message headers
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence hint for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Kept in memory only
    Transient,
    /// Written to disk by durable queues
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// The AMQP `delivery-mode` property value
    pub fn as_u8(&self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        if value == 2 {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// Flags for `exchange.declare`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Flags for `queue.declare`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// A private, server-lifetime-bound queue (used for RPC replies)
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// A message about to be published
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub priority: Option<u8>,
    pub expiration: Option<Duration>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// AMQP `type` property
    pub kind: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Report the message as unroutable when no queue receives it
    pub mandatory: bool,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Serialize `value` as a JSON body with the JSON content type
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?).content_type(JSON_CONTENT_TYPE))
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn expiration(mut self, expiration: Option<Duration>) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// A message received from a queue
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub redelivered: bool,
}

impl Delivery {
    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub(crate) fn from_outbound(exchange: &str, routing_key: &str, message: OutboundMessage) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: message.body,
            content_type: message.content_type,
            delivery_mode: message.delivery_mode,
            priority: message.priority,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            kind: message.kind,
            headers: message.headers,
            redelivered: false,
        }
    }
}

/// Callback run for each delivery of a consumer
///
/// `Ok` acknowledges the delivery; `Err` rejects it without requeueing.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`DeliveryHandler`]
pub fn delivery_handler<F, Fut>(f: F) -> DeliveryHandler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |delivery| f(delivery).boxed())
}

/// Opens connections to a broker
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A live broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel multiplexed on a connection
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), TransportError>;

    /// Declare a queue and return its name (server-generated when `name` is empty)
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, TransportError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError>;

    /// Start consuming `queue`, returning the consumer tag
    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
