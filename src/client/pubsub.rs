//! Publish/subscribe operations on [`RpcClient`]

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::RpcClient;
use crate::error::{Cause, Error, Result, TransportError};
use crate::retry::DEFAULT_RETRY_COUNT;
use crate::rpc::MAX_PRIORITY;
use crate::transport::{
    delivery_handler, Channel, Connection, Delivery, DeliveryHandler, DeliveryMode, ExchangeKind,
    ExchangeOptions, OutboundMessage, QueueOptions,
};

/// Options for [`RpcClient::publish_event`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    pub exchange_kind: ExchangeKind,
    /// Exchange durability
    pub durable: bool,
    pub timeout: Option<Duration>,
    pub retry_count: u32,
    pub priority: Option<u8>,
    pub expiration: Option<Duration>,
    pub headers: BTreeMap<String, String>,
    /// Fail (and retry) when no queue is bound for the routing key
    pub mandatory: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            exchange_kind: ExchangeKind::Direct,
            durable: true,
            timeout: None,
            retry_count: DEFAULT_RETRY_COUNT,
            priority: None,
            expiration: None,
            headers: BTreeMap::new(),
            mandatory: false,
        }
    }
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority.min(MAX_PRIORITY));
        self
    }

    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// Options for [`RpcClient::subscribe_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub exchange_kind: ExchangeKind,
    /// Queue durability (the exchange is always declared durable)
    pub durable: bool,
    /// Routing key pattern to bind with; see [`SubscribeOptions::binding_key_for`]
    pub binding_key: Option<String>,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub timeout: Option<Duration>,
    pub retry_count: u32,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            exchange_kind: ExchangeKind::Topic,
            durable: true,
            binding_key: None,
            exclusive: false,
            auto_delete: false,
            timeout: None,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn binding_key(mut self, key: impl Into<String>) -> Self {
        self.binding_key = Some(key.into());
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Key used to bind `queue`
    ///
    /// Without an explicit key: `#` for topic exchanges, empty for fanout and
    /// the queue name otherwise.
    pub fn binding_key_for(&self, queue: &str) -> String {
        if let Some(key) = &self.binding_key {
            return key.clone();
        }
        match self.exchange_kind {
            ExchangeKind::Topic => "#".to_string(),
            ExchangeKind::Fanout => String::new(),
            ExchangeKind::Direct | ExchangeKind::Headers => queue.to_string(),
        }
    }
}

/// An active consumer created by [`RpcClient::subscribe_event`]
///
/// Dropping the handle leaves the consumer running; call
/// [`cancel`](Subscription::cancel) to stop it.
pub struct Subscription {
    channel: Arc<dyn Channel>,
    exchange: String,
    queue: String,
    binding_key: String,
    consumer_tag: String,
}

impl Subscription {
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Name of the consumed queue (server-generated if none was given)
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn binding_key(&self) -> &str {
        &self.binding_key
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Whether the subscription's channel is still open
    pub fn is_active(&self) -> bool {
        self.channel.is_open()
    }

    /// Stop consuming and close the subscription's channel
    pub async fn cancel(self) -> Result<()> {
        let cancel_error = |e: TransportError| Error::EventSubscribe {
            queue: self.queue.clone(),
            source: e.into(),
        };

        self.channel.cancel(&self.consumer_tag).await.map_err(cancel_error)?;
        self.channel.close().await.map_err(cancel_error)?;

        info!(queue = %self.queue, "Cancelled subscription");
        Ok(())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("binding_key", &self.binding_key)
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}

impl RpcClient {
    /// Publish `message` as JSON to `exchange` under `routing_key`
    ///
    /// The exchange is declared first. Each attempt uses its own channel.
    pub async fn publish_event<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<()> {
        let session = self.live_session()?;
        let publish_error = |source: Cause| Error::EventPublish {
            exchange: exchange.to_string(),
            source,
        };

        let mut outbound = OutboundMessage::json(message)
            .map_err(|e| publish_error(e.into()))?
            .delivery_mode(DeliveryMode::Persistent)
            .expiration(options.expiration)
            .headers(options.headers.clone());
        if let Some(priority) = options.priority {
            outbound = outbound.priority(priority);
        }
        if options.mandatory {
            outbound = outbound.mandatory();
        }

        let timeout = options.timeout.or(self.config.default_timeout);
        self.retry_policy
            .run(
                || {
                    publish_once(
                        session.connection.as_ref(),
                        exchange,
                        routing_key,
                        &options,
                        outbound.clone(),
                    )
                },
                timeout,
                options.retry_count,
            )
            .await
            .map_err(|e| {
                let err = publish_error(e.into());
                error!(error = %err, "Publish failed");
                err
            })?;

        info!(
            exchange = exchange,
            routing_key = routing_key,
            "Published event"
        );
        Ok(())
    }

    /// Consume `queue` bound to `exchange`, running `handler` for each delivery
    ///
    /// The handler's `Ok` acknowledges a delivery, `Err` rejects it. Pass an
    /// empty `queue` for a server-named queue.
    pub async fn subscribe_event<F, Fut>(
        &self,
        exchange: &str,
        queue: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> Result<Subscription>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let session = self.live_session()?;
        let handler = delivery_handler(handler);
        let binding_key = options.binding_key_for(queue);
        let timeout = options.timeout.or(self.config.default_timeout);

        let subscription = self
            .retry_policy
            .run(
                || {
                    subscribe_once(
                        session.connection.as_ref(),
                        exchange,
                        queue,
                        &binding_key,
                        &options,
                        handler.clone(),
                    )
                },
                timeout,
                options.retry_count,
            )
            .await
            .map_err(|e| {
                let err = Error::EventSubscribe {
                    queue: queue.to_string(),
                    source: e.into(),
                };
                error!(error = %err, "Subscribe failed");
                err
            })?;

        info!(
            exchange = exchange,
            queue = %subscription.queue,
            binding_key = %subscription.binding_key,
            "Subscribed to queue"
        );
        Ok(subscription)
    }
}

async fn publish_once(
    connection: &dyn Connection,
    exchange: &str,
    routing_key: &str,
    options: &PublishOptions,
    message: OutboundMessage,
) -> std::result::Result<(), TransportError> {
    let channel = connection.create_channel().await?;

    let outcome = async {
        channel
            .declare_exchange(
                exchange,
                options.exchange_kind,
                ExchangeOptions {
                    durable: options.durable,
                    auto_delete: false,
                },
            )
            .await?;
        channel.publish(exchange, routing_key, message).await
    }
    .await;

    if let Err(e) = channel.close().await {
        debug!(exchange = exchange, error = %e, "Failed to close publish channel");
    }
    outcome
}

async fn subscribe_once(
    connection: &dyn Connection,
    exchange: &str,
    queue: &str,
    binding_key: &str,
    options: &SubscribeOptions,
    handler: DeliveryHandler,
) -> std::result::Result<Subscription, TransportError> {
    let channel = connection.create_channel().await?;

    let setup = async {
        channel
            .declare_exchange(exchange, options.exchange_kind, ExchangeOptions::default())
            .await?;
        let queue = channel
            .declare_queue(
                queue,
                QueueOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                },
            )
            .await?;
        channel.bind_queue(&queue, exchange, binding_key).await?;
        let consumer_tag = channel.consume(&queue, handler).await?;
        Ok::<_, TransportError>((queue, consumer_tag))
    }
    .await;

    match setup {
        Ok((queue, consumer_tag)) => Ok(Subscription {
            channel,
            exchange: exchange.to_string(),
            queue,
            binding_key: binding_key.to_string(),
            consumer_tag,
        }),
        Err(e) => {
            let _ = channel.close().await;
            Err(e)
        }
    }
}
