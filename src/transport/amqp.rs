//! AMQP 0-9-1 transport backed by `lapin`

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ConnectionProperties};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Channel, Connection, Connector, Delivery, DeliveryHandler, DeliveryMode, ExchangeKind,
    ExchangeOptions, OutboundMessage, QueueOptions,
};
use crate::error::TransportError;

const REPLY_SUCCESS: u16 = 200;

/// Unacknowledged deliveries a consumer may hold at once
pub const DEFAULT_PREFETCH_COUNT: u16 = 32;

/// Opens `lapin` connections on the current tokio runtime
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: Option<String>,
    prefetch_count: u16,
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self {
            connection_name: None,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
        }
    }
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the deliveries in flight per consumer (minimum 1)
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count.max(1);
        self
    }

    /// Name shown for the connection in the broker's management UI
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let mut properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = lapin::Connection::connect(url, properties)
            .await
            .map_err(map_lapin_error)?;

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            prefetch_count: self.prefetch_count,
        }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
    prefetch_count: u16,
}

#[async_trait]
impl Connection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = self.inner.create_channel().await.map_err(map_lapin_error)?;
        // Publisher confirms let mandatory publishes report unroutable messages
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_lapin_error)?;

        Ok(Arc::new(AmqpChannel {
            inner: channel,
            prefetch_count: self.prefetch_count,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(map_lapin_error)
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
    prefetch_count: u16,
}

#[async_trait]
impl Channel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), TransportError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };

        self.inner
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, TransportError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), TransportError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let options = BasicPublishOptions {
            mandatory: message.mandatory,
            ..Default::default()
        };
        let properties = to_properties(&message);

        let confirmation = self
            .inner
            .basic_publish(exchange, routing_key, options, &message.body, properties)
            .await
            .map_err(map_lapin_error)?
            .await
            .map_err(map_lapin_error)?;

        match confirmation {
            Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => Err(TransportError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            }),
            Confirmation::Nack(None) => Err(TransportError::Rejected(format!(
                "broker nacked publish to '{}'",
                exchange
            ))),
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String, TransportError> {
        self.inner
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(map_lapin_error)?;

        let tag = format!("rabbitrpc-{}", Uuid::new_v4());
        let mut consumer = self
            .inner
            .basic_consume(queue, &tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(map_lapin_error)?;

        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Consumer stream failed");
                        break;
                    }
                };

                let acker = delivery.acker.clone();
                let converted = from_lapin_delivery(delivery);
                let handler = handler.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let outcome = match handler(converted).await {
                        Ok(()) => acker.ack(BasicAckOptions::default()).await,
                        Err(e) => {
                            warn!(queue = %queue, error = %e, "Handler failed, rejecting delivery");
                            acker
                                .nack(BasicNackOptions {
                                    requeue: false,
                                    ..Default::default()
                                })
                                .await
                        }
                    };
                    if let Err(e) = outcome {
                        debug!(queue = %queue, error = %e, "Failed to settle delivery");
                    }
                });
            }
            debug!(queue = %queue, "Consumer stopped");
        });

        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(map_lapin_error)
    }
}

fn to_properties(message: &OutboundMessage) -> BasicProperties {
    let mut properties =
        BasicProperties::default().with_delivery_mode(message.delivery_mode.as_u8());

    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(content_type.as_str().into());
    }
    if let Some(priority) = message.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(expiration) = message.expiration {
        properties = properties.with_expiration(expiration.as_millis().to_string().into());
    }
    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }
    if let Some(kind) = &message.kind {
        properties = properties.with_kind(kind.as_str().into());
    }
    if !message.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &message.headers {
            table.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
        }
        properties = properties.with_headers(table);
    }

    properties
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;

    let mut headers = BTreeMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => continue,
            };
            headers.insert(key.as_str().to_string(), value);
        }
    }

    Delivery {
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        content_type: properties.content_type().as_ref().map(|s| s.as_str().to_string()),
        delivery_mode: properties
            .delivery_mode()
            .map(DeliveryMode::from_u8)
            .unwrap_or(DeliveryMode::Transient),
        priority: *properties.priority(),
        correlation_id: properties.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
        kind: properties.kind().as_ref().map(|s| s.as_str().to_string()),
        headers,
        redelivered: delivery.redelivered,
        body: delivery.data,
    }
}

fn map_lapin_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::ProtocolError(e) => TransportError::Rejected(e.to_string()),
        lapin::Error::InvalidChannelState(_) => TransportError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) => TransportError::ConnectionClosed,
        other => TransportError::Io(other.to_string()),
    }
}
