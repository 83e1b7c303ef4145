//! In-process loopback transport
//!
//! Mimics the slice of broker behaviour the client relies on: exchanges
//! (direct, fanout, topic), the default exchange, queues with round-robin
//! consumers and a backlog while nobody consumes. Faults can be injected to
//! exercise retry and recovery paths without a real broker.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Channel, Connection, Connector, Delivery, DeliveryHandler, ExchangeKind, ExchangeOptions,
    OutboundMessage, QueueOptions,
};
use crate::error::TransportError;

/// Shared state of a loopback broker
///
/// Cheap to clone; clones address the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    exchanges: DashMap<String, ExchangeState>,
    queues: DashMap<String, Arc<QueueState>>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    next_id: AtomicU64,

    connections_opened: AtomicU64,
    publish_attempts: AtomicU64,

    failing_connects: AtomicU32,
    failing_publishes: AtomicU32,
    failing_closes: AtomicU32,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct QueueState {
    name: String,
    owner: Option<u64>,
    durable: bool,
    auto_delete: bool,
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    consumers: Vec<Consumer>,
    next: usize,
    backlog: VecDeque<Delivery>,
}

struct Consumer {
    tag: String,
    channel_id: u64,
    handler: DeliveryHandler,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that opens connections to this broker
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` publishes fail with a transient I/O error
    pub fn fail_publishes(&self, n: u32) {
        self.inner.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` connection closes fail
    pub fn fail_closes(&self, n: u32) {
        self.inner.failing_closes.store(n, Ordering::SeqCst);
    }

    /// Number of connections successfully opened so far
    pub fn connections_opened(&self) -> u64 {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    /// Number of publish calls received, including failed ones
    pub fn publish_attempts(&self) -> u64 {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    /// Close every live connection from the broker side
    pub fn drop_connections(&self) {
        let connections: Vec<_> = self
            .inner
            .connections
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();

        for connection in connections {
            connection.shutdown();
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.queues.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.inner.exchanges.get(name).map(|ex| ex.kind)
    }

    pub fn exchange_durable(&self, name: &str) -> Option<bool> {
        self.inner.exchanges.get(name).map(|ex| ex.durable)
    }

    pub fn queue_durable(&self, name: &str) -> Option<bool> {
        self.inner.queues.get(name).map(|q| q.durable)
    }

    /// Number of consumers attached to `queue` (0 when it does not exist)
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .get(queue)
            .map(|q| q.inner.lock().consumers.len())
            .unwrap_or(0)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind, options: ExchangeOptions) -> Result<(), TransportError> {
        if name.is_empty() {
            return Err(TransportError::Rejected(
                "ACCESS_REFUSED - operation not permitted on the default exchange".into(),
            ));
        }
        if kind == ExchangeKind::Headers {
            return Err(TransportError::Rejected(
                "NOT_IMPLEMENTED - headers exchanges are not supported by the loopback broker".into(),
            ));
        }

        let (existing_kind, existing_durable) = {
            let state = self
                .inner
                .exchanges
                .entry(name.to_string())
                .or_insert_with(|| ExchangeState {
                    kind,
                    durable: options.durable,
                    bindings: Vec::new(),
                });
            (state.kind, state.durable)
        };

        if existing_kind != kind {
            return Err(TransportError::Rejected(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                name, kind, existing_kind
            )));
        }
        if existing_durable != options.durable {
            return Err(inequivalent_durable("exchange", name, options.durable, existing_durable));
        }
        Ok(())
    }

    fn declare_queue(&self, name: &str, options: QueueOptions, connection_id: u64) -> Result<String, TransportError> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let queue = self
            .inner
            .queues
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    name: name.clone(),
                    owner: options.exclusive.then_some(connection_id),
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    inner: Mutex::new(QueueInner::default()),
                })
            })
            .clone();

        queue.check_owner(connection_id)?;
        if queue.durable != options.durable {
            return Err(inequivalent_durable("queue", &name, options.durable, queue.durable));
        }
        Ok(name)
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), TransportError> {
        if exchange.is_empty() {
            return Err(TransportError::Rejected(
                "ACCESS_REFUSED - operation not permitted on the default exchange".into(),
            ));
        }
        if !self.inner.queues.contains_key(queue) {
            return Err(TransportError::Rejected(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        let mut state = self
            .inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::Rejected(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<(), TransportError> {
        self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if take_fault(&self.inner.failing_publishes) {
            return Err(TransportError::Io("simulated publish failure".into()));
        }

        let queue_names: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let state = self
                .inner
                .exchanges
                .get(exchange)
                .ok_or_else(|| TransportError::Rejected(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

            let mut names: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| match state.kind {
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                    ExchangeKind::Fanout | ExchangeKind::Headers => true,
                })
                .map(|b| b.queue.clone())
                .collect();
            names.sort();
            names.dedup();
            names
        };

        let targets: Vec<Arc<QueueState>> = queue_names
            .iter()
            .filter_map(|name| self.inner.queues.get(name).map(|q| q.clone()))
            .collect();

        if targets.is_empty() {
            if message.mandatory {
                return Err(TransportError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            debug!(exchange = exchange, routing_key = routing_key, "No queue bound, dropping message");
            return Ok(());
        }

        debug!(
            exchange = exchange,
            routing_key = routing_key,
            queue_count = targets.len(),
            "Routing message"
        );
        for queue in targets {
            queue.enqueue(Delivery::from_outbound(exchange, routing_key, message.clone()));
        }
        Ok(())
    }

    fn consume(
        &self,
        queue: &str,
        connection_id: u64,
        channel_id: u64,
        handler: DeliveryHandler,
    ) -> Result<String, TransportError> {
        let state = self
            .inner
            .queues
            .get(queue)
            .map(|q| q.clone())
            .ok_or_else(|| TransportError::Rejected(format!("NOT_FOUND - no queue '{}'", queue)))?;
        state.check_owner(connection_id)?;

        let tag = format!("ctag-{}", Uuid::new_v4().simple());
        state.add_consumer(Consumer {
            tag: tag.clone(),
            channel_id,
            handler,
        });
        Ok(tag)
    }

    fn cancel(&self, consumer_tag: &str) {
        self.remove_consumers(|consumer| consumer.tag == consumer_tag);
    }

    fn remove_consumers<F>(&self, predicate: F)
    where
        F: Fn(&Consumer) -> bool,
    {
        let queues: Vec<Arc<QueueState>> = self.inner.queues.iter().map(|q| q.clone()).collect();

        for queue in queues {
            let emptied = {
                let mut inner = queue.inner.lock();
                let before = inner.consumers.len();
                inner.consumers.retain(|c| !predicate(c));
                before > 0 && inner.consumers.is_empty()
            };
            if emptied && queue.auto_delete {
                self.delete_queue(&queue.name);
            }
        }
    }

    fn delete_queue(&self, name: &str) {
        if self.inner.queues.remove(name).is_some() {
            debug!(queue = name, "Deleted queue");
            for mut exchange in self.inner.exchanges.iter_mut() {
                exchange.bindings.retain(|b| b.queue != name);
            }
        }
    }

    fn release_connection(&self, connection_id: u64) {
        let owned: Vec<String> = self
            .inner
            .queues
            .iter()
            .filter(|q| q.owner == Some(connection_id))
            .map(|q| q.name.clone())
            .collect();

        for name in owned {
            self.delete_queue(&name);
        }
    }
}

impl QueueState {
    fn check_owner(&self, connection_id: u64) -> Result<(), TransportError> {
        match self.owner {
            Some(owner) if owner != connection_id => Err(TransportError::Rejected(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    fn enqueue(&self, delivery: Delivery) {
        let handler = {
            let mut inner = self.inner.lock();
            if inner.consumers.is_empty() {
                inner.backlog.push_back(delivery);
                return;
            }
            let index = inner.next % inner.consumers.len();
            inner.next = inner.next.wrapping_add(1);
            inner.consumers[index].handler.clone()
        };

        dispatch(&self.name, handler, delivery);
    }

    fn add_consumer(&self, consumer: Consumer) {
        let handler = consumer.handler.clone();
        let backlog: Vec<Delivery> = {
            let mut inner = self.inner.lock();
            inner.consumers.push(consumer);
            inner.backlog.drain(..).collect()
        };

        for delivery in backlog {
            dispatch(&self.name, handler.clone(), delivery);
        }
    }
}

fn dispatch(queue: &str, handler: DeliveryHandler, delivery: Delivery) {
    let queue = queue.to_string();
    tokio::spawn(async move {
        if let Err(e) = handler(delivery).await {
            warn!(queue = %queue, error = %e, "Handler failed, dropping delivery");
        }
    });
}

fn inequivalent_durable(what: &str, name: &str, received: bool, current: bool) -> TransportError {
    TransportError::Rejected(format!(
        "PRECONDITION_FAILED - inequivalent arg 'durable' for {} '{}': received '{}' but current is '{}'",
        what, name, received, current
    ))
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Check a topic binding key against a routing key
///
/// Words are dot-separated; `*` matches exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn words(s: &str) -> Vec<&str> {
        if s.is_empty() {
            Vec::new()
        } else {
            s.split('.').collect()
        }
    }

    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    matches(&words(pattern), &words(routing_key))
}

/// Opens connections to a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        if take_fault(&self.broker.inner.failing_connects) {
            return Err(TransportError::Io("simulated connection failure".into()));
        }

        let connection = Arc::new(MemoryConnection {
            id: self.broker.next_id(),
            broker: self.broker.clone(),
            open: Arc::new(AtomicBool::new(true)),
            channels: Mutex::new(Vec::new()),
        });

        {
            let mut connections = self.broker.inner.connections.lock();
            connections.retain(|weak| weak.strong_count() > 0);
            connections.push(Arc::downgrade(&connection));
        }
        self.broker
            .inner
            .connections_opened
            .fetch_add(1, Ordering::SeqCst);
        debug!(connection_id = connection.id, "Opened loopback connection");

        Ok(connection)
    }
}

struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
    channels: Mutex<Vec<Weak<MemoryChannel>>>,
}

impl MemoryConnection {
    fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let channels: Vec<_> = self
            .channels
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for channel in channels {
            channel.shutdown();
        }

        self.broker.release_connection(self.id);
        debug!(connection_id = self.id, "Closed loopback connection");
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let channel = Arc::new(MemoryChannel {
            id: self.broker.next_id(),
            connection_id: self.id,
            broker: self.broker.clone(),
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
        });
        {
            let mut channels = self.channels.lock();
            channels.retain(|weak| weak.strong_count() > 0);
            channels.push(Arc::downgrade(&channel));
        }

        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if take_fault(&self.broker.inner.failing_closes) {
            return Err(TransportError::Io("simulated close failure".into()));
        }
        self.shutdown();
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    connection_id: u64,
    broker: MemoryBroker,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let id = self.id;
            self.broker.remove_consumers(|consumer| consumer.channel_id == id);
        }
    }

    /// A broker rejection closes the channel it happened on
    fn settle<T>(&self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(TransportError::Rejected(reason)) = &result {
            debug!(channel_id = self.id, reason = %reason, "Channel closed by broker");
            self.shutdown();
        }
        result
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.ensure_open().is_ok()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.settle(self.broker.declare_exchange(name, kind, options))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, TransportError> {
        self.ensure_open()?;
        self.settle(self.broker.declare_queue(name, options, self.connection_id))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.settle(self.broker.bind_queue(queue, exchange, routing_key))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.settle(self.broker.publish(exchange, routing_key, message))
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String, TransportError> {
        self.ensure_open()?;
        self.settle(self.broker.consume(queue, self.connection_id, self.id, handler))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.cancel(consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }
}
