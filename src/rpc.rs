//! Request/reply over a broker channel
//!
//! Requests are published to the default exchange with the method name as
//! routing key, so every registered method consumes a queue of the same name.
//! Replies come back on an exclusive, server-named queue and are matched to
//! their caller by correlation id. Each registered method is served on a
//! channel of its own, so a rejected registration cannot close the channel
//! shared by calls and replies.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::payload::Kwargs;
use crate::retry::DEFAULT_RETRY_COUNT;
use crate::transport::{
    delivery_handler, Channel, Connection, Delivery, DeliveryHandler, DeliveryMode, OutboundMessage,
    QueueOptions, JSON_CONTENT_TYPE,
};

/// AMQP `type` of a request
pub const CALL_KIND: &str = "call";
/// AMQP `type` of a successful reply
pub const RESULT_KIND: &str = "result";
/// AMQP `type` of a reply carrying a handler failure
pub const ERROR_KIND: &str = "error";

/// Highest message priority accepted by the broker
pub const MAX_PRIORITY: u8 = 9;

type HandlerFn = dyn Fn(Kwargs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// An async function serving a remote method
///
/// Clones share identity: unregistering needs a clone of the handler that was
/// registered, an equivalent closure does not match.
#[derive(Clone)]
pub struct MethodHandler {
    inner: Arc<HandlerFn>,
}

impl MethodHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |kwargs| f(kwargs).boxed()),
        }
    }

    /// Whether both handles point at the same handler
    pub fn same_as(&self, other: &MethodHandler) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.inner) as *const (),
            Arc::as_ptr(&other.inner) as *const (),
        )
    }

    async fn invoke(&self, kwargs: Kwargs) -> anyhow::Result<Value> {
        (self.inner)(kwargs).await
    }
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodHandler({:p})", Arc::as_ptr(&self.inner) as *const ())
    }
}

/// Per-call options for `send`/`call`
#[derive(Debug, Clone, PartialEq)]
pub struct CallOptions {
    /// Message TTL; the caller also stops waiting once it elapses
    pub expiration: Option<Duration>,
    pub priority: u8,
    pub delivery_mode: DeliveryMode,
    /// Overall deadline across all attempts (falls back to the client default)
    pub timeout: Option<Duration>,
    /// Maximum number of attempts
    pub retry_count: u32,
    pub headers: BTreeMap<String, String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            expiration: None,
            priority: 5,
            delivery_mode: DeliveryMode::Persistent,
            timeout: None,
            retry_count: DEFAULT_RETRY_COUNT,
            headers: BTreeMap::new(),
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Priority is clamped to 0..=9
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
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

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Queue flags for a registered method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            durable: false,
            auto_delete: true,
        }
    }
}

type Reply = Result<Value, TransportError>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

struct Registration {
    handler: MethodHandler,
    channel: Arc<dyn Channel>,
    consumer_tag: String,
}

/// RPC endpoint bound to one connection
pub struct RpcAdaptor {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    reply_queue: String,
    pending: PendingMap,
    registrations: tokio::sync::Mutex<HashMap<String, Registration>>,
}

impl RpcAdaptor {
    /// Open the RPC channel on `connection`, declare the reply queue and start consuming replies
    pub async fn create(connection: Arc<dyn Connection>) -> Result<Self, TransportError> {
        let channel = connection.create_channel().await?;
        let reply_queue = channel.declare_queue("", QueueOptions::exclusive()).await?;

        let pending: PendingMap = Arc::default();
        let replies = pending.clone();
        channel
            .consume(
                &reply_queue,
                delivery_handler(move |delivery| {
                    let replies = replies.clone();
                    async move {
                        resolve_reply(&replies, delivery);
                        Ok(())
                    }
                }),
            )
            .await?;

        debug!(reply_queue = %reply_queue, "RPC adaptor ready");

        Ok(Self {
            connection,
            channel,
            reply_queue,
            pending,
            registrations: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Invoke `method` remotely and wait for its reply
    pub async fn call(&self, method: &str, kwargs: Kwargs, options: &CallOptions) -> Result<Value, TransportError> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id.clone(), tx);
        let _pending = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        let body = serde_json::to_vec(&kwargs).map_err(|e| TransportError::Malformed(e.to_string()))?;
        let message = OutboundMessage::new(body)
            .content_type(JSON_CONTENT_TYPE)
            .delivery_mode(options.delivery_mode)
            .priority(options.priority)
            .expiration(options.expiration)
            .correlation_id(correlation_id.clone())
            .reply_to(self.reply_queue.clone())
            .kind(CALL_KIND)
            .headers(options.headers.clone())
            .mandatory();

        debug!(method = method, correlation_id = %correlation_id, "Sending RPC request");
        self.channel.publish("", method, message).await?;

        let reply = match options.expiration {
            Some(expiration) => tokio::time::timeout(expiration, rx)
                .await
                .map_err(|_| TransportError::Expired(expiration))?,
            None => rx.await,
        };

        // Sender dropped: the adaptor was torn down while we waited
        reply.map_err(|_| TransportError::ConnectionClosed)?
    }

    /// Serve `method` with `handler`
    pub async fn register(
        &self,
        method: &str,
        handler: MethodHandler,
        options: &RegisterOptions,
    ) -> Result<(), TransportError> {
        validate_method_name(method)?;

        let mut registrations = self.registrations.lock().await;
        if registrations.contains_key(method) {
            return Err(TransportError::InvalidArgument(format!(
                "method '{}' is already registered",
                method
            )));
        }

        let channel = self.connection.create_channel().await?;
        let consumer_tag = match serve_on(&channel, method, handler.clone(), options).await {
            Ok(tag) => tag,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e);
            }
        };

        registrations.insert(
            method.to_string(),
            Registration {
                handler,
                channel,
                consumer_tag,
            },
        );
        info!(method = method, "Registered RPC method");
        Ok(())
    }

    /// Stop serving the method registered with `handler`, returning its name
    pub async fn unregister(&self, handler: &MethodHandler) -> Result<String, TransportError> {
        let mut registrations = self.registrations.lock().await;

        let method = registrations
            .iter()
            .find(|(_, registration)| registration.handler.same_as(handler))
            .map(|(method, _)| method.clone())
            .ok_or_else(|| TransportError::InvalidArgument("handler is not registered".into()))?;

        if let Some(registration) = registrations.get(&method) {
            // A channel the broker already closed has no consumer left to cancel
            if registration.channel.is_open() {
                registration.channel.cancel(&registration.consumer_tag).await?;
            }
            if let Err(e) = registration.channel.close().await {
                debug!(method = %method, error = %e, "Failed to close method channel");
            }
        }
        registrations.remove(&method);

        info!(method = %method, "Unregistered RPC method");
        Ok(method)
    }

    /// Method name `handler` is registered under, if any
    pub async fn method_of(&self, handler: &MethodHandler) -> Option<String> {
        self.registrations
            .lock()
            .await
            .iter()
            .find(|(_, registration)| registration.handler.same_as(handler))
            .map(|(method, _)| method.clone())
    }

    /// Names of the methods currently served, sorted
    pub async fn registered_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.registrations.lock().await.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Fail every call still waiting for a reply
    pub fn abandon_pending(&self) {
        let abandoned = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if abandoned > 0 {
            debug!(count = abandoned, "Abandoned pending RPC calls");
        }
    }
}

struct PendingGuard<'a> {
    pending: &'a PendingMap,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

fn validate_method_name(method: &str) -> Result<(), TransportError> {
    if method.is_empty() {
        return Err(TransportError::InvalidArgument("method name must not be empty".into()));
    }
    if method.starts_with("amq.") {
        return Err(TransportError::InvalidArgument(format!(
            "method name '{}' uses the reserved 'amq.' prefix",
            method
        )));
    }
    Ok(())
}

fn resolve_reply(pending: &PendingMap, delivery: Delivery) {
    let Some(correlation_id) = delivery.correlation_id.as_deref() else {
        warn!("Reply without correlation id, dropping");
        return;
    };

    let Some(tx) = pending.lock().remove(correlation_id) else {
        debug!(correlation_id = correlation_id, "No caller waiting for reply");
        return;
    };

    let _ = tx.send(decode_reply(&delivery));
}

fn decode_reply(delivery: &Delivery) -> Reply {
    let body: Value = delivery
        .json()
        .map_err(|e| TransportError::Malformed(e.to_string()))?;

    match delivery.kind.as_deref() {
        Some(ERROR_KIND) => {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            Err(TransportError::Remote(message))
        }
        _ => Ok(body),
    }
}

/// Declare the queue for `method` on `channel` and start consuming it
async fn serve_on(
    channel: &Arc<dyn Channel>,
    method: &str,
    handler: MethodHandler,
    options: &RegisterOptions,
) -> Result<String, TransportError> {
    channel
        .declare_queue(
            method,
            QueueOptions {
                durable: options.durable,
                exclusive: false,
                auto_delete: options.auto_delete,
            },
        )
        .await?;
    channel
        .consume(method, serve(channel.clone(), method.to_string(), handler))
        .await
}

/// Consumer for a method queue
fn serve(channel: Arc<dyn Channel>, method: String, handler: MethodHandler) -> DeliveryHandler {
    delivery_handler(move |delivery: Delivery| {
        answer(channel.clone(), method.clone(), handler.clone(), delivery)
    })
}

/// Run the handler for one request and publish the reply to its `reply_to`
async fn answer(
    channel: Arc<dyn Channel>,
    method: String,
    handler: MethodHandler,
    delivery: Delivery,
) -> anyhow::Result<()> {
    let outcome = match delivery.json::<Kwargs>() {
        Ok(kwargs) => handler.invoke(kwargs).await,
        Err(e) => Err(anyhow::Error::new(e).context("request body is not a JSON object")),
    };

    let Some(reply_to) = delivery.reply_to.as_deref() else {
        debug!(method = %method, "Request without reply_to, discarding result");
        return outcome.map(|_| ());
    };

    let (kind, body) = match &outcome {
        Ok(value) => (RESULT_KIND, serde_json::to_vec(value)?),
        Err(e) => {
            warn!(method = %method, error = %e, "Method handler failed");
            (ERROR_KIND, serde_json::to_vec(&json!({ "error": e.to_string() }))?)
        }
    };

    let mut reply = OutboundMessage::new(body)
        .content_type(JSON_CONTENT_TYPE)
        .delivery_mode(DeliveryMode::Transient)
        .kind(kind);
    if let Some(correlation_id) = &delivery.correlation_id {
        reply = reply.correlation_id(correlation_id.clone());
    }

    channel.publish("", reply_to, reply).await?;
    Ok(())
}
