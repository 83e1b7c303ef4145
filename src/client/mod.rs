//! Broker client implementation

mod pubsub;
mod rpc;

pub use pubsub::{PublishOptions, SubscribeOptions, Subscription};

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use crate::config::RabbitMqConfig;
use crate::error::{Error, Result, TransportError};
use crate::retry::RetryPolicy;
use crate::rpc::RpcAdaptor;
use crate::transport::{AmqpConnector, Channel, Connection, Connector};

/// Lifecycle phase of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session
    Disconnected,
    /// Opening the connection and RPC channel
    Connecting,
    /// Session installed
    Connected,
    /// Closing the session
    Closing,
    /// Re-establishing after an explicit `reconnect`
    Reconnecting,
}

/// A live connection with its RPC adaptor
struct Session {
    connection: Arc<dyn Connection>,
    rpc: RpcAdaptor,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.is_open() && self.rpc.channel().is_open()
    }
}

enum Link {
    Disconnected,
    Connected(Arc<Session>),
}

/// Client for one broker endpoint
///
/// Offers RPC (`send`, `call`, `register_event`) and pub/sub
/// (`publish_event`, `subscribe_event`) over a single managed connection.
/// Share it through an `Arc`, usually obtained from an
/// [`EndpointRegistry`](crate::EndpointRegistry).
pub struct RpcClient {
    config: RabbitMqConfig,
    url: String,
    connector: Arc<dyn Connector>,
    retry_policy: RetryPolicy,

    link: RwLock<Link>,
    // Serializes connect / close / reconnect
    lifecycle: Mutex<()>,

    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl RpcClient {
    /// Create a disconnected client that opens connections through `connector`
    pub fn new(config: RabbitMqConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let url = config.url()?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            config,
            url,
            connector,
            retry_policy: RetryPolicy::default(),
            link: RwLock::new(Link::Disconnected),
            lifecycle: Mutex::new(()),
            state: state_tx,
            state_rx,
        })
    }

    /// Create a disconnected client for a real AMQP broker
    pub fn amqp(config: RabbitMqConfig) -> Result<Self> {
        Self::new(config, Arc::new(AmqpConnector::new()))
    }

    /// Replace the backoff used between retried attempts
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn config(&self) -> &RabbitMqConfig {
        &self.config
    }

    /// Endpoint URL with the password masked
    pub fn endpoint(&self) -> String {
        self.config.redacted_url()
    }

    /// Get the current lifecycle phase
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Get a receiver for lifecycle changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Whether a session exists and its RPC channel is open
    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|session| session.is_open())
    }

    /// The open RPC channel, without performing any I/O
    pub fn channel(&self) -> Result<Arc<dyn Channel>> {
        Ok(self.live_session()?.rpc.channel().clone())
    }

    /// The open RPC channel, connecting first if needed
    pub async fn ensure_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.is_connected() {
            self.connect().await?;
        }
        self.channel()
    }

    /// Open the connection and the RPC channel
    ///
    /// Does nothing when already connected.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.connect_locked(ConnectionState::Connecting).await
    }

    /// Close the session
    ///
    /// Does nothing when disconnected. If the broker connection fails to
    /// close, the session is kept and the error returned.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.close_locked().await
    }

    /// Close, then connect again
    ///
    /// The state stays `Reconnecting` until the new session is up. If the old
    /// connection fails to close it is kept and the state returns to `Connected`.
    pub async fn reconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        info!(url = %self.endpoint(), "Reconnecting to broker");

        self.set_state(ConnectionState::Reconnecting);
        if let Some(session) = self.session() {
            if let Err(e) = self.end_session(&session).await {
                self.set_state(ConnectionState::Connected);
                return Err(e);
            }
        }
        self.connect_locked(ConnectionState::Reconnecting).await
    }

    async fn connect_locked(&self, phase: ConnectionState) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        // A session whose connection died under us
        if let Some(stale) = self.take_session() {
            debug!(url = %self.endpoint(), "Discarding stale session");
            stale.rpc.abandon_pending();
            if stale.connection.is_open() {
                let _ = stale.connection.close().await;
            }
        }

        self.set_state(phase);
        match self.establish().await {
            Ok(session) => {
                *self.link.write() = Link::Connected(Arc::new(session));
                self.set_state(ConnectionState::Connected);
                info!(url = %self.endpoint(), "Connected to broker");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(url = %self.endpoint(), error = %e, "Failed to connect to broker");
                Err(Error::Connection(e.to_string()))
            }
        }
    }

    async fn establish(&self) -> std::result::Result<Session, TransportError> {
        let connection = self.connector.connect(&self.url).await?;

        match RpcAdaptor::create(connection.clone()).await {
            Ok(rpc) => Ok(Session { connection, rpc }),
            Err(e) => {
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    async fn close_locked(&self) -> Result<()> {
        let Some(session) = self.session() else {
            return Ok(());
        };

        self.set_state(ConnectionState::Closing);
        if let Err(e) = self.end_session(&session).await {
            self.set_state(ConnectionState::Connected);
            return Err(e);
        }

        self.set_state(ConnectionState::Disconnected);
        info!(url = %self.endpoint(), "Disconnected from broker");
        Ok(())
    }

    /// Close the session's connection and uninstall it; kept installed on failure
    async fn end_session(&self, session: &Session) -> Result<()> {
        if session.connection.is_open() {
            if let Err(e) = session.connection.close().await {
                error!(url = %self.endpoint(), error = %e, "Failed to close broker connection");
                return Err(Error::Connection(e.to_string()));
            }
        }

        session.rpc.abandon_pending();
        *self.link.write() = Link::Disconnected;
        Ok(())
    }

    fn session(&self) -> Option<Arc<Session>> {
        match &*self.link.read() {
            Link::Connected(session) => Some(session.clone()),
            Link::Disconnected => None,
        }
    }

    fn take_session(&self) -> Option<Arc<Session>> {
        match std::mem::replace(&mut *self.link.write(), Link::Disconnected) {
            Link::Connected(session) => Some(session),
            Link::Disconnected => None,
        }
    }

    /// The installed session if it is usable, checked before any I/O
    fn live_session(&self) -> Result<Arc<Session>> {
        self.session()
            .filter(|session| session.is_open())
            .ok_or(Error::NotConnected)
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
    }
}

impl fmt::Display for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcClient({})", self.endpoint())
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}
