//! Error types for the rabbitrpc client

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::retry::RetryError;

/// Errors raised by the transport layer (broker connection, channels, RPC adaptor)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Socket or protocol I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// The connection is closed or was never opened
    #[error("Connection closed")]
    ConnectionClosed,

    /// The channel is closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The broker refused the operation (e.g. redeclaring an exchange with another kind)
    #[error("Broker rejected operation: {0}")]
    Rejected(String),

    /// A mandatory message could not be routed to any queue
    #[error("Message to exchange '{exchange}' with routing key '{routing_key}' was unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    /// Caller supplied something the transport cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The remote handler answered with an error reply
    #[error("Remote handler error: {0}")]
    Remote(String),

    /// A message body could not be decoded
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// No reply arrived before the request message expired
    #[error("No reply within message expiration of {0:?}")]
    Expired(Duration),
}

impl TransportError {
    /// Whether a fresh attempt of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_)
                | TransportError::ConnectionClosed
                | TransportError::ChannelClosed
                | TransportError::Unroutable { .. }
        )
    }
}

/// Underlying cause carried by the operation-level errors
#[derive(Error, Debug)]
pub enum Cause {
    /// The operation did not finish within its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The payload could not be converted to or from JSON
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<RetryError<TransportError>> for Cause {
    fn from(err: RetryError<TransportError>) -> Self {
        match err {
            RetryError::Timeout(after) => Cause::Timeout(after),
            RetryError::Failed { source, .. } => Cause::Transport(source),
        }
    }
}

/// Errors that can occur when using the client
#[derive(Error, Debug)]
pub enum Error {
    /// The operation requires a live connection
    #[error("Not connected")]
    NotConnected,

    /// Opening or closing the broker connection failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// `send` or `call` failed
    #[error("Failed to call event {event}: {source}")]
    Rpc {
        event: String,
        #[source]
        source: Cause,
    },

    /// Registering or unregistering a method handler failed
    ///
    /// `event` is `<unregistered>` when unregistering a handler the client never saw.
    #[error("Failed to register event handler for {event}: {source}")]
    EventRegistration {
        event: String,
        #[source]
        source: Cause,
    },

    /// Publishing to an exchange failed
    #[error("Failed to publish event to exchange {exchange}: {source}")]
    EventPublish {
        exchange: String,
        #[source]
        source: Cause,
    },

    /// Declaring, binding or consuming a queue failed
    #[error("Failed to subscribe to queue {queue}: {source}")]
    EventSubscribe {
        queue: String,
        #[source]
        source: Cause,
    },

    /// Configuration does not resolve to a usable URL
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl Error {
    /// True for failures caused by an expired deadline
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Rpc { source: Cause::Timeout(_), .. }
                | Error::EventRegistration { source: Cause::Timeout(_), .. }
                | Error::EventPublish { source: Cause::Timeout(_), .. }
                | Error::EventSubscribe { source: Cause::Timeout(_), .. }
        )
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, Error>;
