//! Client Module
//!
//! The `ProtocolClient` contract shared by the two client strategies, the
//! errors they report, and the factory that picks a strategy.
//!
//! - `blocking`: all protocol work happens on the caller's thread
//! - `async_client`: requests return completion tokens; a runtime owned by the
//!   client drives the transport and delivers callbacks

pub mod async_client;
pub mod blocking;

pub use async_client::AsyncClient;
pub use blocking::BlockingClient;

use crate::config::{ClientKind, ConnectionConfig};
use crate::protocol::QoS;
use crate::sink::MessageSink;
use crate::transport::{Connector, TransportError};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Protocol operation named in timeout errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Publish,
    Subscribe,
    Disconnect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Connect => "connect",
            Operation::Publish => "publish",
            Operation::Subscribe => "subscribe",
            Operation::Disconnect => "disconnect",
        })
    }
}

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Unable to connect to {broker}: {reason}")]
    Connection { broker: String, reason: String },

    #[error("Publish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Subscribe to '{topic}' failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Disconnect failed: {0}")]
    Disconnect(#[source] TransportError),

    #[error("{operation} timed out after {} ms", .after.as_millis())]
    Timeout { operation: Operation, after: Duration },

    #[error("Client {0} is not connected")]
    NotConnected(String),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }
}

/// Uniform contract over the blocking and async client strategies.
///
/// A client is connected when constructed. Once `is_connected()` reports
/// false, every operation fails with `NotConnected`; callers build a new
/// client instead of reconnecting this one.
pub trait ProtocolClient: Send + Sync {
    fn client_id(&self) -> &str;

    fn broker_address(&self) -> &str;

    /// Publish `payload` to `topic`, returning the time from just before the
    /// send until the acknowledgment required by `qos` arrived.
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: &[u8],
        retained: bool,
        timeout: Option<Duration>,
    ) -> Result<Duration, ClientError>;

    /// Subscribe to `topic`. The message sink is emptied and its counter
    /// zeroed before the request goes out.
    fn subscribe(&self, topic: &str, qos: QoS, timeout: Option<Duration>) -> Result<(), ClientError>;

    /// End the session gracefully
    fn disconnect(&self) -> Result<(), ClientError>;

    /// Non-blocking check of the live session state
    fn is_connected(&self) -> bool;

    /// Messages received since the last subscribe
    fn messages(&self) -> &MessageSink;

    /// Best-effort disconnect for teardown paths; failures are logged only.
    fn close(&self) {
        if !self.is_connected() {
            log::debug!("{} already disconnected", self.client_id());
            return;
        }
        if let Err(e) = self.disconnect() {
            log::error!("{} error disconnecting from {}: {}", self.client_id(), self.broker_address(), e);
        }
    }
}

/// Connect a client of the requested kind
pub fn connect(
    kind: ClientKind,
    config: &ConnectionConfig,
    connector: &dyn Connector,
) -> Result<Arc<dyn ProtocolClient>, ClientError> {
    Ok(match kind {
        ClientKind::Blocking => Arc::new(BlockingClient::connect(config, connector)?),
        ClientKind::Async => Arc::new(AsyncClient::connect(config, connector)?),
    })
}
