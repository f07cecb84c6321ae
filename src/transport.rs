//! Transport Module
//!
//! The seam between the client layer and the MQTT transport underneath it.
//! A transport session has two halves: a `RequestSender` that queues protocol
//! requests without waiting on the network, and a stream of `TransportEvent`s
//! reporting what actually happened on the wire. The blocking client pulls
//! events on the caller's thread through an `EventSource`; the async client
//! receives them over a channel fed by a task on its own runtime.

use crate::config::ConnectionConfig;
use crate::protocol::{Message, QoS};

use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;

/// Transport error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Invalid broker address '{0}'")]
    InvalidAddress(String),

    #[error("Request not accepted by transport: {0}")]
    Request(String),

    #[error("Broker rejected the request")]
    Rejected,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Transport event stream closed")]
    Closed,

    #[error("Completion signal dropped before the request finished")]
    Abandoned,
}

/// Something observed on a transport session.
///
/// Packet ids of zero are used for QoS 0 publishes, which carry none.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// CONNACK with a success code
    Connected,
    /// A PUBLISH was written to the network
    PublishSent(u16),
    /// Final acknowledgment of a publish: PUBACK for QoS 1, PUBCOMP for QoS 2
    PublishAcked(u16),
    /// A SUBSCRIBE was written to the network
    SubscribeSent(u16),
    /// SUBACK; `rejected` when the broker refused any of the filters
    SubscribeAcked { pkid: u16, rejected: bool },
    /// The DISCONNECT packet was flushed
    DisconnectSent,
    /// Inbound PUBLISH for one of our subscriptions
    MessageArrived(Message),
    /// The session ended; `None` when it ended because we disconnected
    ConnectionClosed(Option<String>),
}

/// Outgoing half of a session. Every method returns as soon as the request is
/// queued; the outcome shows up later as a `TransportEvent`.
pub trait RequestSender: Send + Sync {
    fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: &[u8]) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    fn disconnect(&self) -> Result<(), TransportError>;
}

/// Pull-based event stream for callers that drive the session themselves
pub trait EventSource: Send {
    /// Wait for the next event. `Ok(None)` means `timeout` elapsed, or the
    /// transport made progress that produced nothing of interest.
    fn next_event(&mut self, timeout: Option<Duration>) -> Result<Option<TransportEvent>, TransportError>;

    /// Return an event only if one is available without waiting
    fn try_next(&mut self) -> Result<Option<TransportEvent>, TransportError>;
}

/// Opens transport sessions for a connection config
pub trait Connector: Send + Sync {
    /// Open a session driven by the caller through the returned event source
    fn open_blocking(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(Box<dyn RequestSender>, Box<dyn EventSource>), TransportError>;

    /// Open a session driven by tasks spawned on `runtime`; events are
    /// delivered on the returned channel
    fn open_async(
        &self,
        config: &ConnectionConfig,
        runtime: &Handle,
    ) -> Result<(Box<dyn RequestSender>, UnboundedReceiver<TransportEvent>), TransportError>;
}

/// Host, port and security of a broker URI such as `tcp://host:1883`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub const DEFAULT_PORT: u16 = 1883;
    pub const DEFAULT_TLS_PORT: u16 = 8883;

    /// Parse `tcp://`, `mqtt://`, `ssl://` or `mqtts://` URIs. A bare
    /// `host[:port]` is treated as plain TCP.
    pub fn parse(uri: &str) -> Result<Self, TransportError> {
        let uri = uri.trim();
        let invalid = || TransportError::InvalidAddress(uri.to_string());

        let (tls, rest) = match uri.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "tcp" | "mqtt" => (false, rest),
                "ssl" | "tls" | "mqtts" => (true, rest),
                _ => return Err(invalid()),
            },
            None => (false, uri),
        };

        let authority = rest.trim_end_matches('/');
        if authority.is_empty() || authority.contains('/') {
            return Err(invalid());
        }

        let default_port = if tls { Self::DEFAULT_TLS_PORT } else { Self::DEFAULT_PORT };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, default_port),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self { host: host.to_string(), port, tls })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_uri() {
        let addr = BrokerAddress::parse("tcp://broker.local:1884").unwrap();
        assert_eq!(addr, BrokerAddress { host: "broker.local".into(), port: 1884, tls: false });
    }

    #[test]
    fn test_parse_default_ports() {
        assert_eq!(BrokerAddress::parse("mqtt://h").unwrap().port, 1883);
        let tls = BrokerAddress::parse("ssl://h").unwrap();
        assert!(tls.tls);
        assert_eq!(tls.port, 8883);
    }

    #[test]
    fn test_parse_bare_host() {
        let addr = BrokerAddress::parse("localhost:1883").unwrap();
        assert_eq!(addr.host, "localhost");
        assert!(!addr.tls);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(BrokerAddress::parse("ws://h:80").is_err());
        assert!(BrokerAddress::parse("tcp://").is_err());
        assert!(BrokerAddress::parse("tcp://h:notaport").is_err());
        assert!(BrokerAddress::parse("tcp://h:1883/path").is_err());
        assert!(BrokerAddress::parse("tcp://:1883").is_err());
    }
}
