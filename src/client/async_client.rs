//! Async Client Module
//!
//! Token-based client. Every operation issues a non-blocking request, gets a
//! completion token back, and parks the calling thread on that token for at
//! most the caller's timeout. Each client owns a small tokio runtime; the
//! transport runs there, along with a dispatcher task that applies transport
//! events to the session and invokes the connection-lost, delivery-complete
//! and message-arrived callbacks while the issuing thread is parked.
//!
//! A timed-out wait leaves the client usable. The request stays in flight and
//! its late acknowledgment is discarded.

use super::{ClientError, Operation, ProtocolClient};
use crate::config::ConnectionConfig;
use crate::protocol::QoS;
use crate::session::{notify, Callback, Session, WaitOutcome};
use crate::sink::MessageSink;
use crate::transport::{Connector, RequestSender, TransportEvent};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc::UnboundedReceiver;

pub struct AsyncClient {
    session: Arc<Session>,
    sender: Box<dyn RequestSender>,
    handle: Handle,
    disconnect_timeout: Duration,
    // Dropped last; shut down in the background so dropping never blocks.
    runtime: Option<Runtime>,
}

impl AsyncClient {
    /// Open a session and wait for the broker's CONNACK
    pub fn connect(config: &ConnectionConfig, connector: &dyn Connector) -> Result<Self, ClientError> {
        Self::connect_with_callback(config, connector, None)
    }

    /// Like `connect`, additionally invoking `callback` for every
    /// connection-lost, delivery-complete and message-arrived event.
    pub fn connect_with_callback(
        config: &ConnectionConfig,
        connector: &dyn Connector,
        callback: Option<Arc<dyn Callback>>,
    ) -> Result<Self, ClientError> {
        let connection_error = |reason: String| ClientError::Connection {
            broker: config.broker_address.clone(),
            reason,
        };
        config.validate().map_err(|e| connection_error(e.to_string()))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("mqtt-{}", config.client_id))
            .enable_all()
            .build()
            .map_err(|e| connection_error(format!("failed to start client runtime: {}", e)))?;
        let handle = runtime.handle().clone();

        log::info!(
            "Connecting to {} with client ID '{}' and cleanSession {} as an async client",
            config.broker_address, config.client_id, config.clean_session
        );

        let session = Arc::new(Session::new(config.client_id.clone(), config.broker_address.clone()));
        let token = session.expect_connack();
        let (sender, events) = connector
            .open_async(config, &handle)
            .map_err(|e| connection_error(e.to_string()))?;
        handle.spawn(dispatch(Arc::clone(&session), callback, events));

        let client = Self {
            session,
            sender,
            handle,
            disconnect_timeout: config.connect_timeout(),
            runtime: Some(runtime),
        };

        let timeout = config.connect_timeout();
        match token.wait(&client.handle, Some(timeout)) {
            WaitOutcome::Completed(Ok(())) => {
                log::info!("{} connected", config.client_id);
                Ok(client)
            }
            WaitOutcome::Completed(Err(e)) => {
                log::warn!("Unable to set up client {}: {}", config.client_id, e);
                Err(connection_error(e.to_string()))
            }
            WaitOutcome::TimedOut => {
                log::warn!("Unable to set up client {}: no CONNACK", config.client_id);
                Err(connection_error(format!("no CONNACK within {} ms", timeout.as_millis())))
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected(self.session.client_id().to_string()))
        }
    }

    /// Cause of the last unexpected connection loss, if any
    pub fn last_disconnect_cause(&self) -> Option<String> {
        self.session.last_cause()
    }

    /// Publishes issued but not yet written or acknowledged, including ones
    /// whose callers already timed out
    pub fn in_flight_publishes(&self) -> usize {
        self.session.in_flight_publishes()
    }
}

/// Apply transport events to the session until the stream ends
async fn dispatch(
    session: Arc<Session>,
    callback: Option<Arc<dyn Callback>>,
    mut events: UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(client_event) = session.apply(event) else {
            continue;
        };
        if let Some(callback) = &callback {
            notify(callback.as_ref(), session.client_id(), &client_event);
        }
        session.deliver(client_event);
    }

    if session.is_connected() {
        if let Some(lost) = session.apply(TransportEvent::ConnectionClosed(Some("transport stopped".into()))) {
            if let Some(callback) = &callback {
                notify(callback.as_ref(), session.client_id(), &lost);
            }
            session.deliver(lost);
        }
    }
}

impl ProtocolClient for AsyncClient {
    fn client_id(&self) -> &str {
        self.session.client_id()
    }

    fn broker_address(&self) -> &str {
        self.session.broker_address()
    }

    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: &[u8],
        retained: bool,
        timeout: Option<Duration>,
    ) -> Result<Duration, ClientError> {
        self.ensure_connected()?;
        let publish_error = |source| ClientError::Publish { topic: topic.to_string(), source };

        let start = Instant::now();
        let token = self.session
            .issue_publish(qos, || self.sender.publish(topic, qos, retained, payload))
            .map_err(publish_error)?;

        match token.wait(&self.handle, timeout) {
            WaitOutcome::Completed(outcome) => outcome.map_err(publish_error)?,
            WaitOutcome::TimedOut => {
                return Err(ClientError::Timeout { operation: Operation::Publish, after: timeout.unwrap_or_default() });
            }
        }
        let duration = start.elapsed();

        log::debug!("{} published to {}", self.client_id(), topic);
        Ok(duration)
    }

    fn subscribe(&self, topic: &str, qos: QoS, timeout: Option<Duration>) -> Result<(), ClientError> {
        self.ensure_connected()?;
        let subscribe_error = |source| ClientError::Subscribe { topic: topic.to_string(), source };

        log::info!("{} subscribing to topic \"{}\" qos {}", self.client_id(), topic, qos.level());
        let token = self.session
            .issue_subscribe(|| self.sender.subscribe(topic, qos))
            .map_err(subscribe_error)?;

        match token.wait(&self.handle, timeout) {
            WaitOutcome::Completed(outcome) => outcome.map_err(subscribe_error)?,
            WaitOutcome::TimedOut => {
                return Err(ClientError::Timeout { operation: Operation::Subscribe, after: timeout.unwrap_or_default() });
            }
        }

        log::info!("{} subscribed to topic \"{}\"", self.client_id(), topic);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ClientError> {
        self.ensure_connected()?;

        log::info!("{} disconnecting", self.client_id());
        let token = self.session
            .issue_disconnect(|| self.sender.disconnect())
            .map_err(ClientError::Disconnect)?;

        match token.wait(&self.handle, Some(self.disconnect_timeout)) {
            WaitOutcome::Completed(outcome) => outcome.map_err(ClientError::Disconnect)?,
            WaitOutcome::TimedOut => {
                return Err(ClientError::Timeout { operation: Operation::Disconnect, after: self.disconnect_timeout });
            }
        }

        log::info!("{} disconnected", self.client_id());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    fn messages(&self) -> &MessageSink {
        self.session.sink()
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
