//! Blocking Client Module
//!
//! Strictly synchronous client. Each operation issues its request and then
//! pumps the transport's event source on the calling thread until the
//! request's completion token resolves or the deadline passes. There is no
//! background thread: inbound messages are captured into the sink by whichever
//! thread happens to be pumping.
//!
//! When several threads share one client, one of them pumps at a time. The
//! rest wait on their own token, bounded by their own deadline, and take over
//! the event source once it is free.
//!
//! Nothing drives the transport between calls. While a client sits idle, no
//! PINGREQ is sent and inbound messages stay in the socket, so a broker drops
//! a client left idle for more than about 1.5 times its keep-alive. The next
//! operation or `is_connected()` then reports the session as lost.

use super::{ClientError, Operation, ProtocolClient};
use crate::config::ConnectionConfig;
use crate::protocol::QoS;
use crate::session::{CompletionToken, Session, WaitOutcome};
use crate::sink::MessageSink;
use crate::transport::{Connector, EventSource, RequestSender, TransportEvent};

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

/// Longest a waiter sleeps before checking whether the event source is free
const HANDOFF_POLL: Duration = Duration::from_millis(10);

pub struct BlockingClient {
    session: Session,
    sender: Box<dyn RequestSender>,
    events: Mutex<Box<dyn EventSource>>,
    // Signalled by the pumping thread after each event it handles
    progress: Mutex<()>,
    pumped: Condvar,
    disconnect_timeout: Duration,
}

impl BlockingClient {
    /// Open a session and wait on this thread for the broker's CONNACK
    pub fn connect(config: &ConnectionConfig, connector: &dyn Connector) -> Result<Self, ClientError> {
        let connection_error = |reason: String| ClientError::Connection {
            broker: config.broker_address.clone(),
            reason,
        };
        config.validate().map_err(|e| connection_error(e.to_string()))?;

        log::info!(
            "Connecting to {} with client ID '{}' and cleanSession {} as a blocking client",
            config.broker_address, config.client_id, config.clean_session
        );

        let session = Session::new(config.client_id.clone(), config.broker_address.clone());
        let token = session.expect_connack();
        let (sender, events) = connector.open_blocking(config).map_err(|e| connection_error(e.to_string()))?;
        let client = Self {
            session,
            sender,
            events: Mutex::new(events),
            progress: Mutex::new(()),
            pumped: Condvar::new(),
            disconnect_timeout: config.connect_timeout(),
        };

        let timeout = config.connect_timeout();
        match client.pump_until(token, Some(timeout)) {
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

    fn handle(&self, event: TransportEvent) {
        if let Some(client_event) = self.session.apply(event) {
            self.session.deliver(client_event);
        }
    }

    fn progress(&self) -> MutexGuard<'_, ()> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `wait` for one event and apply it, then wake any waiters
    fn pump_once(&self, events: &mut Box<dyn EventSource>, wait: Option<Duration>) {
        match events.next_event(wait) {
            Ok(Some(event)) => self.handle(event),
            Ok(None) => {}
            // The source is gone; fail whatever is still waiting.
            Err(e) => self.handle(TransportEvent::ConnectionClosed(Some(e.to_string()))),
        }
        drop(self.progress());
        self.pumped.notify_all();
    }

    /// Drive the transport until `token` resolves or `timeout` elapses.
    ///
    /// Only the thread holding the event source pumps. Everyone else parks
    /// until the pumping thread makes progress, their own deadline passes,
    /// or it is time to retry the event source.
    fn pump_until(&self, mut token: CompletionToken, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(outcome) = token.try_outcome() {
                return WaitOutcome::Completed(outcome);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let mut events = match self.events.try_lock() {
                Ok(events) => events,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    let progress = self.progress();
                    // Checked under `progress` so a completion cannot slip in
                    // between this check and the wait.
                    if let Some(outcome) = token.try_outcome() {
                        return WaitOutcome::Completed(outcome);
                    }
                    let nap = remaining.map_or(HANDOFF_POLL, |remaining| remaining.min(HANDOFF_POLL));
                    let _ = self.pumped.wait_timeout(progress, nap);
                    continue;
                }
            };
            self.pump_once(&mut events, remaining);
        }
    }

    /// Apply whatever the transport already has ready, without waiting
    fn drain_ready(&self) {
        let Ok(mut events) = self.events.try_lock() else {
            return;
        };
        while self.session.is_connected() {
            match events.try_next() {
                Ok(Some(event)) => self.handle(event),
                Ok(None) => break,
                Err(e) => self.handle(TransportEvent::ConnectionClosed(Some(e.to_string()))),
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
}

impl ProtocolClient for BlockingClient {
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

        match self.pump_until(token, timeout) {
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

        match self.pump_until(token, timeout) {
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

        match self.pump_until(token, Some(self.disconnect_timeout)) {
            WaitOutcome::Completed(outcome) => outcome.map_err(ClientError::Disconnect)?,
            WaitOutcome::TimedOut => {
                return Err(ClientError::Timeout { operation: Operation::Disconnect, after: self.disconnect_timeout });
            }
        }

        log::info!("{} disconnected", self.client_id());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.drain_ready();
        self.session.is_connected()
    }

    fn messages(&self) -> &MessageSink {
        self.session.sink()
    }
}
