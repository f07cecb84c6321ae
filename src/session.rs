//! Session Module
//!
//! Correlates issued protocol requests with the transport events that finish
//! them, and holds the per-client state both client strategies share.
//!
//! Requests are handed to the transport in order, and the transport reports
//! each one as written (with the packet id it was given) in that same order.
//! Unsent requests therefore wait in FIFO queues; once a packet id is known
//! they move to a map keyed by that id until the broker's acknowledgment
//! arrives.

use crate::protocol::{Message, QoS};
use crate::sink::MessageSink;
use crate::transport::{TransportError, TransportEvent};

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot::{self, error::TryRecvError};

type Outcome = Result<(), TransportError>;

/// Sending half of a completion token
pub(crate) struct Completer(oneshot::Sender<Outcome>);

impl Completer {
    fn complete(self, outcome: Outcome) {
        // The waiter may have timed out and gone away.
        let _ = self.0.send(outcome);
    }

    fn is_abandoned(&self) -> bool {
        self.0.is_closed()
    }
}

/// Handle for the outcome of one issued request
#[derive(Debug)]
pub struct CompletionToken {
    rx: oneshot::Receiver<Outcome>,
}

/// Result of waiting on a token with a deadline
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed(Outcome),
    TimedOut,
}

impl CompletionToken {
    pub(crate) fn new() -> (Completer, Self) {
        let (tx, rx) = oneshot::channel();
        (Completer(tx), Self { rx })
    }

    /// Outcome if the request has already finished
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(TransportError::Abandoned)),
        }
    }

    /// Park the calling thread until the request finishes or `timeout`
    /// elapses. `None` waits without a bound.
    ///
    /// Must not be called from inside an async context.
    pub fn wait(self, runtime: &Handle, timeout: Option<Duration>) -> WaitOutcome {
        let rx = self.rx;
        runtime.block_on(async move {
            let received = match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                    Ok(received) => received,
                    Err(_) => return WaitOutcome::TimedOut,
                },
                None => rx.await,
            };
            WaitOutcome::Completed(received.unwrap_or(Err(TransportError::Abandoned)))
        })
    }
}

/// Requests in flight on one session
#[derive(Default)]
pub(crate) struct PendingRequests {
    connect: Option<Completer>,
    unsent_publishes: VecDeque<(QoS, Completer)>,
    publishes: HashMap<u16, Completer>,
    unsent_subscribes: VecDeque<Completer>,
    subscribes: HashMap<u16, Completer>,
    disconnect: Option<Completer>,
}

impl PendingRequests {
    /// Record that a publish was written. QoS 0 publishes finish here.
    /// Returns true when the publish completed.
    fn publish_sent(&mut self, pkid: u16) -> bool {
        let Some((qos, completer)) = self.unsent_publishes.pop_front() else {
            log::debug!("Publish {} written with no pending request", pkid);
            return false;
        };
        if !qos.is_acknowledged() {
            completer.complete(Ok(()));
            return true;
        }
        self.publishes.retain(|_, pending| !pending.is_abandoned());
        self.publishes.insert(pkid, completer);
        false
    }

    fn publish_acked(&mut self, pkid: u16) {
        match self.publishes.remove(&pkid) {
            Some(completer) => completer.complete(Ok(())),
            None => log::debug!("Acknowledgment for untracked publish {}", pkid),
        }
    }

    fn subscribe_sent(&mut self, pkid: u16) {
        match self.unsent_subscribes.pop_front() {
            Some(completer) => {
                self.subscribes.retain(|_, pending| !pending.is_abandoned());
                self.subscribes.insert(pkid, completer);
            }
            None => log::debug!("Subscribe {} written with no pending request", pkid),
        }
    }

    fn subscribe_acked(&mut self, pkid: u16, rejected: bool) {
        match self.subscribes.remove(&pkid) {
            Some(completer) => completer.complete(if rejected { Err(TransportError::Rejected) } else { Ok(()) }),
            None => log::warn!("SUBACK for unknown packet id {}", pkid),
        }
    }

    /// Fail everything still outstanding
    fn fail_all(&mut self, error: TransportError) {
        let completers = self.connect.take().into_iter()
            .chain(self.disconnect.take())
            .chain(self.unsent_publishes.drain(..).map(|(_, completer)| completer))
            .chain(self.publishes.drain().map(|(_, completer)| completer))
            .chain(self.unsent_subscribes.drain(..))
            .chain(self.subscribes.drain().map(|(_, completer)| completer));
        for completer in completers {
            completer.complete(Err(error.clone()));
        }
    }

    /// Number of publishes awaiting a write or an acknowledgment
    fn in_flight_publishes(&self) -> usize {
        self.unsent_publishes.len() + self.publishes.len()
    }
}

/// What a session reports back to the client that owns it
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The session dropped without us asking for it
    ConnectionLost(String),
    /// A publish was fully acknowledged (packet id 0 for QoS 0)
    DeliveryComplete(u16),
    /// A message arrived for one of our subscriptions
    MessageArrived(Message),
}

/// Receiver for session notifications, invoked on the transport's thread
pub trait Callback: Send + Sync {
    fn connection_lost(&self, cause: &str);

    fn delivery_complete(&self, pkid: u16);

    fn message_arrived(&self, message: &Message);
}

/// Hand `event` to `callback`; a panicking callback is logged and contained.
pub(crate) fn notify(callback: &dyn Callback, client_id: &str, event: &ClientEvent) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| match event {
        ClientEvent::ConnectionLost(cause) => callback.connection_lost(cause),
        ClientEvent::DeliveryComplete(pkid) => callback.delivery_complete(*pkid),
        ClientEvent::MessageArrived(message) => callback.message_arrived(message),
    }));
    if result.is_err() {
        log::warn!("{} callback panicked while handling {:?}", client_id, event);
    }
}

/// State of one client session shared between the issuing thread and
/// whichever thread applies transport events.
pub(crate) struct Session {
    client_id: String,
    broker_address: String,
    connected: AtomicBool,
    last_cause: Mutex<Option<String>>,
    pending: Mutex<PendingRequests>,
    sink: MessageSink,
}

impl Session {
    pub(crate) fn new(client_id: String, broker_address: String) -> Self {
        Self {
            client_id,
            broker_address,
            connected: AtomicBool::new(false),
            last_cause: Mutex::new(None),
            pending: Mutex::new(PendingRequests::default()),
            sink: MessageSink::new(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn broker_address(&self) -> &str {
        &self.broker_address
    }

    pub(crate) fn sink(&self) -> &MessageSink {
        &self.sink
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Why the session last dropped, if it did
    pub(crate) fn last_cause(&self) -> Option<String> {
        self.last_cause.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn in_flight_publishes(&self) -> usize {
        self.pending().in_flight_publishes()
    }

    /// Pending requests, provided the session is still up. Connection loss
    /// clears `connected` before it takes this lock to fail what is pending,
    /// so a request queued here is either failed by that pass or refused.
    fn pending_if_connected(&self) -> Result<MutexGuard<'_, PendingRequests>, TransportError> {
        let pending = self.pending();
        if !self.is_connected() {
            let cause = self.last_cause().unwrap_or_else(|| "client disconnected".into());
            return Err(TransportError::ConnectionClosed(cause));
        }
        Ok(pending)
    }

    /// Token for the CONNACK of a session about to be opened
    pub(crate) fn expect_connack(&self) -> CompletionToken {
        let (completer, token) = CompletionToken::new();
        self.pending().connect = Some(completer);
        token
    }

    /// Queue a publish and issue it through `send`, under the pending lock so
    /// concurrent publishers keep queue order and transport order in step.
    pub(crate) fn issue_publish(
        &self,
        qos: QoS,
        send: impl FnOnce() -> Result<(), TransportError>,
    ) -> Result<CompletionToken, TransportError> {
        let mut pending = self.pending_if_connected()?;
        let (completer, token) = CompletionToken::new();
        pending.unsent_publishes.push_back((qos, completer));
        if let Err(e) = send() {
            pending.unsent_publishes.pop_back();
            return Err(e);
        }
        Ok(token)
    }

    /// Reset the sink, queue a subscribe and issue it through `send`
    pub(crate) fn issue_subscribe(
        &self,
        send: impl FnOnce() -> Result<(), TransportError>,
    ) -> Result<CompletionToken, TransportError> {
        let mut pending = self.pending_if_connected()?;
        self.sink.reset();
        let (completer, token) = CompletionToken::new();
        pending.unsent_subscribes.push_back(completer);
        if let Err(e) = send() {
            pending.unsent_subscribes.pop_back();
            return Err(e);
        }
        Ok(token)
    }

    pub(crate) fn issue_disconnect(
        &self,
        send: impl FnOnce() -> Result<(), TransportError>,
    ) -> Result<CompletionToken, TransportError> {
        let mut pending = self.pending_if_connected()?;
        let (completer, token) = CompletionToken::new();
        pending.disconnect = Some(completer);
        if let Err(e) = send() {
            pending.disconnect = None;
            return Err(e);
        }
        Ok(token)
    }

    /// Apply one transport event, returning what the owner should be told
    pub(crate) fn apply(&self, event: TransportEvent) -> Option<ClientEvent> {
        match event {
            TransportEvent::Connected => {
                self.connected.store(true, Ordering::Release);
                if let Some(completer) = self.pending().connect.take() {
                    completer.complete(Ok(()));
                }
                None
            }
            TransportEvent::PublishSent(pkid) => {
                self.pending().publish_sent(pkid).then_some(ClientEvent::DeliveryComplete(pkid))
            }
            TransportEvent::PublishAcked(pkid) => {
                self.pending().publish_acked(pkid);
                Some(ClientEvent::DeliveryComplete(pkid))
            }
            TransportEvent::SubscribeSent(pkid) => {
                self.pending().subscribe_sent(pkid);
                None
            }
            TransportEvent::SubscribeAcked { pkid, rejected } => {
                self.pending().subscribe_acked(pkid, rejected);
                None
            }
            TransportEvent::DisconnectSent => {
                self.connected.store(false, Ordering::Release);
                let mut pending = self.pending();
                if let Some(completer) = pending.disconnect.take() {
                    completer.complete(Ok(()));
                }
                pending.fail_all(TransportError::ConnectionClosed("client disconnected".into()));
                None
            }
            TransportEvent::MessageArrived(message) => Some(ClientEvent::MessageArrived(message)),
            TransportEvent::ConnectionClosed(cause) => {
                let was_connected = self.connected.swap(false, Ordering::AcqRel);
                let reason = cause.clone().unwrap_or_else(|| "client disconnected".into());
                self.pending().fail_all(TransportError::ConnectionClosed(reason));
                match cause {
                    Some(cause) if was_connected => Some(ClientEvent::ConnectionLost(cause)),
                    _ => None,
                }
            }
        }
    }

    /// The session's own handling of a client event
    pub(crate) fn deliver(&self, event: ClientEvent) {
        match event {
            ClientEvent::ConnectionLost(cause) => {
                log::warn!("{} connection to {} lost: {}", self.client_id, self.broker_address, cause);
                *self.last_cause.lock().unwrap_or_else(PoisonError::into_inner) = Some(cause);
            }
            ClientEvent::DeliveryComplete(pkid) => {
                log::debug!("{} delivery complete for publish {}", self.client_id, pkid);
            }
            ClientEvent::MessageArrived(message) => self.sink.push(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("test-client".into(), "tcp://localhost:1883".into())
    }

    fn connected_session() -> Session {
        let session = session();
        session.apply(TransportEvent::Connected);
        session
    }

    #[test]
    fn test_connack_completes_connect() {
        let session = session();
        let mut token = session.expect_connack();
        assert!(token.try_outcome().is_none());
        session.apply(TransportEvent::Connected);
        assert_eq!(token.try_outcome(), Some(Ok(())));
        assert!(session.is_connected());
    }

    #[test]
    fn test_qos0_publish_completes_when_sent() {
        let session = connected_session();
        let mut token = session.issue_publish(QoS::AtMostOnce, || Ok(())).unwrap();
        let event = session.apply(TransportEvent::PublishSent(0));
        assert_eq!(event, Some(ClientEvent::DeliveryComplete(0)));
        assert_eq!(token.try_outcome(), Some(Ok(())));
    }

    #[test]
    fn test_qos1_publish_waits_for_ack() {
        let session = connected_session();
        let mut token = session.issue_publish(QoS::AtLeastOnce, || Ok(())).unwrap();
        assert_eq!(session.apply(TransportEvent::PublishSent(5)), None);
        assert!(token.try_outcome().is_none());
        assert_eq!(session.in_flight_publishes(), 1);
        session.apply(TransportEvent::PublishAcked(5));
        assert_eq!(token.try_outcome(), Some(Ok(())));
        assert_eq!(session.in_flight_publishes(), 0);
    }

    #[test]
    fn test_publishes_correlate_in_issue_order() {
        let session = connected_session();
        let mut first = session.issue_publish(QoS::AtLeastOnce, || Ok(())).unwrap();
        let mut second = session.issue_publish(QoS::AtLeastOnce, || Ok(())).unwrap();
        session.apply(TransportEvent::PublishSent(1));
        session.apply(TransportEvent::PublishSent(2));
        session.apply(TransportEvent::PublishAcked(2));
        assert!(first.try_outcome().is_none());
        assert_eq!(second.try_outcome(), Some(Ok(())));
        session.apply(TransportEvent::PublishAcked(1));
        assert_eq!(first.try_outcome(), Some(Ok(())));
    }

    #[test]
    fn test_failed_send_is_not_queued() {
        let session = connected_session();
        let result = session.issue_publish(QoS::AtLeastOnce, || Err(TransportError::Request("full".into())));
        assert!(result.is_err());
        assert_eq!(session.in_flight_publishes(), 0);
    }

    #[test]
    fn test_rejected_subscribe() {
        let session = connected_session();
        let mut token = session.issue_subscribe(|| Ok(())).unwrap();
        session.apply(TransportEvent::SubscribeSent(9));
        session.apply(TransportEvent::SubscribeAcked { pkid: 9, rejected: true });
        assert_eq!(token.try_outcome(), Some(Err(TransportError::Rejected)));
    }

    #[test]
    fn test_subscribe_resets_sink() {
        let session = connected_session();
        session.deliver(ClientEvent::MessageArrived(Message::new("t", vec![1], QoS::AtMostOnce, false)));
        assert_eq!(session.sink().received_count(), 1);
        let _token = session.issue_subscribe(|| Ok(())).unwrap();
        assert_eq!(session.sink().received_count(), 0);
        assert!(session.sink().is_empty());
    }

    #[test]
    fn test_connection_loss_fails_pending_and_reports() {
        let session = connected_session();
        let mut token = session.issue_publish(QoS::ExactlyOnce, || Ok(())).unwrap();
        let event = session.apply(TransportEvent::ConnectionClosed(Some("reset by peer".into())));
        assert_eq!(event, Some(ClientEvent::ConnectionLost("reset by peer".into())));
        assert!(matches!(token.try_outcome(), Some(Err(TransportError::ConnectionClosed(_)))));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_refused_connect_is_not_a_lost_connection() {
        let session = session();
        let mut token = session.expect_connack();
        let event = session.apply(TransportEvent::ConnectionClosed(Some("refused".into())));
        assert_eq!(event, None);
        assert!(matches!(token.try_outcome(), Some(Err(TransportError::ConnectionClosed(_)))));
    }

    #[test]
    fn test_disconnect_sent_completes_disconnect() {
        let session = connected_session();
        let mut token = session.issue_disconnect(|| Ok(())).unwrap();
        session.apply(TransportEvent::DisconnectSent);
        assert_eq!(token.try_outcome(), Some(Ok(())));
        assert!(!session.is_connected());
    }

    #[test]
    fn test_requests_after_connection_loss_are_refused() {
        let session = connected_session();
        session.apply(TransportEvent::ConnectionClosed(Some("reset by peer".into())));

        let mut sent = false;
        let publish = session.issue_publish(QoS::AtLeastOnce, || {
            sent = true;
            Ok(())
        });
        assert!(matches!(publish, Err(TransportError::ConnectionClosed(_))));
        assert!(!sent);
        assert_eq!(session.in_flight_publishes(), 0);

        assert!(session.issue_subscribe(|| Ok(())).is_err());
        assert!(session.issue_disconnect(|| Ok(())).is_err());
    }

    #[test]
    fn test_requests_before_connack_are_refused() {
        let session = session();
        assert!(session.issue_publish(QoS::AtMostOnce, || Ok(())).is_err());
    }

    #[test]
    fn test_refused_request_reports_last_cause() {
        let session = connected_session();
        let lost = session.apply(TransportEvent::ConnectionClosed(Some("keep alive timeout".into())));
        session.deliver(lost.unwrap());
        assert_eq!(
            session.issue_publish(QoS::AtMostOnce, || Ok(())).err(),
            Some(TransportError::ConnectionClosed("keep alive timeout".into()))
        );
    }

    #[test]
    fn test_connection_lost_records_cause() {
        let session = session();
        session.deliver(ClientEvent::ConnectionLost("keep alive timeout".into()));
        assert_eq!(session.last_cause().as_deref(), Some("keep alive timeout"));
    }

    #[test]
    fn test_dropped_completer_reads_as_abandoned() {
        let (completer, mut token) = CompletionToken::new();
        drop(completer);
        assert_eq!(token.try_outcome(), Some(Err(TransportError::Abandoned)));
    }

    struct Panicky;

    impl Callback for Panicky {
        fn connection_lost(&self, _cause: &str) {
            panic!("boom");
        }
        fn delivery_complete(&self, _pkid: u16) {
            panic!("boom");
        }
        fn message_arrived(&self, _message: &Message) {
            panic!("boom");
        }
    }

    #[test]
    fn test_notify_contains_panics() {
        notify(&Panicky, "c", &ClientEvent::DeliveryComplete(1));
        notify(&Panicky, "c", &ClientEvent::ConnectionLost("x".into()));
    }
}
