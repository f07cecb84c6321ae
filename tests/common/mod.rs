//! In-process fake broker implementing the transport seam.
//!
//! Each session opened through `FakeBroker` gets its own event outlet. The
//! broker's `Behavior` decides whether connects succeed and whether publishes,
//! subscribes and disconnects are acknowledged; tests can also push inbound
//! messages or drop every session.

#![allow(dead_code)]

use rust_mqtt_load_client::config::ConnectionConfig;
use rust_mqtt_load_client::protocol::{Message, QoS};
use rust_mqtt_load_client::transport::{Connector, EventSource, RequestSender, TransportError, TransportEvent};

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone)]
pub struct Behavior {
    /// Refuse every CONNECT with this reason
    pub refuse_connect: Option<String>,
    /// Never answer CONNECT at all
    pub silent_connect: bool,
    pub ack_publishes: bool,
    pub ack_subscribes: bool,
    pub fail_disconnect: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            refuse_connect: None,
            silent_connect: false,
            ack_publishes: true,
            ack_subscribes: true,
            fail_disconnect: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub client_id: String,
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
    pub retained: bool,
}

#[derive(Clone)]
enum Outlet {
    Blocking(mpsc::Sender<TransportEvent>),
    Async(UnboundedSender<TransportEvent>),
}

impl Outlet {
    fn send(&self, event: TransportEvent) {
        let _ = match self {
            Outlet::Blocking(tx) => tx.send(event).map_err(|_| ()),
            Outlet::Async(tx) => tx.send(event).map_err(|_| ()),
        };
    }
}

#[derive(Default)]
struct State {
    behavior: Behavior,
    outlets: Vec<Outlet>,
    next_pkid: u16,
    connects: usize,
    published: Vec<Published>,
    subscriptions: Vec<(String, QoS)>,
}

impl State {
    fn pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.wrapping_add(1).max(1);
        self.next_pkid
    }
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub fn new(behavior: Behavior) -> Self {
        let broker = Self::default();
        broker.state.lock().unwrap().behavior = behavior;
        broker
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        self.state.lock().unwrap().behavior = behavior;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    /// Deliver an inbound message to every open session
    pub fn deliver(&self, topic: &str, payload: &[u8], qos: QoS) {
        let state = self.state.lock().unwrap();
        for outlet in &state.outlets {
            outlet.send(TransportEvent::MessageArrived(Message::new(topic, payload.to_vec(), qos, false)));
        }
    }

    /// Drop every open session as if the network failed
    pub fn drop_connections(&self, cause: &str) {
        let mut state = self.state.lock().unwrap();
        for outlet in state.outlets.drain(..) {
            outlet.send(TransportEvent::ConnectionClosed(Some(cause.to_string())));
        }
    }

    fn open(&self, config: &ConnectionConfig, outlet: Outlet) -> Box<dyn RequestSender> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        match (&state.behavior.refuse_connect, state.behavior.silent_connect) {
            (Some(reason), _) => outlet.send(TransportEvent::ConnectionClosed(Some(reason.clone()))),
            (None, true) => {}
            (None, false) => outlet.send(TransportEvent::Connected),
        }
        state.outlets.push(outlet.clone());
        Box::new(FakeSession {
            client_id: config.client_id.clone(),
            state: Arc::clone(&self.state),
            outlet,
        })
    }
}

struct FakeSession {
    client_id: String,
    state: Arc<Mutex<State>>,
    outlet: Outlet,
}

impl RequestSender for FakeSession {
    fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.published.push(Published {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            qos,
            payload: payload.to_vec(),
            retained,
        });
        let pkid = if qos.is_acknowledged() { state.pkid() } else { 0 };
        self.outlet.send(TransportEvent::PublishSent(pkid));
        if qos.is_acknowledged() && state.behavior.ack_publishes {
            self.outlet.send(TransportEvent::PublishAcked(pkid));
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.push((topic.to_string(), qos));
        let pkid = state.pkid();
        self.outlet.send(TransportEvent::SubscribeSent(pkid));
        if state.behavior.ack_subscribes {
            self.outlet.send(TransportEvent::SubscribeAcked { pkid, rejected: false });
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        if self.state.lock().unwrap().behavior.fail_disconnect {
            return Err(TransportError::Request("broker unreachable".into()));
        }
        self.outlet.send(TransportEvent::DisconnectSent);
        Ok(())
    }
}

struct FakeEvents {
    rx: mpsc::Receiver<TransportEvent>,
}

impl EventSource for FakeEvents {
    fn next_event(&mut self, timeout: Option<Duration>) -> Result<Option<TransportEvent>, TransportError> {
        match timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(event) => Ok(Some(event)),
                Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
            },
            None => self.rx.recv().map(Some).map_err(|_| TransportError::Closed),
        }
    }

    fn try_next(&mut self) -> Result<Option<TransportEvent>, TransportError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

impl Connector for FakeBroker {
    fn open_blocking(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(Box<dyn RequestSender>, Box<dyn EventSource>), TransportError> {
        let (tx, rx) = mpsc::channel();
        let sender = self.open(config, Outlet::Blocking(tx));
        Ok((sender, Box::new(FakeEvents { rx })))
    }

    fn open_async(
        &self,
        config: &ConnectionConfig,
        _runtime: &Handle,
    ) -> Result<(Box<dyn RequestSender>, UnboundedReceiver<TransportEvent>), TransportError> {
        let (tx, rx) = unbounded_channel();
        let sender = self.open(config, Outlet::Async(tx));
        Ok((sender, rx))
    }
}

/// Config with a short connect timeout for tests
pub fn connection(client_id: &str) -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout_secs: 1,
        ..ConnectionConfig::new("tcp://fake-broker:1883", client_id)
    }
}

/// Poll `condition` until it holds or two seconds pass
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
