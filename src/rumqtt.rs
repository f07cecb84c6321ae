//! rumqttc Transport Module
//!
//! `Connector` backed by the rumqttc MQTT 3.1.1 client. The blocking session
//! pumps rumqttc's synchronous `Connection` on the caller's thread; the async
//! session polls an `EventLoop` from a task on the client's runtime.
//!
//! rumqttc reconnects whenever its event loop is polled after a failure, so
//! both sessions stop polling at the first error. Reconnection is left to the
//! caller building a new client.

use crate::config::ConnectionConfig;
use crate::protocol::{Message, QoS};
use crate::transport::{BrokerAddress, Connector, EventSource, RequestSender, TransportError, TransportEvent};

use rumqttc::{
    ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, RecvTimeoutError, SubscribeReasonCode, Transport,
    TryRecvError,
};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Capacity of rumqttc's request channel.
const REQUEST_CAPACITY: usize = 64;

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Build rumqttc options from a connection config
pub fn mqtt_options(config: &ConnectionConfig) -> Result<MqttOptions, TransportError> {
    config.validate().map_err(|e| TransportError::Request(e.to_string()))?;
    let address = BrokerAddress::parse(&config.broker_address)?;

    let mut options = MqttOptions::new(config.client_id.clone(), address.host, address.port);
    options.set_clean_session(config.clean_session);
    options.set_keep_alive(config.keep_alive());

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }

    if address.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    Ok(options)
}

/// Translate a rumqttc event into the transport events the client layer
/// tracks. Pings and the intermediate QoS 2 packets are dropped.
fn translate(event: Event) -> Option<TransportEvent> {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => Some(if ack.code == ConnectReturnCode::Success {
            TransportEvent::Connected
        } else {
            TransportEvent::ConnectionClosed(Some(format!("connection refused: {:?}", ack.code)))
        }),
        Event::Incoming(Packet::Publish(publish)) => Some(TransportEvent::MessageArrived(Message {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            qos: publish.qos.into(),
            retained: publish.retain,
        })),
        Event::Incoming(Packet::PubAck(ack)) => Some(TransportEvent::PublishAcked(ack.pkid)),
        Event::Incoming(Packet::PubComp(comp)) => Some(TransportEvent::PublishAcked(comp.pkid)),
        Event::Incoming(Packet::SubAck(ack)) => Some(TransportEvent::SubscribeAcked {
            pkid: ack.pkid,
            rejected: ack.return_codes.iter().any(|code| matches!(code, SubscribeReasonCode::Failure)),
        }),
        Event::Incoming(Packet::Disconnect) => {
            Some(TransportEvent::ConnectionClosed(Some("broker sent DISCONNECT".into())))
        }
        Event::Outgoing(Outgoing::Publish(pkid)) => Some(TransportEvent::PublishSent(pkid)),
        Event::Outgoing(Outgoing::Subscribe(pkid)) => Some(TransportEvent::SubscribeSent(pkid)),
        Event::Outgoing(Outgoing::Disconnect) => Some(TransportEvent::DisconnectSent),
        _ => None,
    }
}

fn request_error(e: rumqttc::ClientError) -> TransportError {
    TransportError::Request(e.to_string())
}

impl RequestSender for rumqttc::Client {
    fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: &[u8]) -> Result<(), TransportError> {
        self.try_publish(topic, qos.into(), retained, payload.to_vec()).map_err(request_error)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.try_subscribe(topic, qos.into()).map_err(request_error)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.try_disconnect().map_err(request_error)
    }
}

impl RequestSender for rumqttc::AsyncClient {
    fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: &[u8]) -> Result<(), TransportError> {
        self.try_publish(topic, qos.into(), retained, payload.to_vec()).map_err(request_error)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.try_subscribe(topic, qos.into()).map_err(request_error)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.try_disconnect().map_err(request_error)
    }
}

/// Session state shared by both event pumps: once the connection has ended,
/// the event loop must not be polled again.
#[derive(Debug, Default)]
struct PumpState {
    finished: bool,
}

impl PumpState {
    fn on_event(&mut self, event: Event) -> Option<TransportEvent> {
        let translated = translate(event)?;
        if matches!(translated, TransportEvent::DisconnectSent | TransportEvent::ConnectionClosed(_)) {
            self.finished = true;
        }
        Some(translated)
    }

    fn on_error(&mut self, e: rumqttc::ConnectionError) -> TransportEvent {
        self.finished = true;
        TransportEvent::ConnectionClosed(Some(e.to_string()))
    }
}

/// Caller-driven event source over rumqttc's synchronous connection
struct BlockingEvents {
    connection: rumqttc::Connection,
    state: PumpState,
}

impl EventSource for BlockingEvents {
    fn next_event(&mut self, timeout: Option<Duration>) -> Result<Option<TransportEvent>, TransportError> {
        if self.state.finished {
            return Err(TransportError::Closed);
        }
        let polled = match timeout {
            Some(timeout) => match self.connection.recv_timeout(timeout) {
                Ok(polled) => polled,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            },
            None => self.connection.recv().map_err(|_| TransportError::Closed)?,
        };
        Ok(match polled {
            Ok(event) => self.state.on_event(event),
            Err(e) => Some(self.state.on_error(e)),
        })
    }

    fn try_next(&mut self) -> Result<Option<TransportEvent>, TransportError> {
        if self.state.finished {
            return Err(TransportError::Closed);
        }
        match self.connection.try_recv() {
            Ok(Ok(event)) => Ok(self.state.on_event(event)),
            Ok(Err(e)) => Ok(Some(self.state.on_error(e))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

/// `Connector` for real brokers
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttcConnector;

impl Connector for RumqttcConnector {
    fn open_blocking(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(Box<dyn RequestSender>, Box<dyn EventSource>), TransportError> {
        let (client, connection) = rumqttc::Client::new(mqtt_options(config)?, REQUEST_CAPACITY);
        let events = BlockingEvents { connection, state: PumpState::default() };
        Ok((Box::new(client), Box::new(events)))
    }

    fn open_async(
        &self,
        config: &ConnectionConfig,
        runtime: &Handle,
    ) -> Result<(Box<dyn RequestSender>, UnboundedReceiver<TransportEvent>), TransportError> {
        let (client, mut eventloop) = rumqttc::AsyncClient::new(mqtt_options(config)?, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = config.client_id.clone();

        runtime.spawn(async move {
            let mut state = PumpState::default();
            while !state.finished {
                let event = match eventloop.poll().await {
                    Ok(event) => state.on_event(event),
                    Err(e) => Some(state.on_error(e)),
                };
                if let Some(event) = event {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            log::debug!("{} event loop stopped", client_id);
        });

        Ok((Box::new(client), rx))
    }
}
