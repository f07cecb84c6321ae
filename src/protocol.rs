//! Protocol Module
//!
//! Quality-of-service levels, the inbound message type, and client id generation.
//! The MQTT wire encoding itself is left to the transport beneath this layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Quality of Service
// ============================================================================

/// Selector string for QoS 0 as written in sampler configuration
pub const AT_MOST_ONCE: &str = "mqtt_at_most_once";
/// Selector string for QoS 1
pub const AT_LEAST_ONCE: &str = "mqtt_at_least_once";
/// Selector string for QoS 2
pub const EXACTLY_ONCE: &str = "mqtt_exactly_once";

/// Delivery guarantee for a published or subscribed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Map a configuration selector onto a QoS level.
    ///
    /// Anything that is not one of the three known selectors resolves to
    /// `AtMostOnce`.
    pub fn from_selector(selector: &str) -> Self {
        match selector.trim() {
            AT_MOST_ONCE => QoS::AtMostOnce,
            AT_LEAST_ONCE => QoS::AtLeastOnce,
            EXACTLY_ONCE => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    /// Selector string for this level
    pub fn selector(self) -> &'static str {
        match self {
            QoS::AtMostOnce => AT_MOST_ONCE,
            QoS::AtLeastOnce => AT_LEAST_ONCE,
            QoS::ExactlyOnce => EXACTLY_ONCE,
        }
    }

    /// Numeric level as carried on the wire
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Whether the broker answers a publish at this level
    pub fn is_acknowledged(self) -> bool {
        self != QoS::AtMostOnce
    }
}

// ============================================================================
// Inbound Messages
// ============================================================================

/// A message delivered by the broker for one of the client's subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained,
        }
    }

    /// Payload interpreted as UTF-8, lossy
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Generate a new UUID v4 client ID
pub fn generate_client_id() -> String {
    Uuid::new_v4().to_string()
}
