//! Configuration Module
//!
//! Handles sampler configuration loading from Java-style .properties files
//! (KEY=VALUE format), using the same property names as the JMeter MQTT plugin
//! so existing test plans can be reused.

use crate::protocol::{self, QoS};

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse property '{key}': {reason}")]
    ParseError { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Selector for the blocking client
pub const BLOCKING_CLIENT: &str = "mqtt_blocking_client";
/// Selector for the async client
pub const ASYNC_CLIENT: &str = "mqtt_async_client";
/// Selector for literal text payloads
pub const INPUT_TYPE_TEXT: &str = "mqtt_message_input_type_text";
/// Selector for file payloads
pub const INPUT_TYPE_FILE: &str = "mqtt_message_input_type_file";

const BROKER_URL: &str = "mqtt.broker.url";
const CLIENT_ID: &str = "mqtt.client.id";
const TOPIC_NAME: &str = "mqtt.topic.name";
const RETAINED: &str = "mqtt.message.retained";
const CLEAN_SESSION: &str = "mqtt.clean.session";
const KEEP_ALIVE: &str = "mqtt.keep.alive";
const CONNECT_TIMEOUT: &str = "mqtt.connect.timeout";
const PUBLISH_TIMEOUT: &str = "mqtt.publish.timeout";
const USERNAME: &str = "mqtt.auth.username";
const PASSWORD: &str = "mqtt.auth.password";
const QOS: &str = "mqtt.qos";
const CLIENT_TYPE: &str = "mqtt.client.type";
const MESSAGE_INPUT_TYPE: &str = "mqtt.message.input.type";
const MESSAGE_VALUE: &str = "mqtt.message.input.value";
const LOAD_THREADS: &str = "load.threads";
const LOAD_SAMPLES: &str = "load.samples";
const LOAD_REPORT_EVERY: &str = "load.report.every";

/// Parameters for establishing one client session.
///
/// A config is fixed once a client has been built from it, and each client is
/// built from exactly one config.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub broker_address: String,
    pub client_id: String,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker_address: "tcp://localhost:1883".into(),
            client_id: String::new(),
            clean_session: true,
            username: None,
            password: None,
            keep_alive_secs: 300,
            connect_timeout_secs: 30,
        }
    }
}

impl ConnectionConfig {
    /// Config for `broker_address` with defaults elsewhere. An empty
    /// `client_id` is replaced with a generated UUID.
    pub fn new(broker_address: impl Into<String>, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            broker_address: broker_address.into(),
            client_id: if client_id.is_empty() { protocol::generate_client_id() } else { client_id },
            ..Default::default()
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reject values no broker session can be built from
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_address.trim().is_empty() {
            return Err(ConfigError::Invalid("broker address is empty".into()));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Invalid("client id is empty".into()));
        }
        if self.keep_alive_secs == 0 {
            return Err(ConfigError::Invalid("keep alive must be greater than zero".into()));
        }
        // CONNECT carries keep-alive as a 16-bit field
        if self.keep_alive_secs > u64::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "keep alive must be at most {} seconds, got {}",
                u16::MAX,
                self.keep_alive_secs
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connect timeout must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Which client strategy a sampler builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientKind {
    #[default]
    Blocking,
    Async,
}

impl ClientKind {
    pub fn from_selector(selector: &str) -> Result<Self, ConfigError> {
        match selector.trim() {
            BLOCKING_CLIENT => Ok(ClientKind::Blocking),
            ASYNC_CLIENT => Ok(ClientKind::Async),
            other => Err(ConfigError::ParseError {
                key: CLIENT_TYPE.into(),
                reason: format!("unknown client type: {}", other),
            }),
        }
    }

    pub fn selector(self) -> &'static str {
        match self {
            ClientKind::Blocking => BLOCKING_CLIENT,
            ClientKind::Async => ASYNC_CLIENT,
        }
    }
}

/// Where the outgoing payload comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageInput {
    /// The configured value is the payload
    Text,
    /// The configured value names a file whose bytes are the payload
    File,
    /// Neither; publish an empty payload
    #[default]
    Empty,
}

impl MessageInput {
    pub fn from_selector(selector: &str) -> Self {
        match selector.trim() {
            INPUT_TYPE_TEXT => MessageInput::Text,
            INPUT_TYPE_FILE => MessageInput::File,
            _ => MessageInput::Empty,
        }
    }
}

/// Everything one publisher sampler needs, as read from the properties file.
///
/// `client_id` may be empty here; it is resolved each time a client is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub broker_url: String,
    pub client_id: String,
    pub topic: String,
    pub retained: bool,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos_selector: String,
    pub client_kind: ClientKind,
    pub message_input: MessageInput,
    pub message_value: String,
    pub threads: usize,
    pub samples: usize,
    pub report_every: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        Self {
            broker_url: connection.broker_address,
            client_id: String::new(),
            topic: "loadtest/topic".into(),
            retained: false,
            clean_session: connection.clean_session,
            keep_alive_secs: connection.keep_alive_secs,
            connect_timeout_secs: connection.connect_timeout_secs,
            publish_timeout_secs: 0,
            username: None,
            password: None,
            qos_selector: protocol::AT_MOST_ONCE.into(),
            client_kind: ClientKind::Blocking,
            message_input: MessageInput::Text,
            message_value: String::new(),
            threads: 1,
            samples: 100,
            report_every: 100,
        }
    }
}

fn parse_number<T: std::str::FromStr>(
    props: &HashMap<String, String>,
    key: &str,
    kind: &str,
    default: T,
) -> Result<T, ConfigError> {
    props.get(key)
        .map(|v| v.parse().map_err(|_| ConfigError::ParseError {
            key: key.into(), reason: format!("invalid {}: {}", kind, v),
        }))
        .transpose()
        .map(|v| v.unwrap_or(default))
}

fn non_empty(props: &HashMap<String, String>, key: &str) -> Option<String> {
    props.get(key).filter(|v| !v.is_empty()).cloned()
}

impl SamplerConfig {
    /// Parse a Java-style .properties file into a HashMap.
    /// Skips blank lines and lines starting with '#'.
    fn parse_properties(content: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = trimmed.split_once('=') {
                map.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        map
    }

    /// Load configuration from a .properties file (Java KEY=VALUE format).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_properties_str(&content)
    }

    /// Parse config from a properties-format string.
    pub fn from_properties_str(content: &str) -> Result<Self, ConfigError> {
        let props = Self::parse_properties(content);
        let defaults = SamplerConfig::default();

        Ok(SamplerConfig {
            broker_url: props.get(BROKER_URL).cloned().unwrap_or(defaults.broker_url),
            client_id: props.get(CLIENT_ID).cloned().unwrap_or(defaults.client_id),
            topic: props.get(TOPIC_NAME).cloned().unwrap_or(defaults.topic),
            retained: props.get(RETAINED)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.retained),
            clean_session: props.get(CLEAN_SESSION)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.clean_session),
            keep_alive_secs: parse_number(&props, KEEP_ALIVE, "u64", defaults.keep_alive_secs)?,
            connect_timeout_secs: parse_number(&props, CONNECT_TIMEOUT, "u64", defaults.connect_timeout_secs)?,
            publish_timeout_secs: parse_number(&props, PUBLISH_TIMEOUT, "i64", defaults.publish_timeout_secs)?,
            username: non_empty(&props, USERNAME).or(defaults.username),
            password: non_empty(&props, PASSWORD).or(defaults.password),
            qos_selector: props.get(QOS).cloned().unwrap_or(defaults.qos_selector),
            client_kind: props.get(CLIENT_TYPE)
                .map(|v| ClientKind::from_selector(v))
                .transpose()?
                .unwrap_or(defaults.client_kind),
            message_input: props.get(MESSAGE_INPUT_TYPE)
                .map(|v| MessageInput::from_selector(v))
                .unwrap_or(defaults.message_input),
            message_value: props.get(MESSAGE_VALUE).cloned().unwrap_or(defaults.message_value),
            threads: parse_number(&props, LOAD_THREADS, "usize", defaults.threads)?,
            samples: parse_number(&props, LOAD_SAMPLES, "usize", defaults.samples)?,
            report_every: parse_number(&props, LOAD_REPORT_EVERY, "usize", defaults.report_every)?,
        })
    }

    /// Load configuration, searching for mqtt.properties in standard locations.
    ///
    /// Search order:
    /// 1. ./mqtt.properties (current directory)
    /// 2. ./config/mqtt.properties
    pub fn load_or_default() -> Self {
        let search_paths = [
            "mqtt.properties",
            "config/mqtt.properties",
        ];

        for path in &search_paths {
            if Path::new(path).exists() {
                match Self::load(path) {
                    Ok(config) => {
                        log::info!("Loaded configuration from {}", path);
                        return config;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}", path, e);
                    }
                }
            }
        }

        log::warn!("No mqtt.properties found, using defaults");
        Self::default()
    }

    /// QoS level the selector resolves to
    pub fn qos(&self) -> QoS {
        QoS::from_selector(&self.qos_selector)
    }

    /// Publish timeout; the configured seconds are multiplied by 1000 and
    /// anything not positive means wait without a bound.
    pub fn publish_timeout(&self) -> Option<Duration> {
        let millis = self.publish_timeout_secs.saturating_mul(1000);
        (millis > 0).then(|| Duration::from_millis(millis as u64))
    }

    /// Build the connection parameters for a new client, generating a client
    /// id when none is configured.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            clean_session: self.clean_session,
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive_secs: self.keep_alive_secs,
            connect_timeout_secs: self.connect_timeout_secs,
            ..ConnectionConfig::new(self.broker_url.clone(), self.client_id.clone())
        }
    }

    /// Log all configuration parameters for debugging
    pub fn log_config(&self) {
        log::debug!("Configuration:");
        log::debug!("  {}: {}", BROKER_URL, self.broker_url);
        log::debug!("  {}: {}", CLIENT_ID, self.client_id);
        log::debug!("  {}: {}", TOPIC_NAME, self.topic);
        log::debug!("  {}: {}", RETAINED, self.retained);
        log::debug!("  {}: {}", CLEAN_SESSION, self.clean_session);
        log::debug!("  {}: {} s", KEEP_ALIVE, self.keep_alive_secs);
        log::debug!("  {}: {} s", CONNECT_TIMEOUT, self.connect_timeout_secs);
        log::debug!("  {}: {} s", PUBLISH_TIMEOUT, self.publish_timeout_secs);
        log::debug!("  {}: {:?}", USERNAME, self.username);
        log::debug!("  {}: {}", PASSWORD, if self.password.is_some() { "****" } else { "<none>" });
        log::debug!("  {}: {}", QOS, self.qos_selector);
        log::debug!("  {}: {}", CLIENT_TYPE, self.client_kind.selector());
        log::debug!("  {}: {:?}", MESSAGE_INPUT_TYPE, self.message_input);
        log::debug!("  {}: {}", MESSAGE_VALUE, self.message_value);
        log::debug!("  {}: {}", LOAD_THREADS, self.threads);
        log::debug!("  {}: {}", LOAD_SAMPLES, self.samples);
        log::debug!("  {}: {}", LOAD_REPORT_EVERY, self.report_every);
    }
}
