//! Rust MQTT Load Client Library
//!
//! Drives load-test traffic against an MQTT broker, measuring per-publish
//! latency and correctness. Two client strategies sit behind one contract: a
//! strictly synchronous client that does all protocol work on the caller's
//! thread, and an asynchronous client that waits on completion tokens while
//! its own runtime delivers callbacks.
//!
//! # Modules
//!
//! - `config`: Sampler and connection configuration from .properties files
//! - `protocol`: QoS levels, inbound messages, client id generation
//! - `sink`: Thread-safe store of inbound messages
//! - `transport`: The seam to the MQTT transport, plus broker address parsing
//! - `rumqtt`: rumqttc-backed transport
//! - `session`: Request/acknowledgment correlation, completion tokens, callbacks
//! - `client`: The `ProtocolClient` contract and its blocking and async strategies
//! - `pool`: Registry that closes every client at the end of a run
//! - `sampler`: Publisher sampler producing per-sample results
//! - `tracker`: Histogram-based latency reporting over sample results

pub mod config;
pub mod protocol;
pub mod sink;
pub mod transport;
pub mod rumqtt;
pub mod session;
pub mod client;
pub mod pool;
pub mod sampler;
pub mod tracker;

// Re-export main types for convenience
pub use client::{AsyncClient, BlockingClient, ClientError, ProtocolClient};
pub use config::{ClientKind, ConnectionConfig, SamplerConfig};
pub use pool::ClientPool;
pub use protocol::{Message, QoS};
pub use rumqtt::RumqttcConnector;
pub use sampler::{PublisherSampler, SampleResult};
pub use sink::MessageSink;
pub use tracker::ResultTracker;
