//! Sampler Module
//!
//! One publisher sampler: resolves its configuration, keeps a client alive
//! across samples, publishes one payload per sample and turns the outcome into
//! a `SampleResult`. Failures never escape `sample`; they come back as failed
//! results carrying the error chain.

use crate::client::{self, ClientError, ProtocolClient};
use crate::config::{MessageInput, SamplerConfig};
use crate::pool::ClientPool;
use crate::transport::Connector;

use serde::Serialize;
use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const NAME_LABEL: &str = "MQTT Publisher";
pub const CODE_OK: &str = "OK";
pub const CODE_FAILED: &str = "FAILED";

/// Why a sample failed
#[derive(Debug, Error)]
pub enum SampleError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Failed to read payload file '{}': {source}", .path.display())]
    Payload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Supplies payload bytes for file-based message input
pub trait PayloadSource: Send + Sync {
    fn read_bytes(&self, path: &Path) -> std::io::Result<Vec<u8>>;
}

/// Reads payloads from the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FilePayloadSource;

impl PayloadSource for FilePayloadSource {
    fn read_bytes(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

/// Outcome of one sample, as handed to the reporting side
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleResult {
    pub label: String,
    pub successful: bool,
    pub latency_millis: u64,
    pub latency_nanos: u64,
    pub elapsed_millis: u64,
    pub bytes_sent: usize,
    pub response_message: String,
    pub response_code: String,
    pub response_data: String,
}

impl SampleResult {
    fn success(label: String, latency: Duration, elapsed: Duration, bytes_sent: usize, published: u64) -> Self {
        Self {
            label,
            successful: true,
            latency_millis: latency.as_millis() as u64,
            latency_nanos: latency.as_nanos() as u64,
            elapsed_millis: elapsed.as_millis() as u64,
            bytes_sent,
            response_message: format!("Sent {} messages total", published),
            response_code: CODE_OK.into(),
            response_data: String::new(),
        }
    }

    fn failure(label: String, elapsed: Duration, error: &SampleError) -> Self {
        Self {
            label,
            successful: false,
            latency_millis: 0,
            latency_nanos: 0,
            elapsed_millis: elapsed.as_millis() as u64,
            bytes_sent: 0,
            response_message: format!("Unable to publish messages.\nException: {}", error),
            response_code: CODE_FAILED.into(),
            response_data: error_report(error),
        }
    }
}

/// Render an error and its whole source chain, one cause per line
pub fn error_report(error: &dyn StdError) -> String {
    let mut report = format!("{}: {:?}", error, error);
    let mut source = error.source();
    while let Some(cause) = source {
        report.push_str(&format!("\nCaused by: {}", cause));
        source = cause.source();
    }
    report
}

pub struct PublisherSampler {
    config: SamplerConfig,
    connector: Arc<dyn Connector>,
    pool: Arc<ClientPool>,
    payloads: Box<dyn PayloadSource>,
    client: Option<Arc<dyn ProtocolClient>>,
    published: u64,
}

impl PublisherSampler {
    pub fn new(config: SamplerConfig, connector: Arc<dyn Connector>, pool: Arc<ClientPool>) -> Self {
        Self {
            config,
            connector,
            pool,
            payloads: Box::new(FilePayloadSource),
            client: None,
            published: 0,
        }
    }

    /// Replace where file payloads are read from
    pub fn with_payload_source(mut self, payloads: Box<dyn PayloadSource>) -> Self {
        self.payloads = payloads;
        self
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Client currently held for reuse
    pub fn client(&self) -> Option<&Arc<dyn ProtocolClient>> {
        self.client.as_ref()
    }

    /// Successful publishes so far
    pub fn published_count(&self) -> u64 {
        self.published
    }

    fn label(&self) -> String {
        let client_id = self.client.as_ref().map(|c| c.client_id()).unwrap_or(self.config.client_id.as_str());
        format!("{}::{}", NAME_LABEL, client_id)
    }

    /// Return the held client, building and registering a new one when there
    /// is none or the held one has dropped.
    fn ensure_client(&mut self) -> Result<Arc<dyn ProtocolClient>, ClientError> {
        if let Some(client) = &self.client {
            if client.is_connected() {
                return Ok(Arc::clone(client));
            }
            log::info!("{} is disconnected, reconnecting", client.client_id());
        }
        self.client = None;

        let connection = self.config.connection_config();
        let client = client::connect(self.config.client_kind, &connection, self.connector.as_ref())
            .inspect_err(|e| log::error!("{}: {}", connection.client_id, e))?;
        self.pool.add(Arc::clone(&client));
        self.client = Some(Arc::clone(&client));
        Ok(client)
    }

    fn payload(&self) -> Result<Vec<u8>, SampleError> {
        match self.config.message_input {
            MessageInput::Text => Ok(self.config.message_value.as_bytes().to_vec()),
            MessageInput::File => {
                let path = PathBuf::from(&self.config.message_value);
                log::debug!("{} reading file: {}", self.config.client_id, path.display());
                self.payloads.read_bytes(&path).map_err(|source| SampleError::Payload { path, source })
            }
            MessageInput::Empty => Ok(Vec::new()),
        }
    }

    fn publish_once(&mut self) -> Result<(Duration, usize), SampleError> {
        let client = self.ensure_client()?;
        let payload = self.payload()?;
        let latency = client.publish(
            &self.config.topic,
            self.config.qos(),
            &payload,
            self.config.retained,
            self.config.publish_timeout(),
        )?;
        Ok((latency, payload.len()))
    }

    /// Run one sample
    pub fn sample(&mut self) -> SampleResult {
        let start = Instant::now();
        match self.publish_once() {
            Ok((latency, bytes_sent)) => {
                self.published += 1;
                SampleResult::success(self.label(), latency, start.elapsed(), bytes_sent, self.published)
            }
            Err(e) => {
                log::debug!("{} sample failed: {}", self.label(), e);
                SampleResult::failure(self.label(), start.elapsed(), &e)
            }
        }
    }

    /// Test-run-ended hook: close every pooled client. Failures are logged.
    pub fn test_ended(&mut self) {
        log::debug!("Test ended, clearing client pool");
        self.client = None;
        if let Err(e) = self.pool.clear_all() {
            log::error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    #[test]
    fn test_error_report_includes_chain() {
        let error = SampleError::Client(ClientError::Publish {
            topic: "t/1".into(),
            source: TransportError::Rejected,
        });
        let report = error_report(&error);
        assert!(report.starts_with("Publish to 't/1' failed"));
        assert!(report.contains("Caused by: Broker rejected the request"));
    }

    #[test]
    fn test_failure_result_shape() {
        let error = SampleError::Payload {
            path: PathBuf::from("/missing"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        let result = SampleResult::failure("label".into(), Duration::from_millis(3), &error);
        assert!(!result.successful);
        assert_eq!(result.response_code, CODE_FAILED);
        assert!(result.response_message.starts_with("Unable to publish messages."));
        assert!(result.response_data.contains("gone"));
    }

    #[test]
    fn test_success_result_shape() {
        let result = SampleResult::success("l".into(), Duration::from_micros(2500), Duration::from_millis(3), 2, 7);
        assert!(result.successful);
        assert_eq!(result.latency_millis, 2);
        assert_eq!(result.latency_nanos, 2_500_000);
        assert_eq!(result.response_message, "Sent 7 messages total");
        assert_eq!(result.response_code, CODE_OK);
    }
}
