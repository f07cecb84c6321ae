//! Result Tracker Module
//!
//! Collects sample results and reports publish latency statistics.
//! Uses HdrHistogram for precise latency measurements with percentile calculations.

use crate::sampler::SampleResult;

use hdrhistogram::serialization::interval_log::IntervalLogWriterBuilder;
use hdrhistogram::serialization::V2DeflateSerializer;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::time::{Instant, SystemTime};

/// Upper histogram bound: one hour in nanoseconds
const MAX_LATENCY_NS: u64 = 3_600_000_000_000;

/// Latency statistics structure (nanoseconds)
#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    #[serde(rename = "p99.9")]
    pub p99_9: u64,
    #[serde(rename = "p99.99")]
    pub p99_99: u64,
    pub max: u64,
}

/// Stats report printed at each interval
#[derive(Debug, Serialize)]
struct Report<'a> {
    latency_ns: &'a LatencyStats,
    count: u64,
    successful: u64,
    failed: u64,
    bytes_sent: u64,
}

/// Aggregates sample results across an interval
pub struct ResultTracker {
    /// Histogram of successful publish latencies (in nanoseconds)
    histogram: Histogram<u64>,
    /// Results recorded since creation
    result_count: u64,
    successful: u64,
    failed: u64,
    bytes_sent: u64,
    /// Number of results between statistics reports
    report_every: usize,
    /// Broker host used as directory name for histogram log files
    host: String,
    /// Timestamp when the current histogram interval started
    interval_start: Instant,
}

impl ResultTracker {
    /// Create a new tracker
    ///
    /// Histogram is configured with:
    /// - Minimum value: 1 nanosecond
    /// - Maximum value: 3,600,000,000,000 nanoseconds (1 hour)
    /// - 3 significant figures precision
    pub fn new(report_every: usize, host: String) -> Self {
        Self {
            histogram: Histogram::new_with_bounds(1, MAX_LATENCY_NS, 3)
                .expect("static histogram bounds are valid"),
            result_count: 0,
            successful: 0,
            failed: 0,
            bytes_sent: 0,
            report_every: report_every.max(1),
            host,
            interval_start: Instant::now(),
        }
    }

    /// Record one sample result
    pub fn record(&mut self, result: &SampleResult) {
        self.result_count += 1;
        if !result.successful {
            self.failed += 1;
            return;
        }
        self.successful += 1;
        self.bytes_sent += result.bytes_sent as u64;

        let clamped = result.latency_nanos.clamp(1, MAX_LATENCY_NS);
        if let Err(e) = self.histogram.record(clamped) {
            log::warn!("Failed to record latency {}: {}", result.latency_nanos, e);
        }
    }

    /// Check if statistics should be printed (every report_every results)
    pub fn should_print_stats(&self) -> bool {
        self.result_count > 0 && self.result_count % (self.report_every as u64) == 0
    }

    /// Print statistics, save histogram to file, and reset the histogram
    pub fn print_stats(&mut self) {
        let stats = self.get_stats();
        let report = Report {
            latency_ns: &stats,
            count: self.histogram.len(),
            successful: self.successful,
            failed: self.failed,
            bytes_sent: self.bytes_sent,
        };
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => log::error!("Failed to serialize stats: {}", e),
        }

        log::info!(
            "Latency stats (ns): p50={}, p90={}, p95={}, p99={}, p99.9={}, p99.99={}, max={} ({} ok, {} failed)",
            stats.p50, stats.p90, stats.p95, stats.p99, stats.p99_9, stats.p99_99, stats.max,
            self.successful, self.failed
        );

        self.save_histogram_to_file();

        self.histogram.reset();
        self.interval_start = Instant::now();
    }

    /// Append the current histogram to an HdrHistogram .hlog file, in a
    /// directory named after the broker host (dots replaced with underscores).
    fn save_histogram_to_file(&self) {
        let folder = format!("./{}", self.host.replace('.', "_"));
        if let Err(e) = fs::create_dir_all(&folder) {
            log::error!("Failed to create histogram log directory '{}': {}", folder, e);
            return;
        }

        let path = format!("{}/histogram_mqtt.hlog", folder);
        let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("Failed to open histogram log file '{}': {}", path, e);
                return;
            }
        };

        let interval_elapsed = self.interval_start.elapsed();
        let start_time = SystemTime::now() - interval_elapsed;

        let mut serializer = V2DeflateSerializer::new();
        let mut builder = IntervalLogWriterBuilder::new();
        builder
            .add_comment("[Logged with MQTT load client 0.1.0]")
            .with_base_time(start_time)
            .with_start_time(start_time);

        let mut log_writer = match builder.begin_log_with(&mut file, &mut serializer) {
            Ok(w) => w,
            Err(e) => {
                log::error!("Failed to create interval log writer: {}", e);
                return;
            }
        };

        let tag = hdrhistogram::serialization::interval_log::Tag::new("publish");
        if let Err(e) = log_writer.write_histogram(&self.histogram, std::time::Duration::ZERO, interval_elapsed, tag) {
            log::error!("Failed to write histogram to log: {}", e);
            return;
        }

        log::info!("Histogram saved to {}", path);
    }

    /// Get current latency statistics
    pub fn get_stats(&self) -> LatencyStats {
        LatencyStats {
            p50: self.histogram.value_at_quantile(0.50),
            p90: self.histogram.value_at_quantile(0.90),
            p95: self.histogram.value_at_quantile(0.95),
            p99: self.histogram.value_at_quantile(0.99),
            p99_9: self.histogram.value_at_quantile(0.999),
            p99_99: self.histogram.value_at_quantile(0.9999),
            max: self.histogram.max(),
        }
    }

    pub fn result_count(&self) -> u64 {
        self.result_count
    }

    pub fn successful_count(&self) -> u64 {
        self.successful
    }

    pub fn failed_count(&self) -> u64 {
        self.failed
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}
