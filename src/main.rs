//! MQTT Load Client Main Entry Point
//!
//! Runs `load.threads` publisher samplers against the configured broker, each
//! taking `load.samples` samples, and reports publish latency as it goes.

use rust_mqtt_load_client::transport::BrokerAddress;
use rust_mqtt_load_client::{ClientPool, PublisherSampler, ResultTracker, RumqttcConnector, SamplerConfig};

use std::sync::{Arc, Mutex, PoisonError};

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    log::info!("Starting MQTT load client");

    // Load configuration
    let config = SamplerConfig::load_or_default();
    config.log_config();

    let host = BrokerAddress::parse(&config.broker_url)
        .map(|address| address.host)
        .unwrap_or_else(|_| config.broker_url.clone());
    let tracker = Arc::new(Mutex::new(ResultTracker::new(config.report_every, host)));
    let pool = ClientPool::global();

    std::thread::scope(|scope| {
        for thread in 0..config.threads.max(1) {
            let mut sampler_config = config.clone();
            if !sampler_config.client_id.is_empty() && config.threads > 1 {
                sampler_config.client_id = format!("{}-{}", sampler_config.client_id, thread);
            }
            let pool = Arc::clone(&pool);
            let tracker = Arc::clone(&tracker);

            scope.spawn(move || {
                let mut sampler = PublisherSampler::new(sampler_config, Arc::new(RumqttcConnector), pool);
                for _ in 0..sampler.config().samples {
                    let result = sampler.sample();
                    if !result.successful {
                        log::warn!("{}: {}", result.label, result.response_message);
                    }
                    let mut tracker = tracker.lock().unwrap_or_else(PoisonError::into_inner);
                    tracker.record(&result);
                    if tracker.should_print_stats() {
                        tracker.print_stats();
                    }
                }
                log::info!("Sampler thread {} finished after {} successful publishes", thread, sampler.published_count());
            });
        }
    });

    // Test-run end: close every client that was created
    log::debug!("Test ended, clearing client pool");
    if let Err(e) = pool.clear_all() {
        log::error!("{}", e);
    }

    let mut tracker = tracker.lock().unwrap_or_else(PoisonError::into_inner);
    // Report the tail of the run that did not fill a whole interval
    if tracker.result_count() > 0 && !tracker.should_print_stats() {
        tracker.print_stats();
    }
    log::info!(
        "Client completed: {} samples, {} successful, {} failed, {} bytes sent",
        tracker.result_count(),
        tracker.successful_count(),
        tracker.failed_count(),
        tracker.bytes_sent()
    );
}
