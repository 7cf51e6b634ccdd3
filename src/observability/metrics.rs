//! OpenTelemetry metrics for the pipeline.
//!
//! Key metrics:
//! - tributary_publish_total: Counter for durable publishes
//! - tributary_publish_latency_seconds: Histogram for publish latency
//! - tributary_publish_failures_total: Counter for failed or timed-out publishes
//! - tributary_analytics_failures_total: Counter for soft analytics write failures
//! - tributary_processed_total: Counter for messages processed and acked
//! - tributary_processing_errors_total: Counter for processing failures (nacked)
//! - tributary_redeliveries_total: Counter for deliveries with attempt > 1

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Tributary metrics registry.
#[derive(Debug)]
pub struct Metrics {
    pub publish_total: Counter<u64>,
    pub publish_latency: Histogram<f64>,
    pub publish_failures: Counter<u64>,
    pub analytics_failures: Counter<u64>,
    pub processed_total: Counter<u64>,
    /// Histogram of per-message processing time in seconds.
    pub processing_latency: Histogram<f64>,
    pub processing_errors: Counter<u64>,
    pub redeliveries: Counter<u64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            publish_total: meter
                .u64_counter("tributary_publish_total")
                .with_description("Total number of durable publishes")
                .with_unit("1")
                .init(),
            publish_latency: meter
                .f64_histogram("tributary_publish_latency_seconds")
                .with_description("Publish latency from request to fsync")
                .with_unit("s")
                .init(),
            publish_failures: meter
                .u64_counter("tributary_publish_failures_total")
                .with_description("Publishes that failed or timed out")
                .with_unit("1")
                .init(),
            analytics_failures: meter
                .u64_counter("tributary_analytics_failures_total")
                .with_description("Analytical store writes that failed softly")
                .with_unit("1")
                .init(),
            processed_total: meter
                .u64_counter("tributary_processed_total")
                .with_description("Messages written to the blob sink and acked")
                .with_unit("1")
                .init(),
            processing_latency: meter
                .f64_histogram("tributary_processing_latency_seconds")
                .with_description("Time from receipt to resolution of a delivery")
                .with_unit("s")
                .init(),
            processing_errors: meter
                .u64_counter("tributary_processing_errors_total")
                .with_description("Deliveries whose processing failed and were nacked")
                .with_unit("1")
                .init(),
            redeliveries: meter
                .u64_counter("tributary_redeliveries_total")
                .with_description("Deliveries of a message that was delivered before")
                .with_unit("1")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
///
/// # Arguments
///
/// * `otel_endpoint` - Optional OTLP endpoint for metrics export
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Failed to create OTLP exporter, using no-op metrics"
                    );
                    global::set_meter_provider(local_provider());
                }
            }
        } else {
            // Metrics are recorded but not exported
            global::set_meter_provider(local_provider());
        }

        let meter = global::meter("tributary");
        Metrics::new(&meter)
    });
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

fn local_provider() -> SdkMeterProvider {
    let reader = ManualReader::builder().build();
    SdkMeterProvider::builder().with_reader(reader).build()
}

pub fn record_publish(topic: &str, latency_seconds: f64) {
    if let Some(m) = METRICS.get() {
        let attrs = [KeyValue::new("topic", topic.to_string())];
        m.publish_total.add(1, &attrs);
        m.publish_latency.record(latency_seconds, &attrs);
    }
}

pub fn record_publish_failure(topic: &str) {
    if let Some(m) = METRICS.get() {
        m.publish_failures
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }
}

pub fn record_analytics_failure(table: &str) {
    if let Some(m) = METRICS.get() {
        m.analytics_failures
            .add(1, &[KeyValue::new("table", table.to_string())]);
    }
}

/// Record a delivery resolved successfully.
pub fn record_processed(subscription: &str, latency_seconds: f64) {
    if let Some(m) = METRICS.get() {
        let attrs = [KeyValue::new("subscription", subscription.to_string())];
        m.processed_total.add(1, &attrs);
        m.processing_latency.record(latency_seconds, &attrs);
    }
}

/// Record a failed delivery; `reason` is a short failure category.
pub fn record_processing_error(subscription: &str, reason: &'static str) {
    if let Some(m) = METRICS.get() {
        m.processing_errors.add(
            1,
            &[
                KeyValue::new("subscription", subscription.to_string()),
                KeyValue::new("reason", reason),
            ],
        );
    }
}

pub fn record_redelivery(subscription: &str) {
    if let Some(m) = METRICS.get() {
        m.redeliveries
            .add(1, &[KeyValue::new("subscription", subscription.to_string())]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
        assert!(METRICS.get().is_some());
    }

    #[test]
    fn test_recording_does_not_panic() {
        init_metrics();
        record_publish("events", 0.001);
        record_publish_failure("events");
        record_analytics_failure("events");
        record_processed("workers", 0.002);
        record_processing_error("workers", "sink");
        record_redelivery("workers");
    }
}
