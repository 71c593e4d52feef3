use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{metrics::Histogram, KeyValue};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

use crate::config::TelemetryConfig;

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0,
    ]
}

/// Installs the global meter provider. Without `enable_metrics` the global
/// no-op provider stays in place and instruments record nothing.
pub fn init_provider(
    telemetry: &TelemetryConfig,
    instance_id: &str,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !telemetry.enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "homo"))
        .with_attribute(KeyValue::new("service.name", "homo-function"))
        .with_attribute(KeyValue::new("homo.instance.id", instance_id.to_string()))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &telemetry.endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(telemetry.metrics_interval_secs))
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between creation and drop into `metric`.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    #[must_use]
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub mod function_calls {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::metrics::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub calls: Counter<u64>,
        pub errors: Counter<u64>,
        pub cache_hits: Counter<u64>,
        pub payload_bytes: Counter<u64>,
        pub call_duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("function-runtime");
            let calls = meter
                .u64_counter("homo.function.calls")
                .with_description("number of Call invocations received")
                .build();
            let errors = meter
                .u64_counter("homo.function.errors")
                .with_description("number of Call invocations answered with an error status")
                .build();
            let cache_hits = meter
                .u64_counter("homo.function.cache_hits")
                .with_description("retried invocations answered from the invocation cache")
                .build();
            let payload_bytes = meter
                .u64_counter("homo.function.payload_bytes")
                .with_description("request payload bytes received")
                .build();
            let call_duration = meter
                .f64_histogram("homo.function.call_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("handler latencies in seconds")
                .build();
            Metrics {
                calls,
                errors,
                cache_hits,
                payload_bytes,
                call_duration,
            }
        }
    }
}
