//! # Telemetry Features
//!
//! Console logging is always on. OpenTelemetry export is optional.
//!
//! ## Feature matrix
//!
//! - `tracing`: OpenTelemetry spans for jobs, publishes and deliveries.
//! - `metrics`: OpenTelemetry counters and histograms (see below).
//! - `stdout`: Exports whatever of the above is enabled to stdout.
//!
//! ## Metrics
//!
//! - `jobs_submitted`, `job_errors`, `jobs_inflight`, `jobs_finished{outcome}`
//! - `job_duration` (ms), `chunks_per_job`, `chunks_published`
//! - `results_recorded`, `processing_failures`, `redeliveries`,
//!   `dropped_messages`
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features tracing,metrics,stdout
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`). `LOG_FORMAT=json` swaps
//! the pretty console output for one JSON object per event.

// Disallow using `stdout` without `tracing` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use crate::server::config::LogFormat;
use tracing_subscriber::{
    EnvFilter, fmt::time::ChronoLocal, layer::SubscriberExt, util::SubscriberInitExt,
};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops the exporters.
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_telemetry(log_format: LogFormat) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer();

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("chunkcast")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Console output is independent of any exporter; exactly one of the two
    // layers is present.
    let (pretty, json) = match log_format {
        LogFormat::Pretty => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_target(false)
                    .with_timer(ChronoLocal::rfc_3339())
                    .with_file(true)
                    .pretty(),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(ChronoLocal::rfc_3339())
                    .with_current_span(true)
                    .flatten_event(true),
            ),
        ),
    };

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(pretty)
        .with(json);

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("chunkcast")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "tracing")]
fn init_tracer() -> sdktrace::SdkTracerProvider {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    builder.build()
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static JOBS_SUBMITTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOB_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOBS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOBS_FINISHED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOB_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CHUNKS_PER_JOB: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CHUNKS_PUBLISHED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RESULTS_RECORDED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static PROCESSING_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REDELIVERIES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static DROPPED_MESSAGES: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = JOBS_SUBMITTED.set(
        meter
            .u64_counter("jobs_submitted")
            .with_description("Jobs accepted for processing")
            .build(),
    );

    let _ = JOB_ERRORS.set(
        meter
            .u64_counter("job_errors")
            .with_description("Jobs rejected or failed at submission")
            .build(),
    );

    let _ = JOBS_INFLIGHT.set(
        meter
            .i64_up_down_counter("jobs_inflight")
            .with_description("Jobs waiting for results")
            .build(),
    );

    let _ = JOBS_FINISHED.set(
        meter
            .u64_counter("jobs_finished")
            .with_description("Jobs that reached a terminal state, by outcome")
            .build(),
    );

    let _ = JOB_DURATION_MS.set(
        meter
            .f64_histogram("job_duration")
            .with_unit("ms")
            .with_description("Submission to terminal state")
            .build(),
    );

    let _ = CHUNKS_PER_JOB.set(
        meter
            .f64_histogram("chunks_per_job")
            .with_description("Chunks produced per job")
            .build(),
    );

    let _ = CHUNKS_PUBLISHED.set(
        meter
            .u64_counter("chunks_published")
            .with_description("Chunks accepted by the broker")
            .build(),
    );

    let _ = RESULTS_RECORDED.set(
        meter
            .u64_counter("results_recorded")
            .with_description("Per-chunk results handed to the aggregator")
            .build(),
    );

    let _ = PROCESSING_FAILURES.set(
        meter
            .u64_counter("processing_failures")
            .with_description("Per-chunk results recorded as failures")
            .build(),
    );

    let _ = REDELIVERIES.set(
        meter
            .u64_counter("redeliveries")
            .with_description("Deliveries nacked for redelivery")
            .build(),
    );

    let _ = DROPPED_MESSAGES.set(
        meter
            .u64_counter("dropped_messages")
            .with_description("Messages acknowledged without a routable slot")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_jobs_submitted() {
    if let Some(counter) = JOBS_SUBMITTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_jobs_submitted() {}

#[cfg(feature = "metrics")]
pub fn increment_job_errors() {
    if let Some(counter) = JOB_ERRORS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_job_errors() {}

#[cfg(feature = "metrics")]
pub fn increment_jobs_inflight() {
    if let Some(counter) = JOBS_INFLIGHT.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_jobs_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_jobs_inflight() {
    if let Some(counter) = JOBS_INFLIGHT.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_jobs_inflight() {}

#[cfg(feature = "metrics")]
pub fn increment_jobs_finished(outcome: &'static str) {
    if let Some(counter) = JOBS_FINISHED.get() {
        counter.add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_jobs_finished(_outcome: &'static str) {}

#[cfg(feature = "metrics")]
pub fn record_job_duration(duration_ms: f64) {
    if let Some(histogram) = JOB_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_job_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn record_chunks_per_job(count: f64) {
    if let Some(histogram) = CHUNKS_PER_JOB.get() {
        histogram.record(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_chunks_per_job(_count: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_chunks_published(count: u64) {
    if let Some(counter) = CHUNKS_PUBLISHED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_chunks_published(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_results_recorded() {
    if let Some(counter) = RESULTS_RECORDED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_results_recorded() {}

#[cfg(feature = "metrics")]
pub fn increment_processing_failures() {
    if let Some(counter) = PROCESSING_FAILURES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_processing_failures() {}

#[cfg(feature = "metrics")]
pub fn increment_redeliveries() {
    if let Some(counter) = REDELIVERIES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_redeliveries() {}

#[cfg(feature = "metrics")]
pub fn increment_dropped_messages() {
    if let Some(counter) = DROPPED_MESSAGES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_dropped_messages() {}
