//! # Telemetry Features
//!
//! Console logging is always on. OpenTelemetry export is opt-in through
//! features.
//!
//! ## Feature matrix
//!
//! - `tracing`: Enables OpenTelemetry distributed tracing (via spans).
//! - `metrics`: Enables OpenTelemetry metrics (exchange counts, frames,
//!   errors, in-flight exchanges, exchange duration).
//! - `otlp`: Enables the OTLP/gRPC exporter.
//! - `stdout`: Enables the stdout exporter.
//!
//! Exporters require at least one of `tracing` or `metrics`. Both exporters
//! can be enabled at the same time.
//!
//! ## OTLP settings
//!
//! - `OTLP_ENDPOINT`: collector URL (required).
//! - `OTLP_HEADERS`: comma-separated `key=value` pairs sent as gRPC metadata,
//!   e.g. API keys (optional).
//! - `OTLP_COMPRESSION`: `gzip` or `zstd` (optional, default `gzip`).
//!
//! ## Span behavior
//!
//! - Spans created via `tracing::info_span!` are exported to any enabled
//!   telemetry backend
//! - Events inside a span become span events in telemetry backends
//! - Events outside of a span are only shown in log output (via
//!   `fmt::layer()`), not exported
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --bin partstream-server --features tracing,metrics,otlp
//! cargo run --bin partstream-server --features tracing,stdout
//! ```

// Disallow using `otlp` without `tracing` or `metrics`
#[cfg(all(feature = "otlp", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'tracing' or 'metrics' to be enabled.");

// Disallow using `stdout` without `tracing` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

// Core imports - always needed
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// OTLP-specific imports
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "otlp", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
use tonic::{
    metadata::{MetadataKey, MetadataMap},
    transport::ClientTlsConfig,
};

// Metrics-specific imports
#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use std::time::Duration;

// Either
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

// Tracing-specific imports
#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

/// Exporter providers that must be flushed before the process exits.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Errors are printed, not
    /// returned: this runs while the process is exiting.
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        {
            report("flushing traces", self.tracer_provider.force_flush());
            report("shutting down tracer", self.tracer_provider.shutdown());
        }
        #[cfg(feature = "metrics")]
        {
            report("flushing metrics", self.meter_provider.force_flush());
            report("shutting down meter", self.meter_provider.shutdown());
        }
    }
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn report(what: &str, result: opentelemetry_sdk::error::OTelSdkResult) {
    if let Err(err) = result {
        eprintln!("Error {what}: {err:#?}");
    }
}

/// Installs the global subscriber and, depending on features, the
/// OpenTelemetry tracer and meter providers.
///
/// # Errors
///
/// Fails when an exporter cannot be configured, e.g. `OTLP_ENDPOINT` is
/// missing with `otlp` enabled.
pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("partstream")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Console output is independent of the `opentelemetry_stdout` exporter.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .pretty(),
        );

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;
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
    let meter_provider = init_metrics()?;
    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let _ = METRICS.set(Metrics::new(&opentelemetry::global::meter_with_scope(scope)));
        registry.with(tracing_opentelemetry::MetricsLayer::new(meter_provider.clone()))
    };

    registry.init();

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
        .with_service_name("partstream")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

/// Collector settings read from `OTLP_*` variables.
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
struct OtlpSettings {
    endpoint: String,
    compression: Compression,
    metadata: MetadataMap,
}

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "tracing")))]
impl OtlpSettings {
    const TIMEOUT: Duration = Duration::from_secs(10);

    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let endpoint = std::env::var("OTLP_ENDPOINT").context("missing `OTLP_ENDPOINT`")?;
        let compression = std::env::var("OTLP_COMPRESSION")
            .unwrap_or_else(|_| "gzip".to_string())
            .to_ascii_lowercase();

        let mut metadata = MetadataMap::new();
        let headers = std::env::var("OTLP_HEADERS").unwrap_or_default();
        for pair in headers.split(',').filter(|pair| !pair.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("invalid `OTLP_HEADERS` entry `{pair}`"))?;
            let key = MetadataKey::from_bytes(key.trim().to_ascii_lowercase().as_bytes())
                .with_context(|| format!("invalid header name `{key}`"))?;
            metadata.insert(key, value.trim().parse().context("invalid header value")?);
        }

        Ok(Self {
            endpoint,
            compression: Compression::from_str(&compression)?,
            metadata,
        })
    }
}

#[cfg(feature = "tracing")]
fn batched<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batched(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let settings = OtlpSettings::from_env()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_compression(settings.compression)
            .with_timeout(OtlpSettings::TIMEOUT)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build span exporter")?;
        builder.with_span_processor(batched(exporter))
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(Duration::from_secs(5))
            .build(),
    );

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let settings = OtlpSettings::from_env()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_compression(settings.compression)
            .with_timeout(OtlpSettings::TIMEOUT)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metric exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

/// Instruments of the partition host.
#[cfg(feature = "metrics")]
struct Metrics {
    exchanges: Counter<u64>,
    exchanges_inflight: UpDownCounter<i64>,
    stream_errors: Counter<u64>,
    exchange_duration_ms: Histogram<f64>,
    frames_echoed: Counter<u64>,
    payload_bytes: Histogram<f64>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Metrics> = OnceLock::new();

#[cfg(feature = "metrics")]
impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            exchanges: meter
                .u64_counter("exchanges")
                .with_description("Accepted partition exchanges")
                .build(),
            exchanges_inflight: meter
                .i64_up_down_counter("exchanges_inflight")
                .with_description("Concurrent partition exchanges")
                .build(),
            stream_errors: meter
                .u64_counter("errors")
                .with_description("Rejected, errored or cancelled exchanges")
                .build(),
            exchange_duration_ms: meter
                .f64_histogram("exchange_duration")
                .with_unit("ms")
                .with_description("End-to-end exchange duration")
                .build(),
            frames_echoed: meter
                .u64_counter("frames_echoed")
                .with_description("Frames sent back to clients")
                .build(),
            payload_bytes: meter
                .f64_histogram("payload_bytes")
                .with_unit("By")
                .with_description("Compressed computation payload size per handshake")
                .build(),
        }
    }
}

// The helpers below compile to no-ops without `metrics`, and do nothing
// before `init_telemetry` ran (tests, benches).

pub fn increment_exchanges() {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = METRICS.get() {
            metrics.exchanges.add(1, &[]);
        }
    }
}

pub fn increment_exchanges_inflight() {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = METRICS.get() {
            metrics.exchanges_inflight.add(1, &[]);
        }
    }
}

pub fn decrement_exchanges_inflight() {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = METRICS.get() {
            metrics.exchanges_inflight.add(-1, &[]);
        }
    }
}

pub fn increment_stream_errors() {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = METRICS.get() {
            metrics.stream_errors.add(1, &[]);
        }
    }
}

pub fn increment_frames_echoed() {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = METRICS.get() {
            metrics.frames_echoed.add(1, &[]);
        }
    }
}

pub fn record_exchange_duration(duration_ms: f64) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = METRICS.get() {
            metrics.exchange_duration_ms.record(duration_ms, &[]);
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = duration_ms;
}

pub fn record_payload_bytes(bytes: f64) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = METRICS.get() {
            metrics.payload_bytes.record(bytes, &[]);
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = bytes;
}
