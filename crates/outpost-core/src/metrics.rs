//! `OpenTelemetry` metrics for the broker.
//!
//! This module is only compiled when the `metrics` Cargo feature is enabled.
//! It sets up the OTLP exporter for traces and metrics and exposes the
//! broker's counters through [`broker_meters`].

use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

/// Errors that can occur during metrics / tracing pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Keeps the `OpenTelemetry` providers alive.
///
/// Call [`MetricsGuard::shutdown`] for a graceful flush before exiting.
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    /// Gracefully shut down both providers, flushing any buffered telemetry.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Counters recorded by the broker's state transitions.
pub struct BrokerMeters {
    pub commands_delivered: Counter<u64>,
    pub updates_claimed: Counter<u64>,
    pub tunnels_opened: Counter<u64>,
    pub proxy_jobs_timed_out: Counter<u64>,
}

/// Lazily created broker counters bound to the global meter provider.
pub fn broker_meters() -> &'static BrokerMeters {
    static METERS: OnceLock<BrokerMeters> = OnceLock::new();
    METERS.get_or_init(|| {
        let meter = global::meter("outpost-broker");
        BrokerMeters {
            commands_delivered: meter
                .u64_counter("outpost.commands.delivered")
                .with_description("Commands handed to polling nodes")
                .build(),
            updates_claimed: meter
                .u64_counter("outpost.updates.claimed")
                .with_description("Agent updates moved to downloading")
                .build(),
            tunnels_opened: meter
                .u64_counter("outpost.tunnels.opened")
                .with_description("Tunnel sessions allocated")
                .build(),
            proxy_jobs_timed_out: meter
                .u64_counter("outpost.proxy_jobs.timed_out")
                .with_description("Proxy jobs forced to timeout by the reaper")
                .build(),
        }
    })
}

/// Initialise the `OpenTelemetry` OTLP pipeline for traces and metrics.
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}
