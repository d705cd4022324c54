//! OTLP metrics export.
//!
//! When `--otlp-endpoint` is given, a periodic OTLP/HTTP exporter becomes the
//! global meter provider, so every `ChainStateMetrics` created afterwards
//! reports to it.

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

/// Handle to the installed meter provider.
pub struct MetricsExporter {
    provider: SdkMeterProvider,
}

/// Install an OTLP exporter pushing to `endpoint`
/// (e.g. `http://localhost:4318/v1/metrics`).
pub fn init_metrics(endpoint: &str) -> Result<MetricsExporter> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .with_context(|| format!("failed to build OTLP metrics exporter for '{endpoint}'"))?;
    let reader = PeriodicReader::builder(exporter).build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider.clone());
    tracing::debug!(endpoint, "OTLP metrics exporter installed");
    Ok(MetricsExporter { provider })
}

impl MetricsExporter {
    /// Flush pending data points and stop the exporter.
    pub fn shutdown(self) {
        if let Err(e) = self.provider.shutdown() {
            tracing::warn!(error = %e, "metrics exporter shutdown failed");
        }
    }
}
