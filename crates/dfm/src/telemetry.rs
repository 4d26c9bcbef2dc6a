//! Tracing and telemetry initialization for the service binaries.
//!
//! Every service logs through `tracing`; the subscriber is configured once at
//! startup from the environment: `RUST_LOG` filters, `DFM_LOG_FORMAT` picks
//! plain or JSON output, and `DFM_OTLP_ENDPOINT` turns on OTLP span export.

use crate::config::{EnvConfig, LogFormat};
use crate::error::{DfmError, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Telemetry settings for one service.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_format: LogFormat::default(),
            otlp_endpoint: None,
        }
    }

    /// Pick up format and OTLP endpoint from the shared environment config.
    #[must_use]
    pub fn from_env(service_name: impl Into<String>, env: &EnvConfig) -> Self {
        Self {
            service_name: service_name.into(),
            log_format: env.log_format,
            otlp_endpoint: env.otlp_endpoint.clone(),
        }
    }

    #[must_use]
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    #[must_use]
    pub fn with_otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }
}

/// Initialize the global tracing subscriber.
///
/// Safe to call once per process; a second call reports an error from the
/// subscriber registry rather than panicking.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .map_err(|e| {
                    DfmError::Config(format!("cannot build OTLP exporter for '{endpoint}': {e}"))
                })?;

            let resource = Resource::builder_empty()
                .with_attributes(vec![KeyValue::new(
                    "service.name",
                    config.service_name.clone(),
                )])
                .build();

            let provider = SdkTracerProvider::builder()
                .with_resource(resource)
                .with_batch_exporter(exporter)
                .build();

            global::set_tracer_provider(provider);

            let tracer = global::tracer("dfm");
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let (plain_layer, json_layer) = match config.log_format {
        LogFormat::Plain => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(plain_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| DfmError::Config(format!("cannot initialize tracing: {e}")))?;

    Ok(())
}
