//! Console logging plus optional OTLP trace export.
//!
//! Logs go to stdout through `tracing-subscriber`, filtered by `RUST_LOG`
//! (default `info`). Spans are exported over OTLP only when
//! `VINTAGE_OTEL_SAMPLING_RATE` is set to a rate above zero; the collector
//! endpoint comes from `OTEL_EXPORTER_OTLP_ENDPOINT` (exporter default when unset).

use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type Registry = tracing_subscriber::registry::Registry;

const SAMPLING_RATE_VAR: &str = "VINTAGE_OTEL_SAMPLING_RATE";
const ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Flushes pending spans when dropped. Hold it for the life of the process.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var(SAMPLING_RATE_VAR).ok().as_deref());

    let (otel_layer, otel_error) = match build_otel_layer(service_name, sampling_rate) {
        Ok(layer) => (layer, None),
        Err(error) => (None, Some(error)),
    };
    let tracer_installed = otel_layer.is_some();

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }
    if let Some(error) = otel_error {
        warn!(%error, "failed to initialize OTEL exporter; continuing with console logs only");
    }
    info!(service = service_name, sampling_rate, tracer_installed, "telemetry configured");

    Ok(TelemetryGuard { tracer_installed })
}

fn build_otel_layer(
    service_name: &str,
    sampling_rate: f64,
) -> Result<Option<OpenTelemetryLayer<Registry, trace::Tracer>>> {
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut exporter = opentelemetry_otlp::new_exporter().tonic();
    if let Some(endpoint) = env::var(ENDPOINT_VAR).ok().filter(|value| !value.trim().is_empty()) {
        exporter = exporter.with_endpoint(endpoint.trim());
    }
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

/// Unset means export is off. Out-of-range values are clamped, garbage
/// disables export; both cases come with a warning to log.
pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (0.0, None);
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (
            0.0,
            Some(format!("{SAMPLING_RATE_VAR} is empty; trace export disabled")),
        );
    }

    match trimmed.parse::<f64>() {
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Ok(parsed) if parsed.is_finite() => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "{SAMPLING_RATE_VAR}={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        _ => (
            0.0,
            Some(format!(
                "{SAMPLING_RATE_VAR}='{trimmed}' is not a valid rate; trace export disabled"
            )),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_sampling_rate;

    #[test]
    fn unset_rate_disables_export() {
        assert_eq!(parse_sampling_rate(None), (0.0, None));
    }

    #[test]
    fn parse_valid_sampling_rate() {
        assert_eq!(parse_sampling_rate(Some("0.25")), (0.25, None));
        assert_eq!(parse_sampling_rate(Some(" 1 ")), (1.0, None));
    }

    #[test]
    fn parse_out_of_bounds_sampling_rate() {
        let (rate, warning) = parse_sampling_rate(Some("1.5"));
        assert_eq!(rate, 1.0);
        assert!(warning
            .unwrap()
            .contains("VINTAGE_OTEL_SAMPLING_RATE=1.5 outside 0.0..=1.0"));

        let (rate, _) = parse_sampling_rate(Some("-0.3"));
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn parse_invalid_sampling_rate() {
        for raw in ["abc", "NaN", "inf"] {
            let (rate, warning) = parse_sampling_rate(Some(raw));
            assert_eq!(rate, 0.0, "{raw}");
            assert!(warning.unwrap().contains("is not a valid rate"), "{raw}");
        }
    }

    #[test]
    fn parse_empty_sampling_rate() {
        let (rate, warning) = parse_sampling_rate(Some("   "));
        assert_eq!(rate, 0.0);
        assert!(warning
            .unwrap()
            .contains("VINTAGE_OTEL_SAMPLING_RATE is empty"));
    }
}
