//! Log subscriber and the optional OTLP/gRPC span exporter.

use anyhow::{Context, Result, anyhow};
use base64::{Engine, engine::general_purpose};
use once_cell::sync::OnceCell;
use opentelemetry::{
    KeyValue, global, propagation::TextMapCompositePropagator, trace::TracerProvider as _,
};
use opentelemetry_otlp::{WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
};
use std::{env::var, time::Duration};
use tonic::metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};
use ulid::Ulid;

const DEFAULT_ENDPOINT: &str = "http://localhost:4317";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

/// Exporter settings read from the standard `OTEL_*` variables.
#[derive(Debug, Default, PartialEq, Eq)]
struct OtlpSettings {
    endpoint: String,
    headers: Vec<(String, String)>,
    instance_id: String,
}

impl OtlpSettings {
    /// `None` unless `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
    fn from_env() -> Option<Self> {
        let endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
        Some(Self::new(
            &endpoint,
            var("OTEL_EXPORTER_OTLP_HEADERS").ok().as_deref(),
            var("OTEL_SERVICE_INSTANCE_ID").ok(),
        ))
    }

    fn new(endpoint: &str, headers: Option<&str>, instance_id: Option<String>) -> Self {
        let endpoint = endpoint.trim();
        let endpoint = if endpoint.is_empty() {
            DEFAULT_ENDPOINT.to_string()
        } else if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            // no scheme means plaintext gRPC; TLS needs an explicit https://
            format!("http://{}", endpoint.trim_end_matches('/'))
        };
        Self {
            endpoint,
            headers: headers.map(parse_header_pairs).unwrap_or_default(),
            instance_id: instance_id.unwrap_or_else(|| Ulid::new().to_string()),
        }
    }

    fn metadata(&self) -> Result<MetadataMap> {
        let mut meta = MetadataMap::with_capacity(self.headers.len());
        for (key, value) in &self.headers {
            let key = key.to_ascii_lowercase();
            // "-bin" keys are binary metadata with base64 values
            if key.ends_with("-bin") {
                let bytes = general_purpose::STANDARD
                    .decode(value.as_bytes())
                    .map_err(|err| anyhow!("failed to base64-decode value for key {key}: {err}"))?;
                let name = MetadataKey::<Binary>::from_bytes(key.as_bytes())
                    .map_err(|err| anyhow!("invalid binary metadata key {key}: {err}"))?;
                meta.insert_bin(name, MetadataValue::from_bytes(&bytes));
            } else {
                let name = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
                    .map_err(|err| anyhow!("invalid metadata key {key}: {err}"))?;
                let value: MetadataValue<Ascii> = value
                    .parse()
                    .map_err(|err| anyhow!("invalid metadata value for key {key}: {err}"))?;
                meta.insert(name, value);
            }
        }
        Ok(meta)
    }

    fn resource(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new("service.instance.id", self.instance_id.clone()),
            ])
            .build()
    }
}

/// `k1=v1,k2=v2` as in `OTEL_EXPORTER_OTLP_HEADERS`; pairs without `=` or
/// with an empty key are skipped.
fn parse_header_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn init_tracer(settings: &OtlpSettings) -> Result<Tracer> {
    if let Ok(protocol) = var("OTEL_EXPORTER_OTLP_PROTOCOL") {
        if protocol != "grpc" {
            debug!("OTEL_EXPORTER_OTLP_PROTOCOL={protocol} ignored, only grpc is supported");
        }
    }

    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(settings.endpoint.clone())
        .with_timeout(EXPORT_TIMEOUT);
    if !settings.headers.is_empty() {
        builder = builder.with_metadata(settings.metadata()?);
    }
    let exporter = builder.build().context("failed to build OTLP exporter")?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(settings.resource())
        .build();

    let _ = TRACER_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    Ok(provider.tracer(env!("CARGO_PKG_NAME")))
}

/// Install the global subscriber. `RUST_LOG` overrides `verbosity_level`;
/// spans are also exported when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// # Errors
///
/// Returns an error if the exporter or the subscriber cannot be installed.
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_target(false)
        .pretty();

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_level.unwrap_or(Level::ERROR).into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("tokio=error".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?);

    let registry = Registry::default().with(fmt_layer).with(filter);
    match OtlpSettings::from_env() {
        Some(settings) => {
            let tracer = init_tracer(&settings)?;
            let subscriber = registry.with(tracing_opentelemetry::layer().with_tracer(tracer));
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => tracing::subscriber::set_global_default(registry)?,
    }

    Ok(())
}

/// Flush pending spans; a no-op when the exporter was never installed.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("Shutting down tracer provider");
        if let Err(err) = provider.shutdown() {
            debug!("Tracer provider shutdown failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pairs_skip_malformed_entries() {
        assert!(parse_header_pairs("").is_empty());
        assert_eq!(
            parse_header_pairs("key1 = value1 ,malformed, =orphan,key2=a=b"),
            vec![
                ("key1".to_string(), "value1".to_string()),
                ("key2".to_string(), "a=b".to_string()),
            ]
        );
    }

    #[test]
    fn endpoint_defaults_to_plaintext() {
        let settings = OtlpSettings::new("collector:4317/", None, Some("i1".to_string()));
        assert_eq!(settings.endpoint, "http://collector:4317");
        assert_eq!(settings.instance_id, "i1");

        let settings = OtlpSettings::new("https://otel.example.com:4317", None, None);
        assert_eq!(settings.endpoint, "https://otel.example.com:4317");
        assert!(!settings.instance_id.is_empty());

        assert_eq!(OtlpSettings::new(" ", None, None).endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn metadata_ascii_and_binary() -> Result<()> {
        // base64 of "binary data"
        let settings = OtlpSettings::new(
            DEFAULT_ENDPOINT,
            Some("Authorization=Bearer token123,custom-bin=YmluYXJ5IGRhdGE="),
            None,
        );
        let meta = settings.metadata()?;
        assert_eq!(meta.len(), 2);
        assert_eq!(
            meta.get("authorization").and_then(|value| value.to_str().ok()),
            Some("Bearer token123")
        );
        Ok(())
    }

    #[test]
    fn metadata_rejects_invalid_base64() {
        let settings = OtlpSettings::new(DEFAULT_ENDPOINT, Some("custom-bin=not-valid!!!"), None);
        let err = settings.metadata().err().map(|err| err.to_string());
        assert!(err.is_some_and(|err| err.contains("failed to base64-decode")));
    }

    #[test]
    fn shutdown_without_provider() {
        shutdown_tracer();
    }
}
