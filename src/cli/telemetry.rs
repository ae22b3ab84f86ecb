//! Log output and optional OTLP trace export.
//!
//! Logs always go to stderr. Spans are additionally exported over gRPC when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set; every span then carries the node
//! name so traces from several registry nodes can be told apart.

use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
};
use std::time::Duration;
use tonic::{
    metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};
use ulid::Ulid;

const DEFAULT_ENDPOINT: &str = "http://localhost:4317";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Dependencies that are noisy below these levels.
const QUIET_TARGETS: [(&str, &str); 7] = [
    ("hyper", "error"),
    ("h2", "error"),
    ("tokio", "error"),
    ("tonic", "warn"),
    ("sqlx", "warn"),
    ("redis", "warn"),
    ("opentelemetry_sdk", "warn"),
];

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

/// Where and how spans are shipped, read from the standard `OTEL_*`
/// variables.
#[derive(Debug, PartialEq, Eq)]
struct Exporter {
    endpoint: String,
    tls_domain: Option<String>,
    headers: Vec<(String, String)>,
    instance_id: Option<String>,
}

impl Exporter {
    /// `None` when no endpoint is configured.
    fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT")?;
        if let Some(protocol) = lookup("OTEL_EXPORTER_OTLP_PROTOCOL")
            && protocol != "grpc"
        {
            debug!(protocol = %protocol, "only grpc OTLP export is supported, ignoring protocol");
        }

        let endpoint = if endpoint.trim().is_empty() {
            DEFAULT_ENDPOINT.to_string()
        } else if endpoint.contains("://") {
            endpoint
        } else {
            format!("https://{}", endpoint.trim_end_matches('/'))
        };
        let tls_domain = endpoint
            .strip_prefix("https://")
            .and_then(|rest| rest.split(['/', ':']).next())
            .filter(|host| !host.is_empty())
            .map(str::to_string);

        let headers = lookup("OTEL_EXPORTER_OTLP_HEADERS")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
                    .filter(|(key, _)| !key.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            endpoint,
            tls_domain,
            headers,
            instance_id: lookup("OTEL_SERVICE_INSTANCE_ID"),
        })
    }

    fn metadata(&self) -> Result<MetadataMap> {
        let mut metadata = MetadataMap::with_capacity(self.headers.len());
        for (key, value) in &self.headers {
            let name = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
                .map_err(|err| anyhow!("invalid OTLP header name {key}: {err}"))?;
            let value = value
                .parse::<MetadataValue<Ascii>>()
                .map_err(|err| anyhow!("invalid OTLP header value for {key}: {err}"))?;
            metadata.insert(name, value);
        }
        Ok(metadata)
    }

    fn tracer(&self, resource: Resource) -> Result<Tracer> {
        let mut builder = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&self.endpoint)
            .with_compression(Compression::Gzip)
            .with_timeout(EXPORT_TIMEOUT);
        if let Some(domain) = &self.tls_domain {
            builder = builder.with_tls_config(
                ClientTlsConfig::new()
                    .domain_name(domain.clone())
                    .with_native_roots(),
            );
        }
        if !self.headers.is_empty() {
            builder = builder.with_metadata(self.metadata()?);
        }
        let exporter = builder.build().context("failed to build OTLP exporter")?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build();
        let _ = TRACER_PROVIDER.set(provider.clone());
        global::set_tracer_provider(provider.clone());
        global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]));
        Ok(provider.tracer(env!("CARGO_PKG_NAME")))
    }
}

/// Resource attributes for this registry node. The instance id is the node
/// name when one is configured so spans line up with ticket id suffixes.
fn resource(node: Option<&str>, instance_id: Option<&str>) -> Resource {
    let instance = node
        .or(instance_id)
        .map_or_else(|| Ulid::new().to_string(), str::to_string);
    Resource::builder_empty()
        .with_attributes([
            KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("service.namespace", "cas"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.instance.id", instance),
        ])
        .build()
}

fn filter(verbosity_level: Level) -> Result<EnvFilter> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(verbosity_level.into())
        .from_env_lossy();
    for (target, level) in QUIET_TARGETS {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber. `node` is the configured registry node
/// name, if any.
///
/// # Errors
///
/// Returns an error if the exporter or the subscriber cannot be set up.
pub fn init(verbosity_level: Option<Level>, node: Option<&str>) -> Result<()> {
    let filter = filter(verbosity_level.unwrap_or(Level::ERROR))?;
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    match Exporter::from_lookup(|name| std::env::var(name).ok()) {
        Some(exporter) => {
            let tracer = exporter.tracer(resource(node, exporter.instance_id.as_deref()))?;
            let subscriber = Registry::default()
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .with(filter);
            tracing::subscriber::set_global_default(subscriber)?;
            debug!(endpoint = %exporter.endpoint, "OTLP trace export enabled");
        }
        None => {
            tracing::subscriber::set_global_default(Registry::default().with(fmt_layer).with(filter))?;
        }
    }
    Ok(())
}

/// Flush pending spans. Does nothing when export was never enabled.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get()
        && let Err(err) = provider.shutdown()
    {
        debug!("tracer provider shutdown failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn exporter(vars: &[(&str, &str)]) -> Option<Exporter> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Exporter::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn export_is_off_without_endpoint() {
        assert_eq!(exporter(&[("OTEL_EXPORTER_OTLP_HEADERS", "a=b")]), None);
    }

    #[test]
    fn bare_host_endpoint_gets_tls() {
        let Some(exporter) = exporter(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "otel.example.com:4317/")]) else {
            panic!("exporter not configured");
        };
        assert_eq!(exporter.endpoint, "https://otel.example.com:4317");
        assert_eq!(exporter.tls_domain.as_deref(), Some("otel.example.com"));

        let Some(plain) = super::Exporter::from_lookup(|name| {
            (name == "OTEL_EXPORTER_OTLP_ENDPOINT").then(|| "http://localhost:4317".to_string())
        }) else {
            panic!("exporter not configured");
        };
        assert_eq!(plain.tls_domain, None);
    }

    #[test]
    fn headers_are_trimmed_and_malformed_pairs_dropped() -> Result<()> {
        let Some(exporter) = exporter(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4317"),
            ("OTEL_EXPORTER_OTLP_HEADERS", " Authorization = Bearer t0ken ,broken,=x,tenant=cas"),
        ]) else {
            panic!("exporter not configured");
        };
        assert_eq!(
            exporter.headers,
            vec![
                ("authorization".to_string(), "Bearer t0ken".to_string()),
                ("tenant".to_string(), "cas".to_string()),
            ]
        );
        assert_eq!(exporter.metadata()?.len(), 2);
        Ok(())
    }

    #[test]
    fn non_ascii_header_value_is_rejected() {
        let Some(exporter) = exporter(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4317"),
            ("OTEL_EXPORTER_OTLP_HEADERS", "tenant=caf\u{e9}"),
        ]) else {
            panic!("exporter not configured");
        };
        assert!(exporter.metadata().is_err_and(|err| err.to_string().contains("tenant")));
    }

    #[test]
    fn node_name_becomes_instance_id() {
        let attribute = |resource: &Resource, key: &str| {
            resource
                .iter()
                .find(|(k, _)| k.as_str() == key)
                .map(|(_, v)| v.to_string())
        };

        let named = resource(Some("node1"), Some("from-env"));
        assert_eq!(attribute(&named, "service.instance.id").as_deref(), Some("node1"));
        assert_eq!(attribute(&named, "service.name").as_deref(), Some("tessera"));
        assert_eq!(attribute(&named, "service.namespace").as_deref(), Some("cas"));

        let from_env = resource(None, Some("from-env"));
        assert_eq!(attribute(&from_env, "service.instance.id").as_deref(), Some("from-env"));

        let generated = resource(None, None);
        assert!(attribute(&generated, "service.instance.id").is_some_and(|id| id.len() == 26));
    }

    #[test]
    fn quiet_targets_parse_as_directives() {
        assert!(filter(Level::DEBUG).is_ok());
    }
}
