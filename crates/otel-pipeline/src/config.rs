//! Pipeline configuration.
//!
//! Configuration is layered with figment. When loaded through
//! [`Config::load_from_path`] the sources are, in order of priority:
//! 1. Default values (compiled in)
//! 2. TOML config file (optional)
//! 3. Standard OpenTelemetry environment variables (`OTEL_*`)
//! 4. Pipeline-specific environment variables (`OTEL_PIPELINE_*`, `__` separated)
//!
//! # Supported Standard Environment Variables
//!
//! | Variable | Config Path | Description |
//! |----------|-------------|-------------|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | `exporter.endpoint` | Base URL of the collector |
//! | `OTEL_EXPORTER_OTLP_PROTOCOL` | `exporter.protocol` | `http/protobuf` or `http/json` |
//! | `OTEL_EXPORTER_OTLP_HEADERS` | `exporter.headers` | Comma-separated key=value pairs |
//! | `OTEL_EXPORTER_OTLP_COMPRESSION` | `exporter.compression` | `gzip` or `none` |
//! | `OTEL_SERVICE_NAME` | `resource.service_name` | Service identity |

use crate::logs::Severity;
use crate::metrics::{InstrumentKind, Temporality};
use crate::sampler::Sampler;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "OTEL_PIPELINE_";

/// Wire encoding used for OTLP/HTTP export.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Protocol {
    /// Binary protobuf (`application/x-protobuf`).
    #[default]
    #[serde(rename = "http/protobuf")]
    HttpBinary,
    /// OTLP JSON (`application/json`).
    #[serde(rename = "http/json")]
    HttpJson,
}

/// Compression algorithm for OTLP export.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression.
    #[default]
    None,
    /// Gzip compression.
    Gzip,
}

/// Telemetry pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OTLP exporter configuration.
    pub exporter: ExporterConfig,
    /// Span and log batching configuration.
    pub batch: BatchConfig,
    /// Metric collection configuration.
    pub metrics: MetricsConfig,
    /// Log export configuration.
    pub logs: LogsConfig,
    /// Span sampling policy.
    pub sampler: Sampler,
    /// Resource attributes attached to every signal.
    pub resource: ResourceConfig,
    /// Upper bound on the final flush at shutdown, in milliseconds.
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exporter: ExporterConfig::default(),
            batch: BatchConfig::default(),
            metrics: MetricsConfig::default(),
            logs: LogsConfig::default(),
            sampler: Sampler::default(),
            resource: ResourceConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Loads configuration from defaults, an optional TOML file and the
    /// environment.
    ///
    /// A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if any source cannot be parsed.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment
            .merge(Serialized::defaults(standard_env_overrides()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Creates a new config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// OTLP exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Base URL of the collector; `/v1/{signal}` is appended per signal.
    pub endpoint: Option<String>,
    /// Token sent in the `Authorization` header.
    pub api_token: Option<String>,
    /// Scheme placed before the token in the `Authorization` header.
    pub auth_scheme: String,
    /// Wire encoding.
    pub protocol: Protocol,
    /// Request body compression.
    pub compression: Compression,
    /// Request timeout in milliseconds.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Additional headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_token: None,
            auth_scheme: "Api-Token".to_string(),
            protocol: Protocol::HttpBinary,
            compression: Compression::None,
            timeout: Duration::from_secs(10),
            headers: HashMap::new(),
        }
    }
}

/// Batching configuration shared by the span and log processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum records held in memory; newer records are dropped beyond it.
    pub max_queue_size: usize,
    /// Maximum records per export request; reaching it triggers a flush.
    pub max_export_batch_size: usize,
    /// Interval between scheduled flushes in milliseconds.
    #[serde(with = "duration_ms")]
    pub scheduled_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 2048,
            max_export_batch_size: 512,
            scheduled_delay: Duration::from_secs(5),
        }
    }
}

/// Metric collection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Interval between collections in milliseconds.
    #[serde(with = "duration_ms")]
    pub export_interval: Duration,
    /// Per-kind temporality overrides. Kinds not listed use their
    /// preferred temporality.
    #[serde(default)]
    pub temporality_overrides: HashMap<InstrumentKind, Temporality>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            export_interval: Duration::from_secs(60),
            temporality_overrides: HashMap::new(),
        }
    }
}

/// Log export configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogsConfig {
    /// Records below this severity never reach the export pipeline.
    pub min_severity: Severity,
}

/// A local file contributing resource attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSource {
    /// File to read.
    pub path: PathBuf,
    /// When set, the file holds the path of the JSON attribute file rather
    /// than the attributes themselves.
    #[serde(default)]
    pub indirect: bool,
}

impl MetadataSource {
    /// A JSON object file read directly.
    pub fn direct(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            indirect: false,
        }
    }

    /// A file whose contents name the JSON object file.
    pub fn indirect(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            indirect: true,
        }
    }
}

/// Resource attribute configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// `service.name`; always overrides metadata sources.
    pub service_name: String,
    /// `service.version`; always overrides metadata sources.
    pub service_version: String,
    /// Metadata files merged in order, later files overriding earlier ones.
    pub metadata_sources: Vec<MetadataSource>,
    /// Static attributes applied before the metadata sources.
    pub attributes: HashMap<String, String>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            service_name: "otel-demo".to_string(),
            service_version: "1.0.1".to_string(),
            metadata_sources: Vec::new(),
            attributes: HashMap::new(),
        }
    }
}

/// Builder for constructing configuration programmatically.
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new config builder with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Sets the collector base URL.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.exporter.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the API token sent in the `Authorization` header.
    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.config.exporter.api_token = Some(token.into());
        self
    }

    /// Sets the wire encoding.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.exporter.protocol = protocol;
        self
    }

    /// Sets the request compression.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.exporter.compression = compression;
        self
    }

    /// Sets the service identity.
    pub fn service(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.config.resource.service_name = name.into();
        self.config.resource.service_version = version.into();
        self
    }

    /// Appends a metadata source.
    pub fn metadata_source(mut self, source: MetadataSource) -> Self {
        self.config.resource.metadata_sources.push(source);
        self
    }

    /// Sets the minimum exported log severity.
    pub fn min_log_severity(mut self, severity: Severity) -> Self {
        self.config.logs.min_severity = severity;
        self
    }

    /// Sets the sampler.
    pub fn sampler(mut self, sampler: Sampler) -> Self {
        self.config.sampler = sampler;
        self
    }

    /// Sets the span/log batch configuration.
    pub fn batch(mut self, batch: BatchConfig) -> Self {
        self.config.batch = batch;
        self
    }

    /// Sets the metric export interval.
    pub fn metric_export_interval(mut self, interval: Duration) -> Self {
        self.config.metrics.export_interval = interval;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Overrides read from the standard `OTEL_*` environment variables.
///
/// Serializes to a partial [`Config`] containing only the variables that
/// were set, suitable for merging into a figment.
#[derive(Debug, Default, Serialize)]
pub struct StandardEnvOverrides {
    #[serde(skip_serializing_if = "PartialExporterConfig::is_empty")]
    exporter: PartialExporterConfig,
    #[serde(skip_serializing_if = "PartialResourceConfig::is_empty")]
    resource: PartialResourceConfig,
}

#[derive(Debug, Default, Serialize)]
struct PartialExporterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<Protocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compression: Option<Compression>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
}

impl PartialExporterConfig {
    fn is_empty(&self) -> bool {
        self.endpoint.is_none()
            && self.protocol.is_none()
            && self.compression.is_none()
            && self.headers.is_empty()
    }
}

#[derive(Debug, Default, Serialize)]
struct PartialResourceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    service_name: Option<String>,
}

impl PartialResourceConfig {
    fn is_empty(&self) -> bool {
        self.service_name.is_none()
    }
}

/// Reads the standard OpenTelemetry environment variables.
pub fn standard_env_overrides() -> StandardEnvOverrides {
    let mut overrides = StandardEnvOverrides::default();

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        overrides.exporter.endpoint = Some(endpoint);
    }

    if let Ok(protocol) = std::env::var("OTEL_EXPORTER_OTLP_PROTOCOL") {
        overrides.exporter.protocol = match protocol.to_lowercase().as_str() {
            "http/protobuf" | "http" => Some(Protocol::HttpBinary),
            "http/json" => Some(Protocol::HttpJson),
            _ => None,
        };
    }

    if let Ok(compression) = std::env::var("OTEL_EXPORTER_OTLP_COMPRESSION") {
        overrides.exporter.compression = match compression.to_lowercase().as_str() {
            "gzip" => Some(Compression::Gzip),
            "none" => Some(Compression::None),
            _ => None,
        };
    }

    if let Ok(headers_str) = std::env::var("OTEL_EXPORTER_OTLP_HEADERS") {
        for pair in headers_str.split(',') {
            if let Some((key, value)) = pair.split_once('=') {
                overrides
                    .exporter
                    .headers
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }

    if let Ok(name) = std::env::var("OTEL_SERVICE_NAME")
        && !name.is_empty()
    {
        overrides.resource.service_name = Some(name);
    }

    overrides
}

/// Serde helper storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as milliseconds.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserializes milliseconds into a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
