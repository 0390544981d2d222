//! Service configuration.
//!
//! Loaded with figment from, in order of priority:
//! 1. Default values (compiled in)
//! 2. Config file: `otel-demo.toml` in the working directory (optional)
//! 3. Standard OpenTelemetry environment variables (`OTEL_*`), applied to
//!    the `telemetry` section
//! 4. Service-specific environment variables (`OTEL_DEMO_*`, `__` separated),
//!    e.g. `OTEL_DEMO_TELEMETRY__EXPORTER__API_TOKEN`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use otel_pipeline::config::duration_ms;
use otel_pipeline::{Config as TelemetryConfig, MetadataSource, standard_env_overrides};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "otel-demo.toml";
const ENV_PREFIX: &str = "OTEL_DEMO_";

/// Host metadata written by the OneAgent. The first file names the JSON
/// file; the second is the JSON file itself.
const ONEAGENT_METADATA_POINTER: &str = "dt_metadata_e617c525669e072eebe3d0f08212e8f2.json";
const ENRICHMENT_METADATA_FILE: &str = "/var/lib/dynatrace/enrichment/dt_metadata.json";

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Listener configuration.
    pub server: ServerConfig,
    /// Simulated work per endpoint.
    pub latency: LatencyConfig,
    /// Telemetry pipeline configuration.
    pub telemetry: TelemetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut telemetry = TelemetryConfig::default();
        telemetry.resource.metadata_sources = vec![
            MetadataSource::indirect(ONEAGENT_METADATA_POINTER),
            MetadataSource::direct(ENRICHMENT_METADATA_FILE),
        ];

        Self {
            server: ServerConfig::default(),
            latency: LatencyConfig::default(),
            telemetry,
        }
    }
}

impl AppConfig {
    /// Loads configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if any source cannot be parsed.
    #[allow(clippy::result_large_err)]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration from a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if any source cannot be parsed.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment
            .merge(Serialized::default("telemetry", standard_env_overrides()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: IpAddr,
    /// Port to bind.
    pub port: u16,
}

impl ServerConfig {
    /// Returns the socket address to bind.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5000,
        }
    }
}

/// Simulated latency, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Work done by `GET /`.
    #[serde(with = "duration_ms")]
    pub index: Duration,
    /// Work done by `GET /parent` before the nested call.
    #[serde(with = "duration_ms")]
    pub parent: Duration,
    /// Work done inside the nested call.
    #[serde(with = "duration_ms")]
    pub child: Duration,
}

impl LatencyConfig {
    /// No simulated latency.
    pub const ZERO: LatencyConfig = LatencyConfig {
        index: Duration::ZERO,
        parent: Duration::ZERO,
        child: Duration::ZERO,
    };
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            index: Duration::from_millis(150),
            parent: Duration::from_millis(500),
            child: Duration::from_millis(1000),
        }
    }
}
