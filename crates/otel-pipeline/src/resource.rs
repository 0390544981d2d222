//! Process-wide resource attributes.
//!
//! The resource is assembled once at startup from the SDK's
//! [`ResourceBuilder`](opentelemetry_sdk::resource::ResourceBuilder), with
//! every metadata file plugged in as a [`ResourceDetector`]. Detection never
//! fails: a missing or malformed file contributes no attributes.
//!
//! Merge order, later entries winning on key collision:
//! 1. static `resource.attributes` from configuration
//! 2. `telemetry.sdk.*`
//! 3. each metadata source, in configured order
//! 4. `service.name` and `service.version`

use crate::config::{MetadataSource, ResourceConfig};
use opentelemetry::{Key, KeyValue, Value};
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue as ProtoKeyValue, any_value};
use opentelemetry_proto::tonic::resource::v1::Resource as ProtoResource;
use opentelemetry_sdk::resource::{Resource, ResourceDetector};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use opentelemetry_semantic_conventions::resource as semconv_res;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name reported as `telemetry.sdk.name`.
pub const SDK_NAME: &str = "otel-pipeline";

/// Immutable resource shared by every exported span, metric and log record.
///
/// Cloning is cheap; all clones share the same attributes.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    resource: Resource,
    proto: ProtoResource,
}

impl ResourceDescriptor {
    /// Builds the resource from configuration.
    pub fn from_config(config: &ResourceConfig) -> Self {
        let static_attributes = config
            .attributes
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()));

        let mut builder = Resource::builder_empty()
            .with_attributes(static_attributes)
            .with_detector(Box::new(SdkDetector));

        for source in &config.metadata_sources {
            builder = builder.with_detector(Box::new(MetadataFileDetector::new(source.clone())));
        }

        let resource = builder
            .with_detector(Box::new(ServiceDetector {
                name: config.service_name.clone(),
                version: config.service_version.clone(),
            }))
            .build();

        Self::from_resource(resource)
    }

    /// Wraps an already-built SDK resource.
    pub fn from_resource(resource: Resource) -> Self {
        let proto = to_proto_resource(&resource);
        Self {
            inner: Arc::new(Inner { resource, proto }),
        }
    }

    /// Returns the underlying SDK resource.
    pub fn resource(&self) -> &Resource {
        &self.inner.resource
    }

    /// Returns the resource in its OTLP form.
    pub fn proto(&self) -> &ProtoResource {
        &self.inner.proto
    }

    /// Looks up an attribute.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.resource.get(&Key::from(key.to_owned()))
    }

    /// Looks up a string attribute.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.to_string()),
            _ => None,
        }
    }

    /// Returns the number of attributes.
    pub fn len(&self) -> usize {
        self.inner.resource.len()
    }

    /// Returns whether the resource has no attributes.
    pub fn is_empty(&self) -> bool {
        self.inner.resource.is_empty()
    }
}

impl Default for ResourceDescriptor {
    fn default() -> Self {
        Self::from_config(&ResourceConfig::default())
    }
}

/// Adds the `telemetry.sdk.*` attributes.
#[derive(Debug, Default)]
struct SdkDetector;

impl ResourceDetector for SdkDetector {
    fn detect(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes([
                KeyValue::new(semconv_res::TELEMETRY_SDK_NAME, SDK_NAME),
                KeyValue::new(semconv_res::TELEMETRY_SDK_LANGUAGE, "rust"),
                KeyValue::new(semconv_res::TELEMETRY_SDK_VERSION, env!("CARGO_PKG_VERSION")),
            ])
            .build()
    }
}

#[derive(Debug)]
struct ServiceDetector {
    name: String,
    version: String,
}

impl ResourceDetector for ServiceDetector {
    fn detect(&self) -> Resource {
        Resource::builder_empty()
            .with_schema_url(
                [
                    KeyValue::new(semconv_res::SERVICE_NAME, self.name.clone()),
                    KeyValue::new(semconv_res::SERVICE_VERSION, self.version.clone()),
                ],
                Cow::Borrowed(SCHEMA_URL),
            )
            .build()
    }
}

/// Reads resource attributes from a local JSON metadata file.
///
/// A direct source is a JSON object whose scalar members become attributes.
/// An indirect source is a file whose trimmed contents are the path of that
/// JSON object. Strings, integers, floats and booleans are kept; nested
/// objects, arrays and nulls are skipped.
#[derive(Debug, Clone)]
pub struct MetadataFileDetector {
    source: MetadataSource,
}

impl MetadataFileDetector {
    /// Creates a detector for `source`.
    pub fn new(source: MetadataSource) -> Self {
        Self { source }
    }

    fn target_path(&self) -> Option<PathBuf> {
        if !self.source.indirect {
            return Some(self.source.path.clone());
        }
        let contents = std::fs::read_to_string(&self.source.path).ok()?;
        let target = contents.trim();
        if target.is_empty() {
            return None;
        }
        Some(PathBuf::from(target))
    }

    fn read_attributes(path: &Path) -> Option<Vec<KeyValue>> {
        let contents = std::fs::read_to_string(path).ok()?;
        let json: serde_json::Value = serde_json::from_str(&contents).ok()?;
        let object = json.as_object()?;

        Some(
            object
                .iter()
                .filter_map(|(key, value)| json_to_value(value).map(|v| KeyValue::new(key.clone(), v)))
                .collect(),
        )
    }
}

impl ResourceDetector for MetadataFileDetector {
    fn detect(&self) -> Resource {
        let attributes = self
            .target_path()
            .and_then(|path| Self::read_attributes(&path));

        match attributes {
            Some(attributes) => Resource::builder_empty().with_attributes(attributes).build(),
            None => {
                tracing::debug!(
                    target: "otel_pipeline",
                    path = %self.source.path.display(),
                    indirect = self.source.indirect,
                    "Metadata source unavailable, skipping"
                );
                Resource::builder_empty().build()
            }
        }
    }
}

fn json_to_value(value: &serde_json::Value) -> Option<Value> {
    match value {
        serde_json::Value::String(s) => Some(Value::from(s.clone())),
        serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::I64)
            .or_else(|| n.as_f64().map(Value::F64)),
        _ => None,
    }
}

/// Converts an SDK resource to its OTLP form.
pub fn to_proto_resource(resource: &Resource) -> ProtoResource {
    let mut attributes: Vec<ProtoKeyValue> = resource
        .iter()
        .map(|(key, value)| ProtoKeyValue {
            key: key.to_string(),
            value: Some(value_to_any(value)),
        })
        .collect();
    attributes.sort_by(|a, b| a.key.cmp(&b.key));

    ProtoResource {
        attributes,
        ..Default::default()
    }
}

fn value_to_any(value: &Value) -> AnyValue {
    let value = match value {
        Value::Bool(b) => any_value::Value::BoolValue(*b),
        Value::I64(i) => any_value::Value::IntValue(*i),
        Value::F64(f) => any_value::Value::DoubleValue(*f),
        Value::String(s) => any_value::Value::StringValue(s.to_string()),
        other => any_value::Value::StringValue(other.to_string()),
    };
    AnyValue { value: Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn json_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn config_with_sources(sources: Vec<MetadataSource>) -> ResourceConfig {
        ResourceConfig {
            metadata_sources: sources,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_resource_has_identity_and_sdk_attributes() {
        let resource = ResourceDescriptor::default();

        assert_eq!(
            resource.get_str(semconv_res::SERVICE_NAME).as_deref(),
            Some("otel-demo")
        );
        assert_eq!(
            resource.get_str(semconv_res::SERVICE_VERSION).as_deref(),
            Some("1.0.1")
        );
        assert_eq!(
            resource.get_str(semconv_res::TELEMETRY_SDK_LANGUAGE).as_deref(),
            Some("rust")
        );
        assert_eq!(
            resource.get_str(semconv_res::TELEMETRY_SDK_NAME).as_deref(),
            Some(SDK_NAME)
        );
    }

    #[test]
    fn test_direct_source_maps_scalar_values() {
        let file = json_file(
            r#"{
                "dt.entity.host": "HOST-1234",
                "dt.host.cpu_cores": 8,
                "dt.host.load": 0.75,
                "dt.host.monitored": true,
                "nested": {"a": 1},
                "list": [1, 2],
                "missing": null
            }"#,
        );
        let resource = ResourceDescriptor::from_config(&config_with_sources(vec![
            MetadataSource::direct(file.path()),
        ]));

        assert_eq!(
            resource.get_str("dt.entity.host").as_deref(),
            Some("HOST-1234")
        );
        assert_eq!(resource.get("dt.host.cpu_cores"), Some(Value::I64(8)));
        assert_eq!(resource.get("dt.host.load"), Some(Value::F64(0.75)));
        assert_eq!(resource.get("dt.host.monitored"), Some(Value::Bool(true)));
        assert!(resource.get("nested").is_none());
        assert!(resource.get("list").is_none());
        assert!(resource.get("missing").is_none());
    }

    #[test]
    fn test_indirect_source_follows_path() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("metadata.json");
        std::fs::write(&target, r#"{"dt.entity.process_group_instance": "PGI-1"}"#).unwrap();
        let magic = dir.path().join("magic.json");
        std::fs::write(&magic, format!("{}\n", target.display())).unwrap();

        let resource = ResourceDescriptor::from_config(&config_with_sources(vec![
            MetadataSource::indirect(&magic),
        ]));

        assert_eq!(
            resource
                .get_str("dt.entity.process_group_instance")
                .as_deref(),
            Some("PGI-1")
        );
    }

    #[test]
    fn test_missing_and_malformed_sources_are_ignored() {
        let malformed = json_file("{not json");
        let not_object = json_file("[1, 2, 3]");
        let valid = json_file(r#"{"host.name": "web-1"}"#);

        let resource = ResourceDescriptor::from_config(&config_with_sources(vec![
            MetadataSource::direct("/nonexistent/dt_metadata.json"),
            MetadataSource::indirect("/nonexistent/magic.json"),
            MetadataSource::direct(malformed.path()),
            MetadataSource::direct(not_object.path()),
            MetadataSource::direct(valid.path()),
        ]));

        assert_eq!(resource.get_str("host.name").as_deref(), Some("web-1"));
        assert_eq!(
            resource.get_str(semconv_res::SERVICE_NAME).as_deref(),
            Some("otel-demo")
        );
    }

    #[test]
    fn test_later_sources_override_earlier() {
        let first = json_file(r#"{"host.name": "first", "only.first": "a"}"#);
        let second = json_file(r#"{"host.name": "second"}"#);

        let resource = ResourceDescriptor::from_config(&config_with_sources(vec![
            MetadataSource::direct(first.path()),
            MetadataSource::direct(second.path()),
        ]));

        assert_eq!(resource.get_str("host.name").as_deref(), Some("second"));
        assert_eq!(resource.get_str("only.first").as_deref(), Some("a"));
    }

    #[test]
    fn test_identity_attributes_always_win() {
        let hostile = json_file(
            r#"{"service.name": "impostor", "service.version": "0.0.0", "telemetry.sdk.language": "python"}"#,
        );
        let mut attributes = HashMap::new();
        attributes.insert("service.name".to_string(), "static".to_string());
        attributes.insert("deployment.environment".to_string(), "test".to_string());

        let config = ResourceConfig {
            service_name: "checkout".to_string(),
            service_version: "3.1.4".to_string(),
            metadata_sources: vec![MetadataSource::direct(hostile.path())],
            attributes,
        };
        let resource = ResourceDescriptor::from_config(&config);

        assert_eq!(
            resource.get_str(semconv_res::SERVICE_NAME).as_deref(),
            Some("checkout")
        );
        assert_eq!(
            resource.get_str(semconv_res::SERVICE_VERSION).as_deref(),
            Some("3.1.4")
        );
        assert_eq!(
            resource.get_str(semconv_res::TELEMETRY_SDK_LANGUAGE).as_deref(),
            Some("python"),
            "metadata sources may override sdk attributes"
        );
        assert_eq!(
            resource.get_str("deployment.environment").as_deref(),
            Some("test")
        );
    }

    #[test]
    fn test_proto_resource_is_sorted_and_typed() {
        let file = json_file(r#"{"b.count": 2, "a.flag": false}"#);
        let resource = ResourceDescriptor::from_config(&config_with_sources(vec![
            MetadataSource::direct(file.path()),
        ]));
        let proto = resource.proto();

        let keys: Vec<&str> = proto.attributes.iter().map(|kv| kv.key.as_str()).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);

        let count = proto
            .attributes
            .iter()
            .find(|kv| kv.key == "b.count")
            .and_then(|kv| kv.value.as_ref())
            .and_then(|v| v.value.as_ref());
        assert_eq!(count, Some(&any_value::Value::IntValue(2)));
    }
}
