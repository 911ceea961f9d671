mod app;
mod endpoints;
mod routes;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

pub use app::{
    known_feature_flags, AppConfig, AppLimits, DispatchLimits, HttpLimits, JitterMode,
    OverflowPolicy, RetryBudget, RouteLimits,
};
pub use endpoints::{
    AasEndpointOptions, AmqpEndpointOptions, EndpointConfig, EndpointKind, EndpointTimeouts,
    HttpClientEndpointOptions, HttpServerEndpointOptions, KafkaEndpointOptions,
    MqttEndpointOptions, OpcUaEndpointOptions, OptionMap,
};
pub use routes::{
    DeliveryPolicy, RouteDefinition, RoutePolicy, SinkBinding, SourceBinding, SourceKind,
    TransformerDefinition, TransformerKind,
};

/// Fully parsed and validated bridge document: the endpoint, transformer, and
/// route entities the rest of the system is built from.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub api_version: ApiVersion,
    pub app: AppConfig,
    pub endpoints: Vec<EndpointConfig>,
    pub transformers: Vec<TransformerDefinition>,
    pub routes: Vec<RouteDefinition>,
}

/// Path tried when no explicit bridge document is configured.
pub const DEFAULT_BRIDGE_CONFIG_PATH: &str = "config/databridge.json";

const TOP_LEVEL_FIELDS: &str = "api_version, app, endpoints, transformers, routes";

impl BridgeConfig {
    pub fn from_reader(mut reader: impl Read) -> Result<Self, BridgeConfigError> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;
        Self::from_json_str(&contents)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BridgeConfigError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_default_path() -> Result<Self, BridgeConfigError> {
        Self::from_path(DEFAULT_BRIDGE_CONFIG_PATH)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, BridgeConfigError> {
        let raw: RawBridgeFile = serde_json::from_str(contents)?;
        Self::from_raw(raw).map_err(BridgeConfigError::Invalid)
    }

    fn from_raw(raw: RawBridgeFile) -> Result<Self, BridgeValidationError> {
        let RawBridgeFile {
            api_version: raw_api_version,
            app: raw_app,
            endpoints: raw_endpoints,
            transformers: raw_transformers,
            routes: raw_routes,
            extra_fields,
        } = raw;

        let mut errors = Vec::new();

        for key in extra_fields.keys() {
            errors.push(format!(
                "error[root]: unknown top-level key \"{key}\" (expected one of {TOP_LEVEL_FIELDS})"
            ));
        }

        let api_version = parse_api_version(raw_api_version, &mut errors);
        let app = app::parse_app_config(raw_app, &mut errors);
        let endpoints = endpoints::parse_endpoints(raw_endpoints, &mut errors);
        let transformers = routes::parse_transformers(raw_transformers, &mut errors);
        let routes = routes::parse_routes(raw_routes, &mut errors);

        routes::validate_references(&endpoints, &transformers, &routes, &mut errors);
        routes::validate_source_requirements(&endpoints, &routes, &mut errors);
        routes::validate_ingress_mounts(&endpoints, &routes, &mut errors);
        routes::validate_sink_requirements(&endpoints, &routes, &mut errors);
        routes::validate_policy_requirements(&routes, &app, &mut errors);
        endpoints::validate_endpoint_urls(&endpoints, &mut errors);
        validate_feature_gates(&app, &endpoints, &mut errors);

        if errors.is_empty() {
            Ok(Self {
                api_version,
                app,
                endpoints,
                transformers,
                routes,
            })
        } else {
            let schema_version = schema_version_label(&api_version);
            Err(BridgeValidationError::new(errors, schema_version))
        }
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }

    pub fn transformer(&self, name: &str) -> Option<&TransformerDefinition> {
        self.transformers
            .iter()
            .find(|transformer| transformer.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ApiVersion {
    #[default]
    V1,
    Unsupported(String),
}

fn parse_api_version(raw: Option<String>, errors: &mut Vec<String>) -> ApiVersion {
    match raw {
        None => {
            errors
                .push("error[root]: api_version is required (supported versions: v1)".to_string());
            ApiVersion::V1
        }
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                errors.push("api_version must be a non-empty string".to_string());
                ApiVersion::V1
            } else if trimmed.eq_ignore_ascii_case("v1") {
                ApiVersion::V1
            } else {
                errors.push(format!(
                    "api_version `{trimmed}` is not supported (supported versions: v1)"
                ));
                ApiVersion::Unsupported(trimmed.to_string())
            }
        }
    }
}

fn schema_version_label(version: &ApiVersion) -> String {
    match version {
        ApiVersion::V1 => "v1".to_string(),
        ApiVersion::Unsupported(other) => other.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct RawBridgeFile {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    app: Option<app::RawAppSection>,
    #[serde(default)]
    endpoints: Vec<endpoints::RawEndpoint>,
    #[serde(default)]
    transformers: Vec<routes::RawTransformer>,
    #[serde(default)]
    routes: Vec<routes::RawRoute>,
    #[serde(default)]
    #[serde(flatten)]
    extra_fields: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Error)]
pub enum BridgeConfigError {
    #[error("failed to read bridge config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse bridge config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(BridgeValidationError),
}

#[derive(Debug, Error)]
#[error("bridge config validation failed:\nschema_version: \"{schema_version}\"\n{rendered}")]
pub struct BridgeValidationError {
    schema_version: String,
    rendered: String,
}

impl BridgeValidationError {
    pub fn new(messages: Vec<String>, schema_version: impl Into<String>) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            schema_version: schema_version.into(),
            rendered,
        }
    }
}

fn validate_feature_gates(
    app: &AppConfig,
    endpoints: &[EndpointConfig],
    errors: &mut Vec<String>,
) {
    let has_flag = |flag: &str| app.feature_flags.iter().any(|enabled| enabled == flag);

    for endpoint in endpoints {
        let required_flag = match endpoint.kind {
            EndpointKind::Mqtt => Some("mqtt"),
            EndpointKind::Kafka => Some("kafka"),
            EndpointKind::Amqp => Some("amqp"),
            EndpointKind::OpcUa => Some("opc-ua"),
            _ => None,
        };

        if let Some(flag) = required_flag {
            if !has_flag(flag) {
                errors.push(format!(
                    "endpoint `{}` of kind `{}` requires feature flag `{}` in app.feature_flags",
                    endpoint.name,
                    endpoint.kind.as_str(),
                    flag
                ));
            }
        }
    }
}
