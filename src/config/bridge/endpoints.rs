use super::app::{parse_duration_optional, parse_retry_budget, RawRetryBudget, RetryBudget};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeSet;
use std::time::Duration;
use url::Url;

pub type OptionMap = JsonMap<String, JsonValue>;

/// One protocol endpoint entity: a unique name, a kind, and the
/// protocol-specific option bag the registry decodes into a typed handle.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub kind: EndpointKind,
    pub timeouts: EndpointTimeouts,
    pub retry_budget: Option<RetryBudget>,
    pub options: OptionMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    Mqtt,
    Kafka,
    Amqp,
    HttpClient,
    HttpServer,
    Aas,
    OpcUa,
    Unknown(String),
}

impl EndpointKind {
    pub fn as_str(&self) -> &str {
        match self {
            EndpointKind::Mqtt => "mqtt",
            EndpointKind::Kafka => "kafka",
            EndpointKind::Amqp => "amqp",
            EndpointKind::HttpClient => "http-client",
            EndpointKind::HttpServer => "http-server",
            EndpointKind::Aas => "aas",
            EndpointKind::OpcUa => "opc-ua",
            EndpointKind::Unknown(other) => other.as_str(),
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mqtt" => EndpointKind::Mqtt,
            "kafka" => EndpointKind::Kafka,
            "amqp" | "activemq" => EndpointKind::Amqp,
            "http-client" | "http" => EndpointKind::HttpClient,
            "http-server" => EndpointKind::HttpServer,
            "aas" => EndpointKind::Aas,
            "opc-ua" | "opcua" => EndpointKind::OpcUa,
            other => EndpointKind::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointTimeouts {
    pub connect: Option<Duration>,
    pub request: Option<Duration>,
}

/// Typed option payloads. Decoded from [`EndpointConfig::options`] by the
/// registry; `extra` keeps pass-through keys for retry tuning and the like.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttEndpointOptions {
    pub url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub keep_alive: Option<String>,
    #[serde(default)]
    pub clean_session: Option<bool>,
    #[serde(default)]
    #[serde(flatten)]
    pub extra: OptionMap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaEndpointOptions {
    pub brokers: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub create_topics_if_missing: bool,
    #[serde(default)]
    #[serde(flatten)]
    pub extra: OptionMap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AmqpEndpointOptions {
    pub url: String,
    #[serde(default)]
    pub vhost: Option<String>,
    #[serde(default)]
    #[serde(flatten)]
    pub extra: OptionMap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpClientEndpointOptions {
    pub base_url: String,
    #[serde(default)]
    pub headers: Option<JsonMap<String, JsonValue>>,
    #[serde(default)]
    pub pool_max_idle: Option<usize>,
    #[serde(default)]
    #[serde(flatten)]
    pub extra: OptionMap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerEndpointOptions {
    pub bind: String,
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
    #[serde(default)]
    pub response_timeout: Option<String>,
    #[serde(default)]
    #[serde(flatten)]
    pub extra: OptionMap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AasEndpointOptions {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    #[serde(flatten)]
    pub extra: OptionMap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpcUaEndpointOptions {
    pub url: String,
    #[serde(default)]
    pub security_policy: Option<String>,
    #[serde(default)]
    #[serde(flatten)]
    pub extra: OptionMap,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawEndpoint {
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) kind: Option<String>,
    #[serde(default)]
    pub(crate) connect_timeout: Option<String>,
    #[serde(default)]
    pub(crate) request_timeout: Option<String>,
    #[serde(default)]
    pub(crate) retry_budget: Option<RawRetryBudget>,
    #[serde(default)]
    pub(crate) options: OptionMap,
}

pub(crate) fn parse_endpoints(
    raw: Vec<RawEndpoint>,
    errors: &mut Vec<String>,
) -> Vec<EndpointConfig> {
    let mut seen = BTreeSet::new();
    let mut endpoints = Vec::with_capacity(raw.len());

    for (index, entry) in raw.into_iter().enumerate() {
        let name = match entry.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => {
                errors.push(format!("endpoint at index {index} is missing a name"));
                continue;
            }
        };

        if !seen.insert(name.clone()) {
            errors.push(format!("endpoint `{name}` is defined more than once"));
            continue;
        }

        let kind = match entry.kind {
            Some(kind) if !kind.trim().is_empty() => EndpointKind::parse(&kind),
            _ => {
                errors.push(format!("endpoint `{name}` is missing a kind"));
                continue;
            }
        };

        if let EndpointKind::Unknown(other) = &kind {
            errors.push(format!(
                "endpoint `{name}` has unknown kind `{other}` (expected one of mqtt, kafka, amqp, http-client, http-server, aas, opc-ua)"
            ));
        }

        let timeouts = EndpointTimeouts {
            connect: parse_duration_optional(
                &format!("endpoint `{name}` connect_timeout"),
                entry.connect_timeout,
                errors,
            ),
            request: parse_duration_optional(
                &format!("endpoint `{name}` request_timeout"),
                entry.request_timeout,
                errors,
            ),
        };

        let retry_budget = entry.retry_budget.and_then(|budget| {
            parse_retry_budget(&format!("endpoint `{name}` retry_budget"), budget, errors)
        });

        endpoints.push(EndpointConfig {
            name,
            kind,
            timeouts,
            retry_budget,
            options: entry.options,
        });
    }

    endpoints
}

pub(crate) fn validate_endpoint_urls(endpoints: &[EndpointConfig], errors: &mut Vec<String>) {
    for endpoint in endpoints {
        let (field, expected_schemes): (&str, &[&str]) = match endpoint.kind {
            EndpointKind::Mqtt => ("url", &["mqtt", "mqtts", "tcp", "ssl"]),
            EndpointKind::Amqp => ("url", &["amqp", "amqps"]),
            EndpointKind::HttpClient | EndpointKind::Aas => ("base_url", &["http", "https"]),
            EndpointKind::OpcUa => ("url", &["opc.tcp"]),
            _ => continue,
        };

        let Some(value) = endpoint.options.get(field).and_then(JsonValue::as_str) else {
            errors.push(format!(
                "endpoint `{}` of kind `{}` requires option `{field}`",
                endpoint.name,
                endpoint.kind.as_str()
            ));
            continue;
        };

        match Url::parse(value) {
            Ok(url) => {
                if !expected_schemes.contains(&url.scheme()) {
                    errors.push(format!(
                        "endpoint `{}` option `{field}` has scheme `{}` (expected one of {})",
                        endpoint.name,
                        url.scheme(),
                        expected_schemes.join(", ")
                    ));
                }
            }
            Err(err) => {
                errors.push(format!(
                    "endpoint `{}` option `{field}` is not a valid URL (`{value}`): {err}",
                    endpoint.name
                ));
            }
        }
    }

    for endpoint in endpoints {
        if endpoint.kind != EndpointKind::Kafka {
            continue;
        }
        let brokers = endpoint.options.get("brokers").and_then(JsonValue::as_array);
        match brokers {
            Some(list) if !list.is_empty() => {}
            _ => errors.push(format!(
                "endpoint `{}` of kind `kafka` requires a non-empty `brokers` list",
                endpoint.name
            )),
        }
    }
}
