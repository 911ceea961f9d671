use crate::config::bridge::{
    AasEndpointOptions, AmqpEndpointOptions, BridgeConfig, EndpointConfig, EndpointKind,
    EndpointTimeouts, HttpClientEndpointOptions, HttpServerEndpointOptions, KafkaEndpointOptions,
    MqttEndpointOptions, OpcUaEndpointOptions, OptionMap, RetryBudget,
};
use humantime::parse_duration;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub trait EndpointHandle {
    fn name(&self) -> &str;
    fn timeouts(&self) -> &EndpointTimeouts;
    fn retry_budget(&self) -> Option<&RetryBudget>;
    fn extra(&self) -> &OptionMap;
}

/// Typed view over the bridge document's endpoint entities. Built once at
/// startup; live clients are materialised lazily by the factory.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    mqtt: HashMap<String, MqttEndpoint>,
    kafka: HashMap<String, KafkaEndpoint>,
    amqp: HashMap<String, AmqpEndpoint>,
    http_clients: HashMap<String, HttpClientEndpoint>,
    http_servers: HashMap<String, HttpServerEndpoint>,
    aas: HashMap<String, AasEndpoint>,
    opc_ua: HashMap<String, OpcUaEndpoint>,
    unknown: HashMap<String, EndpointConfig>,
}

impl EndpointRegistry {
    pub fn build(config: &BridgeConfig) -> Result<Self, EndpointRegistryError> {
        let mut registry = EndpointRegistry::default();

        for endpoint in &config.endpoints {
            match endpoint.kind {
                EndpointKind::Mqtt => {
                    let options = decode_options::<MqttEndpointOptions>(endpoint)?;
                    let keep_alive = parse_optional_duration(endpoint, options.keep_alive)?;
                    let handle = MqttEndpoint {
                        name: endpoint.name.clone(),
                        url: options.url,
                        client_id: options.client_id,
                        username: options.username,
                        password: options.password,
                        keep_alive,
                        clean_session: options.clean_session.unwrap_or(true),
                        timeouts: endpoint.timeouts,
                        retry_budget: endpoint.retry_budget.clone(),
                        extra: options.extra,
                    };
                    registry.mqtt.insert(endpoint.name.clone(), handle);
                }
                EndpointKind::Kafka => {
                    let options = decode_options::<KafkaEndpointOptions>(endpoint)?;
                    let handle = KafkaEndpoint {
                        name: endpoint.name.clone(),
                        brokers: options.brokers,
                        client_id: options.client_id,
                        create_topics_if_missing: options.create_topics_if_missing,
                        timeouts: endpoint.timeouts,
                        retry_budget: endpoint.retry_budget.clone(),
                        extra: options.extra,
                    };
                    registry.kafka.insert(endpoint.name.clone(), handle);
                }
                EndpointKind::Amqp => {
                    let options = decode_options::<AmqpEndpointOptions>(endpoint)?;
                    let handle = AmqpEndpoint {
                        name: endpoint.name.clone(),
                        url: options.url,
                        vhost: options.vhost,
                        timeouts: endpoint.timeouts,
                        retry_budget: endpoint.retry_budget.clone(),
                        extra: options.extra,
                    };
                    registry.amqp.insert(endpoint.name.clone(), handle);
                }
                EndpointKind::HttpClient => {
                    let options = decode_options::<HttpClientEndpointOptions>(endpoint)?;
                    let handle = HttpClientEndpoint {
                        name: endpoint.name.clone(),
                        base_url: options.base_url,
                        default_headers: flatten_headers(options.headers),
                        pool_max_idle: options.pool_max_idle,
                        timeouts: endpoint.timeouts,
                        retry_budget: endpoint.retry_budget.clone(),
                        extra: options.extra,
                    };
                    registry.http_clients.insert(endpoint.name.clone(), handle);
                }
                EndpointKind::HttpServer => {
                    let options = decode_options::<HttpServerEndpointOptions>(endpoint)?;
                    let response_timeout =
                        parse_optional_duration(endpoint, options.response_timeout)?;
                    let handle = HttpServerEndpoint {
                        name: endpoint.name.clone(),
                        bind: options.bind,
                        max_body_bytes: options.max_body_bytes,
                        response_timeout,
                        timeouts: endpoint.timeouts,
                        retry_budget: endpoint.retry_budget.clone(),
                        extra: options.extra,
                    };
                    registry.http_servers.insert(endpoint.name.clone(), handle);
                }
                EndpointKind::Aas => {
                    let options = decode_options::<AasEndpointOptions>(endpoint)?;
                    let handle = AasEndpoint {
                        name: endpoint.name.clone(),
                        base_url: options.base_url,
                        api_key: options.api_key,
                        timeouts: endpoint.timeouts,
                        retry_budget: endpoint.retry_budget.clone(),
                        extra: options.extra,
                    };
                    registry.aas.insert(endpoint.name.clone(), handle);
                }
                EndpointKind::OpcUa => {
                    let options = decode_options::<OpcUaEndpointOptions>(endpoint)?;
                    let handle = OpcUaEndpoint {
                        name: endpoint.name.clone(),
                        url: options.url,
                        security_policy: options.security_policy,
                        timeouts: endpoint.timeouts,
                        retry_budget: endpoint.retry_budget.clone(),
                        extra: options.extra,
                    };
                    registry.opc_ua.insert(endpoint.name.clone(), handle);
                }
                EndpointKind::Unknown(_) => {
                    registry
                        .unknown
                        .insert(endpoint.name.clone(), endpoint.clone());
                }
            }
        }

        Ok(registry)
    }

    pub fn mqtt(&self, name: &str) -> Option<&MqttEndpoint> {
        self.mqtt.get(name)
    }

    pub fn kafka(&self, name: &str) -> Option<&KafkaEndpoint> {
        self.kafka.get(name)
    }

    pub fn amqp(&self, name: &str) -> Option<&AmqpEndpoint> {
        self.amqp.get(name)
    }

    pub fn http_client(&self, name: &str) -> Option<&HttpClientEndpoint> {
        self.http_clients.get(name)
    }

    pub fn http_server(&self, name: &str) -> Option<&HttpServerEndpoint> {
        self.http_servers.get(name)
    }

    pub fn aas(&self, name: &str) -> Option<&AasEndpoint> {
        self.aas.get(name)
    }

    pub fn opc_ua(&self, name: &str) -> Option<&OpcUaEndpoint> {
        self.opc_ua.get(name)
    }

    pub fn has_mqtt_endpoints(&self) -> bool {
        !self.mqtt.is_empty()
    }

    pub fn has_kafka_endpoints(&self) -> bool {
        !self.kafka.is_empty()
    }

    pub fn has_amqp_endpoints(&self) -> bool {
        !self.amqp.is_empty()
    }

    pub fn has_http_server_endpoints(&self) -> bool {
        !self.http_servers.is_empty()
    }

    pub fn http_servers(&self) -> impl Iterator<Item = &HttpServerEndpoint> {
        self.http_servers.values()
    }

    pub fn unknown(&self) -> impl Iterator<Item = (&String, &EndpointConfig)> {
        self.unknown.iter()
    }

    pub fn for_each_handle<F>(&self, mut visitor: F)
    where
        F: FnMut(&dyn EndpointHandle),
    {
        for handle in self.mqtt.values() {
            visitor(handle);
        }
        for handle in self.kafka.values() {
            visitor(handle);
        }
        for handle in self.amqp.values() {
            visitor(handle);
        }
        for handle in self.http_clients.values() {
            visitor(handle);
        }
        for handle in self.http_servers.values() {
            visitor(handle);
        }
        for handle in self.aas.values() {
            visitor(handle);
        }
        for handle in self.opc_ua.values() {
            visitor(handle);
        }
    }
}

macro_rules! impl_endpoint_handle {
    ($handle:ident) => {
        impl EndpointHandle for $handle {
            fn name(&self) -> &str {
                &self.name
            }

            fn timeouts(&self) -> &EndpointTimeouts {
                &self.timeouts
            }

            fn retry_budget(&self) -> Option<&RetryBudget> {
                self.retry_budget.as_ref()
            }

            fn extra(&self) -> &OptionMap {
                &self.extra
            }
        }
    };
}

#[derive(Debug, Clone)]
pub struct MqttEndpoint {
    pub name: String,
    pub url: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Option<Duration>,
    pub clean_session: bool,
    pub timeouts: EndpointTimeouts,
    pub retry_budget: Option<RetryBudget>,
    pub extra: OptionMap,
}

impl_endpoint_handle!(MqttEndpoint);

#[derive(Debug, Clone)]
pub struct KafkaEndpoint {
    pub name: String,
    pub brokers: Vec<String>,
    pub client_id: Option<String>,
    pub create_topics_if_missing: bool,
    pub timeouts: EndpointTimeouts,
    pub retry_budget: Option<RetryBudget>,
    pub extra: OptionMap,
}

impl_endpoint_handle!(KafkaEndpoint);

#[derive(Debug, Clone)]
pub struct AmqpEndpoint {
    pub name: String,
    pub url: String,
    pub vhost: Option<String>,
    pub timeouts: EndpointTimeouts,
    pub retry_budget: Option<RetryBudget>,
    pub extra: OptionMap,
}

impl_endpoint_handle!(AmqpEndpoint);

#[derive(Debug, Clone)]
pub struct HttpClientEndpoint {
    pub name: String,
    pub base_url: String,
    pub default_headers: Vec<(String, String)>,
    pub pool_max_idle: Option<usize>,
    pub timeouts: EndpointTimeouts,
    pub retry_budget: Option<RetryBudget>,
    pub extra: OptionMap,
}

impl_endpoint_handle!(HttpClientEndpoint);

#[derive(Debug, Clone)]
pub struct HttpServerEndpoint {
    pub name: String,
    pub bind: String,
    pub max_body_bytes: Option<usize>,
    pub response_timeout: Option<Duration>,
    pub timeouts: EndpointTimeouts,
    pub retry_budget: Option<RetryBudget>,
    pub extra: OptionMap,
}

impl_endpoint_handle!(HttpServerEndpoint);

#[derive(Debug, Clone)]
pub struct AasEndpoint {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeouts: EndpointTimeouts,
    pub retry_budget: Option<RetryBudget>,
    pub extra: OptionMap,
}

impl_endpoint_handle!(AasEndpoint);

#[derive(Debug, Clone)]
pub struct OpcUaEndpoint {
    pub name: String,
    pub url: String,
    pub security_policy: Option<String>,
    pub timeouts: EndpointTimeouts,
    pub retry_budget: Option<RetryBudget>,
    pub extra: OptionMap,
}

impl_endpoint_handle!(OpcUaEndpoint);

fn decode_options<T>(endpoint: &EndpointConfig) -> Result<T, EndpointRegistryError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(JsonValue::Object(endpoint.options.clone())).map_err(|source| {
        EndpointRegistryError::InvalidEndpointOptions {
            name: endpoint.name.clone(),
            source,
        }
    })
}

fn parse_optional_duration(
    endpoint: &EndpointConfig,
    raw: Option<String>,
) -> Result<Option<Duration>, EndpointRegistryError> {
    match raw {
        None => Ok(None),
        Some(value) => parse_duration(value.trim())
            .map(Some)
            .map_err(|source| EndpointRegistryError::InvalidDuration {
                name: endpoint.name.clone(),
                value,
                source,
            }),
    }
}

fn flatten_headers(headers: Option<OptionMap>) -> Vec<(String, String)> {
    headers
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, value)| {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return None;
            }
            value
                .as_str()
                .map(|value| (trimmed.to_string(), value.to_string()))
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum EndpointRegistryError {
    #[error("failed to decode options for endpoint `{name}`: {source}")]
    InvalidEndpointOptions {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("endpoint `{name}` has invalid duration `{value}`: {source}")]
    InvalidDuration {
        name: String,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}
