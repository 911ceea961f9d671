//! Executes resolved sink actions against live endpoints.
//!
//! The engine drives retries and delivery policy; a dispatcher performs
//! exactly one attempt per call. [`ActionDispatcher`] is the seam the tests
//! mock out.

use crate::endpoint::{EndpointFactory, EndpointFactoryError};
use crate::metrics::metrics;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct SinkAction {
    pub endpoint: String,
    pub operation: SinkOperation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkOperation {
    MqttPublish {
        topic: String,
        qos: u8,
        retain: bool,
    },
    KafkaPublish {
        topic: String,
        key: Option<String>,
    },
    AmqpPublish {
        exchange: String,
        routing_key: String,
    },
    HttpRequest {
        method: String,
        path: String,
    },
    AasWrite {
        submodel_id: String,
        element_path: String,
    },
}

impl SinkOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            SinkOperation::MqttPublish { .. } => "mqtt",
            SinkOperation::KafkaPublish { .. } => "kafka",
            SinkOperation::AmqpPublish { .. } => "amqp",
            SinkOperation::HttpRequest { .. } => "http",
            SinkOperation::AasWrite { .. } => "aas",
        }
    }
}

/// String payloads travel as their raw bytes; everything else is serialized
/// as JSON.
pub fn payload_to_bytes(payload: &JsonValue) -> Vec<u8> {
    match payload {
        JsonValue::String(text) => text.clone().into_bytes(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}

#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, action: &SinkAction, payload: &JsonValue) -> Result<(), DispatchError>;
}

/// Live dispatcher backed by the endpoint factory. Records a publish outcome
/// counter per attempt.
pub struct EndpointDispatcher {
    factory: Arc<EndpointFactory>,
}

impl EndpointDispatcher {
    pub fn new(factory: Arc<EndpointFactory>) -> Self {
        Self { factory }
    }

    async fn dispatch_inner(
        &self,
        action: &SinkAction,
        payload: &JsonValue,
    ) -> Result<(), DispatchError> {
        match &action.operation {
            SinkOperation::MqttPublish { topic, qos, retain } => {
                self.publish_mqtt(&action.endpoint, topic, *qos, *retain, payload)
                    .await
            }
            SinkOperation::KafkaPublish { topic, key } => {
                self.publish_kafka(&action.endpoint, topic, key.as_deref(), payload)
                    .await
            }
            SinkOperation::AmqpPublish {
                exchange,
                routing_key,
            } => {
                self.publish_amqp(&action.endpoint, exchange, routing_key, payload)
                    .await
            }
            SinkOperation::HttpRequest { method, path } => {
                self.send_http(&action.endpoint, method, path, payload).await
            }
            SinkOperation::AasWrite {
                submodel_id,
                element_path,
            } => {
                self.write_aas(&action.endpoint, submodel_id, element_path, payload)
                    .await
            }
        }
    }

    #[cfg(feature = "mqtt")]
    async fn publish_mqtt(
        &self,
        endpoint: &str,
        topic: &str,
        qos: u8,
        retain: bool,
        payload: &JsonValue,
    ) -> Result<(), DispatchError> {
        let qos = match qos {
            0 => rumqttc::QoS::AtMostOnce,
            1 => rumqttc::QoS::AtLeastOnce,
            2 => rumqttc::QoS::ExactlyOnce,
            other => {
                return Err(DispatchError::InvalidQos {
                    endpoint: endpoint.to_string(),
                    qos: other,
                })
            }
        };

        let timeout = self
            .factory
            .registry()
            .mqtt(endpoint)
            .and_then(|handle| handle.timeouts.request);
        let publisher = self.factory.mqtt_publisher(endpoint).await?;
        publisher
            .publish(topic, payload_to_bytes(payload), qos, retain, timeout)
            .await?;
        Ok(())
    }

    #[cfg(not(feature = "mqtt"))]
    async fn publish_mqtt(
        &self,
        endpoint: &str,
        _topic: &str,
        _qos: u8,
        _retain: bool,
        _payload: &JsonValue,
    ) -> Result<(), DispatchError> {
        Err(DispatchError::FeatureDisabled {
            endpoint: endpoint.to_string(),
            feature: "mqtt",
        })
    }

    #[cfg(feature = "kafka")]
    async fn publish_kafka(
        &self,
        endpoint: &str,
        topic: &str,
        key: Option<&str>,
        payload: &JsonValue,
    ) -> Result<(), DispatchError> {
        use rdkafka::producer::FutureRecord;
        use rdkafka::util::Timeout;
        use std::time::Duration;

        let handle = self.factory.kafka_producer(endpoint)?;
        let timeout = Timeout::After(
            handle
                .request_timeout()
                .unwrap_or_else(|| Duration::from_secs(10)),
        );
        let bytes = payload_to_bytes(payload);

        let delivery = match key {
            Some(key) => {
                handle
                    .producer()
                    .send(FutureRecord::to(topic).payload(&bytes).key(key), timeout)
                    .await
            }
            None => {
                handle
                    .producer()
                    .send(
                        FutureRecord::<(), Vec<u8>>::to(topic).payload(&bytes),
                        timeout,
                    )
                    .await
            }
        };

        delivery.map_err(|(err, _)| DispatchError::Kafka {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        })?;
        Ok(())
    }

    #[cfg(not(feature = "kafka"))]
    async fn publish_kafka(
        &self,
        endpoint: &str,
        _topic: &str,
        _key: Option<&str>,
        _payload: &JsonValue,
    ) -> Result<(), DispatchError> {
        Err(DispatchError::FeatureDisabled {
            endpoint: endpoint.to_string(),
            feature: "kafka",
        })
    }

    #[cfg(feature = "amqp")]
    async fn publish_amqp(
        &self,
        endpoint: &str,
        exchange: &str,
        routing_key: &str,
        payload: &JsonValue,
    ) -> Result<(), DispatchError> {
        let timeout = self
            .factory
            .registry()
            .amqp(endpoint)
            .and_then(|handle| handle.timeouts.request);
        let publisher = self.factory.amqp_publisher(endpoint).await?;
        publisher
            .publish(
                exchange,
                routing_key,
                &payload_to_bytes(payload),
                lapin::BasicProperties::default().with_content_type("application/json".into()),
                timeout,
            )
            .await?;
        Ok(())
    }

    #[cfg(not(feature = "amqp"))]
    async fn publish_amqp(
        &self,
        endpoint: &str,
        _exchange: &str,
        _routing_key: &str,
        _payload: &JsonValue,
    ) -> Result<(), DispatchError> {
        Err(DispatchError::FeatureDisabled {
            endpoint: endpoint.to_string(),
            feature: "amqp",
        })
    }

    async fn send_http(
        &self,
        endpoint: &str,
        method: &str,
        path: &str,
        payload: &JsonValue,
    ) -> Result<(), DispatchError> {
        let handle = self.factory.http_client(endpoint)?;
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| {
            DispatchError::InvalidMethod {
                endpoint: endpoint.to_string(),
                method: method.to_string(),
            }
        })?;

        let url = format!(
            "{}/{}",
            handle.base_url().trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        let content_type = match payload {
            JsonValue::String(_) => "text/plain",
            _ => "application/json",
        };

        let response = handle
            .client()
            .request(method, &url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(payload_to_bytes(payload))
            .send()
            .await
            .map_err(|source| DispatchError::Http {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::HttpStatus {
                endpoint: endpoint.to_string(),
                status,
            });
        }
        Ok(())
    }

    async fn write_aas(
        &self,
        endpoint: &str,
        submodel_id: &str,
        element_path: &str,
        payload: &JsonValue,
    ) -> Result<(), DispatchError> {
        let client = self.factory.aas_client(endpoint)?;
        client
            .write_element_value(submodel_id, element_path, payload)
            .await
            .map_err(|source| DispatchError::Aas {
                endpoint: endpoint.to_string(),
                source,
            })
    }
}

#[async_trait]
impl ActionDispatcher for EndpointDispatcher {
    async fn dispatch(&self, action: &SinkAction, payload: &JsonValue) -> Result<(), DispatchError> {
        let kind = action.operation.kind();
        match self.dispatch_inner(action, payload).await {
            Ok(()) => {
                metrics().publish_succeeded(kind, &action.endpoint);
                Ok(())
            }
            Err(err) => {
                metrics().publish_failed(kind, &action.endpoint, Some(err.reason_label()));
                Err(err)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Factory(#[from] EndpointFactoryError),
    #[error("endpoint `{endpoint}` requires disabled feature `{feature}`")]
    FeatureDisabled {
        endpoint: String,
        feature: &'static str,
    },
    #[error("endpoint `{endpoint}` got invalid QoS level {qos}")]
    InvalidQos { endpoint: String, qos: u8 },
    #[error("endpoint `{endpoint}` got invalid HTTP method `{method}`")]
    InvalidMethod { endpoint: String, method: String },
    #[error("http request to `{endpoint}` failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("endpoint `{endpoint}` answered with status {status}")]
    HttpStatus { endpoint: String, status: StatusCode },
    #[error("kafka delivery to `{endpoint}` failed: {reason}")]
    Kafka { endpoint: String, reason: String },
    #[error("aas write via `{endpoint}` failed: {source}")]
    Aas {
        endpoint: String,
        #[source]
        source: crate::aas::AasClientError,
    },
}

impl DispatchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Factory(source) => !matches!(
                source,
                EndpointFactoryError::MissingEndpoint { .. }
                    | EndpointFactoryError::KafkaUnavailable { .. }
                    | EndpointFactoryError::MqttUnavailable { .. }
                    | EndpointFactoryError::AmqpUnavailable { .. }
            ),
            DispatchError::FeatureDisabled { .. }
            | DispatchError::InvalidQos { .. }
            | DispatchError::InvalidMethod { .. } => false,
            DispatchError::Http { .. } | DispatchError::Kafka { .. } => true,
            DispatchError::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            DispatchError::Aas { source, .. } => match source {
                crate::aas::AasClientError::ElementNotFound { .. }
                | crate::aas::AasClientError::InvalidBaseUrl { .. }
                | crate::aas::AasClientError::BaseUrlNotHierarchical { .. } => false,
                crate::aas::AasClientError::UnexpectedStatus { status, .. } => {
                    status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
                }
                crate::aas::AasClientError::Request(_) => true,
            },
        }
    }

    fn reason_label(&self) -> &'static str {
        match self {
            DispatchError::Factory(_) => "endpoint",
            DispatchError::FeatureDisabled { .. } => "feature_disabled",
            DispatchError::InvalidQos { .. } => "invalid_qos",
            DispatchError::InvalidMethod { .. } => "invalid_method",
            DispatchError::Http { .. } => "transport",
            DispatchError::HttpStatus { .. } => "status",
            DispatchError::Kafka { .. } => "kafka",
            DispatchError::Aas { .. } => "aas",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_payloads_stay_raw() {
        assert_eq!(payload_to_bytes(&json!("21.5")), b"21.5".to_vec());
    }

    #[test]
    fn structured_payloads_serialize_as_json() {
        assert_eq!(
            payload_to_bytes(&json!({"value": 1})),
            br#"{"value":1}"#.to_vec()
        );
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        let server = DispatchError::HttpStatus {
            endpoint: "api".to_string(),
            status: StatusCode::BAD_GATEWAY,
        };
        let client = DispatchError::HttpStatus {
            endpoint: "api".to_string(),
            status: StatusCode::UNPROCESSABLE_ENTITY,
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
    }
}
