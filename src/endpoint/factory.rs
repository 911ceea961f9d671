use crate::aas::AasClient;
use crate::endpoint::registry::EndpointRegistry;
#[cfg(any(feature = "kafka", feature = "mqtt", feature = "amqp"))]
use crate::endpoint::registry::{AmqpEndpoint, KafkaEndpoint, MqttEndpoint};
use crate::endpoint::registry::{AasEndpoint, HttpClientEndpoint};
use crate::error::Error as BridgeError;
#[cfg(feature = "mqtt")]
use crate::transport::sleep_with_shutdown;
#[cfg(feature = "amqp")]
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    BasicProperties as AmqpBasicProperties, Channel as AmqpChannel,
    Connection as AmqpConnection, ConnectionProperties as AmqpConnectionProperties,
};
#[cfg(feature = "kafka")]
use rdkafka::{config::ClientConfig, producer::FutureProducer};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, ClientBuilder};
#[cfg(feature = "mqtt")]
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
#[cfg(any(feature = "kafka", feature = "mqtt", feature = "amqp"))]
use std::time::Duration;
use thiserror::Error;
#[cfg(feature = "amqp")]
use tokio::time::timeout as amqp_timeout;
#[cfg(feature = "mqtt")]
use tokio::time::timeout as mqtt_timeout;
#[cfg(feature = "amqp")]
use tokio_executor_trait::Tokio as TokioExecutor;
use tokio_util::sync::CancellationToken;
#[cfg(feature = "mqtt")]
use url::Url;
#[cfg(feature = "mqtt")]
use uuid::Uuid;

/// Lazily materialises live protocol clients from registry handles and caches
/// them for reuse across route executions.
struct EndpointCache<H> {
    inner: Mutex<HashMap<String, Arc<H>>>,
}

impl<H> EndpointCache<H> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_insert_with<F>(&self, name: &str, builder: F) -> Result<Arc<H>, EndpointFactoryError>
    where
        F: FnOnce() -> Result<H, EndpointFactoryError>,
    {
        let mut guard = self.inner.lock().expect("endpoint cache lock poisoned");
        if let Some(handle) = guard.get(name) {
            return Ok(handle.clone());
        }
        let handle = Arc::new(builder()?);
        guard.insert(name.to_string(), handle.clone());
        Ok(handle)
    }
}

impl<H> fmt::Debug for EndpointCache<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointCache").finish()
    }
}

#[derive(Debug)]
pub struct EndpointFactory {
    registry: Arc<EndpointRegistry>,
    #[cfg(feature = "mqtt")]
    shutdown: CancellationToken,
    http_clients: EndpointCache<HttpClientHandle>,
    aas_clients: EndpointCache<AasClient>,
    #[cfg(feature = "kafka")]
    kafka_producers: EndpointCache<KafkaProducerHandle>,
    #[cfg(feature = "mqtt")]
    mqtt_publishers: Mutex<HashMap<String, Arc<MqttPublisher>>>,
    #[cfg(feature = "amqp")]
    amqp_publishers: Mutex<HashMap<String, Arc<AmqpPublisher>>>,
}

impl EndpointFactory {
    pub fn new(registry: Arc<EndpointRegistry>, shutdown: CancellationToken) -> Self {
        #[cfg(not(feature = "mqtt"))]
        let _ = shutdown;
        let instance = Self {
            registry: Arc::clone(&registry),
            #[cfg(feature = "mqtt")]
            shutdown,
            http_clients: EndpointCache::new(),
            aas_clients: EndpointCache::new(),
            #[cfg(feature = "kafka")]
            kafka_producers: EndpointCache::new(),
            #[cfg(feature = "mqtt")]
            mqtt_publishers: Mutex::new(HashMap::new()),
            #[cfg(feature = "amqp")]
            amqp_publishers: Mutex::new(HashMap::new()),
        };
        registry.for_each_handle(|handle| {
            tracing::debug!(
                endpoint = handle.name(),
                timeout = ?handle.timeouts(),
                "endpoint handle registered"
            );
        });
        instance
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn http_client(&self, name: &str) -> Result<Arc<HttpClientHandle>, EndpointFactoryError> {
        let endpoint = self.require_endpoint(name, "http-client", EndpointRegistry::http_client)?;
        self.http_clients
            .get_or_insert_with(name, move || build_http_client_handle(&endpoint))
    }

    pub fn aas_client(&self, name: &str) -> Result<Arc<AasClient>, EndpointFactoryError> {
        let endpoint = self.require_endpoint(name, "aas", EndpointRegistry::aas)?;
        self.aas_clients
            .get_or_insert_with(name, move || build_aas_client(&endpoint))
    }

    #[cfg(feature = "kafka")]
    pub fn kafka_producer(
        &self,
        name: &str,
    ) -> Result<Arc<KafkaProducerHandle>, EndpointFactoryError> {
        let endpoint = self.require_endpoint(name, "kafka", EndpointRegistry::kafka)?;
        self.kafka_producers
            .get_or_insert_with(name, move || build_kafka_handle(&endpoint))
    }

    #[cfg(not(feature = "kafka"))]
    pub fn kafka_producer(
        &self,
        name: &str,
    ) -> Result<Arc<KafkaProducerHandle>, EndpointFactoryError> {
        Err(EndpointFactoryError::KafkaUnavailable {
            name: name.to_string(),
        })
    }

    #[cfg(feature = "mqtt")]
    pub async fn mqtt_publisher(
        &self,
        name: &str,
    ) -> Result<Arc<MqttPublisher>, EndpointFactoryError> {
        {
            let cache = self.mqtt_publishers.lock().expect("mqtt publisher cache");
            if let Some(publisher) = cache.get(name) {
                return Ok(publisher.clone());
            }
        }

        let endpoint = self.require_endpoint(name, "mqtt", EndpointRegistry::mqtt)?;
        let publisher = Arc::new(MqttPublisher::connect(&endpoint, self.shutdown.child_token())?);

        let mut cache = self.mqtt_publishers.lock().expect("mqtt publisher cache");
        cache.insert(name.to_string(), publisher.clone());
        Ok(publisher)
    }

    #[cfg(not(feature = "mqtt"))]
    pub async fn mqtt_publisher(
        &self,
        name: &str,
    ) -> Result<Arc<MqttPublisher>, EndpointFactoryError> {
        Err(EndpointFactoryError::MqttUnavailable {
            name: name.to_string(),
        })
    }

    #[cfg(feature = "amqp")]
    pub async fn amqp_publisher(
        &self,
        name: &str,
    ) -> Result<Arc<AmqpPublisher>, EndpointFactoryError> {
        {
            let cache = self.amqp_publishers.lock().expect("amqp publisher cache");
            if let Some(publisher) = cache.get(name) {
                return Ok(publisher.clone());
            }
        }

        let endpoint = self.require_endpoint(name, "amqp", EndpointRegistry::amqp)?;
        let publisher = Arc::new(AmqpPublisher::connect(&endpoint).await?);

        let mut cache = self.amqp_publishers.lock().expect("amqp publisher cache");
        cache.insert(name.to_string(), publisher.clone());
        Ok(publisher)
    }

    #[cfg(not(feature = "amqp"))]
    pub async fn amqp_publisher(
        &self,
        name: &str,
    ) -> Result<Arc<AmqpPublisher>, EndpointFactoryError> {
        Err(EndpointFactoryError::AmqpUnavailable {
            name: name.to_string(),
        })
    }

    fn require_endpoint<T, F>(
        &self,
        name: &str,
        expected: &'static str,
        getter: F,
    ) -> Result<T, EndpointFactoryError>
    where
        T: Clone,
        F: for<'a> FnOnce(&'a EndpointRegistry, &'a str) -> Option<&'a T>,
    {
        getter(&self.registry, name)
            .cloned()
            .ok_or_else(|| EndpointFactoryError::MissingEndpoint {
                name: name.to_string(),
                expected,
            })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientHandle {
    name: String,
    base_url: String,
    client: Client,
    default_headers: Vec<(String, String)>,
}

impl HttpClientHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn default_headers(&self) -> &[(String, String)] {
        &self.default_headers
    }
}

#[cfg(feature = "kafka")]
#[derive(Clone)]
pub struct KafkaProducerHandle {
    name: String,
    brokers: Vec<String>,
    producer: FutureProducer,
    request_timeout: Option<Duration>,
}

#[cfg(not(feature = "kafka"))]
#[derive(Debug, Clone)]
pub struct KafkaProducerHandle;

#[cfg(feature = "kafka")]
impl KafkaProducerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn producer(&self) -> &FutureProducer {
        &self.producer
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}

#[cfg(feature = "kafka")]
impl fmt::Debug for KafkaProducerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaProducerHandle")
            .field("name", &self.name)
            .field("brokers", &self.brokers)
            .finish()
    }
}

#[cfg(feature = "mqtt")]
#[derive(Debug)]
pub struct MqttPublisher {
    name: String,
    client: AsyncClient,
    _driver: tokio::task::JoinHandle<()>,
}

#[cfg(not(feature = "mqtt"))]
#[derive(Debug)]
pub struct MqttPublisher;

#[cfg(feature = "mqtt")]
impl MqttPublisher {
    fn connect(
        endpoint: &MqttEndpoint,
        shutdown: CancellationToken,
    ) -> Result<Self, EndpointFactoryError> {
        let options = mqtt_options(endpoint)?;
        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let name = endpoint.name.clone();
        let driver_name = name.clone();

        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    polled = eventloop.poll() => {
                        if let Err(err) = polled {
                            tracing::error!(
                                target: "databridge::mqtt",
                                endpoint = %driver_name,
                                error = %err,
                                "mqtt publisher event loop error"
                            );
                            if sleep_with_shutdown(Duration::from_secs(1), &shutdown).await {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            name,
            client,
            _driver: driver,
        })
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        timeout: Option<Duration>,
    ) -> Result<(), EndpointFactoryError> {
        let publish = self.client.publish(topic.to_string(), qos, retain, payload);
        if let Some(duration) = timeout {
            mqtt_timeout(duration, publish)
                .await
                .map_err(|_| {
                    EndpointFactoryError::build_failure(
                        &self.name,
                        "mqtt",
                        crate::err!("publish timed out"),
                    )
                })?
                .map_err(|err| {
                    EndpointFactoryError::build_failure(
                        &self.name,
                        "mqtt",
                        BridgeError::with_context(
                            "publish failed",
                            BridgeError::msg(err.to_string()),
                        ),
                    )
                })?;
        } else {
            publish.await.map_err(|err| {
                EndpointFactoryError::build_failure(
                    &self.name,
                    "mqtt",
                    BridgeError::with_context("publish failed", BridgeError::msg(err.to_string())),
                )
            })?;
        }
        Ok(())
    }
}

#[cfg(feature = "amqp")]
#[derive(Debug)]
pub struct AmqpPublisher {
    name: String,
    _connection: AmqpConnection,
    channel: AmqpChannel,
}

#[cfg(not(feature = "amqp"))]
#[derive(Debug)]
pub struct AmqpPublisher;

#[cfg(feature = "amqp")]
impl AmqpPublisher {
    async fn connect(endpoint: &AmqpEndpoint) -> Result<Self, EndpointFactoryError> {
        let properties =
            AmqpConnectionProperties::default().with_executor(TokioExecutor::current());
        let uri = match &endpoint.vhost {
            Some(vhost) => format!("{}/{}", endpoint.url.trim_end_matches('/'), vhost),
            None => endpoint.url.clone(),
        };

        let connection = AmqpConnection::connect(&uri, properties).await.map_err(|err| {
            EndpointFactoryError::build_failure(
                &endpoint.name,
                "amqp",
                BridgeError::with_context(
                    format!("failed to connect to {uri}"),
                    BridgeError::msg(err.to_string()),
                ),
            )
        })?;

        let channel = connection.create_channel().await.map_err(|err| {
            EndpointFactoryError::build_failure(
                &endpoint.name,
                "amqp",
                BridgeError::with_context(
                    "failed to open channel",
                    BridgeError::msg(err.to_string()),
                ),
            )
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                EndpointFactoryError::build_failure(
                    &endpoint.name,
                    "amqp",
                    BridgeError::with_context(
                        "failed to enable publisher confirms",
                        BridgeError::msg(err.to_string()),
                    ),
                )
            })?;

        Ok(Self {
            name: endpoint.name.clone(),
            _connection: connection,
            channel,
        })
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: AmqpBasicProperties,
        timeout: Option<Duration>,
    ) -> Result<(), EndpointFactoryError> {
        let confirm_future = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                EndpointFactoryError::build_failure(
                    &self.name,
                    "amqp",
                    BridgeError::with_context(
                        format!(
                            "basic_publish failed (exchange: {exchange}, routing_key: {routing_key})"
                        ),
                        BridgeError::msg(err.to_string()),
                    ),
                )
            })?;

        let confirmation = if let Some(duration) = timeout {
            amqp_timeout(duration, confirm_future)
                .await
                .map_err(|_| {
                    EndpointFactoryError::build_failure(
                        &self.name,
                        "amqp",
                        crate::err!("publisher confirm timed out"),
                    )
                })?
                .map_err(|err| {
                    EndpointFactoryError::build_failure(
                        &self.name,
                        "amqp",
                        BridgeError::with_context(
                            "publisher confirm failed",
                            BridgeError::msg(err.to_string()),
                        ),
                    )
                })?
        } else {
            confirm_future.await.map_err(|err| {
                EndpointFactoryError::build_failure(
                    &self.name,
                    "amqp",
                    BridgeError::with_context(
                        "publisher confirm failed",
                        BridgeError::msg(err.to_string()),
                    ),
                )
            })?
        };

        match confirmation {
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(EndpointFactoryError::build_failure(
                &self.name,
                "amqp",
                crate::err!("publisher confirm returned nack"),
            )),
        }
    }
}

fn build_http_client_handle(
    endpoint: &HttpClientEndpoint,
) -> Result<HttpClientHandle, EndpointFactoryError> {
    let mut builder = ClientBuilder::new();

    if let Some(max_idle) = endpoint.pool_max_idle {
        builder = builder.pool_max_idle_per_host(max_idle);
    }
    if let Some(connect_timeout) = endpoint.timeouts.connect {
        builder = builder.connect_timeout(connect_timeout);
    }
    if let Some(request_timeout) = endpoint.timeouts.request {
        builder = builder.timeout(request_timeout);
    }
    builder = builder.default_headers(header_map(&endpoint.name, &endpoint.default_headers)?);

    let client = builder.build().map_err(|err| {
        EndpointFactoryError::build_failure(
            &endpoint.name,
            "http-client",
            BridgeError::with_context("failed to build HTTP client", BridgeError::new(err)),
        )
    })?;

    Ok(HttpClientHandle {
        name: endpoint.name.clone(),
        base_url: endpoint.base_url.clone(),
        client,
        default_headers: endpoint.default_headers.clone(),
    })
}

fn build_aas_client(endpoint: &AasEndpoint) -> Result<AasClient, EndpointFactoryError> {
    let mut builder = ClientBuilder::new();
    if let Some(connect_timeout) = endpoint.timeouts.connect {
        builder = builder.connect_timeout(connect_timeout);
    }
    if let Some(request_timeout) = endpoint.timeouts.request {
        builder = builder.timeout(request_timeout);
    }

    let client = builder.build().map_err(|err| {
        EndpointFactoryError::build_failure(
            &endpoint.name,
            "aas",
            BridgeError::with_context("failed to build HTTP client", BridgeError::new(err)),
        )
    })?;

    AasClient::new(
        &endpoint.name,
        &endpoint.base_url,
        endpoint.api_key.clone(),
        client,
    )
    .map_err(|err| {
        EndpointFactoryError::build_failure(&endpoint.name, "aas", BridgeError::new(err))
    })
}

#[cfg(feature = "kafka")]
fn build_kafka_handle(endpoint: &KafkaEndpoint) -> Result<KafkaProducerHandle, EndpointFactoryError> {
    let brokers = endpoint.brokers.join(",");
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", brokers.as_str());
    if let Some(client_id) = &endpoint.client_id {
        config.set("client.id", client_id.as_str());
    }
    if endpoint.create_topics_if_missing {
        config.set("allow.auto.create.topics", "true");
    }
    for (key, value) in &endpoint.extra {
        if let Some(text) = json_to_config_value(value) {
            config.set(key, text);
        }
    }

    let producer: FutureProducer = config.create().map_err(|err| {
        EndpointFactoryError::build_failure(
            &endpoint.name,
            "kafka",
            BridgeError::with_context("failed to build Kafka producer", BridgeError::new(err)),
        )
    })?;

    Ok(KafkaProducerHandle {
        name: endpoint.name.clone(),
        brokers: endpoint.brokers.clone(),
        producer,
        request_timeout: endpoint.timeouts.request,
    })
}

#[cfg(feature = "mqtt")]
fn mqtt_options(endpoint: &MqttEndpoint) -> Result<MqttOptions, EndpointFactoryError> {
    let url = Url::parse(&endpoint.url).map_err(|err| {
        EndpointFactoryError::build_failure(
            &endpoint.name,
            "mqtt",
            BridgeError::with_context(
                format!("invalid MQTT URL `{}`", endpoint.url),
                BridgeError::new(err),
            ),
        )
    })?;

    let host = url.host_str().ok_or_else(|| {
        EndpointFactoryError::build_failure(
            &endpoint.name,
            "mqtt",
            crate::err!("MQTT URL `{}` has no host", endpoint.url),
        )
    })?;
    let port = url.port().unwrap_or(1883);
    let client_id = endpoint
        .client_id
        .clone()
        .unwrap_or_else(|| format!("databridge-{}", Uuid::new_v4()));

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_clean_session(endpoint.clean_session);
    if let Some(keep_alive) = endpoint.keep_alive {
        options.set_keep_alive(keep_alive);
    }
    if let (Some(username), Some(password)) = (&endpoint.username, &endpoint.password) {
        options.set_credentials(username.clone(), password.clone());
    }
    Ok(options)
}

fn header_map(
    endpoint: &str,
    headers: &[(String, String)],
) -> Result<HeaderMap, EndpointFactoryError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = name.parse::<HeaderName>().map_err(|err| {
            EndpointFactoryError::build_failure(
                endpoint,
                "http-client",
                BridgeError::with_context(
                    format!("invalid header name `{name}`"),
                    BridgeError::msg(err.to_string()),
                ),
            )
        })?;
        let value = value.parse::<HeaderValue>().map_err(|err| {
            EndpointFactoryError::build_failure(
                endpoint,
                "http-client",
                BridgeError::with_context(
                    format!("invalid header value for `{name:?}`"),
                    BridgeError::msg(err.to_string()),
                ),
            )
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(feature = "kafka")]
fn json_to_config_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Bool(flag) => Some(flag.to_string()),
        JsonValue::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(not(feature = "kafka"))]
#[allow(dead_code)]
fn json_to_config_value(_value: &JsonValue) -> Option<String> {
    None
}

#[derive(Debug, Error)]
pub enum EndpointFactoryError {
    #[error("endpoint `{name}` not found with expected kind `{expected}`")]
    MissingEndpoint {
        name: String,
        expected: &'static str,
    },
    #[error("failed to build http client `{name}`")]
    HttpClient {
        name: String,
        #[source]
        source: Arc<BridgeError>,
    },
    #[error("failed to build AAS client `{name}`")]
    Aas {
        name: String,
        #[source]
        source: Arc<BridgeError>,
    },
    #[error("failed to build kafka producer `{name}`")]
    Kafka {
        name: String,
        #[source]
        source: Arc<BridgeError>,
    },
    #[error("failed to build mqtt publisher `{name}`")]
    Mqtt {
        name: String,
        #[source]
        source: Arc<BridgeError>,
    },
    #[error("failed to build amqp publisher `{name}`")]
    Amqp {
        name: String,
        #[source]
        source: Arc<BridgeError>,
    },
    #[error("kafka endpoint `{name}` requested but binary built without `kafka` feature")]
    KafkaUnavailable { name: String },
    #[error("mqtt endpoint `{name}` requested but binary built without `mqtt` feature")]
    MqttUnavailable { name: String },
    #[error("amqp endpoint `{name}` requested but binary built without `amqp` feature")]
    AmqpUnavailable { name: String },
}

impl EndpointFactoryError {
    fn build_failure(name: impl Into<String>, kind: &'static str, source: BridgeError) -> Self {
        let name = name.into();
        let source = Arc::new(source);
        match kind {
            "aas" => Self::Aas { name, source },
            "kafka" => Self::Kafka { name, source },
            "mqtt" => Self::Mqtt { name, source },
            "amqp" => Self::Amqp { name, source },
            _ => Self::HttpClient { name, source },
        }
    }
}

#[cfg(all(test, feature = "mqtt"))]
mod tests {
    use super::*;
    use crate::config::bridge::BridgeConfig;
    use serde_json::json;

    #[tokio::test]
    async fn mqtt_publisher_driver_stops_on_shutdown() {
        let raw = json!({
            "api_version": "v1",
            "app": { "feature_flags": ["mqtt"] },
            "endpoints": [
                {"name": "plant-mqtt", "kind": "mqtt", "options": {"url": "mqtt://127.0.0.1:1"}}
            ]
        });
        let config = BridgeConfig::from_json_str(&raw.to_string()).expect("valid config");
        let registry = Arc::new(EndpointRegistry::build(&config).expect("registry"));
        let shutdown = CancellationToken::new();
        let factory = EndpointFactory::new(registry, shutdown.clone());

        let publisher = factory
            .mqtt_publisher("plant-mqtt")
            .await
            .expect("publisher");
        assert!(!publisher._driver.is_finished());

        shutdown.cancel();
        for _ in 0..200 {
            if publisher._driver.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mqtt publisher event loop kept running after shutdown");
    }
}
