//! Kafka consumer trigger. One consumer per kafka route; offsets are stored
//! only after the engine finishes with the message.

use crate::config::bridge::SourceKind;
use crate::domain::BridgeMessage;
use crate::endpoint::registry::KafkaEndpoint;
use crate::endpoint::EndpointRegistry;
use crate::metrics::metrics;
use crate::retry::{run_retry_loop, RetryContext, RetrySettings};
use crate::route::engine::RouteEngine;
use crate::transport::{
    TaskTransportRuntime, TransportHealth, TransportKind, TransportRun, TransportRuntime,
};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::marker::PhantomData;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct KafkaTriggerRuntime<S>
where
    S: KafkaConsumerStream + Send,
{
    inner: TaskTransportRuntime,
    consumer_count: usize,
    _marker: PhantomData<S>,
}

impl KafkaTriggerRuntime<RdkafkaConsumerStream> {
    pub async fn build(
        engine: Arc<RouteEngine>,
        registry: Arc<EndpointRegistry>,
    ) -> Result<Self, KafkaTriggerError> {
        Self::build_with(engine, registry, |config| async move {
            RdkafkaConsumerStream::connect(config)
        })
        .await
    }
}

impl<S> KafkaTriggerRuntime<S>
where
    S: KafkaConsumerStream + Send,
{
    pub async fn build_with<F, Fut>(
        engine: Arc<RouteEngine>,
        registry: Arc<EndpointRegistry>,
        mut make_consumer: F,
    ) -> Result<Self, KafkaTriggerError>
    where
        F: FnMut(KafkaConsumerConfig) -> Fut,
        Fut: Future<Output = StdResult<S, KafkaConsumerError>>,
    {
        let mut instances = Vec::new();

        for plan in engine.plans_for_source(SourceKind::Kafka) {
            let endpoint_name = plan.source.endpoint.clone().ok_or_else(|| {
                KafkaTriggerError::MissingEndpoint {
                    route: plan.name.clone(),
                }
            })?;
            let endpoint = registry.kafka(&endpoint_name).cloned().ok_or_else(|| {
                KafkaTriggerError::UnknownEndpoint {
                    route: plan.name.clone(),
                    endpoint: endpoint_name.clone(),
                }
            })?;

            let topic = require_option(&plan.name, &plan.source.options, "topic")?;
            let group_id = require_option(&plan.name, &plan.source.options, "group_id")?;

            let config = KafkaConsumerConfig {
                route: plan.name.clone(),
                endpoint: endpoint_name.clone(),
                brokers: endpoint.brokers.clone(),
                client_id: endpoint.client_id.clone(),
                topic: topic.clone(),
                group_id,
            };
            let retry = RetrySettings::from_extras(&plan.source.options, &endpoint.extra);

            let consumer = make_consumer(config).await.map_err(|err| {
                KafkaTriggerError::ConsumerBuild {
                    route: plan.name.clone(),
                    reason: err.to_string(),
                }
            })?;

            instances.push(KafkaTriggerInstance {
                route: plan.name.clone(),
                endpoint: endpoint_name,
                topic,
                consumer,
                retry,
            });
        }

        let consumer_count = instances.len();
        let engine_shared = Arc::clone(&engine);
        let inner = TaskTransportRuntime::new(TransportKind::KafkaIn, "kafka", move |shutdown| {
            instances
                .into_iter()
                .map(|instance| {
                    let engine = Arc::clone(&engine_shared);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        instance.run(engine, shutdown).await;
                    })
                })
                .collect()
        });

        Ok(Self {
            inner,
            consumer_count,
            _marker: PhantomData,
        })
    }

    pub fn consumer_count(&self) -> usize {
        self.consumer_count
    }
}

fn require_option(
    route: &str,
    options: &crate::config::bridge::OptionMap,
    key: &'static str,
) -> Result<String, KafkaTriggerError> {
    options
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| KafkaTriggerError::MissingOption {
            route: route.to_string(),
            option: key,
        })
}

#[derive(Debug, Clone)]
pub struct KafkaInboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub struct KafkaConsumerConfig {
    pub route: String,
    pub endpoint: String,
    pub brokers: Vec<String>,
    pub client_id: Option<String>,
    pub topic: String,
    pub group_id: String,
}

#[async_trait]
pub trait KafkaConsumerStream: Send + 'static {
    async fn next(&mut self) -> StdResult<Option<KafkaInboundMessage>, KafkaConsumerError>;

    async fn store_offset(
        &mut self,
        _message: &KafkaInboundMessage,
    ) -> StdResult<(), KafkaConsumerError> {
        Ok(())
    }
}

pub struct RdkafkaConsumerStream {
    consumer: StreamConsumer,
}

impl RdkafkaConsumerStream {
    pub fn connect(config: KafkaConsumerConfig) -> StdResult<Self, KafkaConsumerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.brokers.join(","))
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "latest");
        if let Some(client_id) = &config.client_id {
            client_config.set("client.id", client_id);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|err| KafkaConsumerError::new(format!("consumer create failed: {err}")))?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|err| {
                KafkaConsumerError::new(format!(
                    "failed to subscribe to `{}`: {err}",
                    config.topic
                ))
            })?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl KafkaConsumerStream for RdkafkaConsumerStream {
    async fn next(&mut self) -> StdResult<Option<KafkaInboundMessage>, KafkaConsumerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|err| KafkaConsumerError::new(format!("consumer receive failed: {err}")))?;

        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|header| {
                        header.value.and_then(|value| {
                            std::str::from_utf8(value)
                                .ok()
                                .map(|value| (header.key.to_string(), value.to_string()))
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(KafkaInboundMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|key| key.to_vec()),
            payload: message.payload().map(|body| body.to_vec()).unwrap_or_default(),
            headers,
        }))
    }

    async fn store_offset(
        &mut self,
        message: &KafkaInboundMessage,
    ) -> StdResult<(), KafkaConsumerError> {
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset)
            .map_err(|err| KafkaConsumerError::new(format!("offset store failed: {err}")))
    }
}

struct KafkaTriggerInstance<S>
where
    S: KafkaConsumerStream + Send,
{
    route: String,
    endpoint: String,
    topic: String,
    consumer: S,
    retry: RetrySettings,
}

impl<S> KafkaTriggerInstance<S>
where
    S: KafkaConsumerStream + Send,
{
    async fn run(self, engine: Arc<RouteEngine>, shutdown: CancellationToken) {
        let retry = self.retry.clone();
        let mut context = KafkaRetryContext {
            instance: self,
            engine,
        };

        run_retry_loop(shutdown, retry, Duration::from_millis(50), &mut context).await;
    }

    async fn handle_message(&mut self, engine: &Arc<RouteEngine>, message: KafkaInboundMessage) {
        let counters = metrics();
        counters.trigger_started("kafka");

        let mut bridge_message =
            BridgeMessage::new(&self.endpoint, message.headers.clone(), message.payload.clone())
                .with_trace_id(Uuid::new_v4().to_string())
                .with_route(&self.route)
                .with_metadata("topic", &message.topic)
                .with_metadata("partition", message.partition.to_string())
                .with_metadata("offset", message.offset.to_string());
        if let Some(key) = &message.key {
            if let Ok(key) = std::str::from_utf8(key) {
                bridge_message = bridge_message.with_metadata("key", key);
            }
        }

        match engine.execute(&self.route, bridge_message).await {
            Ok(_) => {
                if let Err(err) = self.consumer.store_offset(&message).await {
                    crate::bridge_event!(
                        error,
                        "databridge::kafka",
                        "offset_store_failed",
                        endpoint = self.endpoint.as_str(),
                        route = self.route.as_str(),
                        topic = self.topic,
                        error = err,
                    );
                }
            }
            Err(err) => {
                crate::bridge_event!(
                    error,
                    "databridge::kafka",
                    "trigger_failed",
                    endpoint = self.endpoint.as_str(),
                    route = self.route.as_str(),
                    topic = self.topic,
                    error = err,
                );
            }
        }

        counters.trigger_finished("kafka");
    }
}

struct KafkaRetryContext<S>
where
    S: KafkaConsumerStream + Send,
{
    instance: KafkaTriggerInstance<S>,
    engine: Arc<RouteEngine>,
}

#[async_trait]
impl<S> RetryContext for KafkaRetryContext<S>
where
    S: KafkaConsumerStream + Send,
{
    type Item = KafkaInboundMessage;
    type Error = KafkaConsumerError;

    async fn poll(&mut self) -> StdResult<Option<Self::Item>, Self::Error> {
        self.instance.consumer.next().await
    }

    async fn handle_item(&mut self, message: Self::Item) {
        self.instance.handle_message(&self.engine, message).await;
    }

    async fn report_error(&mut self, error: &Self::Error, delay: Duration) {
        crate::bridge_event!(
            warn,
            "databridge::kafka",
            "consumer_receive_failed",
            endpoint = self.instance.endpoint.as_str(),
            route = self.instance.route.as_str(),
            topic = self.instance.topic,
            error = error,
            backoff_ms = delay.as_millis(),
        );
    }
}

#[derive(Debug, Clone)]
pub struct KafkaConsumerError {
    message: String,
}

impl KafkaConsumerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for KafkaConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for KafkaConsumerError {}

#[derive(Debug, Error)]
pub enum KafkaTriggerError {
    #[error("kafka route `{route}` has no source endpoint")]
    MissingEndpoint { route: String },
    #[error("kafka route `{route}` references unknown endpoint `{endpoint}`")]
    UnknownEndpoint { route: String, endpoint: String },
    #[error("kafka route `{route}` is missing the `{option}` option")]
    MissingOption { route: String, option: &'static str },
    #[error("kafka route `{route}` consumer failed to build: {reason}")]
    ConsumerBuild { route: String, reason: String },
}

#[async_trait]
impl<S> TransportRuntime for KafkaTriggerRuntime<S>
where
    S: KafkaConsumerStream + Send,
{
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn health(&self) -> TransportHealth {
        self.inner.health()
    }

    async fn prepare(&mut self) -> crate::error::Result<()> {
        self.inner.prepare().await
    }

    async fn start(&mut self, shutdown: CancellationToken) -> crate::error::Result<()> {
        self.inner.start(shutdown).await
    }

    fn run(&mut self) -> TransportRun {
        self.inner.run()
    }

    async fn shutdown(&mut self) -> crate::error::Result<()> {
        self.inner.shutdown().await
    }
}
