//! AMQP queue trigger. One consumer per amqp route; deliveries are acked
//! after the engine finishes, nacked with requeue when execution fails.

use crate::config::bridge::SourceKind;
use crate::domain::BridgeMessage;
use crate::endpoint::registry::AmqpEndpoint;
use crate::endpoint::EndpointRegistry;
use crate::metrics::metrics;
use crate::retry::{run_retry_loop, RetryContext, RetrySettings};
use crate::route::engine::RouteEngine;
use crate::transport::{
    TaskTransportRuntime, TransportHealth, TransportKind, TransportRun, TransportRuntime,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::marker::PhantomData;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_executor_trait::Tokio as TokioExecutor;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct AmqpTriggerRuntime<S>
where
    S: AmqpConsumerStream + Send,
{
    inner: TaskTransportRuntime,
    consumer_count: usize,
    _marker: PhantomData<S>,
}

impl AmqpTriggerRuntime<LapinConsumerStream> {
    pub async fn build(
        engine: Arc<RouteEngine>,
        registry: Arc<EndpointRegistry>,
    ) -> Result<Self, AmqpTriggerError> {
        Self::build_with(engine, registry, |config| async move {
            LapinConsumerStream::connect(config).await
        })
        .await
    }
}

impl<S> AmqpTriggerRuntime<S>
where
    S: AmqpConsumerStream + Send,
{
    pub async fn build_with<F, Fut>(
        engine: Arc<RouteEngine>,
        registry: Arc<EndpointRegistry>,
        mut make_consumer: F,
    ) -> Result<Self, AmqpTriggerError>
    where
        F: FnMut(AmqpConsumerConfig) -> Fut,
        Fut: Future<Output = StdResult<S, AmqpConsumerError>>,
    {
        let mut instances = Vec::new();

        for plan in engine.plans_for_source(SourceKind::Amqp) {
            let endpoint_name = plan.source.endpoint.clone().ok_or_else(|| {
                AmqpTriggerError::MissingEndpoint {
                    route: plan.name.clone(),
                }
            })?;
            let endpoint = registry.amqp(&endpoint_name).cloned().ok_or_else(|| {
                AmqpTriggerError::UnknownEndpoint {
                    route: plan.name.clone(),
                    endpoint: endpoint_name.clone(),
                }
            })?;

            let queue = plan
                .source
                .options
                .get("queue")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| AmqpTriggerError::MissingQueue {
                    route: plan.name.clone(),
                })?
                .to_string();
            let prefetch = plan
                .source
                .options
                .get("prefetch")
                .and_then(JsonValue::as_u64)
                .unwrap_or(10) as u16;

            let config = AmqpConsumerConfig::new(&plan.name, &endpoint, &queue, prefetch);
            let retry = RetrySettings::from_extras(&plan.source.options, &endpoint.extra);

            let consumer = make_consumer(config).await.map_err(|err| {
                AmqpTriggerError::ConsumerBuild {
                    route: plan.name.clone(),
                    reason: err.to_string(),
                }
            })?;

            instances.push(AmqpTriggerInstance {
                route: plan.name.clone(),
                endpoint: endpoint_name,
                queue,
                consumer,
                retry,
            });
        }

        let consumer_count = instances.len();
        let engine_shared = Arc::clone(&engine);
        let inner = TaskTransportRuntime::new(TransportKind::AmqpIn, "amqp", move |shutdown| {
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

#[derive(Debug, Clone)]
pub struct AmqpDelivery {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

#[derive(Clone, Debug)]
pub struct AmqpConsumerConfig {
    pub route: String,
    pub endpoint: String,
    pub url: String,
    pub vhost: Option<String>,
    pub queue: String,
    pub prefetch: u16,
}

impl AmqpConsumerConfig {
    fn new(route: &str, endpoint: &AmqpEndpoint, queue: &str, prefetch: u16) -> Self {
        Self {
            route: route.to_string(),
            endpoint: endpoint.name.clone(),
            url: endpoint.url.clone(),
            vhost: endpoint.vhost.clone(),
            queue: queue.to_string(),
            prefetch,
        }
    }
}

#[async_trait]
pub trait AmqpConsumerStream: Send + 'static {
    async fn next_delivery(&mut self) -> StdResult<Option<AmqpDelivery>, AmqpConsumerError>;
    async fn ack(&mut self, delivery_tag: u64) -> StdResult<(), AmqpConsumerError>;
    async fn nack(&mut self, delivery_tag: u64, requeue: bool)
        -> StdResult<(), AmqpConsumerError>;
}

pub struct LapinConsumerStream {
    _connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

impl LapinConsumerStream {
    pub async fn connect(config: AmqpConsumerConfig) -> StdResult<Self, AmqpConsumerError> {
        let uri = match &config.vhost {
            Some(vhost) => format!("{}/{}", config.url.trim_end_matches('/'), vhost),
            None => config.url.clone(),
        };
        let properties = ConnectionProperties::default().with_executor(TokioExecutor::current());

        let connection = Connection::connect(&uri, properties)
            .await
            .map_err(|err| AmqpConsumerError::new(format!("failed to connect to {uri}: {err}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| AmqpConsumerError::new(format!("failed to open channel: {err}")))?;
        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| AmqpConsumerError::new(format!("failed to set prefetch: {err}")))?;

        let consumer_tag = format!("databridge-{}-{}", config.route, Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &config.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                AmqpConsumerError::new(format!(
                    "failed to consume from `{}`: {err}",
                    config.queue
                ))
            })?;

        Ok(Self {
            _connection: connection,
            channel,
            consumer,
        })
    }
}

#[async_trait]
impl AmqpConsumerStream for LapinConsumerStream {
    async fn next_delivery(&mut self) -> StdResult<Option<AmqpDelivery>, AmqpConsumerError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(AmqpDelivery {
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                payload: delivery.data,
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
            })),
            Some(Err(err)) => Err(AmqpConsumerError::new(format!("delivery failed: {err}"))),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> StdResult<(), AmqpConsumerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|err| AmqpConsumerError::new(format!("ack failed: {err}")))
    }

    async fn nack(
        &mut self,
        delivery_tag: u64,
        requeue: bool,
    ) -> StdResult<(), AmqpConsumerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|err| AmqpConsumerError::new(format!("nack failed: {err}")))
    }
}

struct AmqpTriggerInstance<S>
where
    S: AmqpConsumerStream + Send,
{
    route: String,
    endpoint: String,
    queue: String,
    consumer: S,
    retry: RetrySettings,
}

impl<S> AmqpTriggerInstance<S>
where
    S: AmqpConsumerStream + Send,
{
    async fn run(self, engine: Arc<RouteEngine>, shutdown: CancellationToken) {
        let retry = self.retry.clone();
        let mut context = AmqpRetryContext {
            instance: self,
            engine,
        };

        run_retry_loop(shutdown, retry, Duration::from_millis(50), &mut context).await;
    }

    async fn handle_delivery(&mut self, engine: &Arc<RouteEngine>, delivery: AmqpDelivery) {
        let counters = metrics();
        counters.trigger_started("amqp");

        let bridge_message =
            BridgeMessage::new(&self.endpoint, Vec::new(), delivery.payload.clone())
                .with_trace_id(Uuid::new_v4().to_string())
                .with_route(&self.route)
                .with_metadata("exchange", &delivery.exchange)
                .with_metadata("routing_key", &delivery.routing_key)
                .with_metadata("redelivered", delivery.redelivered.to_string());

        match engine.execute(&self.route, bridge_message).await {
            Ok(_) => {
                if let Err(err) = self.consumer.ack(delivery.delivery_tag).await {
                    crate::bridge_event!(
                        error,
                        "databridge::amqp",
                        "ack_failed",
                        endpoint = self.endpoint.as_str(),
                        route = self.route.as_str(),
                        queue = self.queue,
                        error = err,
                    );
                }
            }
            Err(err) => {
                crate::bridge_event!(
                    error,
                    "databridge::amqp",
                    "trigger_failed",
                    endpoint = self.endpoint.as_str(),
                    route = self.route.as_str(),
                    queue = self.queue,
                    error = err,
                );
                // requeue only on first delivery, drop on repeat failures
                let requeue = !delivery.redelivered;
                if let Err(nack_err) = self.consumer.nack(delivery.delivery_tag, requeue).await {
                    crate::bridge_event!(
                        error,
                        "databridge::amqp",
                        "nack_failed",
                        endpoint = self.endpoint.as_str(),
                        route = self.route.as_str(),
                        queue = self.queue,
                        error = nack_err,
                    );
                }
            }
        }

        counters.trigger_finished("amqp");
    }
}

struct AmqpRetryContext<S>
where
    S: AmqpConsumerStream + Send,
{
    instance: AmqpTriggerInstance<S>,
    engine: Arc<RouteEngine>,
}

#[async_trait]
impl<S> RetryContext for AmqpRetryContext<S>
where
    S: AmqpConsumerStream + Send,
{
    type Item = AmqpDelivery;
    type Error = AmqpConsumerError;

    async fn poll(&mut self) -> StdResult<Option<Self::Item>, Self::Error> {
        self.instance.consumer.next_delivery().await
    }

    async fn handle_item(&mut self, delivery: Self::Item) {
        self.instance.handle_delivery(&self.engine, delivery).await;
    }

    async fn report_error(&mut self, error: &Self::Error, delay: Duration) {
        crate::bridge_event!(
            warn,
            "databridge::amqp",
            "consumer_receive_failed",
            endpoint = self.instance.endpoint.as_str(),
            route = self.instance.route.as_str(),
            queue = self.instance.queue,
            error = error,
            backoff_ms = delay.as_millis(),
        );
    }
}

#[derive(Debug, Clone)]
pub struct AmqpConsumerError {
    message: String,
}

impl AmqpConsumerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AmqpConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AmqpConsumerError {}

#[derive(Debug, Error)]
pub enum AmqpTriggerError {
    #[error("amqp route `{route}` has no source endpoint")]
    MissingEndpoint { route: String },
    #[error("amqp route `{route}` references unknown endpoint `{endpoint}`")]
    UnknownEndpoint { route: String, endpoint: String },
    #[error("amqp route `{route}` is missing the `queue` option")]
    MissingQueue { route: String },
    #[error("amqp route `{route}` consumer failed to build: {reason}")]
    ConsumerBuild { route: String, reason: String },
}

#[async_trait]
impl<S> TransportRuntime for AmqpTriggerRuntime<S>
where
    S: AmqpConsumerStream + Send,
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
