//! MQTT subscription trigger. One subscriber per mqtt route; messages are
//! acked only after the engine finishes with them when QoS > 0.

use crate::config::bridge::SourceKind;
use crate::domain::BridgeMessage;
use crate::endpoint::registry::MqttEndpoint;
use crate::endpoint::EndpointRegistry;
use crate::metrics::metrics;
use crate::retry::{run_retry_loop, RetryContext, RetrySettings};
use crate::route::engine::RouteEngine;
use crate::transport::{
    TaskTransportRuntime, TransportHealth, TransportKind, TransportRun, TransportRuntime,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

pub struct MqttTriggerRuntime<S>
where
    S: MqttSubscriber + Send,
{
    inner: TaskTransportRuntime,
    subscriber_count: usize,
    _marker: PhantomData<S>,
}

impl MqttTriggerRuntime<RumqttcMqttSubscriber> {
    pub async fn build(
        engine: Arc<RouteEngine>,
        registry: Arc<EndpointRegistry>,
    ) -> Result<Self, MqttTriggerError> {
        Self::build_with(engine, registry, |config| async move {
            RumqttcMqttSubscriber::connect(config).await
        })
        .await
    }
}

impl<S> MqttTriggerRuntime<S>
where
    S: MqttSubscriber + Send,
{
    pub async fn build_with<F, Fut>(
        engine: Arc<RouteEngine>,
        registry: Arc<EndpointRegistry>,
        mut make_subscriber: F,
    ) -> Result<Self, MqttTriggerError>
    where
        F: FnMut(MqttSubscriberConfig) -> Fut,
        Fut: Future<Output = StdResult<S, MqttSubscriberError>>,
    {
        let mut instances = Vec::new();

        for plan in engine.plans_for_source(SourceKind::Mqtt) {
            let endpoint_name = plan.source.endpoint.clone().ok_or_else(|| {
                MqttTriggerError::MissingEndpoint {
                    route: plan.name.clone(),
                }
            })?;
            let endpoint = registry.mqtt(&endpoint_name).cloned().ok_or_else(|| {
                MqttTriggerError::UnknownEndpoint {
                    route: plan.name.clone(),
                    endpoint: endpoint_name.clone(),
                }
            })?;

            let topic = plan
                .source
                .options
                .get("topic")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| MqttTriggerError::MissingTopic {
                    route: plan.name.clone(),
                })?
                .to_string();
            let qos = plan
                .source
                .options
                .get("qos")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0);
            if qos > 2 {
                return Err(MqttTriggerError::InvalidQos {
                    route: plan.name.clone(),
                    qos,
                });
            }

            let config = MqttSubscriberConfig::new(&plan.name, &endpoint, &topic, qos as u8);
            let config = MqttSubscriberConfig {
                retry: RetrySettings::from_extras(&plan.source.options, &endpoint.extra),
                ..config
            };
            let retry = config.retry.clone();

            let mut subscriber = make_subscriber(config).await.map_err(|err| {
                MqttTriggerError::SubscriberBuild {
                    route: plan.name.clone(),
                    reason: err.to_string(),
                }
            })?;

            subscriber
                .subscribe(&topic, qos as u8)
                .await
                .map_err(|err| MqttTriggerError::Subscribe {
                    route: plan.name.clone(),
                    topic: topic.clone(),
                    reason: err.to_string(),
                })?;

            instances.push(MqttTriggerInstance {
                route: plan.name.clone(),
                endpoint: endpoint_name,
                topic,
                qos: qos as u8,
                subscriber,
                retry,
                disconnected: false,
            });
        }

        let subscriber_count = instances.len();
        let engine_shared = Arc::clone(&engine);
        let inner = TaskTransportRuntime::new(TransportKind::MqttIn, "mqtt", move |shutdown| {
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
            subscriber_count,
            _marker: PhantomData,
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }
}

#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub packet_id: Option<u16>,
}

#[async_trait]
pub trait MqttSubscriber: Send + 'static {
    async fn subscribe(&mut self, topic: &str, qos: u8) -> StdResult<(), MqttSubscriberError>;

    async fn next_message(&mut self) -> StdResult<Option<MqttMessage>, MqttSubscriberError>;

    async fn ack(&mut self, _packet_id: Option<u16>) -> StdResult<(), MqttSubscriberError> {
        Ok(())
    }

    async fn reconnect(&mut self) -> StdResult<(), MqttSubscriberError> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MqttSubscriberConfig {
    pub route: String,
    pub endpoint: String,
    pub url: String,
    pub topic: String,
    pub qos: u8,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Option<Duration>,
    pub clean_session: bool,
    pub(crate) retry: RetrySettings,
}

impl MqttSubscriberConfig {
    fn new(route: &str, endpoint: &MqttEndpoint, topic: &str, qos: u8) -> Self {
        Self {
            route: route.to_string(),
            endpoint: endpoint.name.clone(),
            url: endpoint.url.clone(),
            topic: topic.to_string(),
            qos,
            client_id: endpoint.client_id.clone(),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            keep_alive: endpoint.keep_alive,
            clean_session: endpoint.clean_session,
            retry: RetrySettings::from_extras(&serde_json::Map::new(), &endpoint.extra),
        }
    }
}

pub struct RumqttcMqttSubscriber {
    config: MqttSubscriberConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    pending: HashMap<u16, Publish>,
}

impl RumqttcMqttSubscriber {
    pub async fn connect(config: MqttSubscriberConfig) -> StdResult<Self, MqttSubscriberError> {
        let manual_acks = config.qos > 0;
        let options = build_mqtt_options(&config, manual_acks)?;
        let (client, eventloop) = AsyncClient::new(options, 10);

        Ok(Self {
            config,
            client,
            eventloop,
            pending: HashMap::new(),
        })
    }
}

#[async_trait]
impl MqttSubscriber for RumqttcMqttSubscriber {
    async fn subscribe(&mut self, topic: &str, qos: u8) -> StdResult<(), MqttSubscriberError> {
        let qos = qos_from_u8(qos)?;
        self.client
            .subscribe(topic.to_string(), qos)
            .await
            .map_err(|err| {
                MqttSubscriberError::new(format!("failed to subscribe to `{topic}`: {err}"))
            })
    }

    async fn next_message(&mut self) -> StdResult<Option<MqttMessage>, MqttSubscriberError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let packet_id = match publish.qos {
                        QoS::AtMostOnce => None,
                        _ => {
                            if publish.pkid != 0 {
                                self.pending.insert(publish.pkid, publish.clone());
                                Some(publish.pkid)
                            } else {
                                None
                            }
                        }
                    };

                    return Ok(Some(MqttMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        qos: publish.qos as u8,
                        retain: publish.retain,
                        packet_id,
                    }));
                }
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => continue,
                Err(err) => {
                    return Err(MqttSubscriberError::new(format!(
                        "mqtt event loop error: {err}"
                    )))
                }
            }
        }
    }

    async fn ack(&mut self, packet_id: Option<u16>) -> StdResult<(), MqttSubscriberError> {
        if let Some(id) = packet_id {
            if let Some(publish) = self.pending.remove(&id) {
                self.client.ack(&publish).await.map_err(|err| {
                    MqttSubscriberError::new(format!("mqtt ack failed for packet {id}: {err}"))
                })?;
            }
        }

        Ok(())
    }

    async fn reconnect(&mut self) -> StdResult<(), MqttSubscriberError> {
        let manual_acks = self.config.qos > 0;
        let options = build_mqtt_options(&self.config, manual_acks)?;
        let (client, eventloop) = AsyncClient::new(options, 10);
        let qos = qos_from_u8(self.config.qos)?;
        client
            .subscribe(self.config.topic.clone(), qos)
            .await
            .map_err(|err| MqttSubscriberError::new(format!("mqtt resubscribe failed: {err}")))?;

        self.client = client;
        self.eventloop = eventloop;
        self.pending.clear();

        Ok(())
    }
}

fn build_mqtt_options(
    config: &MqttSubscriberConfig,
    manual_acks: bool,
) -> StdResult<MqttOptions, MqttSubscriberError> {
    let parsed = Url::parse(&config.url).map_err(|err| {
        MqttSubscriberError::new(format!("invalid mqtt url `{}`: {err}", config.url))
    })?;

    let host = parsed
        .host_str()
        .ok_or_else(|| MqttSubscriberError::new("mqtt url must specify host"))?;
    let port = parsed.port().unwrap_or(1883);

    let client_id = config
        .client_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .map(|id| format!("{id}-{}", config.route))
        .unwrap_or_else(|| format!("databridge-{}", Uuid::new_v4()));

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_clean_session(config.clean_session);

    if let Some(keep_alive) = config.keep_alive {
        options.set_keep_alive(keep_alive);
    }
    if let Some(user) = &config.username {
        options.set_credentials(user, config.password.as_deref().unwrap_or(""));
    }
    options.set_manual_acks(manual_acks);

    Ok(options)
}

fn qos_from_u8(qos: u8) -> StdResult<QoS, MqttSubscriberError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttSubscriberError::new(format!(
            "unsupported mqtt qos `{other}`"
        ))),
    }
}

struct MqttTriggerInstance<S>
where
    S: MqttSubscriber + Send,
{
    route: String,
    endpoint: String,
    topic: String,
    qos: u8,
    subscriber: S,
    retry: RetrySettings,
    disconnected: bool,
}

impl<S> MqttTriggerInstance<S>
where
    S: MqttSubscriber + Send,
{
    fn mark_connected(&mut self) {
        if self.disconnected {
            crate::bridge_event!(
                info,
                "databridge::mqtt",
                "transport_reconnected",
                endpoint = self.endpoint.as_str(),
                route = self.route.as_str(),
                topic = self.topic,
            );
            self.disconnected = false;
        }
    }

    fn mark_disconnected(&mut self, err: &MqttSubscriberError) {
        if !self.disconnected {
            crate::bridge_event!(
                warn,
                "databridge::mqtt",
                "transport_disconnected",
                endpoint = self.endpoint.as_str(),
                route = self.route.as_str(),
                topic = self.topic,
                error = err,
            );
            self.disconnected = true;
        }
    }

    async fn run(self, engine: Arc<RouteEngine>, shutdown: CancellationToken) {
        let retry = self.retry.clone();
        let mut context = MqttRetryContext {
            instance: self,
            engine,
        };

        run_retry_loop(shutdown, retry, Duration::from_millis(50), &mut context).await;
    }

    async fn handle_message(&mut self, engine: &Arc<RouteEngine>, message: MqttMessage) {
        let counters = metrics();
        counters.trigger_started("mqtt");

        let headers = vec![("topic".to_string(), message.topic.clone())];
        let bridge_message = BridgeMessage::new(&self.endpoint, headers, message.payload)
            .with_trace_id(Uuid::new_v4().to_string())
            .with_route(&self.route)
            .with_metadata("topic", &message.topic)
            .with_metadata("retain", message.retain.to_string());

        let packet_id = message.packet_id;
        match engine.execute(&self.route, bridge_message).await {
            Ok(_) => {
                if self.qos > 0 {
                    if let Err(err) = self.subscriber.ack(packet_id).await {
                        crate::bridge_event!(
                            error,
                            "databridge::mqtt",
                            "ack_failed",
                            endpoint = self.endpoint.as_str(),
                            route = self.route.as_str(),
                            topic = self.topic,
                            error = err,
                        );
                    }
                }
            }
            Err(err) => {
                crate::bridge_event!(
                    error,
                    "databridge::mqtt",
                    "trigger_failed",
                    endpoint = self.endpoint.as_str(),
                    route = self.route.as_str(),
                    topic = self.topic,
                    error = err,
                );
            }
        }

        counters.trigger_finished("mqtt");
    }
}

struct MqttRetryContext<S>
where
    S: MqttSubscriber + Send,
{
    instance: MqttTriggerInstance<S>,
    engine: Arc<RouteEngine>,
}

#[async_trait]
impl<S> RetryContext for MqttRetryContext<S>
where
    S: MqttSubscriber + Send,
{
    type Item = MqttMessage;
    type Error = MqttSubscriberError;

    async fn poll(&mut self) -> StdResult<Option<Self::Item>, Self::Error> {
        self.instance.subscriber.next_message().await
    }

    async fn handle_item(&mut self, message: Self::Item) {
        self.instance.mark_connected();
        self.instance.handle_message(&self.engine, message).await;
    }

    async fn report_error(&mut self, error: &Self::Error, _delay: Duration) {
        self.instance.mark_disconnected(error);

        if let Err(reconnect_err) = self.instance.subscriber.reconnect().await {
            crate::bridge_event!(
                error,
                "databridge::mqtt",
                "subscriber_reconnect_failed",
                endpoint = self.instance.endpoint.as_str(),
                route = self.instance.route.as_str(),
                topic = self.instance.topic,
                error = reconnect_err,
            );
        } else if let Err(resub_err) = self
            .instance
            .subscriber
            .subscribe(&self.instance.topic.clone(), self.instance.qos)
            .await
        {
            crate::bridge_event!(
                error,
                "databridge::mqtt",
                "subscriber_resubscribe_failed",
                endpoint = self.instance.endpoint.as_str(),
                route = self.instance.route.as_str(),
                topic = self.instance.topic,
                error = resub_err,
            );
        } else {
            self.instance.mark_connected();
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttSubscriberError {
    message: String,
}

impl MqttSubscriberError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MqttSubscriberError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for MqttSubscriberError {}

#[derive(Debug, Error)]
pub enum MqttTriggerError {
    #[error("mqtt route `{route}` has no source endpoint")]
    MissingEndpoint { route: String },
    #[error("mqtt route `{route}` references unknown endpoint `{endpoint}`")]
    UnknownEndpoint { route: String, endpoint: String },
    #[error("mqtt route `{route}` is missing the `topic` option")]
    MissingTopic { route: String },
    #[error("mqtt route `{route}` has invalid qos {qos}")]
    InvalidQos { route: String, qos: u64 },
    #[error("mqtt route `{route}` subscriber failed to build: {reason}")]
    SubscriberBuild { route: String, reason: String },
    #[error("mqtt route `{route}` failed to subscribe to `{topic}`: {reason}")]
    Subscribe {
        route: String,
        topic: String,
        reason: String,
    },
}

#[async_trait]
impl<S> TransportRuntime for MqttTriggerRuntime<S>
where
    S: MqttSubscriber + Send,
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
