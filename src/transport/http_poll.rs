//! Polling trigger for HTTP endpoints. Each http-poll route owns a poller
//! that fetches on an interval and feeds the response through the engine.

use crate::config::bridge::SourceKind;
use crate::domain::BridgeMessage;
use crate::endpoint::EndpointFactory;
use crate::metrics::metrics;
use crate::retry::{RetryBackoff, RetrySettings};
use crate::route::engine::RouteEngine;
use crate::transport::{
    sleep_with_shutdown, TaskTransportRuntime, TransportHealth, TransportKind, TransportRun,
    TransportRuntime,
};
use async_trait::async_trait;
use humantime::parse_duration;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::future::Future;
use std::marker::PhantomData;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct HttpPollTriggerRuntime<P>
where
    P: HttpPoller,
{
    inner: TaskTransportRuntime,
    poller_count: usize,
    _marker: PhantomData<P>,
}

impl HttpPollTriggerRuntime<ReqwestHttpPoller> {
    pub async fn build(
        engine: Arc<RouteEngine>,
        factory: Arc<EndpointFactory>,
    ) -> Result<Self, HttpPollTriggerError> {
        Self::build_with(engine, |config| {
            let factory = Arc::clone(&factory);
            async move { ReqwestHttpPoller::connect(config, &factory) }
        })
        .await
    }
}

impl<P> HttpPollTriggerRuntime<P>
where
    P: HttpPoller,
{
    pub async fn build_with<F, Fut>(
        engine: Arc<RouteEngine>,
        mut make_poller: F,
    ) -> Result<Self, HttpPollTriggerError>
    where
        F: FnMut(HttpPollerConfig) -> Fut,
        Fut: Future<Output = StdResult<P, HttpPollerError>>,
    {
        let mut instances = Vec::new();

        for plan in engine.plans_for_source(SourceKind::HttpPoll) {
            let config = HttpPollerConfig::from_plan(&plan.name, &plan.source)?;
            let interval = config.interval;
            let retry = RetrySettings::from_extras(&plan.source.options, &JsonMap::new());

            let poller = make_poller(config.clone()).await.map_err(|err| {
                HttpPollTriggerError::PollerBuild {
                    route: plan.name.clone(),
                    reason: err.to_string(),
                }
            })?;

            instances.push(HttpPollInstance {
                route: plan.name.clone(),
                endpoint: config.endpoint,
                interval,
                poller,
                backoff: RetryBackoff::new(retry),
            });
        }

        let poller_count = instances.len();
        let engine_shared = Arc::clone(&engine);
        let inner =
            TaskTransportRuntime::new(TransportKind::HttpPollIn, "http-poll", move |shutdown| {
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
            poller_count,
            _marker: PhantomData,
        })
    }

    pub fn poller_count(&self) -> usize {
        self.poller_count
    }
}

#[async_trait]
pub trait HttpPoller: Send + Sync + 'static {
    async fn poll(&mut self) -> StdResult<PolledResponse, HttpPollerError>;
}

#[derive(Debug, Clone)]
pub struct PolledResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct HttpPollerConfig {
    pub route: String,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub interval: Duration,
}

impl HttpPollerConfig {
    pub(crate) fn from_plan(
        route: &str,
        source: &crate::route::engine::SourcePlan,
    ) -> Result<Self, HttpPollTriggerError> {
        let endpoint =
            source
                .endpoint
                .clone()
                .ok_or_else(|| HttpPollTriggerError::MissingEndpoint {
                    route: route.to_string(),
                })?;
        let raw_interval = source
            .options
            .get("interval")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| HttpPollTriggerError::MissingInterval {
                route: route.to_string(),
            })?;
        let interval = parse_duration(raw_interval).map_err(|source| {
            HttpPollTriggerError::InvalidInterval {
                route: route.to_string(),
                value: raw_interval.to_string(),
                source,
            }
        })?;

        Ok(Self {
            route: route.to_string(),
            endpoint,
            method: source
                .options
                .get("method")
                .and_then(JsonValue::as_str)
                .unwrap_or("GET")
                .to_ascii_uppercase(),
            path: source
                .options
                .get("path")
                .and_then(JsonValue::as_str)
                .unwrap_or("/")
                .to_string(),
            interval,
        })
    }
}

pub struct ReqwestHttpPoller {
    handle: Arc<crate::endpoint::factory::HttpClientHandle>,
    method: reqwest::Method,
    url: String,
}

impl ReqwestHttpPoller {
    pub fn connect(
        config: HttpPollerConfig,
        factory: &EndpointFactory,
    ) -> StdResult<Self, HttpPollerError> {
        let handle = factory
            .http_client(&config.endpoint)
            .map_err(|err| HttpPollerError::new(err.to_string()))?;
        let method = reqwest::Method::from_bytes(config.method.as_bytes())
            .map_err(|_| HttpPollerError::new(format!("invalid method `{}`", config.method)))?;
        let url = format!(
            "{}/{}",
            handle.base_url().trim_end_matches('/'),
            config.path.trim_start_matches('/')
        );

        Ok(Self {
            handle,
            method,
            url,
        })
    }
}

#[async_trait]
impl HttpPoller for ReqwestHttpPoller {
    async fn poll(&mut self) -> StdResult<PolledResponse, HttpPollerError> {
        let response = self
            .handle
            .client()
            .request(self.method.clone(), &self.url)
            .send()
            .await
            .map_err(|err| HttpPollerError::new(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpPollerError::new(format!(
                "poll returned status {status}"
            )));
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| HttpPollerError::new(err.to_string()))?
            .to_vec();

        Ok(PolledResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

struct HttpPollInstance<P>
where
    P: HttpPoller,
{
    route: String,
    endpoint: String,
    interval: Duration,
    poller: P,
    backoff: RetryBackoff,
}

impl<P> HttpPollInstance<P>
where
    P: HttpPoller,
{
    async fn run(mut self, engine: Arc<RouteEngine>, shutdown: CancellationToken) {
        loop {
            if sleep_with_shutdown(self.interval, &shutdown).await {
                break;
            }

            match self.poller.poll().await {
                Ok(response) => {
                    self.backoff.on_success();
                    self.handle_response(&engine, response).await;
                }
                Err(err) => {
                    let delay = self.backoff.on_failure();
                    crate::bridge_event!(
                        warn,
                        "databridge::http_poll",
                        "poll_failed",
                        endpoint = self.endpoint.as_str(),
                        route = self.route.as_str(),
                        error = err,
                        backoff_ms = delay.as_millis(),
                    );
                    if sleep_with_shutdown(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_response(&self, engine: &Arc<RouteEngine>, response: PolledResponse) {
        let counters = metrics();
        counters.trigger_started("http-poll");

        let message = BridgeMessage::new(&self.endpoint, response.headers, response.body)
            .with_trace_id(Uuid::new_v4().to_string())
            .with_route(&self.route)
            .with_metadata("status", response.status.to_string());

        if let Err(err) = engine.execute(&self.route, message).await {
            crate::bridge_event!(
                error,
                "databridge::http_poll",
                "poll_route_failed",
                endpoint = self.endpoint.as_str(),
                route = self.route.as_str(),
                error = err,
            );
        }

        counters.trigger_finished("http-poll");
    }
}

#[derive(Debug, Clone)]
pub struct HttpPollerError {
    message: String,
}

impl HttpPollerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HttpPollerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpPollerError {}

#[derive(Debug, Error)]
pub enum HttpPollTriggerError {
    #[error("http-poll route `{route}` has no source endpoint")]
    MissingEndpoint { route: String },
    #[error("http-poll route `{route}` is missing the `interval` option")]
    MissingInterval { route: String },
    #[error("http-poll route `{route}` has invalid interval `{value}`: {source}")]
    InvalidInterval {
        route: String,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("http-poll route `{route}` poller failed to build: {reason}")]
    PollerBuild { route: String, reason: String },
}

#[async_trait]
impl<P> TransportRuntime for HttpPollTriggerRuntime<P>
where
    P: HttpPoller,
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
