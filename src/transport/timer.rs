//! Interval-driven trigger. Each timer route fires on its own cadence and
//! pushes a synthetic message through the engine.

use crate::config::bridge::SourceKind;
use crate::domain::BridgeMessage;
use crate::route::engine::RouteEngine;
use crate::transport::{
    sleep_with_shutdown, TaskTransportRuntime, TransportHealth, TransportKind, TransportRun,
    TransportRuntime,
};
use chrono::{SecondsFormat, Utc};
use humantime::parse_duration;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub struct TimerTriggerRuntime {
    inner: TaskTransportRuntime,
    timer_count: usize,
}

struct TimerInstance {
    route: String,
    interval: Duration,
    payload: Option<JsonValue>,
}

impl TimerTriggerRuntime {
    pub fn build(engine: Arc<RouteEngine>) -> Result<Self, TimerTriggerError> {
        let mut timers = Vec::new();
        for plan in engine.plans_for_source(SourceKind::Timer) {
            let raw_interval = plan
                .source
                .options
                .get("interval")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| TimerTriggerError::MissingInterval {
                    route: plan.name.clone(),
                })?;
            let interval = parse_duration(raw_interval).map_err(|source| {
                TimerTriggerError::InvalidInterval {
                    route: plan.name.clone(),
                    value: raw_interval.to_string(),
                    source,
                }
            })?;

            timers.push(TimerInstance {
                route: plan.name.clone(),
                interval,
                payload: plan.source.options.get("payload").cloned(),
            });
        }

        let timer_count = timers.len();
        let inner = TaskTransportRuntime::new(TransportKind::Timer, "timer", move |shutdown| {
            timers
                .into_iter()
                .map(|timer| {
                    let engine = Arc::clone(&engine);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        timer.run(engine, shutdown).await;
                    })
                })
                .collect()
        });

        Ok(Self { inner, timer_count })
    }

    pub fn timer_count(&self) -> usize {
        self.timer_count
    }
}

#[async_trait::async_trait]
impl TransportRuntime for TimerTriggerRuntime {
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

    async fn start(
        &mut self,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> crate::error::Result<()> {
        self.inner.start(shutdown).await
    }

    fn run(&mut self) -> TransportRun {
        self.inner.run()
    }

    async fn shutdown(&mut self) -> crate::error::Result<()> {
        self.inner.shutdown().await
    }
}

impl TimerInstance {
    async fn run(self, engine: Arc<RouteEngine>, shutdown: tokio_util::sync::CancellationToken) {
        loop {
            if sleep_with_shutdown(self.interval, &shutdown).await {
                break;
            }

            let body = match &self.payload {
                Some(payload) => payload.clone(),
                None => json!({
                    "fired_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                }),
            };
            let message = BridgeMessage::new("timer", Vec::new(), body.to_string().into_bytes())
                .with_trace_id(Uuid::new_v4().to_string())
                .with_route(&self.route);

            crate::bridge_event!(
                debug,
                "databridge::timer",
                "timer_fired",
                endpoint = "timer",
                route = self.route.as_str(),
            );

            if let Err(err) = engine.execute(&self.route, message).await {
                crate::bridge_event!(
                    error,
                    "databridge::timer",
                    "timer_route_failed",
                    endpoint = "timer",
                    route = self.route.as_str(),
                    error = err,
                );
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TimerTriggerError {
    #[error("timer route `{route}` is missing the `interval` option")]
    MissingInterval { route: String },
    #[error("timer route `{route}` has invalid interval `{value}`: {source}")]
    InvalidInterval {
        route: String,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}
