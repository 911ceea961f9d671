use crate::backpressure::BackpressureManager;
use crate::config::{EndpointFlags, ServiceConfig};
use crate::endpoint::{EndpointFactory, EndpointRegistry};
use crate::error::{Context, Result};
use crate::route::dispatcher::EndpointDispatcher;
use crate::route::engine::RouteEngine;
use crate::transport::http_poll::HttpPollTriggerRuntime;
use crate::transport::prometheus::PrometheusTriggerRuntime;
use crate::transport::timer::TimerTriggerRuntime;
use crate::transport::{TransportRun, TransportRuntime};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

#[cfg(feature = "http-in")]
use crate::transport::http_server::HttpServerRuntime;
#[cfg(feature = "kafka")]
use crate::transport::kafka::KafkaTriggerRuntime;
#[cfg(feature = "mqtt")]
use crate::transport::mqtt::MqttTriggerRuntime;

pub fn should_start_mqtt_runtime(flags: &EndpointFlags, registry: &EndpointRegistry) -> bool {
    flags.mqtt && registry.has_mqtt_endpoints()
}

pub fn should_start_kafka_runtime(flags: &EndpointFlags, registry: &EndpointRegistry) -> bool {
    flags.kafka && registry.has_kafka_endpoints()
}

pub fn should_start_amqp_runtime(flags: &EndpointFlags, registry: &EndpointRegistry) -> bool {
    flags.amqp && registry.has_amqp_endpoints()
}

pub fn should_start_http_server_runtime(
    flags: &EndpointFlags,
    registry: &EndpointRegistry,
) -> bool {
    flags.http_server && registry.has_http_server_endpoints()
}

pub struct DataBridgeApp {
    transports: Vec<Box<dyn TransportRuntime>>,
    drain_timeout: Duration,
    shutdown: tokio_util::sync::CancellationToken,
}

impl DataBridgeApp {
    pub async fn initialise(
        service: ServiceConfig,
        bridge_path: Option<String>,
    ) -> Result<Self> {
        let bridge_path = bridge_path.or_else(|| service.bridge_config_path.clone());
        let bridge = match bridge_path.as_deref() {
            Some(path) if !path.trim().is_empty() => {
                crate::config::BridgeConfig::from_path(path)
                    .with_context(|| format!("failed to load bridge config from {path}"))?
            }
            _ => crate::config::BridgeConfig::from_default_path()
                .context("failed to load bridge config from default path")?,
        };

        let flags = service.endpoint_flags.clone();
        let shutdown = tokio_util::sync::CancellationToken::new();
        let registry = Arc::new(
            EndpointRegistry::build(&bridge).context("failed to construct endpoint registry")?,
        );
        let factory = Arc::new(EndpointFactory::new(
            Arc::clone(&registry),
            shutdown.child_token(),
        ));
        let dispatcher = Arc::new(EndpointDispatcher::new(Arc::clone(&factory)));
        let engine = Arc::new(
            RouteEngine::build(&bridge, dispatcher)
                .context("failed to construct route engine")?,
        );
        let backpressure = BackpressureManager::new(&service.backpressure, Some(&bridge.app));

        let mut transports: Vec<Box<dyn TransportRuntime>> = Vec::new();

        let timer_runtime = TimerTriggerRuntime::build(Arc::clone(&engine))
            .context("failed to construct timer trigger runtime")?;
        if timer_runtime.timer_count() > 0 {
            transports.push(Box::new(timer_runtime));
        }

        let poll_runtime =
            HttpPollTriggerRuntime::build(Arc::clone(&engine), Arc::clone(&factory))
                .await
                .context("failed to construct http poll trigger runtime")?;
        if poll_runtime.poller_count() > 0 {
            transports.push(Box::new(poll_runtime));
        }

        let scrape_runtime =
            PrometheusTriggerRuntime::build(Arc::clone(&engine), Arc::clone(&factory))
                .await
                .context("failed to construct prometheus trigger runtime")?;
        if scrape_runtime.scraper_count() > 0 {
            transports.push(Box::new(scrape_runtime));
        }

        if should_start_mqtt_runtime(&flags, registry.as_ref()) {
            #[cfg(feature = "mqtt")]
            {
                let runtime =
                    MqttTriggerRuntime::build(Arc::clone(&engine), Arc::clone(&registry))
                        .await
                        .context("failed to construct mqtt trigger runtime")?;
                if runtime.subscriber_count() > 0 {
                    transports.push(Box::new(runtime));
                }
            }
            #[cfg(not(feature = "mqtt"))]
            {
                tracing::info!("mqtt trigger runtime skipped (feature `mqtt` disabled)");
            }
        } else if !flags.mqtt && registry.has_mqtt_endpoints() {
            tracing::info!("mqtt endpoints disabled via configuration; trigger runtime skipped");
        }

        if should_start_kafka_runtime(&flags, registry.as_ref()) {
            #[cfg(feature = "kafka")]
            {
                let runtime =
                    KafkaTriggerRuntime::build(Arc::clone(&engine), Arc::clone(&registry))
                        .await
                        .context("failed to construct kafka trigger runtime")?;
                if runtime.consumer_count() > 0 {
                    transports.push(Box::new(runtime));
                }
            }
            #[cfg(not(feature = "kafka"))]
            {
                tracing::info!("kafka trigger runtime skipped (feature `kafka` disabled)");
            }
        } else if !flags.kafka && registry.has_kafka_endpoints() {
            tracing::info!("kafka endpoints disabled via configuration; trigger runtime skipped");
        }

        if should_start_amqp_runtime(&flags, registry.as_ref()) {
            #[cfg(feature = "amqp")]
            {
                let runtime = crate::transport::amqp::AmqpTriggerRuntime::build(
                    Arc::clone(&engine),
                    Arc::clone(&registry),
                )
                .await
                .context("failed to construct amqp trigger runtime")?;
                if runtime.consumer_count() > 0 {
                    transports.push(Box::new(runtime));
                }
            }
            #[cfg(not(feature = "amqp"))]
            {
                tracing::info!("amqp trigger runtime skipped (feature `amqp` disabled)");
            }
        } else if !flags.amqp && registry.has_amqp_endpoints() {
            tracing::info!("amqp endpoints disabled via configuration; trigger runtime skipped");
        }

        if should_start_http_server_runtime(&flags, registry.as_ref()) {
            #[cfg(feature = "http-in")]
            {
                let runtime = HttpServerRuntime::build(
                    Arc::clone(&engine),
                    Arc::clone(&registry),
                    backpressure.http.clone(),
                )
                .context("failed to construct http server runtime")?;
                if runtime.server_count() > 0 {
                    transports.push(Box::new(runtime));
                }
            }
            #[cfg(not(feature = "http-in"))]
            {
                tracing::info!("http server runtime skipped (feature `http-in` disabled)");
            }
        } else if !flags.http_server && registry.has_http_server_endpoints() {
            tracing::info!(
                "http server endpoints disabled via configuration; ingress runtime skipped"
            );
        }

        tracing::info!(
            endpoint_count = bridge.endpoints.len(),
            route_count = bridge.routes.len(),
            transport_count = transports.len(),
            "bridge configuration loaded"
        );

        Ok(Self {
            transports,
            drain_timeout: bridge.app.drain_timeout,
            shutdown,
        })
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            mut transports,
            drain_timeout,
            shutdown,
        } = self;

        let mut transport_runs: Vec<TransportRun> = Vec::new();
        for handle in transports.iter_mut() {
            handle.prepare().await?;
            handle.start(shutdown.clone()).await?;
            transport_runs.push(handle.run());
        }

        let mut transport_tasks = JoinSet::new();
        for run in transport_runs {
            let kind = run.kind();
            let name = run.name();
            transport_tasks.spawn(async move {
                match run.wait().await {
                    Ok(()) => {
                        tracing::info!(transport = %kind, name = name, "transport runtime stopped");
                        Ok(())
                    }
                    Err(err) => {
                        tracing::error!(
                            transport = %kind,
                            name = name,
                            error = %err,
                            "transport runtime terminated with error"
                        );
                        Err(err)
                    }
                }
            });
        }

        tracing::info!("databridge ready; press Ctrl+C to stop");

        tokio::select! {
            res = transport_tasks.join_next(), if !transport_tasks.is_empty() => {
                if let Some(res) = res {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => return Err(err),
                        Err(join_err) => {
                            return Err(crate::err!(
                                "transport runtime supervisor join error: {join_err}"
                            ))
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            }
        }

        shutdown.cancel();
        let hard_stop = Duration::from_secs(5);

        let graceful_shutdown = async {
            for handle in transports.iter_mut() {
                if let Err(err) = handle.shutdown().await {
                    tracing::warn!(
                        transport = %handle.kind(),
                        name = handle.name(),
                        error = %err,
                        "failed to shutdown transport gracefully"
                    );
                }
            }

            while let Some(res) = transport_tasks.join_next().await {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => {
                        tracing::warn!(error = %join_err, "transport monitor task cancelled");
                    }
                }
            }

            Ok::<(), crate::error::Error>(())
        };

        match timeout(drain_timeout, graceful_shutdown).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    timeout_secs = drain_timeout.as_secs_f64(),
                    "graceful shutdown exceeded app.drain_timeout; forcing exit after hard stop"
                );
                transport_tasks.shutdown().await;
                sleep(hard_stop).await;
                Err(crate::err!(
                    "graceful shutdown timed out after {:?}",
                    drain_timeout
                ))
            }
        }
    }
}
