mod support;

use crate::support::mocks::RecordingDispatcher;
use async_trait::async_trait;
use databridge::config::BridgeConfig;
use databridge::route::engine::RouteEngine;
use databridge::transport::http_poll::{
    HttpPollTriggerRuntime, HttpPoller, HttpPollerError, PolledResponse,
};
use databridge::transport::prometheus::PrometheusTriggerRuntime;
use databridge::transport::timer::TimerTriggerRuntime;
use databridge::transport::TransportRuntime;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn engine_for(raw: serde_json::Value, dispatcher: RecordingDispatcher) -> Arc<RouteEngine> {
    let config = BridgeConfig::from_json_str(&raw.to_string()).expect("valid config");
    Arc::new(RouteEngine::build(&config, Arc::new(dispatcher)).expect("engine"))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

struct CannedPoller {
    response: PolledResponse,
}

#[async_trait]
impl HttpPoller for CannedPoller {
    async fn poll(&mut self) -> Result<PolledResponse, HttpPollerError> {
        Ok(self.response.clone())
    }
}

#[tokio::test]
async fn timer_route_fires_until_cancelled() {
    let dispatcher = RecordingDispatcher::new();
    let engine = engine_for(
        json!({
            "api_version": "v1",
            "app": {"feature_flags": ["kafka"], "retry_budget": {"max_attempts": 1}},
            "endpoints": [
                {"name": "lake", "kind": "kafka", "options": {"brokers": ["localhost:9092"]}}
            ],
            "routes": [{
                "name": "tick",
                "source": {"kind": "timer", "options": {"interval": "25ms", "payload": {"status": "alive"}}},
                "sinks": [{"endpoint": "lake", "options": {"topic": "ticks"}}]
            }]
        }),
        dispatcher.clone(),
    );

    let mut runtime = TimerTriggerRuntime::build(engine).expect("runtime builds");
    assert_eq!(runtime.timer_count(), 1);

    let shutdown = CancellationToken::new();
    runtime.prepare().await.expect("prepare");
    runtime.start(shutdown.clone()).await.expect("start");
    let waiter = tokio::spawn(runtime.run().wait());

    wait_until(|| dispatcher.dispatched_to("lake") >= 2).await;

    shutdown.cancel();
    waiter.await.expect("join").expect("runtime stops");
    runtime.shutdown().await.expect("shutdown");

    let actions = dispatcher.actions();
    assert!(actions
        .iter()
        .all(|(_, payload)| payload.pointer("/body/status") == Some(&json!("alive"))));
}

#[tokio::test]
async fn http_poll_route_feeds_responses_through_engine() {
    let dispatcher = RecordingDispatcher::new();
    let engine = engine_for(
        json!({
            "api_version": "v1",
            "app": {"feature_flags": ["kafka"], "retry_budget": {"max_attempts": 1}},
            "endpoints": [
                {"name": "lake", "kind": "kafka", "options": {"brokers": ["localhost:9092"]}},
                {"name": "api", "kind": "http-client", "options": {"base_url": "http://localhost:1"}}
            ],
            "routes": [{
                "name": "poll",
                "source": {"endpoint": "api", "options": {"interval": "25ms", "path": "/data"}},
                "sinks": [{"endpoint": "lake", "options": {"topic": "polled"}}]
            }]
        }),
        dispatcher.clone(),
    );

    let mut runtime = HttpPollTriggerRuntime::build_with(engine, |_config| async move {
        Ok(CannedPoller {
            response: PolledResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: json!({"ok": true}).to_string().into_bytes(),
            },
        })
    })
    .await
    .expect("runtime builds");
    assert_eq!(runtime.poller_count(), 1);

    let shutdown = CancellationToken::new();
    runtime.prepare().await.expect("prepare");
    runtime.start(shutdown.clone()).await.expect("start");
    let waiter = tokio::spawn(runtime.run().wait());

    wait_until(|| dispatcher.dispatched_to("lake") >= 1).await;

    shutdown.cancel();
    waiter.await.expect("join").expect("runtime stops");

    let actions = dispatcher.actions();
    let payload = &actions[0].1;
    assert_eq!(payload.pointer("/body/ok"), Some(&json!(true)));
    assert_eq!(payload.pointer("/metadata/status"), Some(&json!("200")));
}

#[tokio::test]
async fn prometheus_route_emits_parsed_samples() {
    let dispatcher = RecordingDispatcher::new();
    let engine = engine_for(
        json!({
            "api_version": "v1",
            "app": {"feature_flags": ["kafka"], "retry_budget": {"max_attempts": 1}},
            "endpoints": [
                {"name": "lake", "kind": "kafka", "options": {"brokers": ["localhost:9092"]}},
                {"name": "edge", "kind": "http-client", "options": {"base_url": "http://localhost:1"}}
            ],
            "routes": [{
                "name": "scrape",
                "source": {"kind": "prometheus", "endpoint": "edge", "options": {"interval": "25ms"}},
                "sinks": [{"endpoint": "lake", "options": {"topic": "metrics"}}]
            }]
        }),
        dispatcher.clone(),
    );

    let text = "# HELP boiler_temperature Boiler temperature in celsius\n\
                boiler_temperature{zone=\"north\"} 81.5\n";
    let mut runtime = PrometheusTriggerRuntime::build_with(engine, move |_config| {
        let body = text.as_bytes().to_vec();
        async move {
            Ok(CannedPoller {
                response: PolledResponse {
                    status: 200,
                    headers: Vec::new(),
                    body,
                },
            })
        }
    })
    .await
    .expect("runtime builds");
    assert_eq!(runtime.scraper_count(), 1);

    let shutdown = CancellationToken::new();
    runtime.prepare().await.expect("prepare");
    runtime.start(shutdown.clone()).await.expect("start");
    let waiter = tokio::spawn(runtime.run().wait());

    wait_until(|| dispatcher.dispatched_to("lake") >= 1).await;

    shutdown.cancel();
    waiter.await.expect("join").expect("runtime stops");

    let actions = dispatcher.actions();
    let payload = &actions[0].1;
    assert_eq!(
        payload.pointer("/body/samples/0/name"),
        Some(&json!("boiler_temperature"))
    );
    assert_eq!(
        payload.pointer("/body/samples/0/labels/zone"),
        Some(&json!("north"))
    );
    assert_eq!(
        payload.pointer("/body/samples/0/value"),
        Some(&json!(81.5))
    );
}
