mod support;

use databridge::endpoint::EndpointRegistry;
use databridge::route::engine::RouteEngine;
use databridge::transport::TransportRuntime;
use crate::support::mocks::RecordingDispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fixture_engine(dispatcher: RecordingDispatcher) -> Arc<RouteEngine> {
    let config = support::load_bridge_config();
    Arc::new(RouteEngine::build(&config, Arc::new(dispatcher)).expect("engine"))
}

fn fixture_registry() -> Arc<EndpointRegistry> {
    let config = support::load_bridge_config();
    Arc::new(EndpointRegistry::build(&config).expect("registry"))
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

async fn drive<R: TransportRuntime>(
    runtime: &mut R,
    shutdown: &CancellationToken,
) -> tokio::task::JoinHandle<databridge::error::Result<()>> {
    runtime.prepare().await.expect("prepare");
    runtime.start(shutdown.clone()).await.expect("start");
    let run = runtime.run();
    tokio::spawn(run.wait())
}

#[cfg(feature = "mqtt")]
mod mqtt {
    use super::*;
    use crate::support::mocks::{MqttLog, ScriptedMqttSubscriber};
    use databridge::transport::mqtt::{MqttMessage, MqttTriggerRuntime};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[tokio::test]
    async fn inbound_publish_flows_through_route_and_is_acked() {
        let dispatcher = RecordingDispatcher::new();
        let engine = fixture_engine(dispatcher.clone());
        let registry = fixture_registry();

        let log = Arc::new(Mutex::new(MqttLog::default()));
        let mut scripts: HashMap<String, Vec<MqttMessage>> = HashMap::new();
        scripts.insert(
            "telemetry-to-lake".to_string(),
            vec![MqttMessage {
                topic: "plc/7/state".to_string(),
                payload: json!({"raw": 215}).to_string().into_bytes(),
                qos: 1,
                retain: false,
                packet_id: Some(7),
            }],
        );

        let script_log = Arc::clone(&log);
        let mut runtime = MqttTriggerRuntime::build_with(engine, registry, move |config| {
            let messages = scripts.remove(&config.route).unwrap_or_default();
            let log = Arc::clone(&script_log);
            async move { Ok(ScriptedMqttSubscriber::new(messages, log)) }
        })
        .await
        .expect("runtime builds");
        assert_eq!(runtime.subscriber_count(), 2);

        let shutdown = CancellationToken::new();
        let waiter = drive(&mut runtime, &shutdown).await;

        wait_until(|| dispatcher.dispatched_to("lake-kafka") >= 1).await;
        wait_until(|| !log.lock().unwrap().acked.is_empty()).await;

        shutdown.cancel();
        waiter.await.expect("join").expect("runtime stops");

        let log = log.lock().unwrap();
        assert!(log
            .subscriptions
            .iter()
            .any(|(topic, qos)| topic == "plc/+/state" && *qos == 1));
        assert_eq!(log.acked, vec![Some(7)]);

        let actions = dispatcher.actions();
        assert_eq!(actions[0].1, json!(21.5));
    }
}

#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use crate::support::mocks::ScriptedKafkaConsumer;
    use databridge::transport::kafka::{KafkaInboundMessage, KafkaTriggerRuntime};
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn offsets_are_stored_only_after_route_success() {
        let dispatcher = RecordingDispatcher::new();
        let engine = fixture_engine(dispatcher.clone());
        let registry = fixture_registry();

        let offsets = Arc::new(Mutex::new(Vec::new()));
        let script_offsets = Arc::clone(&offsets);
        let mut runtime = KafkaTriggerRuntime::build_with(engine, registry, move |_config| {
            let offsets = Arc::clone(&script_offsets);
            let messages = vec![KafkaInboundMessage {
                topic: "replay".to_string(),
                partition: 0,
                offset: 42,
                key: None,
                payload: json!({"offset": 41}).to_string().into_bytes(),
                headers: Vec::new(),
            }];
            async move { Ok(ScriptedKafkaConsumer::new(messages, offsets)) }
        })
        .await
        .expect("runtime builds");
        assert_eq!(runtime.consumer_count(), 1);

        let shutdown = CancellationToken::new();
        let waiter = drive(&mut runtime, &shutdown).await;

        wait_until(|| dispatcher.dispatched_to("quality-api") >= 1).await;
        wait_until(|| !offsets.lock().unwrap().is_empty()).await;

        shutdown.cancel();
        waiter.await.expect("join").expect("runtime stops");

        assert_eq!(
            offsets.lock().unwrap().clone(),
            vec![("replay".to_string(), 0, 42)]
        );
    }
}

#[cfg(feature = "amqp")]
mod amqp {
    use super::*;
    use crate::support::mocks::{AmqpLog, ScriptedAmqpConsumer};
    use databridge::transport::amqp::{AmqpDelivery, AmqpTriggerRuntime};
    use serde_json::json;
    use std::sync::Mutex;

    fn delivery(tag: u64, redelivered: bool) -> AmqpDelivery {
        AmqpDelivery {
            exchange: "lab".to_string(),
            routing_key: "results".to_string(),
            payload: json!({"sample": "batch-9"}).to_string().into_bytes(),
            delivery_tag: tag,
            redelivered,
        }
    }

    #[tokio::test]
    async fn successful_delivery_is_acked() {
        let dispatcher = RecordingDispatcher::new();
        let engine = fixture_engine(dispatcher.clone());
        let registry = fixture_registry();

        let log = Arc::new(Mutex::new(AmqpLog::default()));
        let script_log = Arc::clone(&log);
        let mut runtime = AmqpTriggerRuntime::build_with(engine, registry, move |_config| {
            let log = Arc::clone(&script_log);
            async move { Ok(ScriptedAmqpConsumer::new(vec![delivery(11, false)], log)) }
        })
        .await
        .expect("runtime builds");
        assert_eq!(runtime.consumer_count(), 1);

        let shutdown = CancellationToken::new();
        let waiter = drive(&mut runtime, &shutdown).await;

        wait_until(|| !log.lock().unwrap().acked.is_empty()).await;

        shutdown.cancel();
        waiter.await.expect("join").expect("runtime stops");

        assert_eq!(log.lock().unwrap().acked, vec![11]);
        assert!(dispatcher.dispatched_to("quality-api") >= 1);
        assert!(dispatcher.dispatched_to("lake-kafka") >= 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_nacked_with_requeue() {
        let dispatcher = RecordingDispatcher::new();
        dispatcher.fail_next("quality-api", 100);
        dispatcher.fail_next("lake-kafka", 100);
        let engine = fixture_engine(dispatcher.clone());
        let registry = fixture_registry();

        let log = Arc::new(Mutex::new(AmqpLog::default()));
        let script_log = Arc::clone(&log);
        let mut runtime = AmqpTriggerRuntime::build_with(engine, registry, move |_config| {
            let log = Arc::clone(&script_log);
            async move { Ok(ScriptedAmqpConsumer::new(vec![delivery(12, false)], log)) }
        })
        .await
        .expect("runtime builds");

        let shutdown = CancellationToken::new();
        let waiter = drive(&mut runtime, &shutdown).await;

        wait_until(|| !log.lock().unwrap().nacked.is_empty()).await;

        shutdown.cancel();
        waiter.await.expect("join").expect("runtime stops");

        assert_eq!(log.lock().unwrap().nacked, vec![(12, true)]);
        assert!(log.lock().unwrap().acked.is_empty());
    }
}
