mod support;

use databridge::delegator::response_slot;
use databridge::domain::BridgeMessage;
use databridge::route::dispatcher::SinkOperation;
use databridge::route::engine::{RouteEngine, RouteEngineError};
use crate::support::mocks::RecordingDispatcher;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fixture_engine(dispatcher: RecordingDispatcher) -> Arc<RouteEngine> {
    let config = support::load_bridge_config();
    Arc::new(RouteEngine::build(&config, Arc::new(dispatcher)).expect("engine"))
}

fn mqtt_message(body: serde_json::Value) -> BridgeMessage {
    BridgeMessage::new("plant-mqtt", Vec::new(), body.to_string().into_bytes())
        .with_route("telemetry-to-lake")
}

#[tokio::test]
async fn mqtt_telemetry_is_scaled_and_published_to_kafka() {
    let dispatcher = RecordingDispatcher::new();
    let engine = fixture_engine(dispatcher.clone());

    let outcome = engine
        .execute("telemetry-to-lake", mqtt_message(json!({"raw": 215})))
        .await
        .expect("route succeeds");

    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.output, Some(json!(21.5)));

    let actions = dispatcher.actions();
    assert_eq!(actions.len(), 1);
    let (action, payload) = &actions[0];
    assert_eq!(action.endpoint, "lake-kafka");
    assert_eq!(payload, &json!(21.5));
    match &action.operation {
        SinkOperation::KafkaPublish { topic, key } => {
            assert_eq!(topic, "plant-telemetry");
            assert!(key.is_none());
        }
        other => panic!("unexpected operation: {other:?}"),
    }
}

#[tokio::test]
async fn shell_route_wraps_reading_in_submodel_envelope() {
    let dispatcher = RecordingDispatcher::new();
    let engine = fixture_engine(dispatcher.clone());

    engine
        .execute("telemetry-to-shell", mqtt_message(json!({"raw": 215})))
        .await
        .expect("route succeeds");

    let actions = dispatcher.actions();
    assert_eq!(actions.len(), 1);
    let (action, payload) = &actions[0];
    assert_eq!(
        payload,
        &json!({"temperature": 21.5, "unit": "celsius"})
    );
    match &action.operation {
        SinkOperation::AasWrite {
            submodel_id,
            element_path,
        } => {
            assert_eq!(submodel_id, "urn:submodel:plant:7");
            assert_eq!(element_path, "Temperature.Value");
        }
        other => panic!("unexpected operation: {other:?}"),
    }
}

#[tokio::test]
async fn partial_delivery_keeps_healthy_sink_results() {
    let dispatcher = RecordingDispatcher::new();
    dispatcher.fail_next("quality-api", 10);
    let engine = fixture_engine(dispatcher.clone());

    let message = BridgeMessage::new(
        "factory-amqp",
        Vec::new(),
        json!({"sample": "batch-12"}).to_string().into_bytes(),
    );
    let outcome = engine
        .execute("lab-results", message)
        .await
        .expect("partial delivery tolerated");

    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.failed, 1);
    // app budget allows three attempts against the failing sink
    assert_eq!(dispatcher.dispatched_to("quality-api"), 3);
    assert_eq!(dispatcher.dispatched_to("lake-kafka"), 1);
}

#[tokio::test]
async fn transient_sink_failure_is_retried_within_budget() {
    let dispatcher = RecordingDispatcher::new();
    dispatcher.fail_next("lake-kafka", 1);
    let engine = fixture_engine(dispatcher.clone());

    let outcome = engine
        .execute("telemetry-to-lake", mqtt_message(json!({"raw": 100})))
        .await
        .expect("retry recovers");

    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.failed, 0);
    assert_eq!(dispatcher.dispatched_to("lake-kafka"), 2);
}

#[tokio::test]
async fn endpoint_budget_caps_attempts_below_app_budget() {
    let dispatcher = RecordingDispatcher::new();
    dispatcher.fail_next("lake-kafka", 10);
    let engine = fixture_engine(dispatcher.clone());

    let err = engine
        .execute("telemetry-to-lake", mqtt_message(json!({"raw": 100})))
        .await
        .expect_err("budget exhausts");

    assert!(matches!(err, RouteEngineError::DeliveryFailed { .. }));
    // lake-kafka declares max_attempts 2, tighter than the app-wide 3
    assert_eq!(dispatcher.dispatched_to("lake-kafka"), 2);
}

#[tokio::test]
async fn ingress_responder_sees_the_final_payload() {
    let dispatcher = RecordingDispatcher::new();
    let engine = fixture_engine(dispatcher.clone());

    let body = json!({"order_id": "ord-19"});
    let message = BridgeMessage::new(
        "ingress",
        vec![("content-type".to_string(), "application/json".to_string())],
        body.to_string().into_bytes(),
    );

    let (sender, slot) = response_slot();
    engine
        .execute_with_responder("order-query", message, Some(sender))
        .await
        .expect("route succeeds");

    let response = slot.wait(Duration::from_millis(200)).await;
    assert!(response.received);
    let value = response.value.expect("payload");
    assert_eq!(value.pointer("/body"), Some(&body));
    assert_eq!(value.pointer("/endpoint"), Some(&json!("ingress")));
}

#[tokio::test]
async fn kafka_replay_route_targets_http_sink() {
    let dispatcher = RecordingDispatcher::new();
    let engine = fixture_engine(dispatcher.clone());

    let message = BridgeMessage::new(
        "lake-kafka",
        Vec::new(),
        json!({"offset": 41}).to_string().into_bytes(),
    );
    engine
        .execute("lake-replay", message)
        .await
        .expect("route succeeds");

    let actions = dispatcher.actions();
    match &actions[0].0.operation {
        SinkOperation::HttpRequest { method, path } => {
            assert_eq!(method, "POST");
            assert_eq!(path, "/replay");
        }
        other => panic!("unexpected operation: {other:?}"),
    }
}
