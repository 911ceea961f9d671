mod support;

use databridge::config::bridge::{
    BridgeConfig, BridgeConfigError, DeliveryPolicy, EndpointKind, SourceKind, TransformerKind,
};
use databridge::endpoint::EndpointRegistry;
use serde_json::json;
use std::time::Duration;

#[test]
fn fixture_document_parses_into_typed_entities() {
    let config = support::load_bridge_config();

    assert_eq!(config.endpoints.len(), 6);
    assert_eq!(config.transformers.len(), 2);
    assert_eq!(config.routes.len(), 8);
    assert_eq!(config.app.drain_timeout, Duration::from_secs(10));
    assert_eq!(
        config.app.feature_flags,
        vec!["mqtt".to_string(), "kafka".to_string(), "amqp".to_string()]
    );

    let budget = config.app.retry_budget.as_ref().expect("app retry budget");
    assert_eq!(budget.max_attempts, Some(3));
    assert_eq!(budget.base_backoff, Some(Duration::from_millis(50)));

    let kafka = config.endpoint("lake-kafka").expect("kafka endpoint");
    assert_eq!(kafka.kind, EndpointKind::Kafka);
    let kafka_budget = kafka.retry_budget.as_ref().expect("endpoint budget");
    assert_eq!(kafka_budget.max_attempts, Some(2));

    let scale = config.transformer("scale-temperature").expect("transformer");
    assert_eq!(scale.kind, TransformerKind::Expression);

    let lab = config
        .routes
        .iter()
        .find(|route| route.name == "lab-results")
        .expect("lab route");
    assert!(lab.policy.allow_partial_delivery);
    assert_eq!(lab.policy.delivery, None);
    assert_eq!(lab.sinks.len(), 2);

    let heartbeat = config
        .routes
        .iter()
        .find(|route| route.name == "heartbeat")
        .expect("heartbeat route");
    assert_eq!(
        heartbeat.source.resolve_kind(None),
        Some(SourceKind::Timer)
    );
}

#[test]
fn registry_decodes_fixture_endpoint_options() {
    let config = support::load_bridge_config();
    let registry = EndpointRegistry::build(&config).expect("registry");

    let mqtt = registry.mqtt("plant-mqtt").expect("mqtt handle");
    assert_eq!(mqtt.url, "mqtt://broker.plant.local:1883");
    assert_eq!(mqtt.client_id.as_deref(), Some("databridge"));
    assert_eq!(mqtt.keep_alive, Some(Duration::from_secs(30)));
    assert!(mqtt.clean_session);

    let kafka = registry.kafka("lake-kafka").expect("kafka handle");
    assert_eq!(kafka.brokers.len(), 2);

    let amqp = registry.amqp("factory-amqp").expect("amqp handle");
    assert_eq!(amqp.vhost.as_deref(), Some("factory"));

    let client = registry.http_client("quality-api").expect("http client");
    assert_eq!(client.timeouts.connect, Some(Duration::from_secs(2)));
    assert_eq!(client.timeouts.request, Some(Duration::from_secs(5)));
    assert_eq!(
        client.default_headers,
        vec![("x-api-key".to_string(), "dev-key".to_string())]
    );

    let server = registry.http_server("ingress").expect("http server");
    assert_eq!(server.bind, "127.0.0.1:8090");
    assert_eq!(server.max_body_bytes, Some(1_048_576));
    assert_eq!(server.response_timeout, Some(Duration::from_secs(5)));

    let aas = registry.aas("shell-registry").expect("aas handle");
    assert_eq!(aas.base_url, "http://aas.plant.local:8081");
}

#[test]
fn documents_load_from_an_explicit_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bridge.json");
    let document = json!({
        "api_version": "v1",
        "endpoints": [
            {"name": "api", "kind": "http-client", "options": {"base_url": "http://localhost:1"}}
        ]
    });
    std::fs::write(&path, document.to_string()).expect("write document");

    let config = BridgeConfig::from_path(&path).expect("document loads");
    assert_eq!(config.endpoints.len(), 1);

    let missing = dir.path().join("absent.json");
    assert!(matches!(
        BridgeConfig::from_path(&missing),
        Err(BridgeConfigError::Io(_))
    ));
}

fn expect_validation_errors(raw: serde_json::Value) -> String {
    match BridgeConfig::from_json_str(&raw.to_string()) {
        Err(BridgeConfigError::Invalid(err)) => err.to_string(),
        Err(other) => panic!("expected validation failure, got parse error: {other}"),
        Ok(_) => panic!("expected validation failure, config was accepted"),
    }
}

#[test]
fn unknown_top_level_keys_are_rejected() {
    let rendered = expect_validation_errors(json!({
        "api_version": "v1",
        "endpoints": [],
        "pipelines": []
    }));
    assert!(rendered.contains("unknown top-level key \"pipelines\""));
}

#[test]
fn unsupported_api_version_is_rejected() {
    let rendered = expect_validation_errors(json!({
        "api_version": "v3",
        "endpoints": []
    }));
    assert!(rendered.contains("api_version `v3` is not supported"));
    assert!(rendered.contains("schema_version: \"v3\""));
}

#[test]
fn broker_endpoints_require_matching_feature_flags() {
    let rendered = expect_validation_errors(json!({
        "api_version": "v1",
        "app": { "feature_flags": [] },
        "endpoints": [
            {"name": "lake", "kind": "kafka", "options": {"brokers": ["localhost:9092"]}}
        ]
    }));
    assert!(rendered.contains("kafka"));
    assert!(rendered.contains("feature_flags"));
}

#[test]
fn timer_routes_must_not_bind_an_endpoint() {
    let rendered = expect_validation_errors(json!({
        "api_version": "v1",
        "app": { "feature_flags": ["kafka"] },
        "endpoints": [
            {"name": "lake", "kind": "kafka", "options": {"brokers": ["localhost:9092"]}}
        ],
        "routes": [{
            "name": "tick",
            "source": {"kind": "timer", "endpoint": "lake", "options": {"interval": "5s"}},
            "sinks": [{"endpoint": "lake", "options": {"topic": "ticks"}}]
        }]
    }));
    assert!(rendered.contains("timer source must not bind an endpoint"));
}

#[test]
fn source_option_requirements_are_enforced_per_kind() {
    let rendered = expect_validation_errors(json!({
        "api_version": "v1",
        "app": { "feature_flags": ["mqtt", "kafka"] },
        "endpoints": [
            {"name": "broker", "kind": "mqtt", "options": {"url": "mqtt://localhost:1883"}},
            {"name": "lake", "kind": "kafka", "options": {"brokers": ["localhost:9092"]}}
        ],
        "routes": [
            {
                "name": "no-topic",
                "source": {"endpoint": "broker", "options": {}},
                "sinks": [{"endpoint": "lake", "options": {"topic": "t"}}]
            },
            {
                "name": "no-group",
                "source": {"endpoint": "lake", "options": {"topic": "t"}},
                "sinks": [{"endpoint": "lake", "options": {"topic": "t"}}]
            }
        ]
    }));
    assert!(rendered.contains("route `no-topic` source of kind `mqtt` requires option `topic`"));
    assert!(rendered.contains("route `no-group` source of kind `kafka` requires option `group_id`"));
}

#[test]
fn malformed_endpoint_urls_are_reported_with_the_endpoint_name() {
    let rendered = expect_validation_errors(json!({
        "api_version": "v1",
        "endpoints": [
            {"name": "quality-api", "kind": "http-client", "options": {"base_url": "not a url"}}
        ]
    }));
    assert!(rendered
        .contains("endpoint `quality-api` option `base_url` is not a valid URL (`not a url`)"));
}

#[test]
fn duplicate_ingress_mounts_are_rejected() {
    let rendered = expect_validation_errors(json!({
        "api_version": "v1",
        "endpoints": [
            {"name": "ingress", "kind": "http-server", "options": {"bind": "127.0.0.1:0"}},
            {"name": "api", "kind": "http-client", "options": {"base_url": "http://localhost:1"}}
        ],
        "routes": [
            {
                "name": "first",
                "source": {"endpoint": "ingress", "options": {"path": "/ingest"}},
                "sinks": [{"endpoint": "api", "options": {"path": "/a"}}]
            },
            {
                "name": "second",
                "source": {"endpoint": "ingress", "options": {"path": "/ingest", "method": "post"}},
                "sinks": [{"endpoint": "api", "options": {"path": "/b"}}]
            }
        ]
    }));
    assert!(rendered
        .contains("routes `first` and `second` both mount `POST /ingest` on endpoint `ingress`"));
}

#[test]
fn distinct_methods_may_share_an_ingress_path() {
    let raw = json!({
        "api_version": "v1",
        "endpoints": [
            {"name": "ingress", "kind": "http-server", "options": {"bind": "127.0.0.1:0"}},
            {"name": "api", "kind": "http-client", "options": {"base_url": "http://localhost:1"}}
        ],
        "routes": [
            {
                "name": "submit",
                "source": {"endpoint": "ingress", "options": {"path": "/ingest"}},
                "sinks": [{"endpoint": "api", "options": {"path": "/a"}}]
            },
            {
                "name": "replace",
                "source": {"endpoint": "ingress", "options": {"path": "/ingest", "method": "PUT"}},
                "sinks": [{"endpoint": "api", "options": {"path": "/b"}}]
            }
        ]
    });
    BridgeConfig::from_json_str(&raw.to_string()).expect("distinct methods are accepted");
}

#[test]
fn http_server_endpoints_cannot_be_sinks() {
    let rendered = expect_validation_errors(json!({
        "api_version": "v1",
        "endpoints": [
            {"name": "in", "kind": "http-server", "options": {"bind": "127.0.0.1:0"}}
        ],
        "routes": [{
            "name": "loop",
            "source": {"endpoint": "in", "options": {"path": "/x"}},
            "sinks": [{"endpoint": "in", "options": {}}]
        }]
    }));
    assert!(rendered.contains("cannot be used as a sink"));
}

#[test]
fn delivery_policy_parses_all_and_any() {
    let raw = json!({
        "api_version": "v1",
        "app": { "feature_flags": ["kafka"] },
        "endpoints": [
            {"name": "lake", "kind": "kafka", "options": {"brokers": ["localhost:9092"]}},
            {"name": "api", "kind": "http-client", "options": {"base_url": "http://localhost:1"}}
        ],
        "routes": [{
            "name": "fanout",
            "source": {"kind": "timer", "options": {"interval": "5s"}},
            "sinks": [
                {"endpoint": "lake", "options": {"topic": "t"}},
                {"endpoint": "api", "options": {"path": "/t"}}
            ],
            "policy": {"delivery": "any"}
        }]
    });
    let config = BridgeConfig::from_json_str(&raw.to_string()).expect("valid config");
    assert_eq!(config.routes[0].policy.delivery, Some(DeliveryPolicy::Any));
}
