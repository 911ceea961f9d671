//! Compiles route definitions into executable plans and drives message
//! execution: transform chain, per-route concurrency limits, budgeted sink
//! delivery and the delivery policy verdict.

use crate::config::bridge::{
    BridgeConfig, DeliveryPolicy, EndpointKind, OptionMap, OverflowPolicy, RetryBudget,
    RouteDefinition, SinkBinding, SourceKind,
};
use crate::delegator::ResponseSender;
use crate::domain::BridgeMessage;
use crate::metrics::metrics;
use crate::retry::{merge_retry_budgets, BudgetedRetry};
use crate::route::context::ExecutionContext;
use crate::route::dispatcher::{ActionDispatcher, SinkAction, SinkOperation};
use crate::transform::{TransformError, Transformer};
use futures_util::future::join_all;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct RouteEngine {
    plans: HashMap<String, Arc<RoutePlan>>,
    dispatcher: Arc<dyn ActionDispatcher>,
    app_budget: Option<RetryBudget>,
}

impl std::fmt::Debug for RouteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEngine")
            .field("plans", &self.plans.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RouteEngine {
    pub fn build(
        config: &BridgeConfig,
        dispatcher: Arc<dyn ActionDispatcher>,
    ) -> Result<Self, RouteEngineError> {
        let mut plans = HashMap::with_capacity(config.routes.len());
        for route in &config.routes {
            let plan = RoutePlan::compile(route, config)?;
            plans.insert(route.name.clone(), Arc::new(plan));
        }

        Ok(Self {
            plans,
            dispatcher,
            app_budget: config.app.retry_budget.clone(),
        })
    }

    pub fn app(&self) -> Option<&RetryBudget> {
        self.app_budget.as_ref()
    }

    pub fn plan(&self, route: &str) -> Option<Arc<RoutePlan>> {
        self.plans.get(route).cloned()
    }

    pub fn route_names(&self) -> impl Iterator<Item = &str> {
        self.plans.keys().map(String::as_str)
    }

    pub fn plans_for_source(&self, kind: SourceKind) -> Vec<Arc<RoutePlan>> {
        let mut matching: Vec<_> = self
            .plans
            .values()
            .filter(|plan| plan.source.kind == kind)
            .cloned()
            .collect();
        matching.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        matching
    }

    pub async fn execute(
        &self,
        route: &str,
        message: BridgeMessage,
    ) -> Result<ExecutionOutcome, RouteEngineError> {
        self.execute_with_responder(route, message, None).await
    }

    /// Runs a message through a route. The responder, when present, receives
    /// the final payload once delivery succeeds.
    pub async fn execute_with_responder(
        &self,
        route: &str,
        message: BridgeMessage,
        responder: Option<ResponseSender>,
    ) -> Result<ExecutionOutcome, RouteEngineError> {
        let plan = self
            .plans
            .get(route)
            .ok_or_else(|| RouteEngineError::UnknownRoute {
                route: route.to_string(),
            })?;

        let _permit = match plan.admit().await {
            Admission::Open => None,
            Admission::Permit(permit) => Some(permit),
            Admission::Rejected => {
                metrics().limit_enforced(&plan.name, plan.overflow_label());
                return Err(RouteEngineError::Overloaded {
                    route: plan.name.clone(),
                });
            }
            Admission::Shed => {
                metrics().route_shed(&plan.name);
                crate::bridge_event!(
                    warn,
                    "databridge::route",
                    "message_shed",
                    endpoint = message.endpoint.as_str(),
                    route = plan.name.as_str(),
                );
                return Ok(ExecutionOutcome::shed(&plan.name));
            }
        };

        let mut context = ExecutionContext::from_message(&message);
        for transformer in &plan.transformers {
            transformer
                .apply(&mut context)
                .map_err(|source| RouteEngineError::Transform {
                    route: plan.name.clone(),
                    source,
                })?;
        }

        let payload = context
            .last_slot_value()
            .cloned()
            .unwrap_or(JsonValue::Null);
        let observability = context.observability();

        let deliveries = plan.sinks.iter().map(|sink| {
            let action = sink.resolve(&context);
            self.deliver_with_budget(plan, sink, action, &payload)
        });
        let results = join_all(deliveries).await;

        let mut delivered = 0usize;
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => failures.push(err),
            }
        }

        let required = match plan.delivery {
            DeliveryPolicy::All if !plan.allow_partial => plan.sinks.len(),
            _ => 1,
        };
        // routes without sinks cannot exist per config validation, but a
        // zero-sink plan still counts as delivered
        let success = plan.sinks.is_empty() || delivered >= required;

        if !success {
            crate::bridge_event!(
                warn,
                "databridge::route",
                "delivery_failed",
                endpoint = message.endpoint.as_str(),
                route = plan.name.as_str(),
                delivered = delivered,
                failed = failures.len(),
            );
            return Err(RouteEngineError::DeliveryFailed {
                route: plan.name.clone(),
                failures: failures.iter().map(|err| err.to_string()).collect(),
            });
        }

        if let Some(responder) = responder {
            responder.fulfill(payload.clone());
        }

        tracing::debug!(
            target: "databridge::route",
            route = %plan.name,
            delivered,
            failed = failures.len(),
            trace_id = observability.trace_id.as_deref().unwrap_or(""),
            "route execution finished"
        );

        Ok(ExecutionOutcome {
            route: plan.name.clone(),
            delivered,
            failed: failures.len(),
            shed: false,
            output: Some(payload),
        })
    }

    async fn deliver_with_budget(
        &self,
        plan: &RoutePlan,
        sink: &SinkPlan,
        action: Result<SinkAction, RouteEngineError>,
        payload: &JsonValue,
    ) -> Result<(), DeliveryFailure> {
        let action = action.map_err(|err| DeliveryFailure {
            endpoint: sink.endpoint.clone(),
            reason: err.to_string(),
        })?;

        let budget = merge_retry_budgets([
            self.app_budget.as_ref(),
            sink.endpoint_budget.as_ref(),
            plan.budget.as_ref(),
        ]);

        let mut retry = budget.map(BudgetedRetry::new);

        loop {
            match self.dispatcher.dispatch(&action, payload).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    let delay = retry.as_mut().and_then(BudgetedRetry::next_delay);
                    match delay {
                        Some(delay) => {
                            crate::bridge_event!(
                                debug,
                                "databridge::route",
                                "delivery_retry",
                                endpoint = sink.endpoint.as_str(),
                                route = plan.name.as_str(),
                                delay_ms = delay.as_millis(),
                                error = err,
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            metrics()
                                .retry_budget_exhausted(&plan.name, Some(sink.endpoint.as_str()));
                            return Err(DeliveryFailure {
                                endpoint: sink.endpoint.clone(),
                                reason: err.to_string(),
                            });
                        }
                    }
                }
                Err(err) => {
                    return Err(DeliveryFailure {
                        endpoint: sink.endpoint.clone(),
                        reason: err.to_string(),
                    })
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub route: String,
    pub delivered: usize,
    pub failed: usize,
    pub shed: bool,
    pub output: Option<JsonValue>,
}

impl ExecutionOutcome {
    fn shed(route: &str) -> Self {
        Self {
            route: route.to_string(),
            delivered: 0,
            failed: 0,
            shed: true,
            output: None,
        }
    }
}

#[derive(Debug)]
struct DeliveryFailure {
    endpoint: String,
    reason: String,
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.reason)
    }
}

pub struct RoutePlan {
    pub name: String,
    pub source: SourcePlan,
    transformers: Vec<Transformer>,
    sinks: Vec<SinkPlan>,
    delivery: DeliveryPolicy,
    allow_partial: bool,
    budget: Option<RetryBudget>,
    limiter: Option<RouteLimiter>,
}

#[derive(Debug, Clone)]
pub struct SourcePlan {
    pub kind: SourceKind,
    pub endpoint: Option<String>,
    pub options: OptionMap,
}

impl RoutePlan {
    fn compile(route: &RouteDefinition, config: &BridgeConfig) -> Result<Self, RouteEngineError> {
        let source_endpoint_kind = route
            .source
            .endpoint
            .as_deref()
            .and_then(|name| config.endpoint(name))
            .map(|endpoint| &endpoint.kind);
        let source_kind = route
            .source
            .resolve_kind(source_endpoint_kind)
            .ok_or_else(|| RouteEngineError::UnsupportedSource {
                route: route.name.clone(),
                kind: "unspecified".to_string(),
            })?;

        if source_kind == SourceKind::OpcUa {
            return Err(RouteEngineError::UnsupportedSource {
                route: route.name.clone(),
                kind: SourceKind::OpcUa.as_str().to_string(),
            });
        }

        let mut transformers = Vec::with_capacity(route.transformers.len());
        for name in &route.transformers {
            let definition =
                config
                    .transformer(name)
                    .ok_or_else(|| RouteEngineError::UnknownTransformer {
                        route: route.name.clone(),
                        name: name.clone(),
                    })?;
            let transformer = Transformer::from_definition(definition).map_err(|source| {
                RouteEngineError::InvalidTransformer {
                    name: name.clone(),
                    source,
                }
            })?;
            transformers.push(transformer);
        }

        let mut sinks = Vec::with_capacity(route.sinks.len());
        for sink in &route.sinks {
            sinks.push(SinkPlan::compile(&route.name, sink, config)?);
        }

        let route_limits = route
            .policy
            .limits
            .as_ref()
            .or(config.app.limits.routes.as_ref());
        let limiter = route_limits.and_then(|limits| {
            limits.max_inflight.map(|max_inflight| RouteLimiter {
                semaphore: Arc::new(Semaphore::new(max_inflight as usize)),
                policy: limits.overflow_policy.unwrap_or(OverflowPolicy::Reject),
                max_queue_depth: limits.max_queue_depth,
                queued: AtomicU32::new(0),
                route: route.name.clone(),
            })
        });

        Ok(Self {
            name: route.name.clone(),
            source: SourcePlan {
                kind: source_kind,
                endpoint: route.source.endpoint.clone(),
                options: route.source.options.clone(),
            },
            transformers,
            sinks,
            delivery: route.policy.delivery.unwrap_or(DeliveryPolicy::All),
            allow_partial: route.policy.allow_partial_delivery,
            budget: route.policy.retry_budget.clone(),
            limiter,
        })
    }

    async fn admit(&self) -> Admission {
        match &self.limiter {
            Some(limiter) => limiter.admit().await,
            None => Admission::Open,
        }
    }

    fn overflow_label(&self) -> &'static str {
        match self.limiter.as_ref().map(|limiter| limiter.policy) {
            Some(OverflowPolicy::Queue) => "queue",
            Some(OverflowPolicy::Shed) => "shed",
            _ => "reject",
        }
    }

    pub fn sink_endpoints(&self) -> impl Iterator<Item = &str> {
        self.sinks.iter().map(|sink| sink.endpoint.as_str())
    }
}

enum Admission {
    Open,
    Permit(OwnedSemaphorePermit),
    Rejected,
    Shed,
}

struct RouteLimiter {
    semaphore: Arc<Semaphore>,
    policy: OverflowPolicy,
    max_queue_depth: Option<u32>,
    queued: AtomicU32,
    route: String,
}

impl RouteLimiter {
    async fn admit(&self) -> Admission {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Admission::Permit(permit);
        }

        match self.policy {
            OverflowPolicy::Reject => Admission::Rejected,
            OverflowPolicy::Shed => Admission::Shed,
            OverflowPolicy::Queue => {
                let depth = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(max_depth) = self.max_queue_depth {
                    if depth > max_depth {
                        self.queued.fetch_sub(1, Ordering::SeqCst);
                        return Admission::Rejected;
                    }
                }
                metrics().route_queue_depth(&self.route, depth);

                let acquired = self.semaphore.clone().acquire_owned().await;
                let depth = self.queued.fetch_sub(1, Ordering::SeqCst) - 1;
                metrics().route_queue_depth(&self.route, depth);

                match acquired {
                    Ok(permit) => Admission::Permit(permit),
                    Err(_) => Admission::Rejected,
                }
            }
        }
    }
}

struct SinkPlan {
    endpoint: String,
    endpoint_budget: Option<RetryBudget>,
    template: SinkTemplate,
}

enum SinkTemplate {
    Mqtt {
        topic: String,
        qos: u8,
        retain: bool,
    },
    Kafka {
        topic: String,
        key: Option<String>,
    },
    Amqp {
        exchange: String,
        routing_key: String,
    },
    Http {
        method: String,
        path: String,
    },
    Aas {
        submodel_id: String,
        element_path: String,
    },
}

impl SinkPlan {
    fn compile(
        route: &str,
        sink: &SinkBinding,
        config: &BridgeConfig,
    ) -> Result<Self, RouteEngineError> {
        let endpoint =
            config
                .endpoint(&sink.endpoint)
                .ok_or_else(|| RouteEngineError::UnknownEndpoint {
                    route: route.to_string(),
                    endpoint: sink.endpoint.clone(),
                })?;

        let require = |key: &str| -> Result<String, RouteEngineError> {
            sink.option_str(key)
                .map(str::to_string)
                .ok_or_else(|| RouteEngineError::InvalidSink {
                    route: route.to_string(),
                    endpoint: sink.endpoint.clone(),
                    reason: format!("missing option `{key}`"),
                })
        };

        let template = match endpoint.kind {
            EndpointKind::Mqtt => {
                let qos = sink
                    .options
                    .get("qos")
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(0);
                if qos > 2 {
                    return Err(RouteEngineError::InvalidSink {
                        route: route.to_string(),
                        endpoint: sink.endpoint.clone(),
                        reason: format!("qos {qos} is out of range"),
                    });
                }
                SinkTemplate::Mqtt {
                    topic: require("topic")?,
                    qos: qos as u8,
                    retain: sink
                        .options
                        .get("retain")
                        .and_then(JsonValue::as_bool)
                        .unwrap_or(false),
                }
            }
            EndpointKind::Kafka => SinkTemplate::Kafka {
                topic: require("topic")?,
                key: sink.option_str("key").map(str::to_string),
            },
            EndpointKind::Amqp => SinkTemplate::Amqp {
                exchange: sink.option_str("exchange").unwrap_or("").to_string(),
                routing_key: sink.option_str("routing_key").unwrap_or("").to_string(),
            },
            EndpointKind::HttpClient => SinkTemplate::Http {
                method: sink
                    .option_str("method")
                    .unwrap_or("POST")
                    .to_ascii_uppercase(),
                path: require("path")?,
            },
            EndpointKind::Aas => SinkTemplate::Aas {
                submodel_id: require("submodel_id")?,
                element_path: require("element_path")?,
            },
            EndpointKind::HttpServer | EndpointKind::OpcUa | EndpointKind::Unknown(_) => {
                return Err(RouteEngineError::InvalidSink {
                    route: route.to_string(),
                    endpoint: sink.endpoint.clone(),
                    reason: format!(
                        "endpoint kind `{}` cannot act as a sink",
                        endpoint.kind.as_str()
                    ),
                })
            }
        };

        Ok(Self {
            endpoint: sink.endpoint.clone(),
            endpoint_budget: endpoint.retry_budget.clone(),
            template,
        })
    }

    /// Option strings that start with `.` are resolved against the execution
    /// context, so topics and paths can derive from message content.
    fn resolve(&self, context: &ExecutionContext) -> Result<SinkAction, RouteEngineError> {
        let resolve = |raw: &str| -> Result<String, RouteEngineError> {
            context
                .resolve_to_string(&JsonValue::String(raw.to_string()))
                .map_err(|err| RouteEngineError::InvalidSink {
                    route: String::new(),
                    endpoint: self.endpoint.clone(),
                    reason: err.to_string(),
                })
        };

        let operation = match &self.template {
            SinkTemplate::Mqtt { topic, qos, retain } => SinkOperation::MqttPublish {
                topic: resolve(topic)?,
                qos: *qos,
                retain: *retain,
            },
            SinkTemplate::Kafka { topic, key } => SinkOperation::KafkaPublish {
                topic: resolve(topic)?,
                key: key.as_deref().map(resolve).transpose()?,
            },
            SinkTemplate::Amqp {
                exchange,
                routing_key,
            } => SinkOperation::AmqpPublish {
                exchange: resolve(exchange)?,
                routing_key: resolve(routing_key)?,
            },
            SinkTemplate::Http { method, path } => SinkOperation::HttpRequest {
                method: method.clone(),
                path: resolve(path)?,
            },
            SinkTemplate::Aas {
                submodel_id,
                element_path,
            } => SinkOperation::AasWrite {
                submodel_id: resolve(submodel_id)?,
                element_path: resolve(element_path)?,
            },
        };

        Ok(SinkAction {
            endpoint: self.endpoint.clone(),
            operation,
        })
    }
}

#[derive(Debug, Error)]
pub enum RouteEngineError {
    #[error("unknown route `{route}`")]
    UnknownRoute { route: String },
    #[error("route `{route}` references unknown endpoint `{endpoint}`")]
    UnknownEndpoint { route: String, endpoint: String },
    #[error("route `{route}` references unknown transformer `{name}`")]
    UnknownTransformer { route: String, name: String },
    #[error("transformer `{name}` is invalid: {source}")]
    InvalidTransformer {
        name: String,
        #[source]
        source: TransformError,
    },
    #[error("route `{route}` has unsupported source kind `{kind}`")]
    UnsupportedSource { route: String, kind: String },
    #[error("route `{route}` sink `{endpoint}` is invalid: {reason}")]
    InvalidSink {
        route: String,
        endpoint: String,
        reason: String,
    },
    #[error("transform failed on route `{route}`: {source}")]
    Transform {
        route: String,
        #[source]
        source: TransformError,
    },
    #[error("route `{route}` is over its inflight limit")]
    Overloaded { route: String },
    #[error("route `{route}` delivery failed: {failures:?}")]
    DeliveryFailed {
        route: String,
        failures: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::bridge::BridgeConfig;
    use crate::route::dispatcher::DispatchError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDispatcher {
        actions: Mutex<Vec<(SinkAction, JsonValue)>>,
        fail_endpoints: Vec<String>,
    }

    #[async_trait]
    impl ActionDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            action: &SinkAction,
            payload: &JsonValue,
        ) -> Result<(), DispatchError> {
            self.actions
                .lock()
                .unwrap()
                .push((action.clone(), payload.clone()));
            if self.fail_endpoints.contains(&action.endpoint) {
                return Err(DispatchError::Kafka {
                    endpoint: action.endpoint.clone(),
                    reason: "broker unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    fn bridge_config(routes: JsonValue) -> BridgeConfig {
        let raw = json!({
            "api_version": "v1",
            "app": {
                "feature_flags": ["mqtt", "kafka"],
                "retry_budget": {"max_attempts": 1}
            },
            "endpoints": [
                {"name": "plant-mqtt", "kind": "mqtt", "options": {"url": "mqtt://localhost:1883"}},
                {"name": "lake-kafka", "kind": "kafka", "options": {"brokers": ["localhost:9092"]}},
                {"name": "api", "kind": "http-client", "options": {"base_url": "http://localhost:8080"}}
            ],
            "transformers": [
                {"name": "scale", "kind": "expression", "options": {"expression": ".[0].body.raw / 10"}},
                {"name": "envelope", "kind": "template", "options": {"template": {"value": ".[1]"}}}
            ],
            "routes": routes
        });
        BridgeConfig::from_json_str(&raw.to_string()).expect("valid config")
    }

    fn message(body: JsonValue) -> BridgeMessage {
        BridgeMessage::new("plant-mqtt", Vec::new(), body.to_string().into_bytes())
    }

    #[tokio::test]
    async fn route_transforms_and_delivers_to_all_sinks() {
        let config = bridge_config(json!([{
            "name": "telemetry",
            "source": {"endpoint": "plant-mqtt", "options": {"topic": "plc/+/state"}},
            "transformers": ["scale", "envelope"],
            "sinks": [
                {"endpoint": "lake-kafka", "options": {"topic": "telemetry"}},
                {"endpoint": "api", "options": {"path": "/ingest"}}
            ]
        }]));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = RouteEngine::build(&config, dispatcher.clone()).unwrap();

        let outcome = engine
            .execute("telemetry", message(json!({"raw": 215})))
            .await
            .unwrap();

        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.output, Some(json!({"value": 21.5})));

        let actions = dispatcher.actions.lock().unwrap();
        assert_eq!(actions.len(), 2);
        assert!(actions
            .iter()
            .all(|(_, payload)| payload == &json!({"value": 21.5})));
    }

    #[tokio::test]
    async fn all_policy_fails_when_one_sink_fails() {
        let config = bridge_config(json!([{
            "name": "telemetry",
            "source": {"endpoint": "plant-mqtt", "options": {"topic": "t"}},
            "transformers": [],
            "sinks": [
                {"endpoint": "lake-kafka", "options": {"topic": "telemetry"}},
                {"endpoint": "api", "options": {"path": "/ingest"}}
            ]
        }]));
        let dispatcher = Arc::new(RecordingDispatcher {
            fail_endpoints: vec!["lake-kafka".to_string()],
            ..Default::default()
        });
        let engine = RouteEngine::build(&config, dispatcher).unwrap();

        let err = engine
            .execute("telemetry", message(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteEngineError::DeliveryFailed { .. }));
    }

    #[tokio::test]
    async fn partial_delivery_tolerates_failures() {
        let config = bridge_config(json!([{
            "name": "telemetry",
            "source": {"endpoint": "plant-mqtt", "options": {"topic": "t"}},
            "transformers": [],
            "sinks": [
                {"endpoint": "lake-kafka", "options": {"topic": "telemetry"}},
                {"endpoint": "api", "options": {"path": "/ingest"}}
            ],
            "policy": {"allow_partial_delivery": true}
        }]));
        let dispatcher = Arc::new(RecordingDispatcher {
            fail_endpoints: vec!["lake-kafka".to_string()],
            ..Default::default()
        });
        let engine = RouteEngine::build(&config, dispatcher).unwrap();

        let outcome = engine.execute("telemetry", message(json!({}))).await.unwrap();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, 1);
    }

    #[tokio::test]
    async fn sink_topic_can_derive_from_message() {
        let config = bridge_config(json!([{
            "name": "per-device",
            "source": {"endpoint": "plant-mqtt", "options": {"topic": "t"}},
            "transformers": [],
            "sinks": [
                {"endpoint": "lake-kafka", "options": {"topic": ".[0].body.device"}}
            ]
        }]));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = RouteEngine::build(&config, dispatcher.clone()).unwrap();

        engine
            .execute("per-device", message(json!({"device": "press-7"})))
            .await
            .unwrap();

        let actions = dispatcher.actions.lock().unwrap();
        match &actions[0].0.operation {
            SinkOperation::KafkaPublish { topic, .. } => assert_eq!(topic, "press-7"),
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[tokio::test]
    async fn responder_receives_final_payload() {
        let config = bridge_config(json!([{
            "name": "query",
            "source": {"endpoint": "plant-mqtt", "options": {"topic": "t"}},
            "transformers": ["scale"],
            "sinks": [{"endpoint": "api", "options": {"path": "/ingest"}}]
        }]));
        let engine =
            RouteEngine::build(&config, Arc::new(RecordingDispatcher::default())).unwrap();

        let (sender, slot) = crate::delegator::response_slot();
        engine
            .execute_with_responder("query", message(json!({"raw": 100})), Some(sender))
            .await
            .unwrap();

        let response = slot.wait(std::time::Duration::from_millis(100)).await;
        assert!(response.received);
        assert_eq!(response.value, Some(json!(10.0)));
    }

    #[tokio::test]
    async fn unknown_route_is_reported() {
        let config = bridge_config(json!([]));
        let engine =
            RouteEngine::build(&config, Arc::new(RecordingDispatcher::default())).unwrap();
        let err = engine.execute("missing", message(json!({}))).await.unwrap_err();
        assert!(matches!(err, RouteEngineError::UnknownRoute { .. }));
    }

    #[test]
    fn opc_ua_routes_are_rejected_at_build() {
        let raw = json!({
            "api_version": "v1",
            "app": {"feature_flags": ["opc-ua", "kafka"]},
            "endpoints": [
                {"name": "plc", "kind": "opc-ua", "options": {"url": "opc.tcp://localhost:4840"}},
                {"name": "lake-kafka", "kind": "kafka", "options": {"brokers": ["localhost:9092"]}}
            ],
            "transformers": [],
            "routes": [{
                "name": "plc-poll",
                "source": {"endpoint": "plc", "options": {"node_id": "ns=2;s=Speed", "interval": "5s"}},
                "transformers": [],
                "sinks": [{"endpoint": "lake-kafka", "options": {"topic": "plc"}}]
            }]
        });
        let config = BridgeConfig::from_json_str(&raw.to_string()).expect("valid config");
        let err = RouteEngine::build(&config, Arc::new(RecordingDispatcher::default()))
            .unwrap_err();
        assert!(matches!(err, RouteEngineError::UnsupportedSource { .. }));
    }
}
