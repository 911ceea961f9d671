use super::app::{
    parse_duration_optional, parse_overflow_policy, parse_retry_budget, AppConfig, RawRetryBudget,
    RetryBudget, RouteLimits,
};
use super::endpoints::{EndpointConfig, EndpointKind, OptionMap};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// One named payload conversion step routes can reference by name.
#[derive(Debug, Clone)]
pub struct TransformerDefinition {
    pub name: String,
    pub kind: TransformerKind,
    pub options: OptionMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformerKind {
    Expression,
    Template,
    Unknown(String),
}

impl TransformerKind {
    pub fn as_str(&self) -> &str {
        match self {
            TransformerKind::Expression => "expression",
            TransformerKind::Template => "template",
            TransformerKind::Unknown(other) => other.as_str(),
        }
    }
}

/// One configured path from a source binding through a transformer chain to
/// one or more sink bindings.
#[derive(Debug, Clone)]
pub struct RouteDefinition {
    pub name: String,
    pub source: SourceBinding,
    pub transformers: Vec<String>,
    pub sinks: Vec<SinkBinding>,
    pub policy: RoutePolicy,
}

#[derive(Debug, Clone)]
pub struct SourceBinding {
    pub declared_kind: Option<SourceKind>,
    pub endpoint: Option<String>,
    pub options: OptionMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Mqtt,
    Kafka,
    Amqp,
    HttpServer,
    Timer,
    HttpPoll,
    Prometheus,
    OpcUa,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Mqtt => "mqtt",
            SourceKind::Kafka => "kafka",
            SourceKind::Amqp => "amqp",
            SourceKind::HttpServer => "http-server",
            SourceKind::Timer => "timer",
            SourceKind::HttpPoll => "http-poll",
            SourceKind::Prometheus => "prometheus",
            SourceKind::OpcUa => "opc-ua",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Some(SourceKind::Mqtt),
            "kafka" => Some(SourceKind::Kafka),
            "amqp" => Some(SourceKind::Amqp),
            "http-server" => Some(SourceKind::HttpServer),
            "timer" => Some(SourceKind::Timer),
            "http-poll" => Some(SourceKind::HttpPoll),
            "prometheus" => Some(SourceKind::Prometheus),
            "opc-ua" | "opcua" => Some(SourceKind::OpcUa),
            _ => None,
        }
    }
}

impl SourceBinding {
    /// The effective source kind: an explicit `kind` wins, otherwise it is
    /// inferred from the referenced endpoint's kind.
    pub fn resolve_kind(&self, endpoint_kind: Option<&EndpointKind>) -> Option<SourceKind> {
        if let Some(kind) = self.declared_kind {
            return Some(kind);
        }
        match endpoint_kind? {
            EndpointKind::Mqtt => Some(SourceKind::Mqtt),
            EndpointKind::Kafka => Some(SourceKind::Kafka),
            EndpointKind::Amqp => Some(SourceKind::Amqp),
            EndpointKind::HttpServer => Some(SourceKind::HttpServer),
            EndpointKind::HttpClient => Some(SourceKind::HttpPoll),
            EndpointKind::OpcUa => Some(SourceKind::OpcUa),
            _ => None,
        }
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(JsonValue::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct SinkBinding {
    pub endpoint: String,
    pub options: OptionMap,
}

impl SinkBinding {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(JsonValue::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutePolicy {
    pub delivery: Option<DeliveryPolicy>,
    pub allow_partial_delivery: bool,
    pub retry_budget: Option<RetryBudget>,
    pub limits: Option<RouteLimits>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    All,
    Any,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawTransformer {
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) kind: Option<String>,
    #[serde(default)]
    pub(crate) options: OptionMap,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRoute {
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) source: Option<RawSource>,
    #[serde(default)]
    pub(crate) transformers: Vec<String>,
    #[serde(default)]
    pub(crate) sinks: Vec<RawSink>,
    #[serde(default)]
    pub(crate) policy: Option<RawPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawSource {
    #[serde(default)]
    pub(crate) kind: Option<String>,
    #[serde(default)]
    pub(crate) endpoint: Option<String>,
    #[serde(default)]
    pub(crate) options: OptionMap,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawSink {
    #[serde(default)]
    pub(crate) endpoint: Option<String>,
    #[serde(default)]
    pub(crate) options: OptionMap,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawPolicy {
    #[serde(default)]
    pub(crate) delivery: Option<String>,
    #[serde(default)]
    pub(crate) allow_partial_delivery: Option<bool>,
    #[serde(default)]
    pub(crate) retry_budget: Option<RawRetryBudget>,
    #[serde(default)]
    pub(crate) max_inflight: Option<u32>,
    #[serde(default)]
    pub(crate) overflow_policy: Option<String>,
    #[serde(default)]
    pub(crate) max_queue_depth: Option<u32>,
}

pub(crate) fn parse_transformers(
    raw: Vec<RawTransformer>,
    errors: &mut Vec<String>,
) -> Vec<TransformerDefinition> {
    let mut seen = BTreeSet::new();
    let mut transformers = Vec::with_capacity(raw.len());

    for (index, entry) in raw.into_iter().enumerate() {
        let name = match entry.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => {
                errors.push(format!("transformer at index {index} is missing a name"));
                continue;
            }
        };

        if !seen.insert(name.clone()) {
            errors.push(format!("transformer `{name}` is defined more than once"));
            continue;
        }

        let kind = match entry.kind.as_deref().map(str::trim) {
            Some("expression") => TransformerKind::Expression,
            Some("template") => TransformerKind::Template,
            Some(other) if !other.is_empty() => {
                errors.push(format!(
                    "transformer `{name}` has unknown kind `{other}` (expected `expression` or `template`)"
                ));
                TransformerKind::Unknown(other.to_string())
            }
            _ => {
                errors.push(format!("transformer `{name}` is missing a kind"));
                continue;
            }
        };

        match kind {
            TransformerKind::Expression => {
                let valid = entry
                    .options
                    .get("expression")
                    .and_then(JsonValue::as_str)
                    .map(|expr| !expr.trim().is_empty())
                    .unwrap_or(false);
                if !valid {
                    errors.push(format!(
                        "transformer `{name}` of kind `expression` requires a non-empty `expression` option"
                    ));
                }
            }
            TransformerKind::Template => {
                if !entry.options.contains_key("template") {
                    errors.push(format!(
                        "transformer `{name}` of kind `template` requires a `template` option"
                    ));
                }
            }
            TransformerKind::Unknown(_) => {}
        }

        transformers.push(TransformerDefinition {
            name,
            kind,
            options: entry.options,
        });
    }

    transformers
}

pub(crate) fn parse_routes(raw: Vec<RawRoute>, errors: &mut Vec<String>) -> Vec<RouteDefinition> {
    let mut seen = BTreeSet::new();
    let mut routes = Vec::with_capacity(raw.len());

    for (index, entry) in raw.into_iter().enumerate() {
        let name = match entry.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => {
                errors.push(format!("route at index {index} is missing a name"));
                continue;
            }
        };

        if !seen.insert(name.clone()) {
            errors.push(format!("route `{name}` is defined more than once"));
            continue;
        }

        let Some(raw_source) = entry.source else {
            errors.push(format!("route `{name}` is missing a source"));
            continue;
        };

        let declared_kind = match raw_source.kind.as_deref() {
            None => None,
            Some(raw_kind) => match SourceKind::parse(raw_kind) {
                Some(kind) => Some(kind),
                None => {
                    errors.push(format!(
                        "route `{name}` source has unknown kind `{raw_kind}`"
                    ));
                    None
                }
            },
        };

        let source = SourceBinding {
            declared_kind,
            endpoint: raw_source
                .endpoint
                .filter(|endpoint| !endpoint.trim().is_empty()),
            options: raw_source.options,
        };

        if entry.sinks.is_empty() {
            errors.push(format!("route `{name}` must declare at least one sink"));
        }

        let mut sinks = Vec::with_capacity(entry.sinks.len());
        for (sink_index, sink) in entry.sinks.into_iter().enumerate() {
            match sink.endpoint {
                Some(endpoint) if !endpoint.trim().is_empty() => sinks.push(SinkBinding {
                    endpoint: endpoint.trim().to_string(),
                    options: sink.options,
                }),
                _ => errors.push(format!(
                    "route `{name}` sink at index {sink_index} is missing an endpoint"
                )),
            }
        }

        let policy = parse_policy(&name, entry.policy, errors);

        routes.push(RouteDefinition {
            name,
            source,
            transformers: entry.transformers,
            sinks,
            policy,
        });
    }

    routes
}

fn parse_policy(route: &str, raw: Option<RawPolicy>, errors: &mut Vec<String>) -> RoutePolicy {
    let raw = raw.unwrap_or_default();
    let location = format!("route `{route}` policy");

    let delivery = raw
        .delivery
        .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
            "all" => Some(DeliveryPolicy::All),
            "any" => Some(DeliveryPolicy::Any),
            other => {
                errors.push(format!(
                    "{location}.delivery must be `all` or `any` (got `{other}`)"
                ));
                None
            }
        });

    let retry_budget = raw
        .retry_budget
        .and_then(|budget| parse_retry_budget(&format!("{location}.retry_budget"), budget, errors));

    let overflow_policy = raw
        .overflow_policy
        .and_then(|policy| parse_overflow_policy(&location, &policy, errors));

    let limits = if raw.max_inflight.is_some()
        || overflow_policy.is_some()
        || raw.max_queue_depth.is_some()
    {
        Some(RouteLimits {
            max_inflight: raw.max_inflight,
            overflow_policy,
            max_queue_depth: raw.max_queue_depth,
        })
    } else {
        None
    };

    RoutePolicy {
        delivery,
        allow_partial_delivery: raw.allow_partial_delivery.unwrap_or(false),
        retry_budget,
        limits,
    }
}

pub(crate) fn validate_references(
    endpoints: &[EndpointConfig],
    transformers: &[TransformerDefinition],
    routes: &[RouteDefinition],
    errors: &mut Vec<String>,
) {
    let endpoint_names: BTreeSet<&str> = endpoints
        .iter()
        .map(|endpoint| endpoint.name.as_str())
        .collect();
    let transformer_names: BTreeSet<&str> = transformers
        .iter()
        .map(|transformer| transformer.name.as_str())
        .collect();

    for route in routes {
        if let Some(endpoint) = route.source.endpoint.as_deref() {
            if !endpoint_names.contains(endpoint) {
                errors.push(format!(
                    "route `{}` source references unknown endpoint `{endpoint}`",
                    route.name
                ));
            }
        }

        for transformer in &route.transformers {
            if !transformer_names.contains(transformer.as_str()) {
                errors.push(format!(
                    "route `{}` references unknown transformer `{transformer}`",
                    route.name
                ));
            }
        }

        for sink in &route.sinks {
            if !endpoint_names.contains(sink.endpoint.as_str()) {
                errors.push(format!(
                    "route `{}` sink references unknown endpoint `{}`",
                    route.name, sink.endpoint
                ));
            }
        }
    }
}

fn endpoint_kind<'a>(endpoints: &'a [EndpointConfig], name: &str) -> Option<&'a EndpointKind> {
    endpoints
        .iter()
        .find(|endpoint| endpoint.name == name)
        .map(|endpoint| &endpoint.kind)
}

pub(crate) fn validate_source_requirements(
    endpoints: &[EndpointConfig],
    routes: &[RouteDefinition],
    errors: &mut Vec<String>,
) {
    for route in routes {
        let bound_kind = route
            .source
            .endpoint
            .as_deref()
            .and_then(|name| endpoint_kind(endpoints, name));
        let resolved = route.source.resolve_kind(bound_kind);

        let Some(kind) = resolved else {
            errors.push(format!(
                "route `{}` source kind could not be determined (declare `kind` or bind a source-capable endpoint)",
                route.name
            ));
            continue;
        };

        let require_option = |key: &str, errors: &mut Vec<String>| {
            if route.source.option_str(key).is_none() {
                errors.push(format!(
                    "route `{}` source of kind `{}` requires option `{key}`",
                    route.name,
                    kind.as_str()
                ));
            }
        };

        let require_endpoint_of =
            |expected: &[EndpointKind], errors: &mut Vec<String>| match bound_kind {
                Some(actual) if expected.contains(actual) => {}
                Some(actual) => errors.push(format!(
                    "route `{}` source of kind `{}` must bind an endpoint of kind {} (got `{}`)",
                    route.name,
                    kind.as_str(),
                    expected
                        .iter()
                        .map(|kind| format!("`{}`", kind.as_str()))
                        .collect::<Vec<_>>()
                        .join(" or "),
                    actual.as_str()
                )),
                None => errors.push(format!(
                    "route `{}` source of kind `{}` must bind an endpoint",
                    route.name,
                    kind.as_str()
                )),
            };

        match kind {
            SourceKind::Timer => {
                if route.source.endpoint.is_some() {
                    errors.push(format!(
                        "route `{}` timer source must not bind an endpoint",
                        route.name
                    ));
                }
                let interval = route.source.option_str("interval").map(str::to_string);
                if parse_duration_optional(
                    &format!("route `{}` source interval", route.name),
                    interval,
                    errors,
                )
                .is_none()
                {
                    errors.push(format!(
                        "route `{}` timer source requires an `interval` duration",
                        route.name
                    ));
                }
            }
            SourceKind::Mqtt => {
                require_endpoint_of(&[EndpointKind::Mqtt], errors);
                require_option("topic", errors);
            }
            SourceKind::Kafka => {
                require_endpoint_of(&[EndpointKind::Kafka], errors);
                require_option("topic", errors);
                require_option("group_id", errors);
            }
            SourceKind::Amqp => {
                require_endpoint_of(&[EndpointKind::Amqp], errors);
                require_option("queue", errors);
            }
            SourceKind::HttpServer => {
                require_endpoint_of(&[EndpointKind::HttpServer], errors);
            }
            SourceKind::HttpPoll | SourceKind::Prometheus => {
                require_endpoint_of(&[EndpointKind::HttpClient], errors);
                let interval = route.source.option_str("interval").map(str::to_string);
                if parse_duration_optional(
                    &format!("route `{}` source interval", route.name),
                    interval,
                    errors,
                )
                .is_none()
                {
                    errors.push(format!(
                        "route `{}` source of kind `{}` requires an `interval` duration",
                        route.name,
                        kind.as_str()
                    ));
                }
            }
            SourceKind::OpcUa => {
                require_endpoint_of(&[EndpointKind::OpcUa], errors);
                require_option("node_id", errors);
            }
        }
    }
}

/// Two routes must not mount the same method and path on one listener; the
/// router would reject the second mount at serve time, long after validation.
pub(crate) fn validate_ingress_mounts(
    endpoints: &[EndpointConfig],
    routes: &[RouteDefinition],
    errors: &mut Vec<String>,
) {
    let mut mounts: BTreeMap<(String, String, String), String> = BTreeMap::new();

    for route in routes {
        let bound_kind = route
            .source
            .endpoint
            .as_deref()
            .and_then(|name| endpoint_kind(endpoints, name));
        if route.source.resolve_kind(bound_kind) != Some(SourceKind::HttpServer) {
            continue;
        }
        let Some(endpoint) = route.source.endpoint.as_deref() else {
            continue;
        };
        let Some(path) = route.source.option_str("path") else {
            continue;
        };
        let path = path.trim().to_string();
        let method = route
            .source
            .option_str("method")
            .unwrap_or("POST")
            .trim()
            .to_ascii_uppercase();

        match mounts.entry((endpoint.to_string(), path.clone(), method.clone())) {
            Entry::Occupied(existing) => errors.push(format!(
                "routes `{}` and `{}` both mount `{method} {path}` on endpoint `{endpoint}`",
                existing.get(),
                route.name
            )),
            Entry::Vacant(slot) => {
                slot.insert(route.name.clone());
            }
        }
    }
}

pub(crate) fn validate_sink_requirements(
    endpoints: &[EndpointConfig],
    routes: &[RouteDefinition],
    errors: &mut Vec<String>,
) {
    for route in routes {
        for sink in &route.sinks {
            let Some(kind) = endpoint_kind(endpoints, &sink.endpoint) else {
                continue;
            };

            let require_option = |key: &str, errors: &mut Vec<String>| {
                if sink.option_str(key).is_none() {
                    errors.push(format!(
                        "route `{}` sink `{}` of kind `{}` requires option `{key}`",
                        route.name,
                        sink.endpoint,
                        kind.as_str()
                    ));
                }
            };

            match kind {
                EndpointKind::Mqtt => require_option("topic", errors),
                EndpointKind::Kafka => require_option("topic", errors),
                EndpointKind::Amqp => {
                    if sink.option_str("routing_key").is_none()
                        && sink.option_str("exchange").is_none()
                    {
                        errors.push(format!(
                            "route `{}` sink `{}` of kind `amqp` requires `routing_key` or `exchange`",
                            route.name, sink.endpoint
                        ));
                    }
                }
                EndpointKind::HttpClient => require_option("path", errors),
                EndpointKind::Aas => {
                    require_option("submodel_id", errors);
                    require_option("element_path", errors);
                }
                EndpointKind::HttpServer | EndpointKind::OpcUa => {
                    errors.push(format!(
                        "route `{}` sink `{}` of kind `{}` cannot be used as a sink",
                        route.name,
                        sink.endpoint,
                        kind.as_str()
                    ));
                }
                EndpointKind::Unknown(_) => {}
            }
        }
    }
}

pub(crate) fn validate_policy_requirements(
    routes: &[RouteDefinition],
    _app: &AppConfig,
    errors: &mut Vec<String>,
) {
    for route in routes {
        if route.policy.allow_partial_delivery && route.sinks.len() < 2 {
            errors.push(format!(
                "route `{}` sets allow_partial_delivery but declares fewer than two sinks",
                route.name
            ));
        }

        if let Some(limits) = &route.policy.limits {
            if limits.overflow_policy == Some(super::app::OverflowPolicy::Queue)
                && limits.max_inflight.is_none()
            {
                errors.push(format!(
                    "route `{}` sets overflow_policy `queue` without max_inflight",
                    route.name
                ));
            }
        }
    }
}
