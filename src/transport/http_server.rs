//! HTTP ingress. One axum server per http-server endpoint; each route on the
//! endpoint mounts a handler that feeds the request through the engine and,
//! unless fire-and-forget, parks on a response slot until the route surfaces
//! a value or the endpoint's response timeout passes.

use crate::backpressure::BackpressureController;
use crate::delegator::response_slot;
use crate::domain::BridgeMessage;
use crate::endpoint::registry::HttpServerEndpoint;
use crate::endpoint::EndpointRegistry;
use crate::metrics::metrics;
use crate::retry::retry_after_seconds_from_budget;
use crate::route::engine::{RouteEngine, RouteEngineError};
use crate::transport::{
    TaskTransportRuntime, TransportHealth, TransportKind, TransportRun, TransportRuntime,
};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{on, MethodFilter};
use axum::Router;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpServerRuntime {
    inner: TaskTransportRuntime,
    server_count: usize,
}

impl HttpServerRuntime {
    pub fn build(
        engine: Arc<RouteEngine>,
        registry: Arc<EndpointRegistry>,
        controller: BackpressureController,
    ) -> Result<Self, HttpServerTriggerError> {
        let mut servers: HashMap<String, ServerSpec> = HashMap::new();

        for plan in engine.plans_for_source(crate::config::bridge::SourceKind::HttpServer) {
            let endpoint_name = plan.source.endpoint.clone().ok_or_else(|| {
                HttpServerTriggerError::MissingEndpoint {
                    route: plan.name.clone(),
                }
            })?;
            let endpoint = registry
                .http_server(&endpoint_name)
                .cloned()
                .ok_or_else(|| HttpServerTriggerError::UnknownEndpoint {
                    route: plan.name.clone(),
                    endpoint: endpoint_name.clone(),
                })?;

            let path = plan
                .source
                .options
                .get("path")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| HttpServerTriggerError::MissingPath {
                    route: plan.name.clone(),
                })?
                .to_string();
            if !path.starts_with('/') {
                return Err(HttpServerTriggerError::InvalidPath {
                    route: plan.name.clone(),
                    path,
                });
            }

            let method = plan
                .source
                .options
                .get("method")
                .and_then(JsonValue::as_str)
                .unwrap_or("POST")
                .to_ascii_uppercase();
            let filter = method_filter(&method).ok_or_else(|| {
                HttpServerTriggerError::UnsupportedMethod {
                    route: plan.name.clone(),
                    method: method.clone(),
                }
            })?;

            let respond = plan
                .source
                .options
                .get("respond")
                .and_then(JsonValue::as_bool)
                .unwrap_or(true);

            let state = Arc::new(IngressState {
                route: plan.name.clone(),
                endpoint: endpoint_name.clone(),
                respond,
                response_timeout: endpoint.response_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT),
                retry_after: retry_after_seconds_from_budget(endpoint.retry_budget.as_ref()),
                engine: Arc::clone(&engine),
                controller: controller.clone(),
            });

            servers
                .entry(endpoint_name)
                .or_insert_with(|| ServerSpec {
                    endpoint,
                    mounts: Vec::new(),
                })
                .mounts
                .push(Mount {
                    path,
                    filter,
                    state,
                });
        }

        let server_count = servers.len();
        let inner = TaskTransportRuntime::new(TransportKind::HttpIn, "http-server", move |shutdown| {
            servers
                .into_values()
                .map(|spec| {
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        serve_endpoint(spec, shutdown).await;
                    })
                })
                .collect()
        });

        Ok(Self {
            inner,
            server_count,
        })
    }

    pub fn server_count(&self) -> usize {
        self.server_count
    }
}

struct ServerSpec {
    endpoint: HttpServerEndpoint,
    mounts: Vec<Mount>,
}

struct Mount {
    path: String,
    filter: MethodFilter,
    state: Arc<IngressState>,
}

struct IngressState {
    route: String,
    endpoint: String,
    respond: bool,
    response_timeout: Duration,
    retry_after: u64,
    engine: Arc<RouteEngine>,
    controller: BackpressureController,
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "PATCH" => Some(MethodFilter::PATCH),
        "DELETE" => Some(MethodFilter::DELETE),
        _ => None,
    }
}

async fn serve_endpoint(spec: ServerSpec, shutdown: CancellationToken) {
    let mut router = Router::new().route("/healthz", axum::routing::get(healthz));
    for mount in spec.mounts {
        let state = mount.state;
        router = router.route(
            &mount.path,
            on(mount.filter, move |headers: HeaderMap, body: Bytes| {
                handle_ingress(Arc::clone(&state), headers, body)
            }),
        );
    }
    if let Some(max_body_bytes) = spec.endpoint.max_body_bytes {
        router = router.layer(DefaultBodyLimit::max(max_body_bytes));
    }

    let listener = match tokio::net::TcpListener::bind(&spec.endpoint.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            crate::bridge_event!(
                error,
                "databridge::http_server",
                "bind_failed",
                endpoint = spec.endpoint.name.as_str(),
                bind = spec.endpoint.bind,
                error = err,
            );
            return;
        }
    };

    crate::bridge_event!(
        info,
        "databridge::http_server",
        "listening",
        endpoint = spec.endpoint.name.as_str(),
        bind = spec.endpoint.bind,
    );

    let graceful = shutdown.clone();
    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await
    {
        crate::bridge_event!(
            error,
            "databridge::http_server",
            "server_failed",
            endpoint = spec.endpoint.name.as_str(),
            bind = spec.endpoint.bind,
            error = err,
        );
    }
}

async fn healthz() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn handle_ingress(state: Arc<IngressState>, headers: HeaderMap, body: Bytes) -> Response {
    let started = Instant::now();
    let response = ingress_response(&state, headers, body).await;
    metrics().http_request(&state.route, response.status().as_u16(), started.elapsed());
    response
}

async fn ingress_response(state: &Arc<IngressState>, headers: HeaderMap, body: Bytes) -> Response {
    let permit = match state.controller.try_acquire_now() {
        Some(permit) => permit,
        None => return overloaded_response(state.retry_after),
    };

    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    let trace_id = headers
        .get("x-trace-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let counters = metrics();
    counters.trigger_started("http-in");

    let message = BridgeMessage::new(&state.endpoint, header_pairs, body.to_vec())
        .with_trace_id(&trace_id)
        .with_route(&state.route);

    let response = if state.respond {
        let (sender, slot) = response_slot();
        match state
            .engine
            .execute_with_responder(&state.route, message, Some(sender))
            .await
        {
            Ok(outcome) if outcome.shed => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "route shedding load", "trace_id": trace_id})),
            )
                .into_response(),
            Ok(_) => {
                let delegated = slot.wait(state.response_timeout).await;
                if delegated.received {
                    Json(delegated.value.unwrap_or(JsonValue::Null)).into_response()
                } else {
                    (
                        StatusCode::GATEWAY_TIMEOUT,
                        Json(json!({"error": "no response before deadline", "trace_id": trace_id})),
                    )
                        .into_response()
                }
            }
            Err(err) => engine_error_response(state, &trace_id, err),
        }
    } else {
        let engine = Arc::clone(&state.engine);
        let route = state.route.clone();
        let endpoint = state.endpoint.clone();
        let background_permit = permit;
        tokio::spawn(async move {
            let _permit = background_permit;
            if let Err(err) = engine.execute(&route, message).await {
                crate::bridge_event!(
                    error,
                    "databridge::http_server",
                    "ingress_route_failed",
                    endpoint = endpoint.as_str(),
                    route = route.as_str(),
                    error = err,
                );
            }
        });
        let accepted = (
            StatusCode::ACCEPTED,
            Json(json!({"accepted": true, "trace_id": trace_id})),
        )
            .into_response();
        counters.trigger_finished("http-in");
        return accepted;
    };

    counters.trigger_finished("http-in");
    drop(permit);
    response
}

fn engine_error_response(state: &IngressState, trace_id: &str, err: RouteEngineError) -> Response {
    match err {
        RouteEngineError::Overloaded { .. } => overloaded_response(state.retry_after),
        RouteEngineError::UnknownRoute { .. } => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": err.to_string(), "trace_id": trace_id})),
        )
            .into_response(),
        RouteEngineError::Transform { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": err.to_string(), "trace_id": trace_id})),
        )
            .into_response(),
        other => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": other.to_string(), "trace_id": trace_id})),
        )
            .into_response(),
    }
}

fn overloaded_response(retry_after: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", retry_after.to_string())],
        Json(json!({"error": "too many requests"})),
    )
        .into_response()
}

#[derive(Debug, Error)]
pub enum HttpServerTriggerError {
    #[error("http-server route `{route}` has no source endpoint")]
    MissingEndpoint { route: String },
    #[error("http-server route `{route}` references unknown endpoint `{endpoint}`")]
    UnknownEndpoint { route: String, endpoint: String },
    #[error("http-server route `{route}` is missing the `path` option")]
    MissingPath { route: String },
    #[error("http-server route `{route}` has invalid path `{path}`")]
    InvalidPath { route: String, path: String },
    #[error("http-server route `{route}` has unsupported method `{method}`")]
    UnsupportedMethod { route: String, method: String },
}

#[async_trait]
impl TransportRuntime for HttpServerRuntime {
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
