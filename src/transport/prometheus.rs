//! Prometheus scrape trigger. Polls a metrics endpoint on an interval, parses
//! the text exposition format, and feeds the samples through the engine as a
//! structured JSON body.

use crate::config::bridge::SourceKind;
use crate::domain::BridgeMessage;
use crate::endpoint::EndpointFactory;
use crate::metrics::metrics;
use crate::retry::{RetryBackoff, RetrySettings};
use crate::route::engine::RouteEngine;
use crate::transport::http_poll::{
    HttpPoller, HttpPollerConfig, HttpPollerError, ReqwestHttpPoller,
};
use crate::transport::{
    sleep_with_shutdown, TaskTransportRuntime, TransportHealth, TransportKind, TransportRun,
    TransportRuntime,
};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use humantime::parse_duration;
use serde::Serialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct PrometheusTriggerRuntime<P>
where
    P: HttpPoller,
{
    inner: TaskTransportRuntime,
    scraper_count: usize,
    _marker: PhantomData<P>,
}

impl PrometheusTriggerRuntime<ReqwestHttpPoller> {
    pub async fn build(
        engine: Arc<RouteEngine>,
        factory: Arc<EndpointFactory>,
    ) -> Result<Self, PrometheusTriggerError> {
        Self::build_with(engine, |config| {
            let factory = Arc::clone(&factory);
            async move {
                ReqwestHttpPoller::connect(config, &factory)
            }
        })
        .await
    }
}

impl<P> PrometheusTriggerRuntime<P>
where
    P: HttpPoller,
{
    pub async fn build_with<F, Fut>(
        engine: Arc<RouteEngine>,
        mut make_poller: F,
    ) -> Result<Self, PrometheusTriggerError>
    where
        F: FnMut(HttpPollerConfig) -> Fut,
        Fut: Future<Output = StdResult<P, HttpPollerError>>,
    {
        let mut instances = Vec::new();

        for plan in engine.plans_for_source(SourceKind::Prometheus) {
            let endpoint = plan.source.endpoint.clone().ok_or_else(|| {
                PrometheusTriggerError::MissingEndpoint {
                    route: plan.name.clone(),
                }
            })?;
            let raw_interval = plan
                .source
                .options
                .get("interval")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| PrometheusTriggerError::MissingInterval {
                    route: plan.name.clone(),
                })?;
            let interval = parse_duration(raw_interval).map_err(|source| {
                PrometheusTriggerError::InvalidInterval {
                    route: plan.name.clone(),
                    value: raw_interval.to_string(),
                    source,
                }
            })?;

            let config = HttpPollerConfig {
                route: plan.name.clone(),
                endpoint: endpoint.clone(),
                method: "GET".to_string(),
                path: plan
                    .source
                    .options
                    .get("path")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("/metrics")
                    .to_string(),
                interval,
            };
            let retry = RetrySettings::from_extras(&plan.source.options, &JsonMap::new());

            let poller = make_poller(config).await.map_err(|err| {
                PrometheusTriggerError::PollerBuild {
                    route: plan.name.clone(),
                    reason: err.to_string(),
                }
            })?;

            instances.push(ScrapeInstance {
                route: plan.name.clone(),
                endpoint,
                interval,
                poller,
                backoff: RetryBackoff::new(retry),
            });
        }

        let scraper_count = instances.len();
        let engine_shared = Arc::clone(&engine);
        let inner =
            TaskTransportRuntime::new(TransportKind::PrometheusIn, "prometheus", move |shutdown| {
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
            scraper_count,
            _marker: PhantomData,
        })
    }

    pub fn scraper_count(&self) -> usize {
        self.scraper_count
    }
}

struct ScrapeInstance<P>
where
    P: HttpPoller,
{
    route: String,
    endpoint: String,
    interval: Duration,
    poller: P,
    backoff: RetryBackoff,
}

impl<P> ScrapeInstance<P>
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
                    self.handle_scrape(&engine, &response.body).await;
                }
                Err(err) => {
                    let delay = self.backoff.on_failure();
                    crate::bridge_event!(
                        warn,
                        "databridge::prometheus",
                        "scrape_failed",
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

    async fn handle_scrape(&self, engine: &Arc<RouteEngine>, body: &[u8]) {
        let text = match std::str::from_utf8(body) {
            Ok(text) => text,
            Err(_) => {
                crate::bridge_event!(
                    warn,
                    "databridge::prometheus",
                    "scrape_not_utf8",
                    endpoint = self.endpoint.as_str(),
                    route = self.route.as_str(),
                );
                return;
            }
        };

        let samples = match parse_prometheus_text(text) {
            Ok(samples) => samples,
            Err(err) => {
                crate::bridge_event!(
                    warn,
                    "databridge::prometheus",
                    "scrape_parse_failed",
                    endpoint = self.endpoint.as_str(),
                    route = self.route.as_str(),
                    error = err,
                );
                return;
            }
        };

        let counters = metrics();
        counters.trigger_started("prometheus");

        let body = json!({
            "scraped_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "samples": samples,
        });
        let message = BridgeMessage::new(&self.endpoint, Vec::new(), body.to_string().into_bytes())
            .with_trace_id(Uuid::new_v4().to_string())
            .with_route(&self.route);

        if let Err(err) = engine.execute(&self.route, message).await {
            crate::bridge_event!(
                error,
                "databridge::prometheus",
                "scrape_route_failed",
                endpoint = self.endpoint.as_str(),
                route = self.route.as_str(),
                error = err,
            );
        }

        counters.trigger_finished("prometheus");
    }
}

/// One parsed exposition line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrometheusSample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
}

/// Parses the Prometheus text exposition format. Comment and `# HELP`/`# TYPE`
/// lines are skipped; histogram and summary series come through as plain
/// samples under their expanded names.
pub fn parse_prometheus_text(input: &str) -> Result<Vec<PrometheusSample>, PrometheusParseError> {
    let mut samples = Vec::new();

    for (line_no, raw_line) in input.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let sample = parse_sample_line(line).map_err(|reason| PrometheusParseError {
            line: line_no + 1,
            reason,
        })?;
        samples.push(sample);
    }

    Ok(samples)
}

fn parse_sample_line(line: &str) -> Result<PrometheusSample, String> {
    let (name_and_labels, rest) = match line.find('{') {
        Some(open) => {
            let close = line[open..]
                .find('}')
                .map(|offset| open + offset)
                .ok_or_else(|| "unterminated label set".to_string())?;
            (
                (&line[..open], Some(&line[open + 1..close])),
                line[close + 1..].trim(),
            )
        }
        None => {
            let mut parts = line.splitn(2, char::is_whitespace);
            let name = parts.next().unwrap_or_default();
            ((name, None), parts.next().unwrap_or_default().trim())
        }
    };

    let (name, raw_labels) = name_and_labels;
    let name = name.trim();
    if name.is_empty() {
        return Err("missing metric name".to_string());
    }
    if !is_valid_metric_name(name) {
        return Err(format!("invalid metric name `{name}`"));
    }

    let labels = match raw_labels {
        Some(raw) => parse_labels(raw)?,
        None => BTreeMap::new(),
    };

    let mut value_parts = rest.split_whitespace();
    let raw_value = value_parts
        .next()
        .ok_or_else(|| "missing sample value".to_string())?;
    let value = parse_sample_value(raw_value)?;

    let timestamp_ms = match value_parts.next() {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| format!("invalid timestamp `{raw}`"))?,
        ),
        None => None,
    };

    Ok(PrometheusSample {
        name: name.to_string(),
        labels,
        value,
        timestamp_ms,
    })
}

fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>, String> {
    let mut labels = BTreeMap::new();
    let mut chars = raw.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(',') | Some(' ')) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        for ch in chars.by_ref() {
            if ch == '=' {
                break;
            }
            key.push(ch);
        }
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err("empty label name".to_string());
        }

        match chars.next() {
            Some('"') => {}
            _ => return Err(format!("label `{key}` value must be quoted")),
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some(ch) = chars.next() {
            match ch {
                '"' => {
                    closed = true;
                    break;
                }
                '\\' => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => return Err("dangling escape in label value".to_string()),
                },
                other => value.push(other),
            }
        }
        if !closed {
            return Err(format!("unterminated value for label `{key}`"));
        }

        labels.insert(key, value);
    }

    Ok(labels)
}

fn parse_sample_value(raw: &str) -> Result<f64, String> {
    match raw {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        other => other
            .parse::<f64>()
            .map_err(|_| format!("invalid sample value `{other}`")),
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == ':')
}

#[derive(Debug, Error)]
#[error("prometheus parse error on line {line}: {reason}")]
pub struct PrometheusParseError {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum PrometheusTriggerError {
    #[error("prometheus route `{route}` has no source endpoint")]
    MissingEndpoint { route: String },
    #[error("prometheus route `{route}` is missing the `interval` option")]
    MissingInterval { route: String },
    #[error("prometheus route `{route}` has invalid interval `{value}`: {source}")]
    InvalidInterval {
        route: String,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("prometheus route `{route}` poller failed to build: {reason}")]
    PollerBuild { route: String, reason: String },
}

#[async_trait]
impl<P> TransportRuntime for PrometheusTriggerRuntime<P>
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_counter() {
        let samples = parse_prometheus_text("requests_total 42\n").unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "requests_total");
        assert_eq!(samples[0].value, 42.0);
        assert!(samples[0].labels.is_empty());
        assert!(samples[0].timestamp_ms.is_none());
    }

    #[test]
    fn parses_labels_and_timestamp() {
        let input = r#"http_requests_total{method="post",code="200"} 1027 1395066363000"#;
        let samples = parse_prometheus_text(input).unwrap();
        assert_eq!(samples[0].labels.get("method").unwrap(), "post");
        assert_eq!(samples[0].labels.get("code").unwrap(), "200");
        assert_eq!(samples[0].timestamp_ms, Some(1395066363000));
    }

    #[test]
    fn skips_help_and_type_lines() {
        let input = "# HELP temp Room temperature\n# TYPE temp gauge\ntemp 21.5\n";
        let samples = parse_prometheus_text(input).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 21.5);
    }

    #[test]
    fn handles_escaped_label_values() {
        let input = r#"msg_total{text="say \"hi\"\n"} 1"#;
        let samples = parse_prometheus_text(input).unwrap();
        assert_eq!(samples[0].labels.get("text").unwrap(), "say \"hi\"\n");
    }

    #[test]
    fn parses_special_float_values() {
        let input = "up{job=\"a\"} +Inf\ndown NaN\n";
        let samples = parse_prometheus_text(input).unwrap();
        assert!(samples[0].value.is_infinite());
        assert!(samples[1].value.is_nan());
    }

    #[test]
    fn rejects_malformed_lines_with_line_numbers() {
        let err = parse_prometheus_text("good 1\nbad{unterminated 2\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn rejects_missing_value() {
        let err = parse_prometheus_text("lonely_metric\n").unwrap_err();
        assert_eq!(err.line, 1);
    }
}
