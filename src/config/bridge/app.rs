use humantime::parse_duration;
use serde::Deserialize;
use std::time::Duration;

pub(crate) const KNOWN_FEATURE_FLAGS: &[&str] = &["mqtt", "kafka", "amqp", "opc-ua"];

pub fn known_feature_flags() -> &'static [&'static str] {
    KNOWN_FEATURE_FLAGS
}

pub fn default_app_retry_budget() -> RetryBudget {
    RetryBudget {
        max_attempts: Some(5),
        max_elapsed: Some(Duration::from_secs(30)),
        base_backoff: Some(Duration::from_millis(50)),
        max_backoff: Some(Duration::from_secs(5)),
        jitter: Some(JitterMode::Full),
    }
}

fn merge_retry_budget_with_defaults(
    defaults: &RetryBudget,
    overrides: Option<RetryBudget>,
) -> RetryBudget {
    let mut merged = defaults.clone();
    if let Some(override_budget) = overrides {
        if override_budget.max_attempts.is_some() {
            merged.max_attempts = override_budget.max_attempts;
        }
        if override_budget.max_elapsed.is_some() {
            merged.max_elapsed = override_budget.max_elapsed;
        }
        if override_budget.base_backoff.is_some() {
            merged.base_backoff = override_budget.base_backoff;
        }
        if override_budget.max_backoff.is_some() {
            merged.max_backoff = override_budget.max_backoff;
        }
        if override_budget.jitter.is_some() {
            merged.jitter = override_budget.jitter;
        }
    }
    merged
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub drain_timeout: Duration,
    pub limits: AppLimits,
    pub retry_budget: Option<RetryBudget>,
    pub feature_flags: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            limits: AppLimits::default(),
            retry_budget: Some(default_app_retry_budget()),
            feature_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppLimits {
    pub routes: Option<RouteLimits>,
    pub http: Option<HttpLimits>,
    pub dispatch: Option<DispatchLimits>,
}

impl Default for AppLimits {
    fn default() -> Self {
        Self {
            routes: Some(RouteLimits::default()),
            http: Some(HttpLimits::default()),
            dispatch: Some(DispatchLimits::default()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteLimits {
    pub max_inflight: Option<u32>,
    pub overflow_policy: Option<OverflowPolicy>,
    pub max_queue_depth: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    Reject,
    Queue,
    Shed,
}

#[derive(Debug, Clone, Default)]
pub struct HttpLimits {
    pub max_concurrency: Option<u32>,
    pub max_payload_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchLimits {
    pub max_inflight: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryBudget {
    pub max_attempts: Option<u32>,
    pub max_elapsed: Option<Duration>,
    pub base_backoff: Option<Duration>,
    pub max_backoff: Option<Duration>,
    pub jitter: Option<JitterMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterMode {
    None,
    Equal,
    Full,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawAppSection {
    #[serde(default)]
    pub(crate) drain_timeout: Option<String>,
    #[serde(default)]
    pub(crate) limits: Option<RawAppLimits>,
    #[serde(default)]
    pub(crate) retry_budget: Option<RawRetryBudget>,
    #[serde(default)]
    pub(crate) feature_flags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawAppLimits {
    #[serde(default)]
    pub(crate) routes: Option<RawRouteLimits>,
    #[serde(default)]
    pub(crate) http: Option<RawHttpLimits>,
    #[serde(default)]
    pub(crate) dispatch: Option<RawDispatchLimits>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRouteLimits {
    #[serde(default)]
    pub(crate) max_inflight: Option<u32>,
    #[serde(default)]
    pub(crate) overflow_policy: Option<String>,
    #[serde(default)]
    pub(crate) max_queue_depth: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawHttpLimits {
    #[serde(default)]
    pub(crate) max_concurrency: Option<u32>,
    #[serde(default)]
    pub(crate) max_payload_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawDispatchLimits {
    #[serde(default)]
    pub(crate) max_inflight: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRetryBudget {
    #[serde(default)]
    pub(crate) max_attempts: Option<u32>,
    #[serde(default)]
    pub(crate) max_elapsed: Option<String>,
    #[serde(default)]
    pub(crate) base_backoff: Option<String>,
    #[serde(default)]
    pub(crate) max_backoff: Option<String>,
    #[serde(default)]
    pub(crate) jitter: Option<String>,
}

pub(crate) fn parse_app_config(raw: Option<RawAppSection>, errors: &mut Vec<String>) -> AppConfig {
    let raw = raw.unwrap_or_default();
    let mut config = AppConfig::default();

    if let Some(duration) = parse_duration_optional("app.drain_timeout", raw.drain_timeout, errors)
        .and_then(|dur| ensure_positive_duration(dur, "app.drain_timeout", errors))
    {
        config.drain_timeout = duration;
    }

    if let Some(limits) = raw.limits {
        config.limits = parse_app_limits(limits, errors);
    }

    let override_budget = raw
        .retry_budget
        .and_then(|budget| parse_retry_budget("app.retry_budget", budget, errors));
    config.retry_budget = Some(merge_retry_budget_with_defaults(
        &default_app_retry_budget(),
        override_budget,
    ));

    for flag in &raw.feature_flags {
        if !KNOWN_FEATURE_FLAGS.contains(&flag.as_str()) {
            errors.push(format!(
                "app.feature_flags contains unknown flag `{flag}` (known flags: {})",
                KNOWN_FEATURE_FLAGS.join(", ")
            ));
        }
    }
    config.feature_flags = raw.feature_flags;

    config
}

fn parse_app_limits(raw: RawAppLimits, errors: &mut Vec<String>) -> AppLimits {
    let routes = raw.routes.map(|limits| RouteLimits {
        max_inflight: limits.max_inflight,
        overflow_policy: limits
            .overflow_policy
            .and_then(|policy| parse_overflow_policy("app.limits.routes", &policy, errors)),
        max_queue_depth: limits.max_queue_depth,
    });

    let http = raw.http.map(|limits| HttpLimits {
        max_concurrency: limits.max_concurrency,
        max_payload_bytes: limits.max_payload_bytes,
    });

    let dispatch = raw.dispatch.map(|limits| DispatchLimits {
        max_inflight: limits.max_inflight,
    });

    AppLimits {
        routes,
        http,
        dispatch,
    }
}

pub(crate) fn parse_overflow_policy(
    location: &str,
    raw: &str,
    errors: &mut Vec<String>,
) -> Option<OverflowPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "reject" => Some(OverflowPolicy::Reject),
        "queue" => Some(OverflowPolicy::Queue),
        "shed" => Some(OverflowPolicy::Shed),
        other => {
            errors.push(format!(
                "{location}.overflow_policy must be one of `reject`, `queue`, or `shed` (got `{other}`)"
            ));
            None
        }
    }
}

pub(crate) fn parse_retry_budget(
    location: &str,
    raw: RawRetryBudget,
    errors: &mut Vec<String>,
) -> Option<RetryBudget> {
    let mut budget = RetryBudget {
        max_attempts: raw.max_attempts,
        ..RetryBudget::default()
    };

    if let Some(value) = raw.max_attempts {
        if value == 0 {
            errors.push(format!("{location}.max_attempts must be at least 1"));
        }
    }

    budget.max_elapsed =
        parse_duration_optional(&format!("{location}.max_elapsed"), raw.max_elapsed, errors);
    budget.base_backoff = parse_duration_optional(
        &format!("{location}.base_backoff"),
        raw.base_backoff,
        errors,
    );
    budget.max_backoff =
        parse_duration_optional(&format!("{location}.max_backoff"), raw.max_backoff, errors);

    if let (Some(base), Some(max)) = (budget.base_backoff, budget.max_backoff) {
        if base > max {
            errors.push(format!(
                "{location}.base_backoff must not exceed {location}.max_backoff"
            ));
        }
    }

    budget.jitter = raw.jitter.and_then(|value| {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(JitterMode::None),
            "equal" => Some(JitterMode::Equal),
            "full" => Some(JitterMode::Full),
            other => {
                errors.push(format!(
                    "{location}.jitter must be one of `none`, `equal`, or `full` (got `{other}`)"
                ));
                None
            }
        }
    });

    Some(budget)
}

pub(crate) fn parse_duration_optional(
    location: &str,
    raw: Option<String>,
    errors: &mut Vec<String>,
) -> Option<Duration> {
    let raw = raw?;
    match parse_duration(raw.trim()) {
        Ok(duration) => Some(duration),
        Err(err) => {
            errors.push(format!(
                "{location} is not a valid duration (`{raw}`): {err}"
            ));
            None
        }
    }
}

fn ensure_positive_duration(
    duration: Duration,
    location: &str,
    errors: &mut Vec<String>,
) -> Option<Duration> {
    if duration.is_zero() {
        errors.push(format!("{location} must be greater than zero"));
        None
    } else {
        Some(duration)
    }
}
