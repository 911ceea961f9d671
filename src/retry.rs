//! Retry primitives shared by trigger loops and the dispatcher.
//!
//! Trigger loops use [`RetrySettings`]/[`RetryBackoff`] for open-ended
//! reconnect backoff; delivery attempts use [`BudgetedRetry`], which walks a
//! bounded [`RetryBudget`] and stops once attempts or elapsed time run out.

use crate::config::bridge::{JitterMode, RetryBudget};
use crate::transport::sleep_with_shutdown;
use async_trait::async_trait;
use humantime::parse_duration;
use rand::Rng;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::cmp::{max, min};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct RetrySettings {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl RetrySettings {
    /// Source options win over endpoint options. Duration keys accept
    /// humantime strings or raw milliseconds; the legacy `_ms` keys stay
    /// readable for older configs.
    pub fn from_extras(
        source_extra: &JsonMap<String, JsonValue>,
        endpoint_extra: &JsonMap<String, JsonValue>,
    ) -> Self {
        let initial = lookup_retry_duration(
            source_extra,
            endpoint_extra,
            "retry_initial",
            "retry_initial_ms",
        )
        .unwrap_or_else(|| Duration::from_millis(200));

        let mut max =
            lookup_retry_duration(source_extra, endpoint_extra, "retry_max", "retry_max_ms")
                .unwrap_or_else(|| Duration::from_secs(5));
        if max < initial {
            max = initial;
        }
        let multiplier = lookup_multiplier(source_extra, endpoint_extra, "retry_multiplier")
            .unwrap_or(2.0)
            .clamp(1.1, 10.0);

        Self {
            initial,
            max,
            multiplier,
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

pub struct RetryBackoff {
    policy: RetrySettings,
    current: Duration,
}

impl RetryBackoff {
    pub fn new(policy: RetrySettings) -> Self {
        let current = policy.initial;
        Self { policy, current }
    }

    pub fn on_success(&mut self) {
        self.current = self.policy.initial;
    }

    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current.max(Duration::from_millis(50));
        let next = (delay.as_millis() as f64 * self.policy.multiplier)
            .round()
            .max(self.policy.initial.as_millis() as f64);
        let capped = next.min(self.policy.max.as_millis() as f64);
        let next_duration = Duration::from_millis(capped as u64);
        self.current = std::cmp::min(next_duration, self.policy.max);
        delay
    }
}

#[async_trait]
pub trait RetryContext {
    type Item;
    type Error;

    async fn poll(&mut self) -> Result<Option<Self::Item>, Self::Error>;
    async fn handle_item(&mut self, item: Self::Item);
    async fn report_error(&mut self, error: &Self::Error, delay: Duration);
}

pub async fn run_retry_loop<C>(
    shutdown: CancellationToken,
    settings: RetrySettings,
    idle_delay: Duration,
    context: &mut C,
) where
    C: RetryContext + Send,
{
    let mut current = settings.initial();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = context.poll() => match result {
                Ok(Some(item)) => {
                    current = settings.initial();
                    context.handle_item(item).await;
                }
                Ok(None) => {
                    if sleep_with_shutdown(idle_delay, &shutdown).await {
                        break;
                    }
                }
                Err(err) => {
                    let delay = backoff_delay(current);
                    current = next_backoff(current, &settings);
                    context.report_error(&err, delay).await;
                    if sleep_with_shutdown(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }
    }
}

fn backoff_delay(current: Duration) -> Duration {
    current.max(Duration::from_millis(50))
}

fn next_backoff(current: Duration, settings: &RetrySettings) -> Duration {
    let delay = backoff_delay(current);
    let next = (delay.as_millis() as f64 * settings.multiplier()).round();
    let capped = next.min(settings.max().as_millis() as f64);
    let next_duration = Duration::from_millis(capped as u64);
    std::cmp::min(next_duration, settings.max())
}

/// Merges budgets from broadest to narrowest scope: attempts, elapsed time and
/// backoff ceiling take the tightest value, base backoff the widest, jitter the
/// most randomised mode.
pub fn merge_retry_budgets<'a, I>(budgets: I) -> Option<RetryBudget>
where
    I: IntoIterator<Item = Option<&'a RetryBudget>>,
{
    let mut merged = RetryBudget::default();
    let mut seen = false;

    for budget in budgets.into_iter().flatten() {
        seen = true;
        merged.max_attempts = min_opt(merged.max_attempts, budget.max_attempts);
        merged.max_elapsed = min_duration_opt(merged.max_elapsed, budget.max_elapsed);
        merged.base_backoff = max_duration_opt(merged.base_backoff, budget.base_backoff);
        merged.max_backoff = min_duration_opt(merged.max_backoff, budget.max_backoff);
        merged.jitter = merge_jitter(merged.jitter, budget.jitter);
    }

    if seen {
        Some(merged)
    } else {
        None
    }
}

fn min_opt<T: Ord>(current: Option<T>, candidate: Option<T>) -> Option<T> {
    match (current, candidate) {
        (Some(lhs), Some(rhs)) => Some(min(lhs, rhs)),
        (Some(lhs), None) => Some(lhs),
        (None, Some(rhs)) => Some(rhs),
        (None, None) => None,
    }
}

fn max_duration_opt(current: Option<Duration>, candidate: Option<Duration>) -> Option<Duration> {
    match (current, candidate) {
        (Some(lhs), Some(rhs)) => Some(max(lhs, rhs)),
        (Some(lhs), None) => Some(lhs),
        (None, Some(rhs)) => Some(rhs),
        (None, None) => None,
    }
}

fn min_duration_opt(current: Option<Duration>, candidate: Option<Duration>) -> Option<Duration> {
    match (current, candidate) {
        (Some(lhs), Some(rhs)) => Some(min(lhs, rhs)),
        (Some(lhs), None) => Some(lhs),
        (None, Some(rhs)) => Some(rhs),
        (None, None) => None,
    }
}

fn merge_jitter(current: Option<JitterMode>, candidate: Option<JitterMode>) -> Option<JitterMode> {
    match (current, candidate) {
        (Some(lhs), Some(rhs)) => {
            if jitter_rank(rhs) >= jitter_rank(lhs) {
                Some(rhs)
            } else {
                Some(lhs)
            }
        }
        (Some(lhs), None) => Some(lhs),
        (None, Some(rhs)) => Some(rhs),
        (None, None) => None,
    }
}

const fn jitter_rank(mode: JitterMode) -> u8 {
    match mode {
        JitterMode::None => 0,
        JitterMode::Equal => 1,
        JitterMode::Full => 2,
    }
}

pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    let min_secs = min.as_secs_f64();
    let span = max.as_secs_f64() - min_secs;
    let sample = rng.gen::<f64>() * span + min_secs;
    Duration::from_secs_f64(sample)
}

pub fn retry_after_seconds_from_budget(budget: Option<&RetryBudget>) -> u64 {
    match budget {
        Some(budget) => {
            let mut delay = budget.base_backoff.unwrap_or(Duration::from_secs(1));
            if let Some(max_backoff) = budget.max_backoff {
                if delay > max_backoff {
                    delay = max_backoff;
                }
            }
            if let Some(max_elapsed) = budget.max_elapsed {
                if delay > max_elapsed {
                    delay = max_elapsed;
                }
            }
            duration_to_seconds(delay)
        }
        None => 1,
    }
}

fn duration_to_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() == 0 {
        secs.max(1)
    } else {
        secs.saturating_add(1).max(1)
    }
}

/// Tracks attempts against a bounded budget. Each call to [`next_delay`]
/// consumes one retry; `None` means the budget is spent and the failure is
/// final.
///
/// [`next_delay`]: BudgetedRetry::next_delay
pub struct BudgetedRetry {
    budget: RetryBudget,
    attempts: u32,
    started: Instant,
}

impl BudgetedRetry {
    pub fn new(budget: RetryBudget) -> Self {
        Self {
            budget,
            attempts: 0,
            started: Instant::now(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);

        if let Some(max_attempts) = self.budget.max_attempts {
            // attempt 1 is the original try, so max_attempts=1 means no retries
            if self.attempts >= max_attempts {
                return None;
            }
        }
        if let Some(max_elapsed) = self.budget.max_elapsed {
            if self.started.elapsed() >= max_elapsed {
                return None;
            }
        }

        let base = self
            .budget
            .base_backoff
            .unwrap_or_else(|| Duration::from_millis(50));
        let exponent = self.attempts.saturating_sub(1).min(16);
        let mut delay = base.saturating_mul(1u32 << exponent);
        if let Some(max_backoff) = self.budget.max_backoff {
            delay = min(delay, max_backoff);
        }

        Some(match self.budget.jitter.unwrap_or(JitterMode::None) {
            JitterMode::None => delay,
            JitterMode::Equal => {
                let half = delay / 2;
                half + jitter_between(Duration::ZERO, delay.saturating_sub(half))
            }
            JitterMode::Full => jitter_between(Duration::ZERO, delay),
        })
    }
}

fn lookup_retry_duration(
    source_extra: &JsonMap<String, JsonValue>,
    endpoint_extra: &JsonMap<String, JsonValue>,
    key: &str,
    legacy_key: &str,
) -> Option<Duration> {
    lookup_duration_value(source_extra, endpoint_extra, key)
        .or_else(|| lookup_legacy_duration(source_extra, endpoint_extra, legacy_key))
}

fn lookup_multiplier(
    source_extra: &JsonMap<String, JsonValue>,
    endpoint_extra: &JsonMap<String, JsonValue>,
    key: &str,
) -> Option<f64> {
    lookup_number(source_extra, endpoint_extra, key).map(|value| value.max(1.0))
}

fn lookup_number(
    source_extra: &JsonMap<String, JsonValue>,
    endpoint_extra: &JsonMap<String, JsonValue>,
    key: &str,
) -> Option<f64> {
    source_extra
        .get(key)
        .or_else(|| endpoint_extra.get(key))
        .and_then(value_to_f64)
}

fn lookup_duration_value(
    source_extra: &JsonMap<String, JsonValue>,
    endpoint_extra: &JsonMap<String, JsonValue>,
    key: &str,
) -> Option<Duration> {
    source_extra
        .get(key)
        .or_else(|| endpoint_extra.get(key))
        .and_then(duration_from_json)
}

fn lookup_legacy_duration(
    source_extra: &JsonMap<String, JsonValue>,
    endpoint_extra: &JsonMap<String, JsonValue>,
    key: &str,
) -> Option<Duration> {
    lookup_number(source_extra, endpoint_extra, key)
        .map(|value| Duration::from_millis(value.max(0.0) as u64))
}

fn duration_from_json(value: &JsonValue) -> Option<Duration> {
    match value {
        JsonValue::String(text) => parse_duration(text).ok(),
        JsonValue::Number(num) => num
            .as_f64()
            .map(|ms| Duration::from_millis(ms.max(0.0) as u64)),
        _ => None,
    }
}

fn value_to_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(num) => num.as_f64(),
        JsonValue::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extras(value: JsonValue) -> JsonMap<String, JsonValue> {
        let JsonValue::Object(map) = value else {
            panic!("extras must be an object");
        };
        map
    }

    #[test]
    fn retry_settings_prefer_source_over_endpoint() {
        let source = extras(json!({"retry_initial": "1s"}));
        let endpoint = extras(json!({"retry_initial": "10s", "retry_max": "30s"}));
        let settings = RetrySettings::from_extras(&source, &endpoint);
        assert_eq!(settings.initial(), Duration::from_secs(1));
        assert_eq!(settings.max(), Duration::from_secs(30));
    }

    #[test]
    fn retry_settings_accept_legacy_millisecond_keys() {
        let source = extras(json!({"retry_initial_ms": 500}));
        let settings = RetrySettings::from_extras(&source, &JsonMap::new());
        assert_eq!(settings.initial(), Duration::from_millis(500));
    }

    #[test]
    fn multiplier_is_clamped() {
        let source = extras(json!({"retry_multiplier": 100.0}));
        let settings = RetrySettings::from_extras(&source, &JsonMap::new());
        assert_eq!(settings.multiplier(), 10.0);
    }

    #[test]
    fn backoff_grows_and_resets() {
        let source = extras(json!({"retry_initial": "100ms", "retry_max": "1s"}));
        let mut backoff = RetryBackoff::new(RetrySettings::from_extras(&source, &JsonMap::new()));

        let first = backoff.on_failure();
        let second = backoff.on_failure();
        assert!(second > first);

        backoff.on_success();
        assert_eq!(backoff.on_failure(), Duration::from_millis(100));
    }

    #[test]
    fn merged_budget_takes_tightest_limits() {
        let app = RetryBudget {
            max_attempts: Some(5),
            max_elapsed: Some(Duration::from_secs(30)),
            base_backoff: Some(Duration::from_millis(50)),
            max_backoff: Some(Duration::from_secs(5)),
            jitter: Some(JitterMode::Equal),
        };
        let route = RetryBudget {
            max_attempts: Some(2),
            max_elapsed: None,
            base_backoff: Some(Duration::from_millis(200)),
            max_backoff: Some(Duration::from_secs(2)),
            jitter: Some(JitterMode::Full),
        };

        let merged = merge_retry_budgets([Some(&app), Some(&route)]).unwrap();
        assert_eq!(merged.max_attempts, Some(2));
        assert_eq!(merged.max_elapsed, Some(Duration::from_secs(30)));
        assert_eq!(merged.base_backoff, Some(Duration::from_millis(200)));
        assert_eq!(merged.max_backoff, Some(Duration::from_secs(2)));
        assert_eq!(merged.jitter, Some(JitterMode::Full));
    }

    #[test]
    fn merging_no_budgets_yields_none() {
        assert!(merge_retry_budgets([None, None]).is_none());
    }

    #[test]
    fn budgeted_retry_stops_at_max_attempts() {
        let mut retry = BudgetedRetry::new(RetryBudget {
            max_attempts: Some(3),
            max_elapsed: None,
            base_backoff: Some(Duration::from_millis(10)),
            max_backoff: Some(Duration::from_millis(100)),
            jitter: Some(JitterMode::None),
        });

        assert_eq!(retry.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(retry.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(retry.next_delay(), None);
    }

    #[test]
    fn budgeted_retry_caps_delay_at_max_backoff() {
        let mut retry = BudgetedRetry::new(RetryBudget {
            max_attempts: Some(10),
            max_elapsed: None,
            base_backoff: Some(Duration::from_millis(100)),
            max_backoff: Some(Duration::from_millis(250)),
            jitter: Some(JitterMode::None),
        });

        let delays: Vec<_> = (0..4).filter_map(|_| retry.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(250),
                Duration::from_millis(250),
            ]
        );
    }

    #[test]
    fn retry_after_respects_elapsed_and_backoff() {
        let budget = RetryBudget {
            max_attempts: Some(3),
            max_elapsed: Some(Duration::from_secs(2)),
            base_backoff: Some(Duration::from_secs(5)),
            max_backoff: Some(Duration::from_secs(10)),
            jitter: Some(JitterMode::None),
        };
        assert_eq!(retry_after_seconds_from_budget(Some(&budget)), 2);
    }

    #[test]
    fn retry_after_defaults_to_one_second() {
        assert_eq!(retry_after_seconds_from_budget(None), 1);
    }

    #[test]
    fn jitter_between_stays_in_range() {
        for _ in 0..100 {
            let sample = jitter_between(Duration::from_millis(10), Duration::from_millis(20));
            assert!(sample >= Duration::from_millis(10));
            assert!(sample <= Duration::from_millis(20));
        }
    }
}
