//! Facade over the runtime counter singleton so call sites never reach into
//! `telemetry` directly.

use crate::telemetry::{
    runtime_counters, HttpMetricsSnapshot, RuntimeCounters, RuntimeCountersSnapshot,
};
use std::time::Duration;

#[derive(Clone, Copy)]
pub struct MetricsCollector {
    counters: &'static RuntimeCounters,
}

pub fn metrics() -> MetricsCollector {
    MetricsCollector::global()
}

impl MetricsCollector {
    pub fn global() -> Self {
        Self {
            counters: runtime_counters(),
        }
    }

    pub fn publish_succeeded(&self, kind: &str, endpoint: &str) {
        self.counters.record_publish_success(kind, endpoint);
    }

    pub fn publish_failed(&self, kind: &str, endpoint: &str, reason: Option<&str>) {
        self.counters.record_publish_failure(kind, endpoint, reason);
    }

    pub fn trigger_started(&self, kind: &str) {
        self.counters.inc_trigger_inflight(kind);
    }

    pub fn trigger_finished(&self, kind: &str) {
        self.counters.dec_trigger_inflight(kind);
    }

    pub fn retry_budget_exhausted(&self, route: &str, endpoint: Option<&str>) {
        self.counters.record_retry_budget_exhausted(route, endpoint);
    }

    pub fn route_queue_depth(&self, route: &str, depth: u32) {
        self.counters.set_route_queue_depth(route, depth);
    }

    pub fn limit_enforced(&self, route: &str, policy: &str) {
        self.counters.record_limit_enforcement(route, policy);
    }

    pub fn route_shed(&self, route: &str) {
        self.counters.record_route_shed(route);
    }

    pub fn http_request(&self, route: &str, status: u16, duration: Duration) {
        self.counters.record_http_request(route, status, duration);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn http_snapshot(&self) -> HttpMetricsSnapshot {
        self.counters.http_metrics_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_outcomes_accumulate_per_endpoint() {
        let collector = metrics();
        collector.publish_succeeded("mqtt", "metrics-broker-a");
        collector.publish_succeeded("mqtt", "metrics-broker-a");
        collector.publish_failed("mqtt", "metrics-broker-a", Some("timeout"));

        let snapshot = collector.snapshot();
        let entry = snapshot
            .publish_outcomes
            .iter()
            .find(|entry| entry.endpoint == "metrics-broker-a")
            .expect("endpoint entry");
        assert_eq!(entry.success, 2);
        assert_eq!(entry.failure, 1);
        assert_eq!(
            entry.failures_by_reason,
            vec![("timeout".to_string(), 1)]
        );
    }

    #[test]
    fn trigger_inflight_tracks_start_and_finish() {
        let collector = metrics();
        collector.trigger_started("metrics-test-timer");
        collector.trigger_started("metrics-test-timer");
        collector.trigger_finished("metrics-test-timer");

        let snapshot = collector.snapshot();
        let entry = snapshot
            .trigger_inflight
            .iter()
            .find(|entry| entry.kind == "metrics-test-timer")
            .expect("trigger entry");
        assert_eq!(entry.inflight, 1);
    }

    #[test]
    fn http_durations_fill_cumulative_buckets() {
        let collector = metrics();
        collector.http_request("metrics-ingest", 202, Duration::from_millis(30));
        collector.http_request("metrics-ingest", 202, Duration::from_millis(700));

        let snapshot = collector.http_snapshot();
        let durations = snapshot
            .durations
            .iter()
            .find(|entry| entry.route == "metrics-ingest")
            .expect("duration entry");
        assert_eq!(durations.count, 2);
        let last = durations.buckets.last().expect("buckets");
        assert_eq!(last.1, 2);
    }
}
