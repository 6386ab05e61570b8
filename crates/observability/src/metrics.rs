//! Fire-and-forget measurement sinks.
//!
//! Recording must never block or fail the caller: implementations swallow their
//! own errors.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bounds (milliseconds) of the latency histogram buckets. Anything slower
/// lands in the overflow bucket.
pub const LATENCY_BUCKETS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

/// Destination for counters and latency observations.
pub trait MetricsSink: Send + Sync {
    /// Count one event outcome, keyed by `(event_name, status)`.
    fn event_processed(&self, event_name: &str, status: &str);

    /// Observe one HTTP request, keyed by `(method, path, status)`.
    fn request_completed(&self, method: &str, path: &str, status: u16, latency: Duration);

    /// Count one action dispatch outcome, keyed by `(action, outcome)`.
    fn action_dispatched(&self, action: &str, outcome: &str);
}

/// Shared handle passed to components at construction.
pub type Metrics = Arc<dyn MetricsSink>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn event_processed(&self, _: &str, _: &str) {}
    fn request_completed(&self, _: &str, _: &str, _: u16, _: Duration) {}
    fn action_dispatched(&self, _: &str, _: &str) {}
}

/// Emits every measurement as a `tracing` event (target `pulse::metrics`).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn event_processed(&self, event_name: &str, status: &str) {
        ::tracing::info!(target: "pulse::metrics", metric = "events_total", event_name, status);
    }

    fn request_completed(&self, method: &str, path: &str, status: u16, latency: Duration) {
        ::tracing::info!(
            target: "pulse::metrics",
            metric = "http_request_duration",
            method,
            path,
            status,
            latency_ms = latency.as_secs_f64() * 1000.0,
        );
    }

    fn action_dispatched(&self, action: &str, outcome: &str) {
        ::tracing::info!(target: "pulse::metrics", metric = "actions_total", action, outcome);
    }
}

/// Cumulative latency histogram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencyHistogram {
    pub count: u64,
    pub sum_ms: u64,
    /// One count per entry of [`LATENCY_BUCKETS_MS`] plus the overflow bucket.
    pub buckets: Vec<u64>,
}

impl LatencyHistogram {
    fn observe(&mut self, latency: Duration) {
        if self.buckets.is_empty() {
            self.buckets = vec![0; LATENCY_BUCKETS_MS.len() + 1];
        }
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_ms = self.sum_ms.saturating_add(ms);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events: BTreeMap<(String, String), u64>,
    pub requests: BTreeMap<(String, String, u16), LatencyHistogram>,
    pub actions: BTreeMap<(String, String), u64>,
}

impl MetricsSnapshot {
    pub fn event_count(&self, event_name: &str, status: &str) -> u64 {
        self.events
            .get(&(event_name.to_string(), status.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn request_count(&self, method: &str, path: &str, status: u16) -> u64 {
        self.requests
            .get(&(method.to_string(), path.to_string(), status))
            .map(|h| h.count)
            .unwrap_or(0)
    }

    pub fn action_count(&self, action: &str, outcome: &str) -> u64 {
        self.actions
            .get(&(action.to_string(), outcome.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// Keeps measurements in memory; used by tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    state: Mutex<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn event_processed(&self, event_name: &str, status: &str) {
        if let Ok(mut s) = self.state.lock() {
            *s.events
                .entry((event_name.to_string(), status.to_string()))
                .or_default() += 1;
        }
    }

    fn request_completed(&self, method: &str, path: &str, status: u16, latency: Duration) {
        if let Ok(mut s) = self.state.lock() {
            s.requests
                .entry((method.to_string(), path.to_string(), status))
                .or_default()
                .observe(latency);
        }
    }

    fn action_dispatched(&self, action: &str, outcome: &str) {
        if let Ok(mut s) = self.state.lock() {
            *s.actions
                .entry((action.to_string(), outcome.to_string()))
                .or_default() += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_events_by_name_and_status() {
        let m = InMemoryMetrics::new();
        m.event_processed("user_signup", "accepted");
        m.event_processed("user_signup", "accepted");
        m.event_processed("user_signup", "rejected");

        let snap = m.snapshot();
        assert_eq!(snap.event_count("user_signup", "accepted"), 2);
        assert_eq!(snap.event_count("user_signup", "rejected"), 1);
        assert_eq!(snap.event_count("page_view", "accepted"), 0);
    }

    #[test]
    fn latency_lands_in_the_right_bucket() {
        let m = InMemoryMetrics::new();
        m.request_completed("POST", "/events", 202, Duration::from_millis(3));
        m.request_completed("POST", "/events", 202, Duration::from_millis(120));
        m.request_completed("POST", "/events", 202, Duration::from_secs(60));

        let snap = m.snapshot();
        let h = &snap.requests[&("POST".to_string(), "/events".to_string(), 202)];
        assert_eq!(h.count, 3);
        assert_eq!(h.buckets[0], 1);
        assert_eq!(h.buckets[5], 1);
        assert_eq!(h.buckets[LATENCY_BUCKETS_MS.len()], 1);
        assert_eq!(snap.request_count("POST", "/events", 202), 3);
    }

    #[test]
    fn handles_are_shareable_trait_objects() {
        let concrete = Arc::new(InMemoryMetrics::new());
        let handle: Metrics = concrete.clone();
        handle.action_dispatched("webhook", "delivered");
        assert_eq!(concrete.snapshot().action_count("webhook", "delivered"), 1);

        let noop: Metrics = Arc::new(NoopMetrics);
        noop.event_processed("x", "accepted");
    }
}
