//! Per-upstream circuit breaker.
//!
//! The tracker owns one health record per upstream for the lifetime of the process.
//! Records are created up front and never removed, so the outer map is immutable and
//! only the per-upstream mutex is taken on reads and writes. Operations on different
//! upstreams never contend.
//!
//! # State transitions
//!
//! ```text
//! healthy   -> unhealthy: windowed error rate > threshold, or consecutive failures >= limit
//!                         (cooldown starts)
//! unhealthy -> healthy:   cooldown elapsed and windowed error rate < threshold, observed
//!                         either by a recovery attempt or by a successful request
//! ```
//!
//! Every `*_at` method takes the observation time explicitly; the plain variants use
//! `Instant::now()`.

use crate::config::RoutingThresholds;
use crate::metrics_defs::{UPSTREAM_CIRCUIT_CLOSED, UPSTREAM_CIRCUIT_OPENED};
use crate::upstream::Roster;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use shared::counter;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HealthError {
    #[error("upstream {0} is not tracked")]
    UnknownUpstream(String),
}

#[derive(Debug)]
struct UpstreamHealth {
    /// Failure timestamps inside the window, oldest first
    failures: VecDeque<Instant>,
    total_requests: u64,
    total_errors: u64,
    consecutive_errors: u32,
    last_failure: Option<SystemTime>,
    last_success: Option<SystemTime>,
    healthy: bool,
    /// When the circuit last opened; the cooldown counts from here
    opened_at: Option<Instant>,
    latency: Option<Duration>,
    /// Times the pipeline selected this upstream
    routed_requests: u64,
    method_counts: BTreeMap<String, u64>,
}

impl UpstreamHealth {
    fn new() -> Self {
        Self {
            failures: VecDeque::new(),
            total_requests: 0,
            total_errors: 0,
            consecutive_errors: 0,
            last_failure: None,
            last_success: None,
            healthy: true,
            opened_at: None,
            latency: None,
            routed_requests: 0,
            method_counts: BTreeMap::new(),
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate(&mut self, now: Instant, window: Duration) -> f64 {
        self.prune(now, window);
        self.failures.len() as f64 / self.total_requests.max(1) as f64
    }

    fn cooldown_elapsed(&self, now: Instant, cooldown: Duration) -> bool {
        self.opened_at
            .is_none_or(|opened| now.saturating_duration_since(opened) >= cooldown)
    }
}

/// Point-in-time view of one upstream, served by the admin endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub id: String,
    pub healthy: bool,
    pub error_rate: f64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub consecutive_errors: u32,
    pub routed_requests: u64,
    pub method_counts: BTreeMap<String, u64>,
    pub last_success_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    pub latency_ms: Option<u64>,
}

pub struct HealthTracker {
    thresholds: RoutingThresholds,
    records: IndexMap<String, Mutex<UpstreamHealth>>,
}

impl HealthTracker {
    pub fn new<I, S>(thresholds: RoutingThresholds, upstream_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = upstream_ids
            .into_iter()
            .map(|id| (id.into(), Mutex::new(UpstreamHealth::new())))
            .collect();

        Self {
            thresholds,
            records,
        }
    }

    pub fn for_roster(thresholds: RoutingThresholds, roster: &Roster) -> Self {
        Self::new(thresholds, roster.iter().map(|u| u.id.clone()))
    }

    pub fn thresholds(&self) -> &RoutingThresholds {
        &self.thresholds
    }

    fn record(&self, id: &str) -> Result<&Mutex<UpstreamHealth>, HealthError> {
        self.records
            .get(id)
            .ok_or_else(|| HealthError::UnknownUpstream(id.to_string()))
    }

    pub fn is_healthy(&self, id: &str) -> Result<bool, HealthError> {
        Ok(self.record(id)?.lock().healthy)
    }

    pub fn error_rate(&self, id: &str) -> Result<f64, HealthError> {
        self.error_rate_at(id, Instant::now())
    }

    /// Prunes failures older than the window and returns `failures / max(total, 1)`.
    pub fn error_rate_at(&self, id: &str, now: Instant) -> Result<f64, HealthError> {
        let window = self.thresholds.window();
        Ok(self.record(id)?.lock().error_rate(now, window))
    }

    pub fn record_outcome(
        &self,
        id: &str,
        success: bool,
        latency: Duration,
    ) -> Result<(), HealthError> {
        self.record_outcome_at(id, success, latency, Instant::now())
    }

    pub fn record_outcome_at(
        &self,
        id: &str,
        success: bool,
        latency: Duration,
        now: Instant,
    ) -> Result<(), HealthError> {
        let thresholds = &self.thresholds;
        let mut record = self.record(id)?.lock();

        record.total_requests += 1;
        record.latency = Some(latency);

        if success {
            record.consecutive_errors = 0;
            record.last_success = Some(SystemTime::now());

            if !record.healthy
                && record.cooldown_elapsed(now, thresholds.cooldown())
                && record.error_rate(now, thresholds.window()) < thresholds.error_rate_threshold
            {
                record.healthy = true;
                record.opened_at = None;
                counter!(UPSTREAM_CIRCUIT_CLOSED, "upstream" => id.to_string()).increment(1);
                tracing::info!(upstream = %id, "upstream recovered after successful request");
            }
            return Ok(());
        }

        record.failures.push_back(now);
        record.total_errors += 1;
        record.consecutive_errors += 1;
        record.last_failure = Some(SystemTime::now());

        let error_rate = record.error_rate(now, thresholds.window());
        if error_rate > thresholds.error_rate_threshold
            || record.consecutive_errors >= thresholds.consecutive_failure_limit
        {
            if record.healthy {
                counter!(UPSTREAM_CIRCUIT_OPENED, "upstream" => id.to_string()).increment(1);
                tracing::warn!(
                    upstream = %id,
                    error_rate,
                    consecutive_errors = record.consecutive_errors,
                    "marking upstream unhealthy"
                );
            }
            record.healthy = false;
            record.opened_at = Some(now);
        }

        Ok(())
    }

    pub fn attempt_recovery(&self, id: &str) -> Result<bool, HealthError> {
        self.attempt_recovery_at(id, Instant::now())
    }

    /// Flips an unhealthy upstream back to healthy if its cooldown has elapsed and its
    /// windowed error rate is below the threshold. Returns whether it recovered.
    pub fn attempt_recovery_at(&self, id: &str, now: Instant) -> Result<bool, HealthError> {
        let thresholds = &self.thresholds;
        let mut record = self.record(id)?.lock();

        if record.healthy || !record.cooldown_elapsed(now, thresholds.cooldown()) {
            return Ok(false);
        }

        let error_rate = record.error_rate(now, thresholds.window());
        if error_rate >= thresholds.error_rate_threshold {
            tracing::debug!(upstream = %id, error_rate, "upstream not recovered yet");
            return Ok(false);
        }

        record.healthy = true;
        record.opened_at = None;
        counter!(UPSTREAM_CIRCUIT_CLOSED, "upstream" => id.to_string()).increment(1);
        tracing::info!(upstream = %id, error_rate, "upstream recovered after cooldown");
        Ok(true)
    }

    /// Counts a pipeline selection of `id` for `method`.
    pub fn record_selection(&self, id: &str, method: &str) -> Result<(), HealthError> {
        let mut record = self.record(id)?.lock();
        record.routed_requests += 1;
        *record.method_counts.entry(method.to_string()).or_default() += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let now = Instant::now();
        let window = self.thresholds.window();

        self.records
            .iter()
            .map(|(id, record)| {
                let mut record = record.lock();
                HealthSnapshot {
                    id: id.clone(),
                    healthy: record.healthy,
                    error_rate: record.error_rate(now, window),
                    total_requests: record.total_requests,
                    total_errors: record.total_errors,
                    consecutive_errors: record.consecutive_errors,
                    routed_requests: record.routed_requests,
                    method_counts: record.method_counts.clone(),
                    last_success_at: record.last_success.and_then(unix_millis),
                    last_failure_at: record.last_failure.and_then(unix_millis),
                    latency_ms: record.latency.map(|l| l.as_millis() as u64),
                }
            })
            .collect()
    }
}

fn unix_millis(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const LATENCY: Duration = Duration::from_millis(20);

    fn tracker(error_rate_threshold: f64, consecutive_failure_limit: u32) -> HealthTracker {
        HealthTracker::new(
            RoutingThresholds {
                error_rate_threshold,
                window_secs: 60,
                cooldown_secs: 30,
                consecutive_failure_limit,
            },
            ["a", "b"],
        )
    }

    fn fail_times(tracker: &HealthTracker, id: &str, times: u32, now: Instant) {
        for _ in 0..times {
            tracker.record_outcome_at(id, false, LATENCY, now).unwrap();
        }
    }

    #[test]
    fn test_opens_on_consecutive_failures() {
        // Threshold 1.0 can never be exceeded, so only the consecutive limit applies
        let tracker = tracker(1.0, 5);
        let now = Instant::now();

        fail_times(&tracker, "a", 4, now);
        assert!(tracker.is_healthy("a").unwrap());

        fail_times(&tracker, "a", 1, now);
        assert!(!tracker.is_healthy("a").unwrap());

        // Other upstreams are unaffected
        assert!(tracker.is_healthy("b").unwrap());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let tracker = tracker(1.0, 3);
        let now = Instant::now();

        fail_times(&tracker, "a", 2, now);
        tracker.record_outcome_at("a", true, LATENCY, now).unwrap();
        fail_times(&tracker, "a", 2, now);
        assert!(tracker.is_healthy("a").unwrap());
    }

    #[test]
    fn test_opens_on_error_rate() {
        let tracker = tracker(0.5, 100);
        let now = Instant::now();

        for _ in 0..3 {
            tracker.record_outcome_at("a", true, LATENCY, now).unwrap();
        }
        // 1/4, 2/5, 3/6 are not above 0.5
        fail_times(&tracker, "a", 3, now);
        assert!(tracker.is_healthy("a").unwrap());

        // 4/7 is
        fail_times(&tracker, "a", 1, now);
        assert!(!tracker.is_healthy("a").unwrap());
    }

    #[test]
    fn test_error_rate_pruning() {
        let tracker = tracker(1.0, 100);
        let t0 = Instant::now();

        tracker.record_outcome_at("a", true, LATENCY, t0).unwrap();
        fail_times(&tracker, "a", 1, t0);
        assert_eq!(tracker.error_rate_at("a", t0).unwrap(), 0.5);

        // Still inside the window at exactly 60s
        let edge = t0 + Duration::from_secs(60);
        assert_eq!(tracker.error_rate_at("a", edge).unwrap(), 0.5);

        // Pruned afterwards, total requests still count
        let later = t0 + Duration::from_secs(61);
        assert_eq!(tracker.error_rate_at("a", later).unwrap(), 0.0);
        assert_eq!(tracker.snapshot()[0].total_requests, 2);
    }

    #[test]
    fn test_error_rate_is_idempotent() {
        let tracker = tracker(1.0, 100);
        let t0 = Instant::now();

        tracker.record_outcome_at("a", true, LATENCY, t0).unwrap();
        fail_times(&tracker, "a", 2, t0);
        tracker
            .record_outcome_at("a", false, LATENCY, t0 + Duration::from_secs(30))
            .unwrap();

        let at = t0 + Duration::from_secs(75);
        let first = tracker.error_rate_at("a", at).unwrap();
        let second = tracker.error_rate_at("a", at).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, 0.25);
    }

    #[test]
    fn test_no_requests_has_zero_error_rate() {
        let tracker = tracker(0.5, 5);
        assert_eq!(tracker.error_rate("a").unwrap(), 0.0);
    }

    #[test]
    fn test_recovery_requires_cooldown_and_low_error_rate() {
        let tracker = tracker(0.5, 5);
        let t0 = Instant::now();
        fail_times(&tracker, "a", 5, t0);
        assert!(!tracker.is_healthy("a").unwrap());

        // Cooldown (30s) not elapsed
        let during_cooldown = t0 + Duration::from_secs(10);
        assert!(!tracker.attempt_recovery_at("a", during_cooldown).unwrap());
        assert!(!tracker.is_healthy("a").unwrap());

        // Cooldown elapsed but all failures are still in the window
        let after_cooldown = t0 + Duration::from_secs(31);
        assert!(!tracker.attempt_recovery_at("a", after_cooldown).unwrap());
        assert!(!tracker.is_healthy("a").unwrap());

        // Failures have left the window
        let after_window = t0 + Duration::from_secs(61);
        assert!(tracker.attempt_recovery_at("a", after_window).unwrap());
        assert!(tracker.is_healthy("a").unwrap());

        // Recovering a healthy upstream is a no-op
        assert!(!tracker.attempt_recovery_at("a", after_window).unwrap());
    }

    #[test]
    fn test_huge_cooldown_never_recovers() {
        let tracker = HealthTracker::new(
            RoutingThresholds {
                error_rate_threshold: 0.5,
                window_secs: 60,
                cooldown_secs: u64::MAX,
                consecutive_failure_limit: 1,
            },
            ["a"],
        );
        let t0 = Instant::now();
        fail_times(&tracker, "a", 1, t0);
        assert!(!tracker.is_healthy("a").unwrap());

        let much_later = t0 + Duration::from_secs(365 * 24 * 3600);
        assert!(!tracker.attempt_recovery_at("a", much_later).unwrap());
        tracker
            .record_outcome_at("a", true, LATENCY, much_later)
            .unwrap();
        assert!(!tracker.is_healthy("a").unwrap());
    }

    #[test]
    fn test_recovery_keeps_consecutive_count() {
        let tracker = tracker(0.5, 5);
        let t0 = Instant::now();
        fail_times(&tracker, "a", 5, t0);

        let after_window = t0 + Duration::from_secs(90);
        assert!(tracker.attempt_recovery_at("a", after_window).unwrap());
        assert_eq!(tracker.snapshot()[0].consecutive_errors, 5);

        // Half-open: the next failure reopens the circuit immediately
        tracker
            .record_outcome_at("a", false, LATENCY, after_window)
            .unwrap();
        assert!(!tracker.is_healthy("a").unwrap());
    }

    #[test]
    fn test_success_after_cooldown_recovers() {
        let tracker = tracker(0.5, 2);
        let t0 = Instant::now();
        for _ in 0..8 {
            tracker.record_outcome_at("a", true, LATENCY, t0).unwrap();
        }
        fail_times(&tracker, "a", 2, t0);
        assert!(!tracker.is_healthy("a").unwrap());

        // Success during cooldown does not close the circuit
        tracker
            .record_outcome_at("a", true, LATENCY, t0 + Duration::from_secs(5))
            .unwrap();
        assert!(!tracker.is_healthy("a").unwrap());

        // After cooldown, 2 failures out of 12 requests is below the threshold
        tracker
            .record_outcome_at("a", true, LATENCY, t0 + Duration::from_secs(31))
            .unwrap();
        assert!(tracker.is_healthy("a").unwrap());
    }

    #[test]
    fn test_failure_while_open_extends_cooldown() {
        let tracker = tracker(1.0, 1);
        let t0 = Instant::now();
        for _ in 0..10 {
            tracker.record_outcome_at("a", true, LATENCY, t0).unwrap();
        }
        fail_times(&tracker, "a", 1, t0);
        fail_times(&tracker, "a", 1, t0 + Duration::from_secs(20));

        // Past the first cooldown (t0 + 30s), within the second (t0 + 50s)
        let t = t0 + Duration::from_secs(40);
        assert!(!tracker.attempt_recovery_at("a", t).unwrap());

        let t = t0 + Duration::from_secs(51);
        assert!(tracker.attempt_recovery_at("a", t).unwrap());
    }

    #[test]
    fn test_selection_counters() {
        let tracker = tracker(0.5, 5);
        tracker.record_selection("a", "eth_call").unwrap();
        tracker.record_selection("a", "eth_call").unwrap();
        tracker.record_selection("a", "eth_chainId").unwrap();

        let snapshot = &tracker.snapshot()[0];
        assert_eq!(snapshot.routed_requests, 3);
        assert_eq!(snapshot.method_counts.get("eth_call"), Some(&2));
        assert_eq!(snapshot.method_counts.get("eth_chainId"), Some(&1));
        // Selections do not feed the error rate denominator
        assert_eq!(snapshot.total_requests, 0);
    }

    #[test]
    fn test_unknown_upstream() {
        let tracker = tracker(0.5, 5);
        assert_eq!(
            tracker.is_healthy("zzz"),
            Err(HealthError::UnknownUpstream("zzz".into()))
        );
        assert!(tracker.record_outcome("zzz", true, LATENCY).is_err());
        assert!(tracker.attempt_recovery("zzz").is_err());
        assert!(tracker.record_selection("zzz", "eth_call").is_err());
    }

    #[test]
    fn test_snapshot() {
        let tracker = tracker(0.5, 5);
        tracker
            .record_outcome("b", true, Duration::from_millis(42))
            .unwrap();
        tracker.record_outcome("b", false, LATENCY).unwrap();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "a");
        assert_eq!(snapshot[0].last_success_at, None);

        let b = &snapshot[1];
        assert_eq!(b.total_requests, 2);
        assert_eq!(b.total_errors, 1);
        assert_eq!(b.consecutive_errors, 1);
        assert_eq!(b.error_rate, 0.5);
        assert_eq!(b.latency_ms, Some(20));
        assert!(b.last_success_at.is_some());
        assert!(b.last_failure_at.is_some());

        let json = serde_json::to_value(b).unwrap();
        assert_eq!(json["totalErrors"], 1);
        assert_eq!(json["consecutiveErrors"], 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let tracker = Arc::new(tracker(1.0, u32::MAX));

        std::thread::scope(|scope| {
            for i in 0..8 {
                let tracker = tracker.clone();
                scope.spawn(move || {
                    for _ in 0..500 {
                        tracker.record_outcome("a", i % 2 == 0, LATENCY).unwrap();
                        tracker.record_selection("b", "eth_call").unwrap();
                    }
                });
            }
        });

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[0].total_requests, 4000);
        assert_eq!(snapshot[0].total_errors, 2000);
        assert_eq!(snapshot[1].routed_requests, 4000);
    }
}
