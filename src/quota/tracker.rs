//! Client Quota Tracker
//!
//! Admission decisions per identity against its assigned plan.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

use super::counter::{secs_until, ClientCounter, CounterSnapshot, Denial, WindowResets};
use super::plan::{PlanRegistry, RatePlan};
use crate::clock::{Clock, SystemClock};
use crate::error::{GateError, Window};
use crate::metrics;

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionInfo {
    /// Whether the request may proceed
    pub allowed: bool,

    /// Remaining minute allowance (limit plus burst, minus used)
    pub remaining: u64,

    /// Limit of the window reported in `remaining`, or of the window that denied
    pub limit: u64,

    /// Seconds to wait before retrying (denials only)
    pub retry_after_secs: Option<u64>,

    /// Plan that governed the decision
    pub plan: String,

    /// Time until the minute window rolls over
    #[serde(skip)]
    pub minute_reset_in: Duration,

    /// Denial reason, if any
    #[serde(skip)]
    pub denial: Option<Denial>,
}

impl AdmissionInfo {
    /// Error matching this denial, if the request was denied
    pub fn to_error(&self) -> Option<GateError> {
        match self.denial? {
            Denial::Concurrency => Some(GateError::ConcurrencyExceeded { limit: self.limit }),
            Denial::Window(window) => Some(GateError::QuotaExceeded {
                window,
                limit: self.limit,
                retry_after_secs: self.retry_after_secs.unwrap_or(1),
            }),
        }
    }
}

/// Usage snapshot for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub identity: String,
    pub plan: String,
    pub minute_count: u64,
    pub minute_limit: u64,
    pub hour_count: u64,
    pub hour_limit: u64,
    pub day_count: u64,
    pub day_limit: u64,
    pub concurrent: u64,
    pub max_concurrent: u64,
    pub minute_reset_secs: u64,
    pub hour_reset_secs: u64,
    pub day_reset_secs: u64,
}

impl UsageSnapshot {
    fn build(identity: &str, plan: &RatePlan, snapshot: CounterSnapshot, now: Instant) -> Self {
        Self {
            identity: identity.to_string(),
            plan: plan.name.clone(),
            minute_count: snapshot.minute_count,
            minute_limit: plan.minute_ceiling(),
            hour_count: snapshot.hour_count,
            hour_limit: u64::from(plan.per_hour),
            day_count: snapshot.day_count,
            day_limit: u64::from(plan.per_day),
            concurrent: snapshot.concurrent,
            max_concurrent: u64::from(plan.max_concurrent),
            minute_reset_secs: secs_until(snapshot.resets.minute, now),
            hour_reset_secs: secs_until(snapshot.resets.hour, now),
            day_reset_secs: secs_until(snapshot.resets.day, now),
        }
    }
}

/// Per-identity quota tracker
#[derive(Debug)]
pub struct ClientQuotaTracker {
    plans: Arc<PlanRegistry>,
    counters: RwLock<HashMap<String, Arc<ClientCounter>>>,
    clock: Arc<dyn Clock>,
}

impl ClientQuotaTracker {
    /// Create a tracker on the system clock
    pub fn new(plans: Arc<PlanRegistry>) -> Self {
        Self::with_clock(plans, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(plans: Arc<PlanRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            plans,
            counters: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn plans(&self) -> &Arc<PlanRegistry> {
        &self.plans
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Fetch the counter for an identity, creating it on first use
    fn counter(&self, identity: &str) -> Arc<ClientCounter> {
        {
            let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(counter) = counters.get(identity) {
                return Arc::clone(counter);
            }
        }

        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have created it between the two locks
        let counter = counters
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(ClientCounter::new(self.clock.now())));
        Arc::clone(counter)
    }

    fn existing(&self, identity: &str) -> Option<Arc<ClientCounter>> {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        counters.get(identity).cloned()
    }

    /// Decide whether one request for `identity` may proceed
    ///
    /// An allowed request holds one concurrency slot until [`release`](Self::release).
    pub fn allow(&self, identity: &str) -> AdmissionInfo {
        let plan = self.plans.plan_for(identity);
        let counter = self.counter(identity);
        let now = self.clock.now();

        let admission = counter.try_admit(&plan, now);
        let minute_ceiling = plan.minute_ceiling();
        let minute_reset_in = admission.resets.minute.saturating_duration_since(now);

        let info = match admission.denial {
            None => AdmissionInfo {
                allowed: true,
                remaining: minute_ceiling.saturating_sub(admission.minute_count),
                limit: minute_ceiling,
                retry_after_secs: None,
                plan: plan.name.clone(),
                minute_reset_in,
                denial: None,
            },
            Some(denial) => {
                let (limit, retry_after) = denial_terms(&plan, denial, &admission.resets, now);
                debug!(
                    identity,
                    plan = %plan.name,
                    ?denial,
                    retry_after_secs = retry_after,
                    "Admission denied"
                );
                AdmissionInfo {
                    allowed: false,
                    remaining: 0,
                    limit,
                    retry_after_secs: Some(retry_after),
                    plan: plan.name.clone(),
                    minute_reset_in,
                    denial: Some(denial),
                }
            }
        };

        metrics::record_admission(&info);
        info
    }

    /// Return one concurrency slot; safe without a matching `allow`
    pub fn release(&self, identity: &str) {
        if let Some(counter) = self.existing(identity) {
            counter.release();
        }
    }

    /// Current usage for an identity
    ///
    /// Expired windows read as zero. Unknown identities report an untouched
    /// counter without allocating one.
    pub fn usage(&self, identity: &str) -> UsageSnapshot {
        let plan = self.plans.plan_for(identity);
        let now = self.clock.now();
        let snapshot = match self.existing(identity) {
            Some(counter) => counter.snapshot(now),
            None => ClientCounter::new(now).snapshot(now),
        };
        UsageSnapshot::build(identity, &plan, snapshot, now)
    }

    /// Zero all counts and the gauge for an identity
    ///
    /// Returns false when the identity has no tracked state.
    pub fn reset_counters(&self, identity: &str) -> bool {
        match self.existing(identity) {
            Some(counter) => {
                counter.reset(self.clock.now());
                true
            }
            None => false,
        }
    }

    /// Evict idle identities; returns how many were removed
    pub fn cleanup(&self, now: Instant) -> usize {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        let before = counters.len();
        // A counter still referenced elsewhere is in use by a caller
        counters.retain(|_, counter| Arc::strong_count(counter) > 1 || !counter.is_idle(now));
        before - counters.len()
    }

    pub fn tracked_identities(&self) -> usize {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        counters.len()
    }

    #[cfg(test)]
    pub(crate) fn force_resets(&self, identity: &str, resets: WindowResets) {
        self.counter(identity).force_resets(resets);
    }
}

/// Limit and retry-after for a denial
fn denial_terms(
    plan: &RatePlan,
    denial: Denial,
    resets: &WindowResets,
    now: Instant,
) -> (u64, u64) {
    match denial {
        Denial::Concurrency => (u64::from(plan.max_concurrent), 1),
        Denial::Window(window) => {
            let limit = match window {
                Window::Minute => plan.minute_ceiling(),
                Window::Hour => u64::from(plan.per_hour),
                Window::Day => u64::from(plan.per_day),
            };
            (limit, secs_until(resets.for_window(window), now))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::quota::counter::{DAY, HOUR, MINUTE};

    fn tracker_with(plan: RatePlan, identity: &str) -> (ClientQuotaTracker, Arc<MockClock>) {
        let plans = Arc::new(PlanRegistry::new());
        let name = plan.name.clone();
        plans.register_plan(plan);
        plans.assign_plan(identity, &name).unwrap();
        let clock = Arc::new(MockClock::default());
        let tracker = ClientQuotaTracker::with_clock(plans, clock.clone());
        (tracker, clock)
    }

    #[test]
    fn test_minute_plan_denies_fourth_call() {
        let plan = RatePlan::new("three-per-minute", 3, 1_000, 10_000, 0, 0);
        let (tracker, _clock) = tracker_with(plan, "client-b");

        for expected_remaining in [2, 1, 0] {
            let info = tracker.allow("client-b");
            assert!(info.allowed);
            assert_eq!(info.remaining, expected_remaining);
            assert_eq!(info.limit, 3);
            assert_eq!(info.plan, "three-per-minute");
        }

        let info = tracker.allow("client-b");
        assert!(!info.allowed);
        assert_eq!(info.remaining, 0);
        assert!(info.retry_after_secs.unwrap() >= 1);
        assert!(matches!(
            info.to_error(),
            Some(GateError::QuotaExceeded {
                window: Window::Minute,
                ..
            })
        ));
    }

    #[test]
    fn test_burst_extends_minute_window() {
        let plan = RatePlan::new("bursty", 2, 1_000, 10_000, 3, 0);
        let (tracker, _clock) = tracker_with(plan, "client");

        let allowed = (0..10).filter(|_| tracker.allow("client").allowed).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn test_forced_minute_reset_allows_again() {
        let plan = RatePlan::new("tiny", 2, 1_000, 10_000, 1, 0);
        let (tracker, clock) = tracker_with(plan, "client");

        for _ in 0..3 {
            assert!(tracker.allow("client").allowed);
        }
        assert!(!tracker.allow("client").allowed);

        let now = clock.now();
        tracker.force_resets(
            "client",
            WindowResets {
                minute: now,
                hour: now + HOUR,
                day: now + DAY,
            },
        );

        let info = tracker.allow("client");
        assert!(info.allowed);
        assert_eq!(info.remaining, 2);
    }

    #[test]
    fn test_minute_window_expires_with_clock() {
        let plan = RatePlan::new("one", 1, 1_000, 10_000, 0, 0);
        let (tracker, clock) = tracker_with(plan, "client");

        assert!(tracker.allow("client").allowed);
        let denied = tracker.allow("client");
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs.unwrap() <= 60);

        clock.advance(MINUTE);
        assert!(tracker.allow("client").allowed);
    }

    #[test]
    fn test_hour_limit_reports_hour_retry() {
        let plan = RatePlan::new("hourly", 100, 2, 10_000, 0, 0);
        let (tracker, _clock) = tracker_with(plan, "client");

        assert!(tracker.allow("client").allowed);
        assert!(tracker.allow("client").allowed);
        let info = tracker.allow("client");
        assert!(!info.allowed);
        assert_eq!(info.limit, 2);
        assert!(info.retry_after_secs.unwrap() > 60);
    }

    #[test]
    fn test_day_limit() {
        let plan = RatePlan::new("daily", 100, 100, 1, 0, 0);
        let (tracker, clock) = tracker_with(plan, "client");

        assert!(tracker.allow("client").allowed);
        clock.advance(HOUR);
        let info = tracker.allow("client");
        assert!(!info.allowed);
        assert_eq!(info.denial, Some(Denial::Window(Window::Day)));
    }

    #[test]
    fn test_concurrency_limit_and_release() {
        let plan = RatePlan::new("concurrent", 1_000, 10_000, 100_000, 0, 2);
        let (tracker, _clock) = tracker_with(plan, "client");

        assert!(tracker.allow("client").allowed);
        assert!(tracker.allow("client").allowed);

        let denied = tracker.allow("client");
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, Some(1));
        assert_eq!(denied.denial, Some(Denial::Concurrency));

        tracker.release("client");
        assert!(tracker.allow("client").allowed);
        assert!(!tracker.allow("client").allowed);
    }

    #[test]
    fn test_extra_releases_never_go_negative() {
        let plan = RatePlan::new("concurrent", 1_000, 10_000, 100_000, 0, 1);
        let (tracker, _clock) = tracker_with(plan, "client");

        for _ in 0..10 {
            tracker.release("client");
        }
        tracker.release("never-seen");

        assert!(tracker.allow("client").allowed);
        assert!(!tracker.allow("client").allowed);
        assert_eq!(tracker.usage("client").concurrent, 1);
    }

    #[test]
    fn test_identities_are_independent() {
        let plan = RatePlan::new("one", 1, 1_000, 10_000, 0, 0);
        let (tracker, _clock) = tracker_with(plan, "x");
        tracker.plans().assign_plan("y", "one").unwrap();

        assert!(tracker.allow("x").allowed);
        assert!(!tracker.allow("x").allowed);
        assert!(tracker.allow("y").allowed);
    }

    #[test]
    fn test_usage_applies_lazy_rollover() {
        let plan = RatePlan::new("ten", 10, 1_000, 10_000, 0, 0);
        let (tracker, clock) = tracker_with(plan, "client");

        tracker.allow("client");
        tracker.allow("client");
        let usage = tracker.usage("client");
        assert_eq!(usage.minute_count, 2);
        assert_eq!(usage.hour_count, 2);
        assert_eq!(usage.minute_limit, 10);

        clock.advance(MINUTE);
        let usage = tracker.usage("client");
        assert_eq!(usage.minute_count, 0);
        assert_eq!(usage.hour_count, 2);
    }

    #[test]
    fn test_usage_of_unknown_identity_does_not_allocate() {
        let tracker = ClientQuotaTracker::new(Arc::new(PlanRegistry::new()));
        let usage = tracker.usage("ghost");
        assert_eq!(usage.plan, "free");
        assert_eq!(usage.minute_count, 0);
        assert_eq!(tracker.tracked_identities(), 0);
    }

    #[test]
    fn test_reset_counters() {
        let plan = RatePlan::new("one", 1, 1_000, 10_000, 0, 0);
        let (tracker, _clock) = tracker_with(plan, "client");

        assert!(tracker.allow("client").allowed);
        assert!(!tracker.allow("client").allowed);

        assert!(tracker.reset_counters("client"));
        let usage = tracker.usage("client");
        assert_eq!(usage.minute_count, 0);
        assert_eq!(usage.concurrent, 0);
        assert!(tracker.allow("client").allowed);

        assert!(!tracker.reset_counters("unknown"));
    }

    #[test]
    fn test_cleanup_evicts_only_idle() {
        let plan = RatePlan::new("ten", 10, 1_000, 10_000, 0, 0);
        let (tracker, clock) = tracker_with(plan, "busy");
        tracker.plans().assign_plan("idle", "ten").unwrap();

        tracker.allow("idle");
        tracker.release("idle");
        tracker.allow("busy");

        assert_eq!(tracker.cleanup(clock.now()), 0);

        clock.advance(DAY);
        assert_eq!(tracker.cleanup(clock.now()), 1);
        assert_eq!(tracker.tracked_identities(), 1);
        assert_eq!(tracker.usage("busy").concurrent, 1);
    }

    #[test]
    fn test_concurrent_first_access_creates_one_counter() {
        let plan = RatePlan::new("wide", 10_000, 100_000, 1_000_000, 0, 0);
        let (tracker, _clock) = tracker_with(plan, "shared");
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.allow("shared");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.tracked_identities(), 1);
        assert_eq!(tracker.usage("shared").minute_count, 800);
    }

    #[test]
    fn test_concurrent_callers_never_exceed_ceiling() {
        let plan = RatePlan::new("narrow", 50, 1_000, 10_000, 5, 0);
        let (tracker, _clock) = tracker_with(plan, "client");
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || (0..20).filter(|_| tracker.allow("client").allowed).count())
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(allowed, 55);
        assert_eq!(tracker.usage("client").minute_count, 55);
    }
}
