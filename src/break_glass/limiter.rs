//! Break-Glass Limiter
//!
//! Rolling one-hour request log per identity. Independent of plan quotas.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Length of the rolling window
pub const BREAK_GLASS_WINDOW: Duration = Duration::from_secs(3600);

/// Default overrides allowed per identity per rolling hour
pub const DEFAULT_MAX_PER_HOUR: u32 = 10;

/// Per-identity rolling-hour override counter
#[derive(Debug, Default)]
pub struct BreakGlassLimiter {
    records: Mutex<HashMap<String, Vec<Instant>>>,
}

/// Drop instants at least one window older than `now`
fn prune(instants: &mut Vec<Instant>, now: Instant) {
    instants.retain(|at| now.saturating_duration_since(*at) < BREAK_GLASS_WINDOW);
}

impl BreakGlassLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an override for `identity` if under `max_per_hour`
    ///
    /// A denied attempt is not recorded.
    pub fn allow(&self, identity: &str, now: Instant, max_per_hour: u32) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let instants = records.entry(identity.to_string()).or_default();
        prune(instants, now);

        if instants.len() >= max_per_hour as usize {
            return false;
        }

        instants.push(now);
        true
    }

    /// Overrides recorded for `identity` within the window ending at `now`
    pub fn recent_count(&self, identity: &str, now: Instant) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(identity) {
            Some(instants) => {
                prune(instants, now);
                instants.len()
            }
            None => 0,
        }
    }

    /// Instant at which the oldest recorded override leaves the window
    ///
    /// `None` when nothing is recorded for `identity` within the window.
    pub fn next_expiry(&self, identity: &str, now: Instant) -> Option<Instant> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let instants = records.get_mut(identity)?;
        prune(instants, now);
        instants.iter().min().map(|oldest| *oldest + BREAK_GLASS_WINDOW)
    }

    /// Prune every identity and drop those left empty; returns how many were dropped
    pub fn cleanup(&self, now: Instant) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, instants| {
            prune(instants, now);
            !instants.is_empty()
        });
        before - records.len()
    }

    pub fn tracked_identities(&self) -> usize {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.len()
    }
}
