//! Background sweep of idle per-identity state.
//!
//! Runs [`ClientQuotaTracker::cleanup`] and [`BreakGlassLimiter::cleanup`] on an
//! interval. The sweep only bounds memory: both trackers re-derive window
//! validity on every call, so cancelling it never changes an admission
//! decision.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::break_glass::BreakGlassLimiter;
use crate::metrics;
use crate::quota::ClientQuotaTracker;

/// Configuration for the housekeeping task.
#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    /// Interval between sweeps (default: 5 minutes).
    pub sweep_interval: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Handle to a running sweep task.
#[derive(Debug)]
pub struct HousekeepingHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HousekeepingHandle {
    /// Token that stops the sweep when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the sweep and wait for the task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub quota_evicted: usize,
    pub break_glass_evicted: usize,
}

/// Run one sweep over both trackers.
pub fn sweep(tracker: &ClientQuotaTracker, limiter: &BreakGlassLimiter) -> SweepReport {
    let now = tracker.clock().now();
    let report = SweepReport {
        quota_evicted: tracker.cleanup(now),
        break_glass_evicted: limiter.cleanup(now),
    };

    metrics::record_sweep("quota", report.quota_evicted);
    metrics::record_sweep("break_glass", report.break_glass_evicted);
    metrics::TRACKED_IDENTITIES.set(tracker.tracked_identities() as i64);

    if report.quota_evicted + report.break_glass_evicted > 0 {
        info!(
            quota_evicted = report.quota_evicted,
            break_glass_evicted = report.break_glass_evicted,
            remaining = tracker.tracked_identities(),
            "Housekeeping sweep completed"
        );
    } else {
        debug!("Housekeeping sweep: nothing to evict");
    }

    report
}

/// Spawn the sweep loop; cancel through the returned handle.
pub fn spawn_housekeeping(
    tracker: Arc<ClientQuotaTracker>,
    limiter: Arc<BreakGlassLimiter>,
    config: HousekeepingConfig,
) -> HousekeepingHandle {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    let task = tokio::spawn(async move {
        run_housekeeping_loop(tracker, limiter, config, cancel_clone).await;
    });

    HousekeepingHandle { cancel, task }
}

async fn run_housekeeping_loop(
    tracker: Arc<ClientQuotaTracker>,
    limiter: Arc<BreakGlassLimiter>,
    config: HousekeepingConfig,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        interval_secs = config.sweep_interval.as_secs(),
        "Housekeeping task started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Housekeeping task shutting down");
                break;
            }
            _ = ticker.tick() => {
                sweep(&tracker, &limiter);
            }
        }
    }
}
