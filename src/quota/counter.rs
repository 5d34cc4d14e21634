//! Per-Identity Window Counters
//!
//! Minute, hour, and day counts plus an in-flight gauge for one identity.
//! Counts and the gauge are plain atomics; only the three reset instants sit
//! behind a mutex, held just long enough to detect and apply rollover.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::plan::RatePlan;
use crate::error::Window;

/// Minute window length
pub const MINUTE: Duration = Duration::from_secs(60);
/// Hour window length
pub const HOUR: Duration = Duration::from_secs(3600);
/// Day window length (longest window)
pub const DAY: Duration = Duration::from_secs(24 * 3600);

/// Next rollover instants for each window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowResets {
    pub minute: Instant,
    pub hour: Instant,
    pub day: Instant,
}

impl WindowResets {
    fn starting_at(now: Instant) -> Self {
        Self {
            minute: now + MINUTE,
            hour: now + HOUR,
            day: now + DAY,
        }
    }

    pub fn for_window(&self, window: Window) -> Instant {
        match window {
            Window::Minute => self.minute,
            Window::Hour => self.hour,
            Window::Day => self.day,
        }
    }
}

/// Why a counter refused admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// Gauge at or above `max_concurrent`
    Concurrency,
    /// A window is exhausted
    Window(Window),
}

/// Outcome of [`ClientCounter::try_admit`]
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    /// `None` when admitted
    pub denial: Option<Denial>,
    /// Minute count after the attempt
    pub minute_count: u64,
    /// Reset instants observed for this attempt
    pub resets: WindowResets,
}

/// Counts for one identity
#[derive(Debug)]
pub struct ClientCounter {
    minute_count: AtomicU64,
    hour_count: AtomicU64,
    day_count: AtomicU64,
    concurrent: AtomicU64,
    resets: Mutex<WindowResets>,
}

/// Point-in-time view of a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub minute_count: u64,
    pub hour_count: u64,
    pub day_count: u64,
    pub concurrent: u64,
    pub resets: WindowResets,
}

impl ClientCounter {
    /// Create a zeroed counter whose windows start at `now`
    pub fn new(now: Instant) -> Self {
        Self {
            minute_count: AtomicU64::new(0),
            hour_count: AtomicU64::new(0),
            day_count: AtomicU64::new(0),
            concurrent: AtomicU64::new(0),
            resets: Mutex::new(WindowResets::starting_at(now)),
        }
    }

    fn lock_resets(&self) -> MutexGuard<'_, WindowResets> {
        self.resets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Zero every window whose reset instant has passed and move it forward
    pub fn roll_windows(&self, now: Instant) -> WindowResets {
        let mut resets = self.lock_resets();
        Self::roll_locked(&mut resets, now, &self.minute_count, MINUTE, Window::Minute);
        Self::roll_locked(&mut resets, now, &self.hour_count, HOUR, Window::Hour);
        Self::roll_locked(&mut resets, now, &self.day_count, DAY, Window::Day);
        *resets
    }

    fn roll_locked(
        resets: &mut WindowResets,
        now: Instant,
        count: &AtomicU64,
        length: Duration,
        window: Window,
    ) {
        let slot = match window {
            Window::Minute => &mut resets.minute,
            Window::Hour => &mut resets.hour,
            Window::Day => &mut resets.day,
        };
        if now < *slot {
            return;
        }

        count.store(0, Ordering::SeqCst);
        let next = *slot + length;
        // An identity idle for several windows restarts from now
        *slot = if next > now { next } else { now + length };
    }

    /// Try to admit one request under `plan`
    ///
    /// Checks run in order concurrency, minute, hour, day. Each step is a
    /// conditional increment, so concurrent callers cannot push a count past
    /// its limit; a later failure rolls back the earlier increments.
    pub fn try_admit(&self, plan: &RatePlan, now: Instant) -> Admission {
        let resets = self.roll_windows(now);

        let deny = |denial: Denial| Admission {
            denial: Some(denial),
            minute_count: self.minute_count.load(Ordering::SeqCst),
            resets,
        };

        let max_concurrent = u64::from(plan.max_concurrent);
        if max_concurrent > 0 {
            if !increment_below(&self.concurrent, max_concurrent) {
                return deny(Denial::Concurrency);
            }
        } else {
            self.concurrent.fetch_add(1, Ordering::SeqCst);
        }

        if !increment_below(&self.minute_count, plan.minute_ceiling()) {
            decrement_floor(&self.concurrent);
            return deny(Denial::Window(Window::Minute));
        }

        if !increment_below(&self.hour_count, u64::from(plan.per_hour)) {
            decrement_floor(&self.minute_count);
            decrement_floor(&self.concurrent);
            return deny(Denial::Window(Window::Hour));
        }

        if !increment_below(&self.day_count, u64::from(plan.per_day)) {
            decrement_floor(&self.hour_count);
            decrement_floor(&self.minute_count);
            decrement_floor(&self.concurrent);
            return deny(Denial::Window(Window::Day));
        }

        Admission {
            denial: None,
            minute_count: self.minute_count.load(Ordering::SeqCst),
            resets,
        }
    }

    /// Decrement the in-flight gauge, never below zero
    pub fn release(&self) {
        decrement_floor(&self.concurrent);
    }

    /// Consistent snapshot after applying lazy rollover
    pub fn snapshot(&self, now: Instant) -> CounterSnapshot {
        let resets = self.roll_windows(now);
        CounterSnapshot {
            minute_count: self.minute_count.load(Ordering::SeqCst),
            hour_count: self.hour_count.load(Ordering::SeqCst),
            day_count: self.day_count.load(Ordering::SeqCst),
            concurrent: self.concurrent.load(Ordering::SeqCst),
            resets,
        }
    }

    /// Zero all counts and the gauge and restart every window at `now`
    pub fn reset(&self, now: Instant) {
        let mut resets = self.lock_resets();
        self.minute_count.store(0, Ordering::SeqCst);
        self.hour_count.store(0, Ordering::SeqCst);
        self.day_count.store(0, Ordering::SeqCst);
        self.concurrent.store(0, Ordering::SeqCst);
        *resets = WindowResets::starting_at(now);
    }

    /// No in-flight work, the day window has elapsed, and every count is
    /// either zero or belongs to an expired window
    pub fn is_idle(&self, now: Instant) -> bool {
        let resets = self.lock_resets();
        if self.concurrent.load(Ordering::SeqCst) != 0 || now < resets.day {
            return false;
        }

        let expired_or_zero =
            |count: &AtomicU64, reset: Instant| now >= reset || count.load(Ordering::SeqCst) == 0;

        expired_or_zero(&self.minute_count, resets.minute)
            && expired_or_zero(&self.hour_count, resets.hour)
            && expired_or_zero(&self.day_count, resets.day)
    }

    pub fn concurrent(&self) -> u64 {
        self.concurrent.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn force_resets(&self, resets: WindowResets) {
        *self.lock_resets() = resets;
    }
}

/// Increment `value` only while it is below `limit`
fn increment_below(value: &AtomicU64, limit: u64) -> bool {
    let mut current = value.load(Ordering::SeqCst);
    loop {
        if current >= limit {
            return false;
        }

        match value.compare_exchange_weak(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Decrement `value` with a floor at zero
fn decrement_floor(value: &AtomicU64) {
    let mut current = value.load(Ordering::SeqCst);
    loop {
        if current == 0 {
            return;
        }

        match value.compare_exchange_weak(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Whole seconds until `reset`, rounded up, minimum 1
pub fn secs_until(reset: Instant, now: Instant) -> u64 {
    let remaining = reset.saturating_duration_since(now);
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    secs.max(1)
}
