// SPDX-License-Identifier: MIT OR Apache-2.0
//! Rolling-window retry budget.
//!
//! Caps the ratio of retried to original requests within a rolling-fixed
//! window: `retries < floor(requests * ratio)`. All four operations
//! (`allow`, `record`, `stats`, `reset`) acquire the same exclusive lock so
//! the invariant holds under arbitrary concurrent callers — the lazy-reset-
//! then-check sequence must be linearizable across all four operations,
//! which a single `Mutex` gives for free and independent atomics would not.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct WindowState {
    requests: u64,
    retries: u64,
    window_start: Instant,
}

impl WindowState {
    fn fresh(now: Instant) -> Self {
        Self {
            requests: 0,
            retries: 0,
            window_start: now,
        }
    }
}

/// Point-in-time snapshot of the budget's rolling-window counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetStats {
    /// Requests logged in the current window.
    pub requests: u64,
    /// Retried requests logged in the current window.
    pub retries: u64,
}

/// Token-accounted cap on the ratio of retried to original requests in a
/// rolling-fixed window.
#[derive(Debug)]
pub struct RetryBudget {
    ratio: f64,
    window: Duration,
    state: Mutex<WindowState>,
}

impl RetryBudget {
    /// Build a budget. `ratio` is clamped to `[0, 1]`; `window <= 0`
    /// defaults to one minute.
    #[must_use]
    pub fn new(ratio: f64, window: Duration) -> Self {
        let window = if window.is_zero() { DEFAULT_WINDOW } else { window };
        Self {
            ratio: ratio.clamp(0.0, 1.0),
            window,
            state: Mutex::new(WindowState::fresh(Instant::now())),
        }
    }

    /// The configured retry ratio (post-clamp).
    #[must_use]
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// The configured rolling window duration (post-default).
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock_and_reset(&self) -> std::sync::MutexGuard<'_, WindowState> {
        let mut state = self.state.lock().expect("retry budget lock poisoned");
        if state.window_start.elapsed() >= self.window {
            *state = WindowState::fresh(Instant::now());
        }
        state
    }

    /// Returns whether a retry is currently permitted:
    /// `retries < floor(requests * ratio)`.
    #[must_use]
    pub fn allow(&self) -> bool {
        let state = self.lock_and_reset();
        let allowance = (state.requests as f64 * self.ratio).floor() as u64;
        state.retries < allowance
    }

    /// Record a completed request. `success == false` also counts it as a
    /// retry toward the budget.
    pub fn record(&self, success: bool) {
        let mut state = self.lock_and_reset();
        state.requests += 1;
        if !success {
            state.retries += 1;
        }
    }

    /// Snapshot the current window's counters.
    #[must_use]
    pub fn stats(&self) -> BudgetStats {
        let state = self.lock_and_reset();
        BudgetStats {
            requests: state.requests,
            retries: state.retries,
        }
    }

    /// Force the window to reset immediately, zeroing both counters.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("retry budget lock poisoned");
        *state = WindowState::fresh(Instant::now());
    }
}
