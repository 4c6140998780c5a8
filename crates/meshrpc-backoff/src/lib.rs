// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backoff strategies for the meshrpc retry engine.
//!
//! A [`Backoff`] computes `delay = next(attempt)` for `attempt >= 1`;
//! `attempt <= 0` always yields zero. All four strategies share
//! [`BackoffParams`] (multiplier, max delay, jitter fraction) and apply
//! jitter through `rand`'s thread-local generator so concurrent callers get
//! statistically-independent sequences even when called from many tasks at
//! once.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use rand::Rng;
use std::time::Duration;

/// Shared tunables for every [`Backoff`] variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffParams {
    /// Base delay for the first attempt.
    pub base: Duration,
    /// Growth factor for [`Backoff::Exponential`]; ignored by other variants.
    pub multiplier: f64,
    /// Upper clamp applied after the strategy's raw computation, before
    /// jitter.
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1]`; the final delay is sampled uniformly
    /// from `[delay * (1 - jitter), delay * (1 + jitter)]`, never negative.
    pub jitter: f64,
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffParams {
    /// Construct params with the given base delay and every other field at
    /// its default (multiplier 2.0, max delay 30s, jitter 0.2).
    #[must_use]
    pub fn with_base(base: Duration) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    fn clamped_jitter(&self) -> f64 {
        self.jitter.clamp(0.0, 1.0)
    }

    /// Apply this params' jitter fraction to `delay`, sampling uniformly
    /// from `[delay*(1-jitter), delay*(1+jitter)]` and never returning a
    /// negative duration.
    fn apply_jitter(&self, delay: Duration) -> Duration {
        let jitter = self.clamped_jitter();
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let nominal = delay.as_secs_f64();
        let low = (nominal * (1.0 - jitter)).max(0.0);
        let high = nominal * (1.0 + jitter);
        let sampled = if high > low {
            rand::rng().random_range(low..=high)
        } else {
            low
        };
        Duration::from_secs_f64(sampled.max(0.0))
    }
}

/// One of the four closed backoff strategies the retry engine supports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `base * multiplier^(attempt-1)`, clamped, then jittered.
    Exponential(BackoffParams),
    /// `base * attempt`, clamped, then jittered.
    Linear(BackoffParams),
    /// Always `base`, jittered.
    Constant(BackoffParams),
    /// Always zero, regardless of attempt or params.
    None,
}

impl Backoff {
    /// Compute the delay before the given attempt. `attempt <= 0` is always
    /// zero; otherwise dispatches to the strategy's formula, clamps to
    /// `max_delay`, then applies jitter.
    #[must_use]
    pub fn next(&self, attempt: i64) -> Duration {
        if attempt <= 0 {
            return Duration::ZERO;
        }
        match self {
            Self::Exponential(params) => {
                let exp = params.multiplier.powi((attempt - 1) as i32);
                let raw = params.base.as_secs_f64() * exp;
                let clamped = Duration::from_secs_f64(raw.max(0.0)).min(params.max_delay);
                params.apply_jitter(clamped)
            }
            Self::Linear(params) => {
                let raw = params.base.as_secs_f64() * attempt as f64;
                let clamped = Duration::from_secs_f64(raw.max(0.0)).min(params.max_delay);
                params.apply_jitter(clamped)
            }
            Self::Constant(params) => {
                let clamped = params.base.min(params.max_delay);
                params.apply_jitter(clamped)
            }
            Self::None => Duration::ZERO,
        }
    }

    /// Build an [`Backoff::Exponential`] with default params.
    #[must_use]
    pub fn exponential() -> Self {
        Self::Exponential(BackoffParams::default())
    }

    /// Build a [`Backoff::Linear`] with default params.
    #[must_use]
    pub fn linear() -> Self {
        Self::Linear(BackoffParams::default())
    }

    /// Build a [`Backoff::Constant`] with default params.
    #[must_use]
    pub fn constant() -> Self {
        Self::Constant(BackoffParams::default())
    }
}

impl Default for Backoff {
    /// The retry engine's default: exponential with base 1s.
    fn default() -> Self {
        Self::exponential()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_attempt_is_always_zero() {
        let params = BackoffParams::with_base(Duration::from_millis(100));
        for strategy in [
            Backoff::Exponential(params),
            Backoff::Linear(params),
            Backoff::Constant(params),
            Backoff::None,
        ] {
            assert_eq!(strategy.next(0), Duration::ZERO);
            assert_eq!(strategy.next(-5), Duration::ZERO);
        }
    }

    #[test]
    fn none_strategy_is_always_zero() {
        let strategy = Backoff::None;
        for attempt in 1..10 {
            assert_eq!(strategy.next(attempt), Duration::ZERO);
        }
    }

    #[test]
    fn exponential_grows_without_jitter() {
        let params = BackoffParams {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        let strategy = Backoff::Exponential(params);
        assert_eq!(strategy.next(1), Duration::from_millis(100));
        assert_eq!(strategy.next(2), Duration::from_millis(200));
        assert_eq!(strategy.next(3), Duration::from_millis(400));
    }

    #[test]
    fn exponential_clamps_to_max_delay() {
        let params = BackoffParams {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
        };
        let strategy = Backoff::Exponential(params);
        assert_eq!(strategy.next(10), Duration::from_secs(5));
    }

    #[test]
    fn linear_scales_by_attempt() {
        let params = BackoffParams {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        let strategy = Backoff::Linear(params);
        assert_eq!(strategy.next(1), Duration::from_millis(100));
        assert_eq!(strategy.next(4), Duration::from_millis(400));
    }

    #[test]
    fn constant_ignores_attempt() {
        let params = BackoffParams {
            base: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        let strategy = Backoff::Constant(params);
        assert_eq!(strategy.next(1), Duration::from_millis(250));
        assert_eq!(strategy.next(99), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_bounds_and_non_negative() {
        let params = BackoffParams {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.5,
        };
        let strategy = Backoff::Constant(params);
        for _ in 0..200 {
            let delay = strategy.next(1);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn jitter_is_statistically_independent_across_calls() {
        let params = BackoffParams {
            base: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        };
        let strategy = Backoff::Constant(params);
        let samples: Vec<Duration> = (0..20).map(|_| strategy.next(1)).collect();
        assert!(samples.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn default_backoff_is_exponential_base_one_second() {
        let strategy = Backoff::default();
        match strategy {
            Backoff::Exponential(params) => assert_eq!(params.base, Duration::from_secs(1)),
            other => panic!("expected Exponential, got {other:?}"),
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn jitter_never_escapes_its_bounds(
            base_millis in 1u64..5_000,
            max_millis in 1u64..60_000,
            jitter in 0.0f64..=1.0,
            attempt in 1i64..20,
        ) {
            let params = BackoffParams {
                base: Duration::from_millis(base_millis),
                multiplier: 2.0,
                max_delay: Duration::from_millis(max_millis),
                jitter,
            };
            for strategy in [Backoff::Exponential(params), Backoff::Linear(params), Backoff::Constant(params)] {
                let delay = strategy.next(attempt);
                let clamped_nominal = match strategy {
                    Backoff::Exponential(p) => {
                        let raw = p.base.as_secs_f64() * p.multiplier.powi((attempt - 1) as i32);
                        Duration::from_secs_f64(raw.max(0.0)).min(p.max_delay)
                    }
                    Backoff::Linear(p) => {
                        let raw = p.base.as_secs_f64() * attempt as f64;
                        Duration::from_secs_f64(raw.max(0.0)).min(p.max_delay)
                    }
                    Backoff::Constant(p) => p.base.min(p.max_delay),
                    Backoff::None => Duration::ZERO,
                };
                let low = clamped_nominal.as_secs_f64() * (1.0 - jitter.clamp(0.0, 1.0));
                let high = clamped_nominal.as_secs_f64() * (1.0 + jitter.clamp(0.0, 1.0));
                prop_assert!(delay.as_secs_f64() >= low.max(0.0) - 1e-9);
                prop_assert!(delay.as_secs_f64() <= high + 1e-9);
            }
        }

        #[test]
        fn non_positive_attempt_is_always_zero_under_any_params(
            base_millis in 0u64..60_000,
            jitter in 0.0f64..=1.0,
            attempt in -10i64..=0,
        ) {
            let params = BackoffParams {
                base: Duration::from_millis(base_millis),
                multiplier: 2.0,
                max_delay: Duration::from_secs(30),
                jitter,
            };
            for strategy in [Backoff::Exponential(params), Backoff::Linear(params), Backoff::Constant(params), Backoff::None] {
                prop_assert_eq!(strategy.next(attempt), Duration::ZERO);
            }
        }
    }
}
