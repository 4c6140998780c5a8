// SPDX-License-Identifier: MIT OR Apache-2.0
//! Generic async retry engine.
//!
//! [`run`] is a `Do[T](ctx, op, opts) -> (T, error)` contract realized as an
//! `async fn` generic over the success type `T`; the error type is fixed to
//! [`meshrpc_error::ClientError`] — the one taxonomy every crate in this
//! workspace produces — rather than generic over an arbitrary `E`, since
//! there is no way to manufacture an arbitrary `E` for the
//! ctx-cancelled/deadline-exceeded path the retry loop needs.
//!
//! Rust has no ambient `context.Context`; [`CancellationToken`] plus an
//! optional [`Instant`] deadline, bundled as [`RetryContext`], play that
//! role here and are reused as-is by `meshrpc-client` for its manager-wide
//! shutdown signal and per-call caller context.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use meshrpc_backoff::Backoff;
use meshrpc_error::ClientError;
use meshrpc_retry_budget::RetryBudget;
use meshrpc_retry_condition::{Always, BoxCondition, Condition};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

// ── Cancellation ────────────────────────────────────────────────────────

/// A cloneable, cheaply-shareable token used to signal cancellation.
///
/// All clones share the same underlying state; cancelling one immediately
/// makes every clone observe `is_cancelled() == true`.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new token that is **not** cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` if [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// A future that completes when the token is cancelled (immediately, if
    /// already cancelled).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Stand-in for a caller's cancellable context: a [`CancellationToken`] plus
/// an optional absolute deadline.
#[derive(Clone, Debug)]
pub struct RetryContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RetryContext {
    /// A context with no deadline, carrying `token`.
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// Attach an absolute deadline to this context.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The underlying cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Remaining time until the deadline, if one is set. `None` means no
    /// deadline; `Some(Duration::ZERO)` means the deadline has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether this context is "done": cancelled, or its deadline has
    /// passed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.remaining() == Some(Duration::ZERO)
    }

    /// Wait until the context is done (cancelled or deadline elapses).
    pub async fn done(&self) {
        match self.remaining() {
            Some(remaining) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep(remaining) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

/// One failed attempt, preserved in order inside a [`RetryError`].
#[derive(Debug)]
pub struct AttemptError {
    /// 1-indexed attempt number this error occurred on.
    pub attempt: u32,
    /// The error produced by that attempt.
    pub error: ClientError,
}

/// Aggregation of every attempt's error, preserving attempt-ordered history.
///
/// `Display` surfaces the last error's message; the full per-attempt
/// history is available via [`RetryError::render_history`].
#[derive(Debug)]
pub struct RetryError {
    attempts: Vec<AttemptError>,
}

impl RetryError {
    fn new(attempts: Vec<AttemptError>) -> Self {
        debug_assert!(!attempts.is_empty(), "RetryError must carry at least one attempt");
        Self { attempts }
    }

    /// The ordered list of every attempt's error.
    #[must_use]
    pub fn attempts(&self) -> &[AttemptError] {
        &self.attempts
    }

    /// Number of attempts that were made.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// The last (most recent) error, for `Is`/`As`-style traversal.
    #[must_use]
    pub fn last(&self) -> &ClientError {
        &self.attempts.last().expect("non-empty").error
    }

    /// Multi-line record of every attempt: `"attempt N: <message>"` per
    /// line.
    #[must_use]
    pub fn render_history(&self) -> String {
        self.attempts
            .iter()
            .map(|a| format!("attempt {}: {}", a.attempt, a.error))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.last())
    }
}

impl std::error::Error for RetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.last())
    }
}

// ── Options ─────────────────────────────────────────────────────────────

/// Configuration for a single [`run`] invocation, built from an option
/// list via the builder methods below.
pub struct RetryOptions {
    max_attempts: u32,
    backoff: Backoff,
    condition: BoxCondition<ClientError>,
    per_attempt_timeout: Option<Duration>,
    budget: Option<Arc<RetryBudget>>,
    on_retry: Option<Box<dyn Fn(u32, &ClientError) + Send + Sync>>,
}

impl Default for RetryOptions {
    /// 3 attempts, exponential backoff with base 1s, always-retry, no
    /// per-attempt timeout, no budget.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            condition: Box::new(Always),
            per_attempt_timeout: None,
            budget: None,
            on_retry: None,
        }
    }
}

impl RetryOptions {
    /// Start from the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum attempt count (must be at least 1).
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Override the backoff strategy.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the retry condition.
    #[must_use]
    pub fn condition(mut self, condition: BoxCondition<ClientError>) -> Self {
        self.condition = condition;
        self
    }

    /// Set a per-attempt timeout, derived from the caller's context.
    #[must_use]
    pub fn per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = Some(timeout);
        self
    }

    /// Attach a shared retry budget.
    #[must_use]
    pub fn budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Attach a callback invoked `(attempt, err)` before each backoff sleep.
    #[must_use]
    pub fn on_retry(mut self, callback: impl Fn(u32, &ClientError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(callback));
        self
    }
}

fn ctx_error(_ctx: &RetryContext, start: Instant) -> ClientError {
    ClientError::DeadlineExceeded {
        elapsed: start.elapsed(),
    }
}

/// Run `op` under the retry policy described by `opts`, honoring `ctx`'s
/// cancellation/deadline, the optional retry budget, and per-attempt
/// timeouts.
pub async fn run<T, F, Fut>(ctx: &RetryContext, mut op: F, opts: &RetryOptions) -> Result<T, RetryError>
where
    T: Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
{
    let start = Instant::now();
    let mut collected: Vec<AttemptError> = Vec::new();

    for attempt in 1..=opts.max_attempts {
        // (a) ctx already done.
        if ctx.is_done() {
            tracing::debug!(attempt, "context already done, giving up before attempt");
            let err = ctx_error(ctx, start);
            collected.push(AttemptError { attempt, error: err });
            return Err(RetryError::new(collected));
        }

        // (b) budget gate (not applied to the first attempt).
        if attempt > 1
            && let Some(budget) = &opts.budget
            && !budget.allow()
        {
            tracing::warn!(attempt, "retry budget exhausted, giving up");
            collected.push(AttemptError {
                attempt,
                error: ClientError::RetryBudgetExhausted,
            });
            return Err(RetryError::new(collected));
        }

        // (c) execute, optionally under a per-attempt timeout.
        let outcome = match opts.per_attempt_timeout {
            Some(timeout) => run_one_attempt(&mut op, ctx, timeout).await,
            None => op().await,
        };

        // (d) record against the budget.
        if let Some(budget) = &opts.budget {
            budget.record(outcome.is_ok());
        }

        match outcome {
            // (e) success.
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                // (f) collect.
                let is_last = attempt == opts.max_attempts;
                let should_retry = opts.condition.should_retry(&err, attempt);
                tracing::debug!(attempt, error = %err, should_retry, is_last, "attempt failed");
                collected.push(AttemptError { attempt, error: err });

                // (g) stop if the condition says no, or attempts exhausted.
                if !should_retry || is_last {
                    tracing::warn!(attempt, "giving up, not retrying further");
                    return Err(RetryError::new(collected));
                }

                // (h) user callback.
                if let Some(on_retry) = &opts.on_retry {
                    on_retry(attempt, &collected.last().expect("just pushed").error);
                }

                // (i) compute delay, bail if it would overrun the deadline.
                let delay = opts.backoff.next(i64::from(attempt));
                if let Some(remaining) = ctx.remaining()
                    && remaining < delay
                {
                    collected.push(AttemptError {
                        attempt,
                        error: ClientError::DeadlineExceeded {
                            elapsed: start.elapsed(),
                        },
                    });
                    return Err(RetryError::new(collected));
                }
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before next attempt");

                // (j) interruptible sleep.
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = ctx.token().cancelled() => {
                        collected.push(AttemptError {
                            attempt,
                            error: ClientError::DeadlineExceeded { elapsed: start.elapsed() },
                        });
                        return Err(RetryError::new(collected));
                    }
                }
            }
        }
    }

    unreachable!("loop always returns by the last iteration")
}

/// Race a single attempt against `ctx`'s cancellation and a per-attempt
/// timeout. The operation always runs to completion on the Tokio runtime
/// regardless of which branch of the `select!` wins — there is no leaked
/// task, because the spawned future is not aborted, only its result
/// discarded if we stop waiting on it first.
async fn run_one_attempt<T, F, Fut>(op: &mut F, ctx: &RetryContext, timeout: Duration) -> Result<T, ClientError>
where
    T: Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
{
    let fut = op();
    let handle = tokio::spawn(fut);
    tokio::select! {
        res = handle => {
            match res {
                Ok(result) => result,
                Err(join_err) => Err(ClientError::transport(join_err)),
            }
        }
        () = tokio::time::sleep(timeout) => {
            Err(ClientError::DeadlineExceeded { elapsed: timeout })
        }
        () = ctx.token().cancelled() => {
            Err(ClientError::DeadlineExceeded { elapsed: Duration::ZERO })
        }
    }
}
