//! Retry/timeout wrapper for remote calls.
//!
//! Each attempt runs on a freshly spawned task so a hung call never
//! blocks the caller beyond the attempt timeout. A timed-out attempt is
//! aborted locally; if the remote side finishes later its result is
//! dropped with the task.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use berth_core::ExecutorConfig;

use crate::error::{AttemptError, ExecError, ExecResult, OperationKind, RuntimeError};

/// Smallest pause between attempts of a deadline-bounded operation.
///
/// Without it, a call that fails instantly would spin until the deadline.
pub const MIN_DEADLINE_BACKOFF: Duration = Duration::from_millis(100);

/// When to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
    /// Give up after this many attempts.
    AfterAttempts(u32),
    /// Keep trying until this much time has passed since the first attempt.
    AfterElapsed(Duration),
}

/// Retry policy: per-attempt timeout, stop strategy, and pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub stop: StopStrategy,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Bounded attempt-count policy.
    pub fn attempts(max_attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            attempt_timeout,
            stop: StopStrategy::AfterAttempts(max_attempts.max(1)),
            backoff: Duration::ZERO,
        }
    }

    /// Retry-until-deadline policy.
    pub fn until(deadline: Duration, attempt_timeout: Duration) -> Self {
        Self {
            attempt_timeout,
            stop: StopStrategy::AfterElapsed(deadline),
            backoff: MIN_DEADLINE_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = match self.stop {
            StopStrategy::AfterElapsed(_) => backoff.max(MIN_DEADLINE_BACKOFF),
            StopStrategy::AfterAttempts(_) => backoff,
        };
        self
    }

    /// Policy for reads (inspect, list).
    pub fn read(config: &ExecutorConfig) -> Self {
        Self::until(config.read_deadline.get(), config.attempt_timeout.get())
            .with_backoff(config.retry_backoff.get())
    }

    /// Policy for image pulls.
    pub fn pull(config: &ExecutorConfig) -> Self {
        Self::attempts(config.max_pull_attempts, config.attempt_timeout.get())
            .with_backoff(config.retry_backoff.get())
    }

    /// Policy for start, stop, and remove.
    pub fn mutation(config: &ExecutorConfig) -> Self {
        Self::attempts(config.max_mutation_attempts, config.attempt_timeout.get())
            .with_backoff(config.retry_backoff.get())
    }

    /// Time allowed for the next attempt, clipped to the remaining deadline.
    fn attempt_budget(&self, elapsed: Duration) -> Duration {
        match self.stop {
            StopStrategy::AfterAttempts(_) => self.attempt_timeout,
            StopStrategy::AfterElapsed(deadline) => {
                self.attempt_timeout.min(deadline.saturating_sub(elapsed))
            }
        }
    }

    /// Whether another attempt may start once the backoff has elapsed.
    fn exhausted(&self, attempts: u32, elapsed_after_backoff: Duration) -> bool {
        match self.stop {
            StopStrategy::AfterAttempts(max) => attempts >= max,
            StopStrategy::AfterElapsed(deadline) => elapsed_after_backoff >= deadline,
        }
    }
}

/// Run `call` under `policy` until it succeeds or the policy gives up.
///
/// `call` is invoked once per attempt and must produce an owned future.
pub async fn call_with_retries<T, F, Fut>(
    op: OperationKind,
    policy: &RetryPolicy,
    mut call: F,
) -> ExecResult<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>> + Send + 'static,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let budget = policy.attempt_budget(started.elapsed());
        let mut handle = tokio::spawn(call());

        let failure = match tokio::time::timeout(budget, &mut handle).await {
            Ok(Ok(Ok(value))) => {
                if attempt > 1 {
                    debug!(%op, attempt, "remote call succeeded after retries");
                }
                return Ok(value);
            }
            Ok(Ok(Err(e))) => AttemptError::Runtime(e),
            Ok(Err(join_err)) => AttemptError::Aborted(join_err.to_string()),
            Err(_) => {
                handle.abort();
                AttemptError::TimedOut(budget)
            }
        };

        let permanent = matches!(&failure, AttemptError::Runtime(e) if !e.is_retryable());
        if permanent || policy.exhausted(attempt, started.elapsed() + policy.backoff) {
            warn!(%op, attempts = attempt, error = %failure, "remote call exhausted retries");
            return Err(ExecError::Exhausted {
                op,
                attempts: attempt,
                source: failure,
            });
        }

        debug!(%op, attempt, error = %failure, "remote call attempt failed, retrying");
        if !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff).await;
        }
    }
}
