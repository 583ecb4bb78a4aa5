//! Convergence polling.
//!
//! [`retry`] drives an operation under exponential backoff until it
//! reports [`PollOutcome::Succeed`] or [`PollOutcome::FailPermanent`], or
//! the elapsed-time budget runs out. [`Convergence`] turns change-feed
//! snapshots into outcomes and enforces the no-progress stall window.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use grid_core::{PollConfig, ResultState, Workload};
use tokio::time::Instant;
use tracing::debug;

/// Result of one polling attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T, E> {
    /// Not there yet; try again after the next interval.
    Continue,
    FailPermanent(E),
    Succeed(T),
}

/// Why [`retry`] stopped without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    Permanent(E),
    Exhausted { attempts: u32, elapsed: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Backoff {
    pub fn from_config(config: &PollConfig) -> Self {
        Self {
            initial_interval: config.initial_interval(),
            multiplier: config.multiplier,
            max_interval: config.max_interval(),
            max_elapsed: config.max_elapsed(),
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_interval)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&PollConfig::default())
    }
}

/// Run `op` until it succeeds, fails permanently, or the next wait would
/// exceed `backoff.max_elapsed`. The first attempt runs immediately.
pub async fn retry<T, E, F, Fut>(backoff: &Backoff, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollOutcome<T, E>>,
{
    let start = Instant::now();
    let mut interval = backoff.initial_interval;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match op().await {
            PollOutcome::Succeed(value) => return Ok(value),
            PollOutcome::FailPermanent(err) => return Err(RetryError::Permanent(err)),
            PollOutcome::Continue => {}
        }

        let elapsed = start.elapsed();
        if elapsed + interval > backoff.max_elapsed {
            return Err(RetryError::Exhausted { attempts, elapsed });
        }
        debug!(attempts, ?interval, "not converged, backing off");
        tokio::time::sleep(interval).await;
        interval = backoff.next_interval(interval);
    }
}

/// A workload that can no longer reach `ok` at its expected version, or a
/// deployment that stopped making progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceFailure {
    Workload {
        name: String,
        state: ResultState,
        message: String,
    },
    Stalled { ok: usize, total: usize },
}

/// Tracks how many expected workloads are `ok` across change-feed polls.
#[derive(Debug)]
pub struct Convergence {
    expected: BTreeMap<String, u32>,
    stall_timeout: Duration,
    best_ok: usize,
    last_progress: Instant,
}

impl Convergence {
    pub fn new(expected: BTreeMap<String, u32>, stall_timeout: Duration) -> Self {
        Self {
            expected,
            stall_timeout,
            best_ok: 0,
            last_progress: Instant::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.expected.len()
    }

    pub fn ok(&self) -> usize {
        self.best_ok
    }

    /// Judge one snapshot of the change feed.
    ///
    /// Workloads at a version other than the expected one are still being
    /// rolled out and only count as pending.
    pub fn observe(&mut self, workloads: &[Workload]) -> PollOutcome<(), ConvergenceFailure> {
        let mut ok_names = BTreeSet::new();
        for w in workloads {
            if self.expected.get(&w.name) != Some(&w.version) {
                continue;
            }
            match w.result.state {
                ResultState::Ok => {
                    ok_names.insert(w.name.as_str());
                }
                state if state.is_failure() => {
                    return PollOutcome::FailPermanent(ConvergenceFailure::Workload {
                        name: w.name.clone(),
                        state,
                        message: w.result.error.clone(),
                    });
                }
                _ => {}
            }
        }

        let ok = ok_names.len();
        if ok == self.expected.len() {
            return PollOutcome::Succeed(());
        }
        if ok > self.best_ok {
            self.best_ok = ok;
            self.last_progress = Instant::now();
        } else if self.last_progress.elapsed() > self.stall_timeout {
            return PollOutcome::FailPermanent(ConvergenceFailure::Stalled {
                ok,
                total: self.expected.len(),
            });
        }
        PollOutcome::Continue
    }
}
