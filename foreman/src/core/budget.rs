//! Time and retry budgets, and the cancellation signal workers observe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::types::StopReason;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Shared cancellation flag plus an optional deadline.
///
/// Clones share the flag. [`CancelSignal::with_deadline`] derives a signal for
/// one task that also trips at the task's own deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal sharing this flag whose deadline is the earlier of both.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Cancelled explicitly (not by deadline).
    pub fn is_flagged(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_flagged() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(remaining_budget)
    }

    /// `timeout` shortened to the remaining budget.
    pub fn bound(&self, timeout: Duration) -> Duration {
        self.remaining().map_or(timeout, |left| left.min(timeout))
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `false` when the signal tripped before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let left = remaining_budget(until);
            if left.is_zero() {
                return true;
            }
            thread::sleep(self.bound(left).min(SLEEP_SLICE));
        }
    }
}

/// Return the remaining time budget until the provided deadline (zero once passed).
pub fn remaining_budget(deadline: Instant) -> Duration {
    deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::ZERO)
}

/// Retries applied across all tasks of a run, shared by the workers.
///
/// A worker reserves a retry before applying it, so the total never exceeds
/// the configured maximum no matter how many tasks run concurrently.
#[derive(Debug)]
pub struct RetryBudget {
    used: AtomicU32,
    max: Option<u32>,
    exhausted: AtomicBool,
}

impl RetryBudget {
    /// `already_used` carries retries over from a resumed run.
    pub fn new(max: Option<u32>, already_used: u32) -> Self {
        Self {
            used: AtomicU32::new(already_used),
            max,
            exhausted: AtomicBool::new(false),
        }
    }

    /// Take one retry from the budget. Returns `false`, and marks the budget
    /// exhausted, when none is left.
    pub fn try_reserve(&self) -> bool {
        let reserved = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| match self.max {
                Some(max) if used >= max => None,
                _ => Some(used + 1),
            })
            .is_ok();
        if !reserved {
            self.exhausted.store(true, Ordering::SeqCst);
        }
        reserved
    }

    /// A retry was needed but refused.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }
}

/// Run-wide limits checked by the director between events.
#[derive(Debug)]
pub struct RunBudget {
    pub started: Instant,
    pub run_timeout: Option<Duration>,
    pub retries: RetryBudget,
}

impl RunBudget {
    pub fn new(run_timeout: Option<Duration>, retries: RetryBudget) -> Self {
        Self {
            started: Instant::now(),
            run_timeout,
            retries,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.run_timeout.map(|t| self.started + t)
    }

    /// Which budget, if any, is spent.
    pub fn exhausted(&self) -> Option<StopReason> {
        if self.deadline().is_some_and(|d| Instant::now() >= d) {
            return Some(StopReason::TimeBudgetExhausted);
        }
        if self.retries.is_exhausted() {
            return Some(StopReason::RetryBudgetExhausted);
        }
        None
    }
}
