//! Bounded retry state carried in each session record.
//!
//! Nothing here sleeps or spawns; the session actor asks for the next
//! deadline and calls back in when it passes.

use std::time::Duration;

use tokio::time::Instant;

/// ICE restarts allowed before a failure is surfaced
#[derive(Debug, Clone)]
pub struct RestartBudget {
    limit: u32,
    used: u32,
}

impl RestartBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Spends one restart; false once the budget is gone
    pub fn try_consume(&mut self) -> bool {
        if self.used < self.limit {
            self.used += 1;
            true
        } else {
            false
        }
    }

    /// Connectivity recovered; later failures get a fresh budget
    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}

/// Fixed-backoff retry of local offer creation
#[derive(Debug, Clone)]
pub struct OfferRetry {
    delay: Duration,
    attempts: u32,
    due: Option<(Instant, bool)>,
}

impl OfferRetry {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            attempts: 0,
            due: None,
        }
    }

    pub fn schedule(&mut self, now: Instant, ice_restart: bool) {
        self.attempts += 1;
        self.due = Some((now + self.delay, ice_restart));
    }

    /// Returns the restart flag of a retry whose time has come
    pub fn take_due(&mut self, now: Instant) -> Option<bool> {
        match self.due {
            Some((at, ice_restart)) if at <= now => {
                self.due = None;
                Some(ice_restart)
            }
            _ => None,
        }
    }

    pub fn succeeded(&mut self) {
        self.attempts = 0;
        self.due = None;
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }

    /// Drops a pending first-offer retry; a deferred ICE restart stays
    pub fn cancel_initial(&mut self) {
        if matches!(self.due, Some((_, false))) {
            self.due = None;
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.due.map(|(at, _)| at)
    }
}

/// One-shot deadline: the grace period for a `Disconnected` connection, or
/// the wait for an ICE restart to bring connectivity back
#[derive(Debug, Clone)]
pub struct Countdown {
    period: Duration,
    deadline: Option<Instant>,
}

impl Countdown {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    /// Starts the timer unless one is already running
    pub fn arm(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.period);
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// True exactly once, when an armed timer has run out
    pub fn take_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if at <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

#[derive(Debug, Clone)]
pub struct Recovery {
    pub restart: RestartBudget,
    pub offer_retry: OfferRetry,
    pub grace: Countdown,
    pub restart_wait: Countdown,
}

impl Recovery {
    pub fn new(restart_budget: u32, retry_delay: Duration, grace: Duration) -> Self {
        Self {
            restart: RestartBudget::new(restart_budget),
            offer_retry: OfferRetry::new(retry_delay),
            grace: Countdown::new(grace),
            restart_wait: Countdown::new(grace),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.offer_retry.deadline(),
            self.grace.deadline(),
            self.restart_wait.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn cancel_timers(&mut self) {
        self.offer_retry.cancel();
        self.grace.cancel();
        self.restart_wait.cancel();
    }
}
