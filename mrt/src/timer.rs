//! Retransmit timer and retry budgets.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! response arrives within a bounded time.  This protocol uses a **fixed**
//! per-attempt timeout (no RTT estimation, no back-off); what bounds the
//! total wait is the [`RetryBudget`] of the current phase.
//!
//! - [`RetransmitTimer`]: a single deadline owned by a protocol loop and
//!   polled inside its `select!`.  A disarmed timer never fires.
//! - [`RetryBudget`]: counts expiries (and, during the handshake and
//!   teardown, bad replies) and turns exhaustion into the phase's fatal
//!   error.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{MrtError, Phase, Result};

/// A bounded number of attempts for one connection phase.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    phase: Phase,
    limit: u32,
    remaining: u32,
}

impl RetryBudget {
    pub fn new(phase: Phase, limit: u32) -> Self {
        Self {
            phase,
            limit,
            remaining: limit,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Spend one attempt.
    ///
    /// Returns the attempts left, or the phase's fatal error once the last
    /// one is gone.
    pub fn consume(&mut self) -> Result<u32> {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            Err(MrtError::exhausted(self.phase, self.limit))
        } else {
            Ok(self.remaining)
        }
    }

    /// Refill after progress.
    pub fn reset(&mut self) {
        self.remaining = self.limit;
    }
}

/// Single-deadline retransmit timer.
#[derive(Debug)]
pub struct RetransmitTimer {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl RetransmitTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// (Re)start the countdown from now.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes when the armed deadline passes; pends forever when disarmed.
    ///
    /// Cancel-safe: dropping the future leaves the deadline untouched.
    pub async fn expired(&self) {
        until(self.deadline).await
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
