//! Endpoint tuning knobs.
//!
//! Every timing constant the protocol uses lives here so tests can shrink
//! them and the CLI can expose them as flags.

use std::time::Duration;

use crate::error::{MrtError, Result};
use crate::segment::{HEADER_LEN, MAX_SEGMENT_SIZE};

/// Adjustable timeout and retry parameters for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Fixed per-attempt timeout for handshake, transfer and teardown.
    pub timeout: Duration,
    /// Expiries tolerated while connecting before `ConnectionFailure`.
    pub handshake_retries: u32,
    /// Expiries tolerated without window progress before `TransferFailure`.
    pub transfer_retries: u32,
    /// Expiries tolerated while closing before `ConnectionFailure`.
    pub teardown_retries: u32,
    /// Bounded wait for socket readability in the receive loop.
    pub poll_interval: Duration,
    /// Capacity of the receive-loop → protocol-loop event queue.
    pub queue_capacity: usize,
    /// How long a closed server keeps answering retransmitted FINs.
    /// Covers the client's whole teardown budget, `teardown_retries × timeout`.
    pub linger: Duration,
    /// Deadline applied to every `Server::receive`; `None` waits for the
    /// full length or a FIN.
    pub receive_deadline: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        let timeout = Duration::from_millis(1000);
        let retries = 6;
        Self {
            timeout,
            handshake_retries: retries,
            transfer_retries: retries,
            teardown_retries: retries,
            poll_interval: Duration::from_millis(100),
            queue_capacity: 64,
            linger: timeout * retries,
            receive_deadline: None,
        }
    }
}

impl Config {
    /// Same configuration with every timing knob derived from `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let defaults = Self::default();
        Self {
            timeout,
            poll_interval: (timeout / 4).max(Duration::from_millis(1)),
            linger: timeout * defaults.teardown_retries,
            ..defaults
        }
    }

    /// Set every retry budget to `retries`; the linger follows the
    /// teardown budget.
    pub fn retries(mut self, retries: u32) -> Self {
        self.handshake_retries = retries;
        self.transfer_retries = retries;
        self.teardown_retries = retries;
        self.linger = self.timeout * retries;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(MrtError::InvalidConfig("timeout must be non-zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(MrtError::InvalidConfig("poll_interval must be non-zero".into()));
        }
        if self.handshake_retries == 0 || self.transfer_retries == 0 || self.teardown_retries == 0
        {
            return Err(MrtError::InvalidConfig("retry budgets must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(MrtError::InvalidConfig("queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Check a maximum segment size against the header and UDP limits.
pub fn validate_mss(mss: usize) -> Result<()> {
    if mss <= HEADER_LEN {
        return Err(MrtError::InvalidConfig(format!(
            "segment size {mss} leaves no room for payload after the {HEADER_LEN}-byte header"
        )));
    }
    if mss > MAX_SEGMENT_SIZE {
        return Err(MrtError::InvalidConfig(format!(
            "segment size {mss} exceeds the {MAX_SEGMENT_SIZE}-byte UDP limit"
        )));
    }
    Ok(())
}
