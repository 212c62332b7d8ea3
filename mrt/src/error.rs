//! Error types shared by every layer of the crate.
//!
//! [`MrtError`] is `Clone` because the protocol loop publishes one failure to
//! every task waiting on a condition signal; I/O errors are therefore carried
//! as their rendered message.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::segment::SegmentKind;
use crate::state::ConnectionState;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MrtError>;

/// Connection phase a retry budget belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// SYN / SYN+ACK / ACK exchange, including the wait for `ready`.
    Handshake,
    /// Windowed data transfer.
    Transfer,
    /// FIN / ACK+FIN exchange.
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Handshake => write!(f, "handshake"),
            Phase::Transfer => write!(f, "transfer"),
            Phase::Teardown => write!(f, "teardown"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MrtError {
    /// Checksum mismatch. Always answered with a resend or duplicate ack.
    #[error("corrupt segment: checksum mismatch")]
    CorruptSegment,

    /// Nothing usable arrived inside one timeout window.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// A verified segment of the wrong kind for the current state.
    #[error("unexpected {0} segment")]
    UnexpectedSegment(SegmentKind),

    /// A data segment arrived out of order.
    #[error("unexpected packet index {got} (expected {expected})")]
    UnexpectedIndex { expected: u16, got: u16 },

    /// Handshake or teardown retry budget exhausted.
    #[error("connection failed during {phase} after {attempts} attempts")]
    ConnectionFailure { phase: Phase, attempts: u32 },

    /// Data-phase retry budget exhausted.
    #[error("transfer failed after {attempts} attempts")]
    TransferFailure { attempts: u32 },

    #[error("operation not valid while connection is {0}")]
    BadState(ConnectionState),

    #[error("unknown connection {0}")]
    UnknownConnection(SocketAddr),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("socket error: {0}")]
    Socket(String),

    /// The protocol loop exited, so no signal will ever be raised again.
    #[error("protocol loop terminated")]
    LoopTerminated,
}

impl MrtError {
    /// Fatal error for an exhausted budget in `phase`.
    pub fn exhausted(phase: Phase, attempts: u32) -> Self {
        match phase {
            Phase::Transfer => MrtError::TransferFailure { attempts },
            _ => MrtError::ConnectionFailure { phase, attempts },
        }
    }
}

impl From<std::io::Error> for MrtError {
    fn from(err: std::io::Error) -> Self {
        MrtError::Socket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_maps_phase_to_variant() {
        assert_eq!(
            MrtError::exhausted(Phase::Transfer, 4),
            MrtError::TransferFailure { attempts: 4 }
        );
        assert_eq!(
            MrtError::exhausted(Phase::Handshake, 2),
            MrtError::ConnectionFailure {
                phase: Phase::Handshake,
                attempts: 2
            }
        );
    }

    #[test]
    fn io_error_keeps_message() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(MrtError::from(io), MrtError::Socket("boom".into()));
    }

    #[test]
    fn display_names_phase() {
        let e = MrtError::ConnectionFailure {
            phase: Phase::Teardown,
            attempts: 3,
        };
        assert_eq!(e.to_string(), "connection failed during teardown after 3 attempts");
    }
}
