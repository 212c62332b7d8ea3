//! Connection finite-state machine (FSM) types.
//!
//! The protocol loop of each endpoint is the only code that moves a
//! connection between these states; everything else observes them through
//! the condition signals in [`crate::harness`].
//!
//! ```text
//!  client:  CLOSED ──SYN──▶ SYN_SENT ──SYN+ACK / ACK──▶ ESTABLISHED
//!  server:  CLOSED ──▶ LISTEN ──SYN / SYN+ACK──▶ SYN_RECEIVED ──ACK──▶ ESTABLISHED
//!
//!  ESTABLISHED ──FIN sent──▶ FIN_WAIT ──ACK+FIN──▶ CLOSED        (initiator)
//!  ESTABLISHED ──FIN rcvd / ACK+FIN──────────────▶ CLOSED        (peer)
//! ```

use std::fmt;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and final state.
    #[default]
    Closed,
    /// Server socket bound, waiting for the first valid SYN.
    Listen,
    /// Client sent SYN, waiting for SYN+ACK.
    SynSent,
    /// Server sent SYN+ACK, waiting for the handshake ACK.
    SynReceived,
    /// Handshake complete; data may flow.
    Established,
    /// Initiator sent FIN, waiting for ACK+FIN.
    FinWait,
}

/// Which side of the handshake an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl ConnectionState {
    /// `true` when `self → next` is an edge of the diagram above for `role`.
    pub fn can_transition(self, next: ConnectionState, role: Role) -> bool {
        use ConnectionState::*;
        match (role, self, next) {
            (Role::Client, Closed, SynSent) => true,
            (Role::Client, SynSent, Established) => true,
            (Role::Client, Established, FinWait) => true,
            (Role::Client, FinWait, Closed) => true,
            (Role::Server, Closed, Listen) => true,
            (Role::Server, Listen, SynReceived) => true,
            (Role::Server, SynReceived, Established) => true,
            (Role::Server, Established, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynReceived => "SYN_RECEIVED",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait => "FIN_WAIT",
        };
        f.write_str(name)
    }
}
