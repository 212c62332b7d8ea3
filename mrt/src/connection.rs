//! Per-connection record shared by the client and server protocol loops.
//!
//! A [`Connection`] owns everything one end knows about its peer:
//! - the FSM state (see [`crate::state`]),
//! - the negotiated segment size and both receive capacities,
//! - the coarse `seq` / `ack` counters carried in every header,
//! - the retransmit timer and the retry budget of the current phase,
//! - the last control segment sent, so a bad or missing reply can be
//!   answered by resending it.
//!
//! It never spawns tasks or reads the socket; the protocol loop passes the
//! socket in whenever a segment must go out.

use std::net::SocketAddr;

use crate::config::Config;
use crate::error::{MrtError, Phase, Result};
use crate::segment::{Header, SegmentKind, HEADER_LEN};
use crate::socket::Socket;
use crate::state::{ConnectionState, Role};
use crate::timer::{RetransmitTimer, RetryBudget};

#[derive(Debug)]
pub struct Connection {
    role: Role,
    pub local: SocketAddr,
    remote: Option<SocketAddr>,
    /// Maximum segment size, header included.
    pub mss: usize,
    /// Receive capacity this end advertises (server only).
    pub local_capacity: u32,
    /// Receive capacity learned from the SYN+ACK (client only).
    pub peer_capacity: u32,
    state: ConnectionState,
    seq: u16,
    ack: u16,
    budget: RetryBudget,
    pub timer: RetransmitTimer,
    last_control: Option<(Header, Vec<u8>)>,
    config: Config,
}

impl Connection {
    pub fn new(
        role: Role,
        local: SocketAddr,
        remote: Option<SocketAddr>,
        mss: usize,
        local_capacity: u32,
        config: &Config,
    ) -> Self {
        Self {
            role,
            local,
            remote,
            mss,
            local_capacity,
            peer_capacity: 0,
            state: ConnectionState::Closed,
            seq: 0,
            ack: 0,
            budget: RetryBudget::new(Phase::Handshake, config.handshake_retries),
            timer: RetransmitTimer::new(config.timeout),
            last_control: None,
            config: config.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote(&self) -> Result<SocketAddr> {
        self.remote.ok_or(MrtError::BadState(self.state))
    }

    /// `true` when `from` is the bound peer.
    pub fn is_peer(&self, from: SocketAddr) -> bool {
        self.remote == Some(from)
    }

    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = Some(remote);
    }

    /// Bytes of payload that fit in one segment.
    pub fn payload_size(&self) -> usize {
        self.mss - HEADER_LEN
    }

    /// Move the FSM.  An edge missing from the diagram is logged, not refused.
    pub fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition(next, self.role) {
            log::warn!(
                "{:?} {}: unexpected transition {} -> {}",
                self.role,
                self.local,
                self.state,
                next
            );
        }
        log::debug!("{:?} {}: {} -> {}", self.role, self.local, self.state, next);
        self.state = next;
    }

    // -----------------------------------------------------------------------
    // Retry budget
    // -----------------------------------------------------------------------

    /// Start a fresh budget for `phase`.
    pub fn begin_phase(&mut self, phase: Phase) {
        let limit = match phase {
            Phase::Handshake => self.config.handshake_retries,
            Phase::Transfer => self.config.transfer_retries,
            Phase::Teardown => self.config.teardown_retries,
        };
        self.budget = RetryBudget::new(phase, limit);
    }

    pub fn budget_mut(&mut self) -> &mut RetryBudget {
        &mut self.budget
    }

    // -----------------------------------------------------------------------
    // Headers
    // -----------------------------------------------------------------------

    /// Record the peer's control segment; `ack` names the one after it.
    pub fn on_peer_control(&mut self, header: &Header) {
        self.ack = header.seq.wrapping_add(1);
    }

    pub fn data_header(&self, packet_index: u16, flags: u8) -> Header {
        Header::new(self.seq, self.ack, packet_index, flags)
    }

    // -----------------------------------------------------------------------
    // Control segments
    // -----------------------------------------------------------------------

    /// Send a control segment, remember it and arm the timer.
    ///
    /// Segments carrying SYN, and a lone FIN, consume one `seq`.
    pub async fn send_control(&mut self, socket: &Socket, flags: u8, payload: &[u8]) -> Result<()> {
        let header = Header::new(self.seq, self.ack, 0, flags);
        socket.send_segment(&header, payload, self.remote()?).await?;
        let kind = SegmentKind::of(&header);
        if matches!(kind, SegmentKind::Syn | SegmentKind::SynAck | SegmentKind::Fin) {
            self.seq = self.seq.wrapping_add(1);
        }
        self.last_control = Some((header, payload.to_vec()));
        self.timer.arm();
        Ok(())
    }

    /// Resend the last control segment, spending one attempt.
    ///
    /// Fails with the phase's fatal error once the budget is gone.
    pub async fn resend_control(&mut self, socket: &Socket, cause: &MrtError) -> Result<()> {
        let left = self.budget.consume()?;
        let Some((header, payload)) = self.last_control.as_ref() else {
            return Ok(());
        };
        log::warn!(
            "{:?} {}: {cause}; resending {} ({left} {} attempts left)",
            self.role,
            self.local,
            SegmentKind::of(header),
            self.budget.phase()
        );
        socket.send_segment(header, payload, self.remote()?).await?;
        self.timer.arm();
        Ok(())
    }

    /// Resend the last control segment without touching the budget.
    ///
    /// Used when the peer itself retransmitted, so the reply was lost.
    pub async fn repeat_control(&mut self, socket: &Socket) -> Result<()> {
        if let Some((header, payload)) = self.last_control.as_ref() {
            log::debug!("{:?} {}: repeating {}", self.role, self.local, SegmentKind::of(header));
            socket.send_segment(header, payload, self.remote()?).await?;
        }
        Ok(())
    }

    /// Send a control segment the peer must not answer, keeping it for
    /// [`Connection::repeat_control`].  The timer is left alone.
    pub async fn send_notice(&mut self, socket: &Socket, flags: u8, payload: &[u8]) -> Result<()> {
        let header = Header::new(self.seq, self.ack, 0, flags);
        socket.send_segment(&header, payload, self.remote()?).await?;
        self.last_control = Some((header, payload.to_vec()));
        Ok(())
    }

    /// Reply received: stop the timer and refill the budget.
    pub fn clear_control(&mut self) {
        self.timer.disarm();
        self.budget.reset();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::segment::flags;

    async fn pair() -> (Socket, Socket) {
        let a = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn syn_consumes_seq_and_arms_timer() {
        let (a, b) = pair().await;
        let cfg = Config::with_timeout(Duration::from_millis(50));
        let mut conn = Connection::new(Role::Client, a.local_addr, Some(b.local_addr), 100, 0, &cfg);
        conn.send_control(&a, flags::SYN, b"").await.unwrap();
        assert!(conn.timer.is_armed());

        let got = b.recv_segment(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(got.segment.kind(), SegmentKind::Syn);
        assert_eq!(got.segment.header.seq, 0);
        assert_eq!(conn.data_header(0, 0).seq, 1);
    }

    #[tokio::test]
    async fn resend_spends_budget_until_failure() {
        let (a, b) = pair().await;
        let cfg = Config::with_timeout(Duration::from_millis(50)).retries(2);
        let mut conn = Connection::new(Role::Client, a.local_addr, Some(b.local_addr), 100, 0, &cfg);
        conn.begin_phase(Phase::Teardown);
        conn.send_control(&a, flags::FIN, b"").await.unwrap();

        conn.resend_control(&a, &MrtError::Timeout(cfg.timeout)).await.unwrap();
        let err = conn
            .resend_control(&a, &MrtError::Timeout(cfg.timeout))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MrtError::ConnectionFailure {
                phase: Phase::Teardown,
                attempts: 2
            }
        );

        // Original plus one resend reached the peer.
        for _ in 0..2 {
            let got = b.recv_segment(Duration::from_secs(2)).await.unwrap().unwrap();
            assert_eq!(got.segment.kind(), SegmentKind::Fin);
        }
    }

    #[tokio::test]
    async fn unbound_server_cannot_send() {
        let (a, _b) = pair().await;
        let mut conn = Connection::new(Role::Server, a.local_addr, None, 100, 1000, &Config::default());
        let err = conn.send_control(&a, flags::SYN | flags::ACK, b"").await.unwrap_err();
        assert_eq!(err, MrtError::BadState(ConnectionState::Closed));
    }

    #[test]
    fn payload_size_excludes_header() {
        let conn = Connection::new(
            Role::Client,
            "127.0.0.1:1".parse().unwrap(),
            None,
            100,
            0,
            &Config::default(),
        );
        assert_eq!(conn.payload_size(), 100 - HEADER_LEN);
    }
}
