//! Server endpoint: passive open, in-order reassembly, and the FIN reply.
//!
//! The server accepts exactly one connection.  Its protocol loop keeps a
//! [`Reassembler`] and answers every data segment with a cumulative ack;
//! [`Server::receive`] is a read request handed to the loop, which replies
//! once enough bytes are buffered, the peer has closed, or the read's
//! deadline passes.
//!
//! ```ignore
//! let mut server = Server::init(60000, 4096).await?;
//! let conn = server.accept().await?;
//! let data = server.receive(&conn, 10_000).await?;
//! server.close().await?;
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{MrtError, Phase, Result};
use crate::harness::{receive_loop, Event, Signal, SignalWaiter, Signals, Tasks};
use crate::receiver::{Reassembler, Verdict};
use crate::segment::{capacity_payload, flags, Decoded, SegmentKind, MAX_SEGMENT_SIZE, READY};
use crate::socket::{Inbound, Socket};
use crate::state::{ConnectionState, Role};
use crate::timer;

/// Opaque identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    peer: SocketAddr,
}

impl ConnectionHandle {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Bytes returned by a bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub data: Vec<u8>,
    /// Fewer bytes than requested: the peer closed or the deadline passed.
    pub truncated: bool,
}

#[derive(Debug)]
enum Command {
    Receive(ReadRequest),
    Shutdown,
}

#[derive(Debug)]
struct ReadRequest {
    length: usize,
    deadline: Option<Instant>,
    reply: oneshot::Sender<Delivery>,
}

// ---------------------------------------------------------------------------
// Server handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    signals: SignalWaiter,
    tasks: Option<Tasks>,
    linger: Duration,
    receive_deadline: Option<Duration>,
}

impl Server {
    /// Bind `local_port` on the loopback interface and start listening.
    /// `receive_buffer_size` is advertised to the client and caps its window.
    pub async fn init(local_port: u16, receive_buffer_size: u32) -> Result<Self> {
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        Self::bind(local, receive_buffer_size, Config::default()).await
    }

    /// Bind `local` and spawn the receive and protocol loops.
    pub async fn bind(local: SocketAddr, receive_buffer_size: u32, config: Config) -> Result<Self> {
        config.validate()?;
        if receive_buffer_size == 0 {
            return Err(MrtError::InvalidConfig("receive buffer size must be non-zero".into()));
        }

        let socket = Arc::new(Socket::bind(local).await?);
        let local_addr = socket.local_addr;
        let (events_tx, events_rx) = mpsc::channel(config.queue_capacity);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (signals, waiter) = Signals::new();

        let mut conn = Connection::new(
            Role::Server,
            local_addr,
            None,
            MAX_SEGMENT_SIZE,
            receive_buffer_size,
            &config,
        );
        conn.transition(ConnectionState::Listen);
        signals.set_state(ConnectionState::Listen);

        let receive = tokio::spawn(receive_loop(
            socket.clone(),
            events_tx,
            stop_rx,
            config.poll_interval,
        ));
        let protocol = tokio::spawn(
            ServerLoop {
                conn,
                socket,
                signals,
                events: events_rx,
                commands: commands_rx,
                stop: stop_tx,
                reassembler: Reassembler::new(),
                pending: None,
                peer_closed: false,
            }
            .run(),
        );
        log::info!("server listening on {local_addr} (capacity {receive_buffer_size} bytes)");

        Ok(Self {
            local_addr,
            commands: commands_tx,
            signals: waiter,
            tasks: Some(Tasks { receive, protocol }),
            linger: config.linger,
            receive_deadline: config.receive_deadline,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.signals.snapshot().state
    }

    /// Wait for a client to complete the handshake.
    pub async fn accept(&mut self) -> Result<ConnectionHandle> {
        let board = self.signals.wait(Signal::ConnectionEstablished).await?;
        let peer = board.peer.ok_or(MrtError::BadState(board.state))?;
        log::info!("server {}: accepted {peer}", self.local_addr);
        Ok(ConnectionHandle { peer })
    }

    /// Read exactly `length` bytes, or fewer if the peer closes first.
    ///
    /// With [`Config::receive_deadline`] set, a read that overruns it returns
    /// what is buffered instead of waiting further.
    pub async fn receive(&mut self, conn: &ConnectionHandle, length: usize) -> Result<Vec<u8>> {
        let deadline = self.receive_deadline.map(|d| Instant::now() + d);
        self.read(conn, length, deadline).await.map(|d| d.data)
    }

    /// Read `length` bytes, giving up after `within` with whatever arrived.
    pub async fn receive_within(
        &mut self,
        conn: &ConnectionHandle,
        length: usize,
        within: Duration,
    ) -> Result<Delivery> {
        self.read(conn, length, Some(Instant::now() + within)).await
    }

    async fn read(
        &mut self,
        conn: &ConnectionHandle,
        length: usize,
        deadline: Option<Instant>,
    ) -> Result<Delivery> {
        let board = self.signals.snapshot();
        if board.peer != Some(conn.peer) {
            return Err(MrtError::UnknownConnection(conn.peer));
        }
        let (reply, delivered) = oneshot::channel();
        self.commands
            .send(Command::Receive(ReadRequest {
                length,
                deadline,
                reply,
            }))
            .await
            .map_err(|_| self.terminated())?;
        delivered.await.map_err(|_| self.terminated())
    }

    /// Wait for the client's FIN, linger to answer retransmitted FINs, then
    /// stop both tasks.  Returns at once if no client ever connected.
    pub async fn close(&mut self) -> Result<()> {
        let Some(tasks) = self.tasks.take() else {
            return Ok(());
        };
        let outcome = if self.signals.snapshot().state == ConnectionState::Listen {
            Ok(())
        } else {
            match self.signals.wait(Signal::ConnectionClosing).await {
                Ok(_) => {
                    tokio::time::sleep(self.linger).await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        let _ = self.commands.send(Command::Shutdown).await;
        tasks.join().await;
        log::info!("server {}: closed", self.local_addr);
        outcome
    }

    fn terminated(&self) -> MrtError {
        self.signals
            .snapshot()
            .fault
            .unwrap_or(MrtError::LoopTerminated)
    }
}

// ---------------------------------------------------------------------------
// Protocol loop
// ---------------------------------------------------------------------------

struct ServerLoop {
    conn: Connection,
    socket: Arc<Socket>,
    signals: Signals,
    events: mpsc::Receiver<Event>,
    commands: mpsc::Receiver<Command>,
    stop: watch::Sender<bool>,
    reassembler: Reassembler,
    pending: Option<ReadRequest>,
    peer_closed: bool,
}

impl ServerLoop {
    async fn run(mut self) {
        if let Err(e) = self.drive().await {
            log::error!("server {}: {e}", self.conn.local);
            self.signals.fail(e);
        }
        let _ = self.stop.send(true);
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let read_deadline = self.pending.as_ref().and_then(|r| r.deadline);
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(Event::Segment(inbound)) => self.on_segment(inbound).await?,
                    Some(Event::Fault(e)) => return Err(e),
                    None => return Err(MrtError::LoopTerminated),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Receive(request)) => self.pending = Some(request),
                    Some(Command::Shutdown) | None => return Ok(()),
                },
                _ = self.conn.timer.expired() => self.on_timeout().await?,
                // Checked below by `fulfil`.
                _ = timer::until(read_deadline) => {}
            }
            self.fulfil();
        }
    }

    fn enter(&mut self, state: ConnectionState) {
        self.conn.transition(state);
        self.signals.set_state(state);
    }

    /// Answer the pending read if it can be answered now.
    fn fulfil(&mut self) {
        let Some(request) = self.pending.take() else {
            return;
        };
        // Buffered bytes stay put for the next reader.
        if request.reply.is_closed() {
            log::debug!("server {}: reader went away", self.conn.local);
            return;
        }
        let expired = request.deadline.is_some_and(|d| Instant::now() >= d);
        if self.reassembler.buffered() < request.length && !self.peer_closed && !expired {
            self.pending = Some(request);
            return;
        }
        let data = self.reassembler.take(request.length);
        let truncated = data.len() < request.length;
        if truncated {
            log::warn!(
                "server {}: delivering {} of {} requested bytes ({})",
                self.conn.local,
                data.len(),
                request.length,
                if self.peer_closed { "peer closed" } else { "deadline passed" }
            );
        }
        if let Err(Delivery { data, .. }) = request.reply.send(Delivery { data, truncated }) {
            log::debug!("server {}: reader went away, keeping {} bytes", self.conn.local, data.len());
            self.reassembler.restore(data);
        }
    }

    async fn on_segment(&mut self, inbound: Inbound) -> Result<()> {
        let Inbound { segment, from } = inbound;
        if self.conn.state() == ConnectionState::Listen {
            return self.on_listen(&segment, from).await;
        }
        if !self.conn.is_peer(from) {
            log::debug!("server {}: ignoring segment from {from}", self.conn.local);
            return Ok(());
        }
        match self.conn.state() {
            ConnectionState::SynReceived => self.on_handshake_ack(&segment).await,
            ConnectionState::Established => self.on_established(&segment).await,
            ConnectionState::Closed => self.on_lingering(&segment).await,
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    async fn on_listen(&mut self, segment: &Decoded, from: SocketAddr) -> Result<()> {
        if segment.corrupt || segment.kind() != SegmentKind::Syn {
            log::debug!("server {}: ignoring {} from {from} while listening", self.conn.local, segment.kind());
            return Ok(());
        }
        self.conn.set_remote(from);
        self.signals.set_peer(from);
        self.conn.on_peer_control(&segment.header);
        self.conn.begin_phase(Phase::Handshake);
        self.enter(ConnectionState::SynReceived);
        let capacity = capacity_payload(self.conn.local_capacity);
        self.conn
            .send_control(&self.socket, flags::SYN | flags::ACK, &capacity)
            .await
    }

    async fn on_handshake_ack(&mut self, segment: &Decoded) -> Result<()> {
        match (segment.corrupt, segment.kind()) {
            (false, SegmentKind::Ack(_)) => {
                self.conn.clear_control();
                self.enter(ConnectionState::Established);
                self.conn.send_notice(&self.socket, 0, READY).await?;
                log::info!("server {}: connection established", self.conn.local);
                self.signals.raise(Signal::ConnectionEstablished);
                self.signals.raise(Signal::DataPhaseReady);
                Ok(())
            }
            (false, SegmentKind::Syn) => self.conn.repeat_control(&self.socket).await,
            (corrupt, kind) => {
                let cause = if corrupt {
                    MrtError::CorruptSegment
                } else {
                    MrtError::UnexpectedSegment(kind)
                };
                self.conn.resend_control(&self.socket, &cause).await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Data phase
    // -----------------------------------------------------------------------

    async fn on_established(&mut self, segment: &Decoded) -> Result<()> {
        if segment.corrupt {
            return self.acknowledge(segment).await;
        }
        match segment.kind() {
            SegmentKind::Data(_) => self.acknowledge(segment).await,
            // Client missed `ready` and resent its ACK.
            SegmentKind::Ack(_) => self.conn.repeat_control(&self.socket).await,
            SegmentKind::Fin => {
                self.conn.on_peer_control(&segment.header);
                self.conn
                    .send_notice(&self.socket, flags::FIN | flags::ACK, &[])
                    .await?;
                self.peer_closed = true;
                self.enter(ConnectionState::Closed);
                log::info!(
                    "server {}: peer closed after {} segments",
                    self.conn.local,
                    self.reassembler.accepted()
                );
                self.signals.raise(Signal::ConnectionClosing);
                Ok(())
            }
            kind => {
                log::debug!("server {}: ignoring stray {kind}", self.conn.local);
                Ok(())
            }
        }
    }

    /// Feed one data segment to the reassembler and send the cumulative ack.
    async fn acknowledge(&mut self, segment: &Decoded) -> Result<()> {
        let index = segment.header.packet_index;
        let verdict = self
            .reassembler
            .on_segment(index, &segment.payload, segment.corrupt);
        match &verdict {
            Verdict::Accepted { .. } => {
                log::trace!("server {}: accepted pkt{index}", self.conn.local);
            }
            Verdict::Rejected { ack, cause } => {
                log::debug!("server {}: discarding pkt{index}: {cause}; re-acking {ack}", self.conn.local);
            }
        }
        let header = self.conn.data_header(verdict.ack(), flags::ACK);
        self.socket
            .send_segment(&header, &[], self.conn.remote()?)
            .await
    }

    // -----------------------------------------------------------------------
    // After close
    // -----------------------------------------------------------------------

    async fn on_lingering(&mut self, segment: &Decoded) -> Result<()> {
        if !segment.corrupt && segment.kind() == SegmentKind::Fin {
            self.conn.repeat_control(&self.socket).await?;
        }
        Ok(())
    }

    async fn on_timeout(&mut self) -> Result<()> {
        if self.conn.state() == ConnectionState::SynReceived {
            let cause = MrtError::Timeout(self.conn.timer.timeout());
            self.conn.resend_control(&self.socket, &cause).await
        } else {
            self.conn.timer.disarm();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Header;

    fn quick() -> Config {
        Config::with_timeout(Duration::from_millis(200)).retries(3)
    }

    async fn raw_client() -> Socket {
        Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    async fn next(sock: &Socket) -> Decoded {
        sock.recv_segment(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("segment")
            .segment
    }

    /// Drive a raw socket through the handshake.
    async fn handshake(server: &Server, client: &Socket) {
        let to = server.local_addr();
        client
            .send_segment(&Header::new(0, 0, 0, flags::SYN), b"", to)
            .await
            .unwrap();
        let syn_ack = next(client).await;
        assert_eq!(syn_ack.kind(), SegmentKind::SynAck);
        assert_eq!(crate::segment::parse_capacity(&syn_ack.payload), Some(1000));
        client
            .send_segment(&Header::new(1, 1, 0, flags::ACK), b"", to)
            .await
            .unwrap();
        let ready = next(client).await;
        assert_eq!(ready.payload, READY);
    }

    #[tokio::test]
    async fn close_without_client_returns() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), 1000, quick())
            .await
            .unwrap();
        assert_eq!(server.state(), ConnectionState::Listen);
        tokio::time::timeout(Duration::from_secs(2), server.close())
            .await
            .expect("close hung")
            .unwrap();
    }

    #[tokio::test]
    async fn out_of_order_segment_is_reacked() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), 1000, quick())
            .await
            .unwrap();
        let client = raw_client().await;
        handshake(&server, &client).await;
        let conn = server.accept().await.unwrap();
        assert_eq!(conn.peer(), client.local_addr);

        let to = server.local_addr();
        client
            .send_segment(&Header::new(1, 1, 1, 0), b"later", to)
            .await
            .unwrap();
        assert_eq!(next(&client).await.kind(), SegmentKind::Ack(u16::MAX));

        client
            .send_segment(&Header::new(1, 1, 0, 0), b"first", to)
            .await
            .unwrap();
        assert_eq!(next(&client).await.kind(), SegmentKind::Ack(0));
        assert_eq!(server.receive(&conn, 5).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn fin_short_circuits_pending_read() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), 1000, quick())
            .await
            .unwrap();
        let client = raw_client().await;
        handshake(&server, &client).await;
        let conn = server.accept().await.unwrap();
        let to = server.local_addr();

        client
            .send_segment(&Header::new(1, 1, 0, 0), b"abc", to)
            .await
            .unwrap();
        assert_eq!(next(&client).await.kind(), SegmentKind::Ack(0));
        client
            .send_segment(&Header::new(1, 1, 0, flags::FIN), b"", to)
            .await
            .unwrap();
        assert_eq!(next(&client).await.kind(), SegmentKind::FinAck);

        let delivered = server
            .receive_within(&conn, 100, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(delivered.data, b"abc");
        assert!(delivered.truncated);

        // A retransmitted FIN is answered while lingering.
        client
            .send_segment(&Header::new(1, 1, 0, flags::FIN), b"", to)
            .await
            .unwrap();
        assert_eq!(next(&client).await.kind(), SegmentKind::FinAck);
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn deadline_returns_partial_data() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), 1000, quick())
            .await
            .unwrap();
        let client = raw_client().await;
        handshake(&server, &client).await;
        let conn = server.accept().await.unwrap();

        client
            .send_segment(&Header::new(1, 1, 0, 0), b"part", server.local_addr())
            .await
            .unwrap();
        let delivered = server
            .receive_within(&conn, 10, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(delivered.data, b"part");
        assert!(delivered.truncated);
    }

    #[tokio::test]
    async fn receive_rejects_unknown_handle() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), 1000, quick())
            .await
            .unwrap();
        let stranger = ConnectionHandle {
            peer: "127.0.0.1:9".parse().unwrap(),
        };
        assert_eq!(
            server.receive(&stranger, 1).await.unwrap_err(),
            MrtError::UnknownConnection(stranger.peer)
        );
    }

    #[tokio::test]
    async fn corrupt_handshake_ack_resends_syn_ack() {
        let cfg = Config::with_timeout(Duration::from_secs(5)).retries(3);
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), 1000, cfg)
            .await
            .unwrap();
        let client = raw_client().await;
        let to = server.local_addr();
        client
            .send_segment(&Header::new(0, 0, 0, flags::SYN), b"", to)
            .await
            .unwrap();
        assert_eq!(next(&client).await.kind(), SegmentKind::SynAck);

        let ack = Header::new(1, 1, 0, flags::ACK);
        client.send_damaged(&ack, b"", to).await.unwrap();
        let again = client
            .recv_segment(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("SYN+ACK resent");
        assert_eq!(again.segment.kind(), SegmentKind::SynAck);
        assert_eq!(server.state(), ConnectionState::SynReceived);

        client.send_segment(&ack, b"", to).await.unwrap();
        assert_eq!(next(&client).await.payload, READY);
        let conn = server.accept().await.unwrap();
        assert_eq!(conn.peer(), client.local_addr);
    }

    #[tokio::test]
    async fn abandoned_read_keeps_buffered_bytes() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), 1000, quick())
            .await
            .unwrap();
        let client = raw_client().await;
        handshake(&server, &client).await;
        let conn = server.accept().await.unwrap();

        let gave_up = tokio::time::timeout(Duration::from_millis(50), server.receive(&conn, 5)).await;
        assert!(gave_up.is_err());

        client
            .send_segment(&Header::new(1, 1, 0, 0), b"hello", server.local_addr())
            .await
            .unwrap();
        assert_eq!(next(&client).await.kind(), SegmentKind::Ack(0));

        let delivered = server
            .receive_within(&conn, 5, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(delivered.data, b"hello");
        assert!(!delivered.truncated);
    }

    #[tokio::test]
    async fn silent_client_fails_handshake() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), 1000, quick())
            .await
            .unwrap();
        let client = raw_client().await;
        client
            .send_segment(&Header::new(0, 0, 0, flags::SYN), b"", server.local_addr())
            .await
            .unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .expect("accept hung")
            .unwrap_err();
        assert_eq!(
            err,
            MrtError::ConnectionFailure {
                phase: Phase::Handshake,
                attempts: 3
            }
        );
    }
}
