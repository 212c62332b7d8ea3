//! Client endpoint: active open, windowed sends, and the FIN exchange.
//!
//! # Architecture
//!
//! ```text
//!  Application                       protocol loop task
//!      │  connect / send / close     ┌───────────────────────────────┐
//!      │ ──── Command (mpsc) ──────▶ │ Connection + WindowSender     │
//!      │                             │   select! { events,           │
//!      │ ◀──── Signals (watch) ───── │             commands,         │
//!      ▼                             │             timer }           │
//!  Client handle                     └───────────────────────────────┘
//! ```
//!
//! Each `send` becomes one [`WindowSender`].  Payloads submitted while a
//! transfer is in flight are queued and started in order; packet indices
//! continue from one transfer to the next.  A `close` issued while data is
//! still queued sends FIN only after the last transfer is acknowledged.
//!
//! ```ignore
//! let mut client = Client::init(0, "localhost", 60000, 1000).await?;
//! client.connect().await?;
//! client.send(b"hello").await?;
//! client.close().await?;
//! ```

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::lookup_host;
use tokio::sync::{mpsc, watch};

use crate::config::{validate_mss, Config};
use crate::connection::Connection;
use crate::error::{MrtError, Phase, Result};
use crate::harness::{receive_loop, Event, Signal, SignalWaiter, Signals, Tasks};
use crate::segment::{flags, parse_capacity, Decoded, SegmentKind, READY};
use crate::sender::{AckOutcome, WindowSender};
use crate::socket::{Inbound, Socket};
use crate::state::{ConnectionState, Role};

// ---------------------------------------------------------------------------
// Client handle
// ---------------------------------------------------------------------------

/// Application-facing client.
///
/// Dropping the handle without calling [`Client::close`] stops both tasks
/// without a FIN exchange.
#[derive(Debug)]
pub struct Client {
    local_addr: SocketAddr,
    remote: SocketAddr,
    commands: mpsc::Sender<Command>,
    signals: SignalWaiter,
    tasks: Option<Tasks>,
    /// `send` calls handed to the loop so far.
    transfers_issued: u64,
    close_requested: bool,
}

#[derive(Debug)]
enum Command {
    Connect,
    Send(Vec<u8>),
    Close,
}

impl Client {
    /// Bind `local_port` on the loopback interface and target
    /// `remote_addr:remote_port`.  `mss` is the largest segment, header
    /// included, this client will put on the wire.
    pub async fn init(local_port: u16, remote_addr: &str, remote_port: u16, mss: usize) -> Result<Self> {
        let remote = lookup_host((remote_addr, remote_port))
            .await?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| MrtError::InvalidConfig(format!("cannot resolve {remote_addr}")))?;
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        Self::bind(local, remote, mss, Config::default()).await
    }

    /// Bind `local` and spawn the receive and protocol loops.
    pub async fn bind(local: SocketAddr, remote: SocketAddr, mss: usize, config: Config) -> Result<Self> {
        validate_mss(mss)?;
        config.validate()?;

        let socket = Arc::new(Socket::bind(local).await?);
        let local_addr = socket.local_addr;
        let (events_tx, events_rx) = mpsc::channel(config.queue_capacity);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (signals, waiter) = Signals::new();

        let receive = tokio::spawn(receive_loop(
            socket.clone(),
            events_tx,
            stop_rx,
            config.poll_interval,
        ));
        let protocol = tokio::spawn(
            ClientLoop {
                conn: Connection::new(Role::Client, local_addr, Some(remote), mss, 0, &config),
                socket,
                signals,
                events: events_rx,
                commands: commands_rx,
                stop: stop_tx,
                data_ready: false,
                transfer: None,
                queued: VecDeque::new(),
                next_index: 0,
                close_requested: false,
                done: false,
            }
            .run(),
        );
        log::info!("client bound on {local_addr} for {remote} (mss {mss})");

        Ok(Self {
            local_addr,
            remote,
            commands: commands_tx,
            signals: waiter,
            tasks: Some(Tasks { receive, protocol }),
            transfers_issued: 0,
            close_requested: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.signals.snapshot().state
    }

    /// Three-way handshake.  Returns once the server's SYN+ACK is answered;
    /// [`Client::send`] then waits for the server's `ready`.
    pub async fn connect(&mut self) -> Result<()> {
        let board = self.signals.snapshot();
        if let Some(fault) = board.fault {
            return Err(fault);
        }
        if board.established {
            return Ok(());
        }
        if self.close_requested || board.state != ConnectionState::Closed {
            return Err(MrtError::BadState(board.state));
        }
        self.command(Command::Connect).await?;
        self.signals.wait(Signal::ConnectionEstablished).await?;
        Ok(())
    }

    /// Reliably deliver `data`; returns once every segment is acknowledged.
    ///
    /// Blocks until the server has signalled that the data phase is open.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let board = self.signals.snapshot();
        if let Some(fault) = board.fault {
            return Err(fault);
        }
        if !board.established || board.closing || self.close_requested {
            return Err(MrtError::BadState(board.state));
        }
        if data.is_empty() {
            return Ok(0);
        }
        if !board.data_ready {
            self.signals.wait(Signal::DataPhaseReady).await?;
        }
        self.command(Command::Send(data.to_vec())).await?;
        self.transfers_issued += 1;
        self.signals.wait_transfers(self.transfers_issued).await?;
        Ok(data.len())
    }

    /// FIN exchange, then stop both tasks.  A second call is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        let Some(tasks) = self.tasks.take() else {
            return Ok(());
        };
        self.close_requested = true;
        let outcome = match self.command(Command::Close).await {
            Ok(()) => self.signals.wait(Signal::ConnectionClosing).await.map(|_| ()),
            Err(e) => Err(e),
        };
        tasks.join().await;
        outcome
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| {
            self.signals
                .snapshot()
                .fault
                .unwrap_or(MrtError::LoopTerminated)
        })
    }
}

// ---------------------------------------------------------------------------
// Protocol loop
// ---------------------------------------------------------------------------

struct ClientLoop {
    conn: Connection,
    socket: Arc<Socket>,
    signals: Signals,
    events: mpsc::Receiver<Event>,
    commands: mpsc::Receiver<Command>,
    stop: watch::Sender<bool>,
    /// Server's `ready` seen; data may flow.
    data_ready: bool,
    transfer: Option<WindowSender>,
    queued: VecDeque<Vec<u8>>,
    /// Connection-global index of the next transfer's first segment.
    next_index: u64,
    close_requested: bool,
    done: bool,
}

impl ClientLoop {
    async fn run(mut self) {
        if let Err(e) = self.drive().await {
            log::error!("client {}: {e}", self.conn.local);
            self.signals.fail(e);
        }
        let _ = self.stop.send(true);
    }

    async fn drive(&mut self) -> Result<()> {
        while !self.done {
            tokio::select! {
                // ── inbound segment ──────────────────────────────────────────
                event = self.events.recv() => match event {
                    Some(Event::Segment(inbound)) => self.on_segment(inbound).await?,
                    Some(Event::Fault(e)) => return Err(e),
                    None => return Err(MrtError::LoopTerminated),
                },

                // ── application request ──────────────────────────────────────
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await?,
                    None => {
                        log::debug!("client {}: handle dropped", self.conn.local);
                        return Ok(());
                    }
                },

                // ── retransmit timeout ───────────────────────────────────────
                _ = self.conn.timer.expired() => self.on_timeout().await?,
            }
            self.pump().await?;
        }
        Ok(())
    }

    fn enter(&mut self, state: ConnectionState) {
        self.conn.transition(state);
        self.signals.set_state(state);
    }

    async fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Connect => {
                if self.conn.state() != ConnectionState::Closed {
                    return Ok(());
                }
                self.conn.begin_phase(Phase::Handshake);
                self.enter(ConnectionState::SynSent);
                self.conn.send_control(&self.socket, flags::SYN, &[]).await?;
            }
            Command::Send(payload) => {
                self.queued.push_back(payload);
                self.start_next_transfer();
            }
            Command::Close => {
                self.close_requested = true;
                match self.conn.state() {
                    ConnectionState::Established => self.maybe_teardown().await?,
                    ConnectionState::FinWait => {}
                    state => {
                        log::debug!("client {}: close while {state}, nothing to tear down", self.conn.local);
                        self.conn.timer.disarm();
                        self.signals.raise(Signal::ConnectionClosing);
                        self.done = true;
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_segment(&mut self, inbound: Inbound) -> Result<()> {
        if !self.conn.is_peer(inbound.from) {
            log::debug!("client {}: ignoring segment from {}", self.conn.local, inbound.from);
            return Ok(());
        }
        let segment = inbound.segment;
        match self.conn.state() {
            ConnectionState::SynSent => self.on_handshake_reply(&segment).await,
            ConnectionState::Established if !self.data_ready => self.on_ready_reply(&segment).await,
            ConnectionState::Established => self.on_data_reply(&segment).await,
            ConnectionState::FinWait => self.on_teardown_reply(&segment).await,
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    async fn on_handshake_reply(&mut self, segment: &Decoded) -> Result<()> {
        let capacity = parse_capacity(&segment.payload);
        match (segment.corrupt, segment.kind(), capacity) {
            (false, SegmentKind::SynAck, Some(capacity)) => {
                self.conn.peer_capacity = capacity;
                self.conn.on_peer_control(&segment.header);
                self.conn.clear_control();
                self.enter(ConnectionState::Established);
                self.conn.send_control(&self.socket, flags::ACK, &[]).await?;
                log::info!(
                    "client {}: connected (peer capacity {capacity} bytes)",
                    self.conn.local
                );
                self.signals.raise(Signal::ConnectionEstablished);
                Ok(())
            }
            _ => self.conn.resend_control(&self.socket, &bad_reply(segment)).await,
        }
    }

    /// Handshake ACK sent; waiting for the server's `ready`.
    async fn on_ready_reply(&mut self, segment: &Decoded) -> Result<()> {
        match (segment.corrupt, segment.kind()) {
            (false, SegmentKind::Data(_)) if segment.payload == READY => {
                self.conn.clear_control();
                self.data_ready = true;
                log::debug!("client {}: server ready for data", self.conn.local);
                self.signals.raise(Signal::DataPhaseReady);
                self.start_next_transfer();
                self.maybe_teardown().await
            }
            // Server never saw our ACK and retransmitted.
            (false, SegmentKind::SynAck) => self.conn.repeat_control(&self.socket).await,
            _ => self.conn.resend_control(&self.socket, &bad_reply(segment)).await,
        }
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    fn start_next_transfer(&mut self) {
        if !self.data_ready || self.transfer.is_some() {
            return;
        }
        while let Some(payload) = self.queued.pop_front() {
            let tx = WindowSender::new(
                &payload,
                self.conn.payload_size(),
                self.next_index,
                self.conn.peer_capacity,
                self.conn.mss,
            );
            if tx.is_complete() {
                self.signals.raise(Signal::TransferComplete);
                continue;
            }
            log::info!(
                "client {}: sending {} bytes in {} segments (window {})",
                self.conn.local,
                tx.byte_len(),
                tx.segment_count(),
                tx.window_size()
            );
            self.conn.begin_phase(Phase::Transfer);
            self.conn.timer.arm();
            self.transfer = Some(tx);
            return;
        }
    }

    /// Push every sendable segment, draining inbound events between
    /// segments so a gap signal cuts the burst short.
    async fn pump(&mut self) -> Result<()> {
        while self.data_ready && self.conn.state() == ConnectionState::Established {
            let Some(tx) = self.transfer.as_mut() else {
                break;
            };
            let Some((index, chunk)) = tx.next_segment() else {
                break;
            };
            let header = self.conn.data_header(index, 0);
            self.socket
                .send_segment(&header, chunk, self.conn.remote()?)
                .await?;
            if !self.conn.timer.is_armed() {
                self.conn.timer.arm();
            }
            while let Ok(event) = self.events.try_recv() {
                match event {
                    Event::Segment(inbound) => self.on_segment(inbound).await?,
                    Event::Fault(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn on_data_reply(&mut self, segment: &Decoded) -> Result<()> {
        if segment.corrupt {
            log::debug!("client {}: ignoring corrupt ack", self.conn.local);
            return Ok(());
        }
        match segment.kind() {
            SegmentKind::Ack(index) => self.on_data_ack(index).await,
            kind => {
                log::trace!("client {}: ignoring stray {kind}", self.conn.local);
                Ok(())
            }
        }
    }

    async fn on_data_ack(&mut self, index: u16) -> Result<()> {
        let Some(tx) = self.transfer.as_mut() else {
            return Ok(());
        };
        match tx.on_ack(index) {
            AckOutcome::Advanced(slid) => {
                log::trace!("client {}: ack{index} slid window by {slid}", self.conn.local);
                self.conn.budget_mut().reset();
                if tx.is_complete() {
                    self.finish_transfer().await?;
                } else {
                    self.conn.timer.arm();
                }
            }
            AckOutcome::Rewind { resume } => {
                log::debug!(
                    "client {}: receiver missing pkt{resume}, going back",
                    self.conn.local
                );
            }
            AckOutcome::DuplicateGap | AckOutcome::Stale => {}
        }
        Ok(())
    }

    async fn finish_transfer(&mut self) -> Result<()> {
        if let Some(tx) = self.transfer.take() {
            self.next_index = tx.end_index();
            log::info!(
                "client {}: {} bytes acknowledged",
                self.conn.local,
                tx.byte_len()
            );
        }
        self.conn.timer.disarm();
        self.signals.raise(Signal::TransferComplete);
        self.start_next_transfer();
        self.maybe_teardown().await
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Send FIN once a close is pending and the data phase has drained.
    async fn maybe_teardown(&mut self) -> Result<()> {
        if !self.close_requested
            || !self.data_ready
            || self.transfer.is_some()
            || !self.queued.is_empty()
            || self.conn.state() != ConnectionState::Established
        {
            return Ok(());
        }
        self.conn.begin_phase(Phase::Teardown);
        self.enter(ConnectionState::FinWait);
        self.conn.send_control(&self.socket, flags::FIN, &[]).await
    }

    async fn on_teardown_reply(&mut self, segment: &Decoded) -> Result<()> {
        match (segment.corrupt, segment.kind()) {
            (false, SegmentKind::FinAck) => {
                self.conn.on_peer_control(&segment.header);
                self.conn.clear_control();
                self.enter(ConnectionState::Closed);
                log::info!("client {}: connection closed", self.conn.local);
                self.signals.raise(Signal::ConnectionClosing);
                self.done = true;
                Ok(())
            }
            // Late data ack still in the network.
            (false, SegmentKind::Ack(_)) => Ok(()),
            _ => self.conn.resend_control(&self.socket, &bad_reply(segment)).await,
        }
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    async fn on_timeout(&mut self) -> Result<()> {
        let cause = MrtError::Timeout(self.conn.timer.timeout());
        match self.conn.state() {
            ConnectionState::SynSent | ConnectionState::FinWait => {
                self.conn.resend_control(&self.socket, &cause).await
            }
            ConnectionState::Established if !self.data_ready => {
                self.conn.resend_control(&self.socket, &cause).await
            }
            ConnectionState::Established => {
                let Some(tx) = self.transfer.as_mut() else {
                    self.conn.timer.disarm();
                    return Ok(());
                };
                let left = self.conn.budget_mut().consume()?;
                log::warn!(
                    "client {}: {cause}; resending {} segments from offset {} ({left} attempts left)",
                    self.conn.local,
                    tx.in_flight(),
                    tx.base()
                );
                tx.on_timeout();
                self.conn.timer.arm();
                Ok(())
            }
            _ => {
                self.conn.timer.disarm();
                Ok(())
            }
        }
    }
}

/// Cause to log when a reply is not the one the state expects.
fn bad_reply(segment: &Decoded) -> MrtError {
    if segment.corrupt {
        MrtError::CorruptSegment
    } else {
        MrtError::UnexpectedSegment(segment.kind())
    }
}
