//! Task plumbing shared by the client and server endpoints.
//!
//! ```text
//!   UDP socket ──▶ receive_loop ──mpsc<Event>──▶ protocol loop ──▶ UDP socket
//!                      ▲                              │
//!                      └──────── stop (watch) ────────┤
//!                                                     ▼
//!                                   Signals (watch<Board>) ──▶ application handles
//! ```
//!
//! The receive loop is the only reader of the socket.  The protocol loop is
//! the only writer and the only mutator of connection state; application
//! handles observe it exclusively through [`SignalWaiter`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{MrtError, Result};
use crate::socket::{Inbound, Socket};
use crate::state::ConnectionState;

/// Item handed from the receive loop to the protocol loop.
#[derive(Debug)]
pub(crate) enum Event {
    Segment(Inbound),
    /// Socket fault; the receive loop has already stopped.
    Fault(MrtError),
}

/// Named condition signals raised by a protocol loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ConnectionEstablished,
    DataPhaseReady,
    /// Latched once per completed `send`; see [`SignalWaiter::wait_transfers`].
    TransferComplete,
    ConnectionClosing,
}

/// Everything a handle may observe about its endpoint.
#[derive(Debug, Clone, Default)]
pub struct Board {
    pub state: ConnectionState,
    pub peer: Option<SocketAddr>,
    pub established: bool,
    pub data_ready: bool,
    pub transfers_completed: u64,
    pub closing: bool,
    pub fault: Option<MrtError>,
}

impl Board {
    pub fn is_raised(&self, signal: Signal) -> bool {
        match signal {
            Signal::ConnectionEstablished => self.established,
            Signal::DataPhaseReady => self.data_ready,
            Signal::TransferComplete => self.transfers_completed > 0,
            Signal::ConnectionClosing => self.closing,
        }
    }
}

/// Raising side, owned by the protocol loop.
#[derive(Debug)]
pub(crate) struct Signals {
    tx: watch::Sender<Board>,
}

impl Signals {
    pub fn new() -> (Self, SignalWaiter) {
        let (tx, rx) = watch::channel(Board::default());
        (Self { tx }, SignalWaiter { rx })
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.tx.send_modify(|b| b.state = state);
    }

    pub fn set_peer(&self, peer: SocketAddr) {
        self.tx.send_modify(|b| b.peer = Some(peer));
    }

    pub fn raise(&self, signal: Signal) {
        log::debug!("signal raised: {signal:?}");
        self.tx.send_modify(|b| match signal {
            Signal::ConnectionEstablished => b.established = true,
            Signal::DataPhaseReady => b.data_ready = true,
            Signal::TransferComplete => b.transfers_completed += 1,
            Signal::ConnectionClosing => b.closing = true,
        });
    }

    /// Publish a fatal error; the first one wins.
    pub fn fail(&self, err: MrtError) {
        self.tx.send_modify(|b| {
            if b.fault.is_none() {
                b.fault = Some(err);
            }
        });
    }
}

/// Waiting side, held by application handles.
#[derive(Debug, Clone)]
pub struct SignalWaiter {
    rx: watch::Receiver<Board>,
}

impl SignalWaiter {
    pub fn snapshot(&self) -> Board {
        self.rx.borrow().clone()
    }

    /// Block until `signal` is raised or the endpoint fails.
    pub async fn wait(&mut self, signal: Signal) -> Result<Board> {
        self.wait_until(|b| b.is_raised(signal)).await
    }

    /// Block until at least `count` transfers have completed.
    pub async fn wait_transfers(&mut self, count: u64) -> Result<Board> {
        self.wait_until(|b| b.transfers_completed >= count).await
    }

    async fn wait_until(&mut self, mut ready: impl FnMut(&Board) -> bool) -> Result<Board> {
        let board = self
            .rx
            .wait_for(|b| ready(b) || b.fault.is_some())
            .await
            .map(|b| Board::clone(&b));
        match board {
            Ok(b) if ready(&b) => Ok(b),
            Ok(b) => Err(b.fault.unwrap_or(MrtError::LoopTerminated)),
            // Loop gone without raising: report its fault if it left one.
            Err(_) => Err(self.rx.borrow().fault.clone().unwrap_or(MrtError::LoopTerminated)),
        }
    }
}

/// Exclusive reader of the socket.
///
/// Waits at most `poll` for each datagram so the stop signal is honoured
/// promptly; a socket error is forwarded as [`Event::Fault`] and ends the
/// loop.
pub(crate) async fn receive_loop(
    socket: Arc<Socket>,
    events: mpsc::Sender<Event>,
    mut stop: watch::Receiver<bool>,
    poll: Duration,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            received = socket.recv_segment(poll) => match received {
                Ok(Some(inbound)) => {
                    if events.send(Event::Segment(inbound)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    if events.is_closed() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("receive loop on {}: {e}", socket.local_addr);
                    let _ = events.send(Event::Fault(e)).await;
                    break;
                }
            }
        }
    }
    log::debug!("receive loop on {} stopped", socket.local_addr);
}

/// Join handles of one endpoint's two tasks.
#[derive(Debug)]
pub(crate) struct Tasks {
    pub receive: JoinHandle<()>,
    pub protocol: JoinHandle<()>,
}

impl Tasks {
    pub async fn join(self) {
        if let Err(e) = self.protocol.await {
            log::error!("protocol loop panicked: {e}");
        }
        if let Err(e) = self.receive.await {
            log::error!("receive loop panicked: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_once_raised() {
        let (signals, mut waiter) = Signals::new();
        let task = tokio::spawn(async move {
            waiter.wait(Signal::ConnectionEstablished).await
        });
        signals.set_state(ConnectionState::Established);
        signals.raise(Signal::ConnectionEstablished);
        let board = task.await.unwrap().unwrap();
        assert_eq!(board.state, ConnectionState::Established);
    }

    #[tokio::test]
    async fn fault_releases_waiters() {
        let (signals, mut waiter) = Signals::new();
        let task = tokio::spawn(async move { waiter.wait(Signal::DataPhaseReady).await });
        signals.fail(MrtError::TransferFailure { attempts: 2 });
        assert_eq!(
            task.await.unwrap().unwrap_err(),
            MrtError::TransferFailure { attempts: 2 }
        );
    }

    #[tokio::test]
    async fn dropped_loop_releases_waiters() {
        let (signals, mut waiter) = Signals::new();
        drop(signals);
        assert_eq!(
            waiter.wait(Signal::ConnectionClosing).await.unwrap_err(),
            MrtError::LoopTerminated
        );
    }

    #[tokio::test]
    async fn transfer_count_is_cumulative() {
        let (signals, mut waiter) = Signals::new();
        signals.raise(Signal::TransferComplete);
        signals.raise(Signal::TransferComplete);
        let board = waiter.wait_transfers(2).await.unwrap();
        assert_eq!(board.transfers_completed, 2);
    }

    #[tokio::test]
    async fn receive_loop_forwards_and_stops() {
        use crate::segment::{flags, Header};

        let socket = Arc::new(Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let peer = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(receive_loop(
            socket.clone(),
            tx,
            stop_rx,
            Duration::from_millis(10),
        ));

        peer.send_segment(&Header::new(0, 0, 0, flags::SYN), b"", socket.local_addr)
            .await
            .unwrap();
        match rx.recv().await {
            Some(Event::Segment(inbound)) => assert_eq!(inbound.from, peer.local_addr),
            other => panic!("unexpected event {other:?}"),
        }

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("receive loop did not stop")
            .unwrap();
    }
}
