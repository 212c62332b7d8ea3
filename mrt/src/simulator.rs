//! Fault-injecting UDP relay for tests and demos.
//!
//! Real networks drop, reorder, duplicate, and corrupt datagrams.  To
//! exercise the reliability mechanisms without depending on actual network
//! conditions, a [`LossyLink`] sits between a client and a server:
//!
//! ```text
//!  client ──▶ LossyLink ──(faults)──▶ server
//!  client ◀── LossyLink ◀──────────── server
//! ```
//!
//! | Fault            | Description                                          |
//! |------------------|------------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.        |
//! | Reordering       | Delay a datagram by `reorder_delay`, letting later   |
//! |                  | ones overtake it.                                    |
//! | Duplication      | Deliver a datagram twice.                            |
//! | Corruption       | Flip one byte after the checksum.                    |
//! | Every n-th       | Corrupt data segments `n-1, 2n-1, ...` once each.    |
//! | Targeted drop    | Drop the listed data indices the first time only.    |
//! | Lost FIN+ACK     | Drop the server's first `drop_fin_acks` FIN+ACKs.    |
//!
//! Random faults touch only data segments (and, with `both_directions`,
//! their acks); handshake segments always pass unharmed.  The RNG is seeded
//! so a failing run can be replayed.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{MrtError, Result};
use crate::segment::{self, SegmentKind, CHECKSUM_LEN};

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct FaultPlan {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,
    /// Extra delay applied to reordered datagrams.
    pub reorder_delay: Duration,
    pub corrupt_rate: f64,
    /// Corrupt every n-th data index, once per index.
    pub corrupt_every: Option<u16>,
    /// Data indices dropped the first time they pass.
    pub drop_once: Vec<u16>,
    /// Apply the random faults to server acks as well.
    pub both_directions: bool,
    /// Server FIN+ACKs dropped before one is let through.
    pub drop_fin_acks: u32,
    pub seed: u64,
}

impl Default for FaultPlan {
    fn default() -> Self {
        // No faults by default: the link is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::from_millis(20),
            corrupt_rate: 0.0,
            corrupt_every: None,
            drop_once: Vec::new(),
            both_directions: false,
            drop_fin_acks: 0,
            seed: 0,
        }
    }
}

impl FaultPlan {
    pub fn validate(&self) -> Result<()> {
        let rates = [
            ("loss_rate", self.loss_rate),
            ("duplicate_rate", self.duplicate_rate),
            ("reorder_rate", self.reorder_rate),
            ("corrupt_rate", self.corrupt_rate),
        ];
        for (name, rate) in rates {
            if !(0.0..=1.0).contains(&rate) {
                return Err(MrtError::InvalidConfig(format!("{name} {rate} outside [0, 1]")));
            }
        }
        if self.corrupt_every == Some(0) {
            return Err(MrtError::InvalidConfig("corrupt_every must be at least 1".into()));
        }
        Ok(())
    }
}

/// Fault counters, readable while the link runs.
#[derive(Debug, Default)]
struct Counters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
    reordered: AtomicU64,
    corrupted: AtomicU64,
}

/// Point-in-time copy of the link's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
    pub corrupted: u64,
}

/// A running relay.
#[derive(Debug)]
pub struct LossyLink {
    local_addr: SocketAddr,
    counters: Arc<Counters>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LossyLink {
    /// Bind `local` and relay between the first client seen and `upstream`.
    pub async fn spawn(local: SocketAddr, upstream: SocketAddr, plan: FaultPlan) -> Result<Self> {
        plan.validate()?;
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let local_addr = socket.local_addr()?;
        let counters = Arc::new(Counters::default());
        let (stop, stop_rx) = watch::channel(false);
        log::info!("lossy link {local_addr} -> {upstream}: {plan:?}");

        let relay = Relay {
            socket,
            upstream,
            client: None,
            faults: Faults::new(plan),
            counters: counters.clone(),
        };
        let task = tokio::spawn(relay.run(stop_rx));
        Ok(Self {
            local_addr,
            counters,
            stop,
            task,
        })
    }

    /// Address clients should send to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> LinkStats {
        let c = &self.counters;
        LinkStats {
            forwarded: c.forwarded.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            duplicated: c.duplicated.load(Ordering::Relaxed),
            reordered: c.reordered.load(Ordering::Relaxed),
            corrupted: c.corrupted.load(Ordering::Relaxed),
        }
    }

    pub async fn shutdown(mut self) -> LinkStats {
        let _ = self.stop.send(true);
        if let Err(e) = (&mut self.task).await {
            log::error!("lossy link task panicked: {e}");
        }
        let stats = self.stats();
        log::info!("lossy link {} stopped: {stats:?}", self.local_addr);
        stats
    }
}

// ---------------------------------------------------------------------------
// Fault model
// ---------------------------------------------------------------------------

/// What to do with one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Deliver,
    Drop,
    Corrupt,
    Duplicate,
    Delay,
}

struct Faults {
    plan: FaultPlan,
    rng: StdRng,
    dropped_once: HashSet<u16>,
    corrupted_once: HashSet<u16>,
    fin_acks_dropped: u32,
}

impl Faults {
    fn new(plan: FaultPlan) -> Self {
        Self {
            rng: StdRng::seed_from_u64(plan.seed),
            plan,
            dropped_once: HashSet::new(),
            corrupted_once: HashSet::new(),
            fin_acks_dropped: 0,
        }
    }

    /// Decide the fate of a datagram travelling client → server when
    /// `forward`, server → client otherwise.
    fn judge(&mut self, bytes: &[u8], forward: bool) -> Fate {
        let Ok(decoded) = segment::decode(bytes) else {
            return Fate::Deliver;
        };
        match (forward, decoded.kind()) {
            (true, SegmentKind::Data(index)) => {
                if self.plan.drop_once.contains(&index) && self.dropped_once.insert(index) {
                    return Fate::Drop;
                }
                if let Some(n) = self.plan.corrupt_every {
                    if index % n == n - 1 && self.corrupted_once.insert(index) {
                        return Fate::Corrupt;
                    }
                }
                self.roll()
            }
            (false, SegmentKind::Ack(_)) if self.plan.both_directions => self.roll(),
            (false, SegmentKind::FinAck) if self.fin_acks_dropped < self.plan.drop_fin_acks => {
                self.fin_acks_dropped += 1;
                Fate::Drop
            }
            _ => Fate::Deliver,
        }
    }

    fn roll(&mut self) -> Fate {
        let plan = &self.plan;
        if self.rng.gen_bool(plan.loss_rate) {
            Fate::Drop
        } else if self.rng.gen_bool(plan.corrupt_rate) {
            Fate::Corrupt
        } else if self.rng.gen_bool(plan.duplicate_rate) {
            Fate::Duplicate
        } else if self.rng.gen_bool(plan.reorder_rate) {
            Fate::Delay
        } else {
            Fate::Deliver
        }
    }

    /// Flip one byte past the checksum so verification fails.
    fn corrupt(&mut self, bytes: &mut [u8]) {
        if bytes.len() > CHECKSUM_LEN {
            let at = self.rng.gen_range(CHECKSUM_LEN..bytes.len());
            bytes[at] ^= 0xff;
        }
    }
}

// ---------------------------------------------------------------------------
// Relay task
// ---------------------------------------------------------------------------

struct Relay {
    socket: Arc<UdpSocket>,
    upstream: SocketAddr,
    client: Option<SocketAddr>,
    faults: Faults,
    counters: Arc<Counters>,
}

impl Relay {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut buf = vec![0u8; 65_535];
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => self.relay(buf[..n].to_vec(), from).await,
                    Err(e) => {
                        log::error!("lossy link recv: {e}");
                        break;
                    }
                }
            }
        }
    }

    async fn relay(&mut self, mut bytes: Vec<u8>, from: SocketAddr) {
        let forward = from != self.upstream;
        let dest = if forward {
            self.client = Some(from);
            self.upstream
        } else {
            match self.client {
                Some(client) => client,
                None => return,
            }
        };

        let fate = self.faults.judge(&bytes, forward);
        let counters = &self.counters;
        match fate {
            Fate::Drop => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("lossy link: dropped datagram to {dest}");
                return;
            }
            Fate::Corrupt => {
                counters.corrupted.fetch_add(1, Ordering::Relaxed);
                self.faults.corrupt(&mut bytes);
                log::debug!("lossy link: corrupted datagram to {dest}");
            }
            Fate::Duplicate => {
                counters.duplicated.fetch_add(1, Ordering::Relaxed);
                self.send(&bytes, dest).await;
            }
            Fate::Delay => {
                counters.reordered.fetch_add(1, Ordering::Relaxed);
                counters.forwarded.fetch_add(1, Ordering::Relaxed);
                let socket = self.socket.clone();
                let delay = self.faults.plan.reorder_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = socket.send_to(&bytes, dest).await;
                });
                return;
            }
            Fate::Deliver => {}
        }
        counters.forwarded.fetch_add(1, Ordering::Relaxed);
        self.send(&bytes, dest).await;
    }

    async fn send(&self, bytes: &[u8], dest: SocketAddr) {
        if let Err(e) = self.socket.send_to(bytes, dest).await {
            log::warn!("lossy link send to {dest}: {e}");
        }
    }
}
