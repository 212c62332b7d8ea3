//! Mini Reliable Transport (`mrt`): a connection-oriented, reliable byte
//! transfer protocol over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐   data segments   ┌──────────┐
//!  │  Client  │──────────────────▶│  Server  │
//!  │ (sender) │◀──────────────────│(receiver)│
//!  └────┬─────┘   cumulative acks └─────┬────┘
//!       │                               │
//!  ┌────▼───────────────────────────────▼────┐
//!  │  protocol loop  ◀── mpsc ──  receive    │   one pair of tasks
//!  │  (Connection, timer, budget)     loop   │   per endpoint
//!  └────┬────────────────────────────────────┘
//!       │ raw UDP datagrams
//!  ┌────▼──────┐
//!  │  Socket   │  (thin async wrapper around tokio UdpSocket)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`segment`]: wire format (encode / decode, MD5 checksum)
//! - [`state`]: finite-state-machine types
//! - [`connection`]: per-connection record and control-segment retries
//! - [`sender`]: Go-Back-N outbound window
//! - [`receiver`]: in-order reassembly and the transfer buffer
//! - [`harness`]: receive loop, event queue and condition signals
//! - [`client`]: client endpoint
//! - [`server`]: server endpoint
//! - [`timer`]: retransmit timer and retry budgets
//! - [`socket`]: async UDP socket abstraction
//! - [`config`]: timeouts, retry budgets and queue sizes
//! - [`simulator`]: fault-injecting UDP relay for tests
//! - [`error`]: crate error type

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod harness;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod server;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;

pub use client::Client;
pub use config::Config;
pub use error::{MrtError, Phase, Result};
pub use server::{ConnectionHandle, Delivery, Server};
pub use state::ConnectionState;
