//! Entry point for `mrt`.
//!
//! Parses CLI arguments and dispatches into **server**, **client** or
//! **relay** mode.  All protocol work is delegated to library modules;
//! `main.rs` owns only process setup (logging, argument parsing, file I/O).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use mrt::simulator::{FaultPlan, LossyLink};
use mrt::{Client, Config, Server};

/// Reliable byte transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept one connection and receive a fixed number of bytes.
    Server {
        /// Local UDP port to listen on.
        #[arg(short, long)]
        port: u16,
        /// Receive buffer capacity advertised to the client, in bytes.
        #[arg(short, long, default_value_t = 4096)]
        buffer_size: u32,
        /// Number of bytes to receive.
        #[arg(short, long)]
        length: usize,
        /// Write received bytes here instead of reporting a summary.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Connect to a server and send a file.
    Client {
        /// Local UDP port (0 picks one).
        #[arg(short, long, default_value_t = 0)]
        port: u16,
        /// Server host name or address.
        #[arg(long, default_value = "localhost")]
        server_addr: String,
        /// Server UDP port.
        #[arg(long)]
        server_port: u16,
        /// Maximum segment size, header included.
        #[arg(long, default_value_t = 1000)]
        mss: usize,
        /// File whose contents are sent.
        #[arg(short, long)]
        input: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Run a fault-injecting relay in front of a server.
    Relay {
        /// Local UDP port clients send to.
        #[arg(short, long)]
        port: u16,
        /// Server address, e.g. 127.0.0.1:60000.
        #[arg(long)]
        upstream: SocketAddr,
        #[arg(long, default_value_t = 0.0)]
        loss: f64,
        #[arg(long, default_value_t = 0.0)]
        duplicate: f64,
        #[arg(long, default_value_t = 0.0)]
        reorder: f64,
        #[arg(long, default_value_t = 0.0)]
        corrupt: f64,
        /// Corrupt every n-th data segment once.
        #[arg(long)]
        corrupt_every: Option<u16>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

/// Timing flags shared by server and client.
#[derive(Args)]
struct Tuning {
    /// Per-attempt timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
    /// Retry budget for every phase.
    #[arg(long, default_value_t = 6)]
    retries: u32,
    /// Give up on a receive after this many milliseconds (server only).
    #[arg(long)]
    receive_deadline_ms: Option<u64>,
}

impl Tuning {
    fn config(&self) -> Config {
        let mut config = Config::with_timeout(Duration::from_millis(self.timeout_ms)).retries(self.retries);
        config.receive_deadline = self.receive_deadline_ms.map(Duration::from_millis);
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            port,
            buffer_size,
            length,
            output,
            tuning,
        } => {
            let local = SocketAddr::from(([127, 0, 0, 1], port));
            let mut server = Server::bind(local, buffer_size, tuning.config())
                .await
                .with_context(|| format!("binding server on {local}"))?;
            let conn = server.accept().await.context("accepting connection")?;
            let data = server.receive(&conn, length).await.context("receiving")?;
            log::info!("received {} of {length} bytes from {}", data.len(), conn.peer());
            match output {
                Some(path) => tokio::fs::write(&path, &data)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("received {} bytes", data.len()),
            }
            server.close().await.context("closing server")?;
        }
        Mode::Client {
            port,
            server_addr,
            server_port,
            mss,
            input,
            tuning,
        } => {
            let data = tokio::fs::read(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let remote = tokio::net::lookup_host((server_addr.as_str(), server_port))
                .await?
                .find(SocketAddr::is_ipv4)
                .with_context(|| format!("resolving {server_addr}"))?;
            let local = SocketAddr::from(([127, 0, 0, 1], port));
            let mut client = Client::bind(local, remote, mss, tuning.config()).await?;
            client.connect().await.context("connecting")?;
            let sent = client.send(&data).await.context("sending")?;
            println!("sent {sent} bytes");
            client.close().await.context("closing client")?;
        }
        Mode::Relay {
            port,
            upstream,
            loss,
            duplicate,
            reorder,
            corrupt,
            corrupt_every,
            seed,
        } => {
            let plan = FaultPlan {
                loss_rate: loss,
                duplicate_rate: duplicate,
                reorder_rate: reorder,
                corrupt_rate: corrupt,
                corrupt_every,
                seed,
                ..FaultPlan::default()
            };
            let link = LossyLink::spawn(SocketAddr::from(([127, 0, 0, 1], port)), upstream, plan).await?;
            println!("relaying {} -> {upstream}; Ctrl-C to stop", link.local_addr());
            tokio::signal::ctrl_c().await?;
            let stats = link.shutdown().await;
            println!("{stats:?}");
        }
    }
    Ok(())
}
