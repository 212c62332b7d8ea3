//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! segments instead of raw bytes.  All protocol logic lives elsewhere; this
//! module owns only byte I/O and the per-segment trace log.
//!
//! Trace lines use the target `mrt::segment` and read
//! `<local> <remote> <seq> <ack> <kind> <payload-len>`, so
//! `RUST_LOG=mrt::segment=trace` reproduces a per-endpoint segment log.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::Result;
use crate::segment::{self, Decoded, Header, SegmentKind};

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

/// One decoded datagram and where it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub segment: Decoded,
    pub from: SocketAddr,
}

/// An async, segment-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared between the receive
/// loop (reads) and the protocol loop (writes).
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        log::debug!("bound UDP socket on {local_addr}");
        Ok(Self { local_addr, inner })
    }

    /// Encode one segment and send it as a single datagram to `dest`.
    pub async fn send_segment(&self, header: &Header, payload: &[u8], dest: SocketAddr) -> Result<()> {
        let bytes = segment::encode(header, payload);
        self.inner.send_to(&bytes, dest).await?;
        log::trace!(
            target: "mrt::segment",
            "{} {} {} {} {} {}",
            self.local_addr,
            dest,
            header.seq,
            header.ack,
            SegmentKind::of(header),
            payload.len()
        );
        Ok(())
    }

    /// Wait at most `poll` for the next datagram and decode it.
    ///
    /// `Ok(None)` means nothing usable arrived: either the wait elapsed or
    /// the datagram was too short to carry a header.  Corrupt segments are
    /// returned with `corrupt` set; the caller decides trust.
    pub async fn recv_segment(&self, poll: Duration) -> Result<Option<Inbound>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, from) = match tokio::time::timeout(poll, self.inner.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_elapsed) => return Ok(None),
        };
        match segment::decode(&buf[..n]) {
            Ok(segment) => {
                log::trace!(
                    target: "mrt::segment",
                    "{} {} {} {} {}{} {}",
                    self.local_addr,
                    from,
                    segment.header.seq,
                    segment.header.ack,
                    segment.kind(),
                    if segment.corrupt { " (corrupt)" } else { "" },
                    segment.payload.len()
                );
                Ok(Some(Inbound { segment, from }))
            }
            Err(e) => {
                log::debug!("dropping datagram from {from}: {e}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
impl Socket {
    /// Send a segment with one sequence bit flipped after checksumming; the
    /// flags survive so the receiver sees the intended kind, marked corrupt.
    pub(crate) async fn send_damaged(&self, header: &Header, payload: &[u8], dest: SocketAddr) -> Result<()> {
        let mut bytes = segment::encode(header, payload);
        bytes[segment::CHECKSUM_LEN] ^= 0x01;
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::flags;

    async fn loopback() -> Socket {
        Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn segment_crosses_loopback() {
        let a = loopback().await;
        let b = loopback().await;
        let header = Header::new(1, 0, 0, flags::SYN);
        a.send_segment(&header, b"", b.local_addr).await.unwrap();

        let inbound = b
            .recv_segment(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("datagram");
        assert_eq!(inbound.from, a.local_addr);
        assert_eq!(inbound.segment.header, header);
        assert!(!inbound.segment.corrupt);
    }

    #[tokio::test]
    async fn poll_elapses_without_traffic() {
        let a = loopback().await;
        let got = a.recv_segment(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn runt_datagram_is_skipped() {
        let a = loopback().await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"tiny", a.local_addr).await.unwrap();
        let got = a.recv_segment(Duration::from_secs(2)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn damaged_segment_arrives_flagged() {
        let a = loopback().await;
        let b = loopback().await;
        let header = Header::new(1, 2, 0, flags::FIN | flags::ACK);
        a.send_damaged(&header, b"", b.local_addr).await.unwrap();

        let inbound = b.recv_segment(Duration::from_secs(2)).await.unwrap().expect("datagram");
        assert!(inbound.segment.corrupt);
        assert_eq!(inbound.segment.kind(), SegmentKind::FinAck);
    }
}
