//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is one segment.  This module is
//! responsible for:
//! - Defining the on-wire binary layout (checksum, header fields, payload).
//! - Serialising a [`Header`] plus payload into a byte buffer.
//! - Parsing a raw byte slice back into a [`Decoded`] segment and flagging
//!   corruption, without ever refusing to return the parsed fields.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |              Checksum (MD5 over header + payload)             |
//! |                          16 bytes                             |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Sequence Number        |     Acknowledgment Number     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Packet Index          |     Flags     |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 23 bytes.
//! checksum(16) + seq(2) + ack(2) + packet_index(2) + flags(1)

use std::fmt;

use md5::{Digest, Md5};
use thiserror::Error;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Synchronise (handshake initiation).
    pub const SYN: u8 = 0b0000_0100;
    /// Acknowledgement.
    pub const ACK: u8 = 0b0000_0010;
    /// Finish: sender has no more data to send.
    pub const FIN: u8 = 0b0000_0001;
}

/// Byte length of the checksum prefix.
pub const CHECKSUM_LEN: usize = 16;

/// Byte length of the fixed-size header on the wire, checksum included.
pub const HEADER_LEN: usize = 23;

/// Largest segment a UDP datagram can carry.
pub const MAX_SEGMENT_SIZE: usize = 65_507;

/// Payload of the server's data-phase-ready notice.
pub const READY: &[u8] = b"ready";

// Byte offsets of each field within the serialised segment.
const OFF_SEQ: usize = 16;
const OFF_ACK: usize = 18;
const OFF_INDEX: usize = 20;
const OFF_FLAGS: usize = 22;

/// Fixed-size protocol header (checksum excluded; it is derived).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Coarse handshake counter.
    pub seq: u16,
    /// Coarse handshake acknowledgement counter.
    pub ack: u16,
    /// Per-segment index; the only key used for data acks and resends.
    pub packet_index: u16,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
}

impl Header {
    pub fn new(seq: u16, ack: u16, packet_index: u16, flags: u8) -> Self {
        Self {
            seq,
            ack,
            packet_index,
            flags,
        }
    }

    /// `true` when exactly the bits in `mask` are set.
    pub fn is(&self, mask: u8) -> bool {
        self.flags == mask
    }
}

/// Output of [`decode`]: the parsed segment and whether it verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub header: Header,
    pub payload: Vec<u8>,
    /// Recomputed checksum differs from the received one.  Header fields are
    /// untrusted when this is set.
    pub corrupt: bool,
}

impl Decoded {
    pub fn kind(&self) -> SegmentKind {
        SegmentKind::of(&self.header)
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    /// Buffer shorter than the fixed header size.
    #[error("datagram of {0} bytes is shorter than the 23-byte header")]
    TooShort(usize),
}

/// Serialise `header` and `payload` into a newly allocated byte vector.
pub fn encode(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN + payload.len()];

    buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&header.seq.to_be_bytes());
    buf[OFF_ACK..OFF_ACK + 2].copy_from_slice(&header.ack.to_be_bytes());
    buf[OFF_INDEX..OFF_INDEX + 2].copy_from_slice(&header.packet_index.to_be_bytes());
    buf[OFF_FLAGS] = header.flags;
    buf[HEADER_LEN..].copy_from_slice(payload);

    let digest = checksum(&buf[CHECKSUM_LEN..]);
    buf[..CHECKSUM_LEN].copy_from_slice(&digest);
    buf
}

/// Parse a segment from a raw byte slice.
///
/// The header is returned even when the checksum fails; only a buffer too
/// short to hold a header is an error.
pub fn decode(buf: &[u8]) -> Result<Decoded, SegmentError> {
    if buf.len() < HEADER_LEN {
        return Err(SegmentError::TooShort(buf.len()));
    }

    let header = Header {
        seq: read_u16(buf, OFF_SEQ),
        ack: read_u16(buf, OFF_ACK),
        packet_index: read_u16(buf, OFF_INDEX),
        flags: buf[OFF_FLAGS],
    };
    let corrupt = checksum(&buf[CHECKSUM_LEN..])[..] != buf[..CHECKSUM_LEN];

    Ok(Decoded {
        header,
        payload: buf[HEADER_LEN..].to_vec(),
        corrupt,
    })
}

/// Payload of a SYN+ACK: the sender's receive-buffer capacity.
pub fn capacity_payload(capacity: u32) -> [u8; 4] {
    capacity.to_be_bytes()
}

/// Read the capacity carried by a SYN+ACK, if the payload is well formed.
pub fn parse_capacity(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&Md5::digest(data));
    out
}

/// Human-readable segment class used in trace logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Syn,
    SynAck,
    Ack(u16),
    Fin,
    FinAck,
    Data(u16),
    Unknown(u8),
}

impl SegmentKind {
    pub fn of(header: &Header) -> Self {
        use flags::*;
        match header.flags {
            SYN => SegmentKind::Syn,
            f if f == SYN | ACK => SegmentKind::SynAck,
            ACK => SegmentKind::Ack(header.packet_index),
            FIN => SegmentKind::Fin,
            f if f == FIN | ACK => SegmentKind::FinAck,
            0 => SegmentKind::Data(header.packet_index),
            other => SegmentKind::Unknown(other),
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Syn => write!(f, "SYN"),
            SegmentKind::SynAck => write!(f, "SYN-ACK"),
            SegmentKind::Ack(i) => write!(f, "ack{i}"),
            SegmentKind::Fin => write!(f, "FIN"),
            SegmentKind::FinAck => write!(f, "FIN-ACK"),
            SegmentKind::Data(i) => write!(f, "pkt{i}"),
            SegmentKind::Unknown(bits) => write!(f, "UNKNOWN({bits:#05b})"),
        }
    }
}
