//! Go-Back-N receive-side state machine.
//!
//! [`Reassembler`] implements the receiver side of Go-Back-N:
//!
//! - Only **in-order**, verified segments are accepted
//!   (`packet_index == expected`).
//! - Corrupt, out-of-order and duplicate segments are discarded without
//!   touching the [`TransferBuffer`].
//! - Every segment is answered with an ack naming the last index accepted in
//!   order, which doubles as the sender's Go-Back-N resume point.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;

use crate::error::MrtError;

/// Append-only ordered byte accumulator, read destructively.
#[derive(Debug, Default)]
pub struct TransferBuffer {
    bytes: VecDeque<u8>,
}

impl TransferBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn append(&mut self, payload: &[u8]) {
        self.bytes.extend(payload.iter().copied());
    }

    /// Remove and return up to `len` bytes from the front.
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        let n = len.min(self.bytes.len());
        self.bytes.drain(..n).collect()
    }

    /// Put bytes back at the front, ahead of anything buffered since.
    pub fn unread(&mut self, bytes: Vec<u8>) {
        for b in bytes.into_iter().rev() {
            self.bytes.push_front(b);
        }
    }
}

/// What happened to one inbound data segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Payload appended; ack names this segment.
    Accepted { ack: u16 },
    /// Discarded; duplicate ack names the last good segment.
    Rejected { ack: u16, cause: MrtError },
}

impl Verdict {
    /// Packet index the outbound ack should carry.
    pub fn ack(&self) -> u16 {
        match self {
            Verdict::Accepted { ack } | Verdict::Rejected { ack, .. } => *ack,
        }
    }
}

/// Receive-side state for one connection.
#[derive(Debug, Default)]
pub struct Reassembler {
    /// Next in-order packet index, widened so long transfers never alias.
    expected: u64,
    buffer: TransferBuffer,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire form of the next packet index required.
    pub fn expected_index(&self) -> u16 {
        self.expected as u16
    }

    /// Segments accepted so far.
    pub fn accepted(&self) -> u64 {
        self.expected
    }

    /// Last index accepted in order; `expected - 1` modulo 2^16, so before
    /// anything arrives it is `u16::MAX`.
    pub fn last_received(&self) -> u16 {
        self.expected_index().wrapping_sub(1)
    }

    /// Process one inbound data segment.
    pub fn on_segment(&mut self, index: u16, payload: &[u8], corrupt: bool) -> Verdict {
        if corrupt {
            return Verdict::Rejected {
                ack: self.last_received(),
                cause: MrtError::CorruptSegment,
            };
        }
        if index != self.expected_index() {
            return Verdict::Rejected {
                ack: self.last_received(),
                cause: MrtError::UnexpectedIndex {
                    expected: self.expected_index(),
                    got: index,
                },
            };
        }
        self.buffer.append(payload);
        self.expected += 1;
        Verdict::Accepted { ack: index }
    }

    pub fn buffer(&self) -> &TransferBuffer {
        &self.buffer
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Destructively read up to `len` in-order bytes.
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        self.buffer.take(len)
    }

    /// Return bytes from an undelivered [`Reassembler::take`].
    pub fn restore(&mut self, bytes: Vec<u8>) {
        self.buffer.unread(bytes);
    }
}
