//! Go-Back-N send-side state machine.
//!
//! A [`WindowSender`] covers exactly one `send` call: the payload is sliced
//! into fixed-size segments up front and the sender tracks which of them are
//! in flight.  It does **not** touch the socket; the client protocol loop
//! pulls segments out with [`WindowSender::next_segment`] and feeds acks and
//! timer expiries back in.
//!
//! # Protocol contract
//!
//! - Segments are keyed by **packet index**.  Indices are connection-global
//!   (a later `send` continues where the previous one stopped) and travel as
//!   `u16`, so every wire index is interpreted relative to `base` with
//!   modulo-2^16 arithmetic.  The window is capped at [`MAX_WINDOW`] so that
//!   interpretation is never ambiguous.
//! - An ack names the receiver's last in-order index `a`; `a + 1` is its
//!   resume point.  A resume point ahead of `base` acknowledges everything
//!   before it, one equal to `base` is a gap signal (Go-Back-N rewind), and
//!   one behind `base` is stale.
//! - On timeout every unacked segment from `base` onwards is resent.
//!
//! # Window layout
//!
//! ```text
//!        base               next          base + window
//!          │                  │                  │
//!  ────────┼──────────────────┼──────────────────┼──────▶ index
//!   acked  │ <── in flight ──▶│ <── sendable ──▶ │
//! ```

/// Largest window the modular index comparison tolerates.
pub const MAX_WINDOW: usize = (i16::MAX) as usize;

/// What an inbound ack did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `base` moved forward by this many segments.
    Advanced(usize),
    /// Receiver is missing `base`; `next` was rewound to it.
    Rewind { resume: u16 },
    /// Gap already being repaired for this `base`.
    DuplicateGap,
    /// Ack for something already acknowledged, or for something never sent.
    Stale,
}

/// Send-side window for one outbound payload.
#[derive(Debug)]
pub struct WindowSender {
    chunks: Vec<Vec<u8>>,
    /// Connection-global index of `chunks[0]`.
    first_index: u64,
    /// Oldest unacknowledged segment (offset into `chunks`).
    base: usize,
    /// Next segment eligible for transmission.
    next: usize,
    /// One past the highest segment ever transmitted.
    sent_high: usize,
    /// Receiver-imposed window, `max(1, floor(capacity / mss))`.
    capacity_window: usize,
    /// `base` value a gap rewind was last issued for.
    rewound_at: Option<usize>,
    byte_len: usize,
}

impl WindowSender {
    /// Slice `payload` into `chunk_size`-byte segments numbered from
    /// `first_index`.  `peer_capacity` and `mss` fix the window.
    pub fn new(
        payload: &[u8],
        chunk_size: usize,
        first_index: u64,
        peer_capacity: u32,
        mss: usize,
    ) -> Self {
        assert!(chunk_size > 0, "chunk_size must be non-zero");
        assert!(mss > 0, "mss must be non-zero");
        let chunks: Vec<Vec<u8>> = payload.chunks(chunk_size).map(<[u8]>::to_vec).collect();
        Self {
            chunks,
            first_index,
            base: 0,
            next: 0,
            sent_high: 0,
            capacity_window: capacity_window(peer_capacity, mss),
            rewound_at: None,
            byte_len: payload.len(),
        }
    }

    /// Number of segments this payload was split into.
    pub fn segment_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes carried by this transfer.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn next(&self) -> usize {
        self.next
    }

    /// Segments sent but not yet acknowledged (outstanding-ack count).
    pub fn in_flight(&self) -> usize {
        self.next - self.base
    }

    /// Current window size: the receiver limit clamped to what is left.
    pub fn window_size(&self) -> usize {
        self.capacity_window
            .min(self.chunks.len() - self.base)
            .max(1)
    }

    /// Every segment acknowledged.
    pub fn is_complete(&self) -> bool {
        self.base >= self.chunks.len()
    }

    /// Connection-global index following this transfer.
    pub fn end_index(&self) -> u64 {
        self.first_index + self.chunks.len() as u64
    }

    /// Take the next sendable segment, advancing `next`.
    ///
    /// Returns `None` once `next` reaches the right window edge.
    pub fn next_segment(&mut self) -> Option<(u16, &[u8])> {
        let edge = (self.base + self.window_size()).min(self.chunks.len());
        if self.next >= edge {
            return None;
        }
        let offset = self.next;
        self.next += 1;
        self.sent_high = self.sent_high.max(self.next);
        Some((self.wire_index(offset), &self.chunks[offset]))
    }

    /// Process an ack naming the receiver's last in-order index.
    pub fn on_ack(&mut self, last_received: u16) -> AckOutcome {
        if self.is_complete() {
            return AckOutcome::Stale;
        }
        let resume = last_received.wrapping_add(1);
        let delta = resume.wrapping_sub(self.wire_index(self.base)) as i16;

        if delta > 0 {
            let target = self.base + delta as usize;
            if target > self.sent_high {
                return AckOutcome::Stale;
            }
            let advanced = target - self.base;
            self.base = target;
            self.next = self.next.max(self.base);
            self.rewound_at = None;
            AckOutcome::Advanced(advanced)
        } else if delta == 0 {
            if self.rewound_at == Some(self.base) {
                return AckOutcome::DuplicateGap;
            }
            self.rewound_at = Some(self.base);
            self.next = self.base;
            AckOutcome::Rewind { resume }
        } else {
            AckOutcome::Stale
        }
    }

    /// Timer expired: go back to `base` and resend the whole window.
    pub fn on_timeout(&mut self) {
        self.next = self.base;
        self.rewound_at = None;
    }

    fn wire_index(&self, offset: usize) -> u16 {
        (self.first_index + offset as u64) as u16
    }
}

/// `max(1, floor(capacity / mss))`, capped at [`MAX_WINDOW`].
pub fn capacity_window(peer_capacity: u32, mss: usize) -> usize {
    (peer_capacity as usize / mss).clamp(1, MAX_WINDOW)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drain every currently sendable index.
    fn burst(s: &mut WindowSender) -> Vec<u16> {
        let mut out = Vec::new();
        while let Some((idx, _)) = s.next_segment() {
            out.push(idx);
        }
        out
    }

    #[test]
    fn initial_state() {
        let s = WindowSender::new(&[0u8; 770], 77, 0, 1000, 100);
        assert_eq!(s.segment_count(), 10);
        assert_eq!(s.base(), 0);
        assert_eq!(s.next(), 0);
        assert_eq!(s.window_size(), 10);
        assert!(!s.is_complete());
    }

    #[test]
    fn last_segment_carries_remainder() {
        let mut s = WindowSender::new(&[7u8; 10], 4, 0, 1000, 27);
        let lens: Vec<usize> = std::iter::from_fn(|| s.next_segment().map(|(_, c)| c.len())).collect();
        assert_eq!(lens, vec![4, 4, 2]);
    }

    #[test]
    fn burst_respects_window() {
        let mut s = WindowSender::new(&[0u8; 100], 10, 0, 300, 100);
        assert_eq!(s.window_size(), 3);
        assert_eq!(burst(&mut s), vec![0, 1, 2]);
        assert_eq!(s.in_flight(), 3);
        assert!(s.next_segment().is_none());
    }

    #[test]
    fn ack_for_base_slides_by_one() {
        let mut s = WindowSender::new(&[0u8; 100], 10, 0, 300, 100);
        burst(&mut s);
        assert_eq!(s.on_ack(0), AckOutcome::Advanced(1));
        assert_eq!(s.base(), 1);
        // Right edge moved by one: exactly one new segment is sendable.
        assert_eq!(burst(&mut s), vec![3]);
    }

    #[test]
    fn cumulative_ack_slides_multiple() {
        let mut s = WindowSender::new(&[0u8; 100], 10, 0, 500, 100);
        burst(&mut s);
        assert_eq!(s.on_ack(2), AckOutcome::Advanced(3));
        assert_eq!(s.base(), 3);
        assert_eq!(burst(&mut s), vec![5, 6, 7]);
    }

    #[test]
    fn gap_rewinds_once_per_base() {
        let mut s = WindowSender::new(&[0u8; 100], 10, 0, 500, 100);
        burst(&mut s);
        assert_eq!(s.on_ack(0), AckOutcome::Advanced(1));
        // Segment 1 was lost; receiver keeps naming 0.
        assert_eq!(s.on_ack(0), AckOutcome::Rewind { resume: 1 });
        assert_eq!(s.next(), 1);
        assert_eq!(s.on_ack(0), AckOutcome::DuplicateGap);
        assert_eq!(burst(&mut s), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn gap_before_anything_acked() {
        let mut s = WindowSender::new(&[0u8; 30], 10, 0, 300, 100);
        burst(&mut s);
        // Receiver has nothing yet: it names index 0 - 1.
        assert_eq!(s.on_ack(u16::MAX), AckOutcome::Rewind { resume: 0 });
        assert_eq!(s.next(), 0);
    }

    #[test]
    fn stale_and_unsent_acks_ignored() {
        let mut s = WindowSender::new(&[0u8; 100], 10, 0, 300, 100);
        burst(&mut s);
        assert_eq!(s.on_ack(1), AckOutcome::Advanced(2));
        assert_eq!(s.on_ack(0), AckOutcome::Stale);
        assert_eq!(s.on_ack(9), AckOutcome::Stale);
        assert_eq!(s.base(), 2);
    }

    #[test]
    fn timeout_resends_from_base() {
        let mut s = WindowSender::new(&[0u8; 100], 10, 0, 300, 100);
        burst(&mut s);
        s.on_ack(0);
        s.on_timeout();
        assert_eq!(burst(&mut s), vec![1, 2, 3]);
    }

    #[test]
    fn completes_after_last_ack() {
        let mut s = WindowSender::new(&[0u8; 25], 10, 0, 1000, 100);
        burst(&mut s);
        assert_eq!(s.on_ack(2), AckOutcome::Advanced(3));
        assert!(s.is_complete());
        assert_eq!(s.end_index(), 3);
        assert_eq!(s.on_ack(2), AckOutcome::Stale);
    }

    #[test]
    fn window_never_exceeds_capacity_or_remaining() {
        let capacity = 450u32;
        let mss = 100usize;
        let limit = (capacity as usize) / mss;
        let mut s = WindowSender::new(&[0u8; 230], 10, 0, capacity, mss);
        let mut last = u16::MAX;
        while !s.is_complete() {
            assert!(s.window_size() <= limit);
            assert!(s.window_size() <= s.segment_count() - s.base());
            burst(&mut s);
            assert!(s.in_flight() <= limit);
            last = last.wrapping_add(1);
            s.on_ack(last);
        }
    }

    #[test]
    fn tiny_capacity_still_sends_one() {
        let mut s = WindowSender::new(&[0u8; 20], 10, 0, 10, 100);
        assert_eq!(s.window_size(), 1);
        assert_eq!(burst(&mut s), vec![0]);
    }

    #[test]
    fn indices_continue_and_wrap() {
        let start = u16::MAX as u64 - 1;
        let mut s = WindowSender::new(&[0u8; 40], 10, start, 1000, 100);
        assert_eq!(burst(&mut s), vec![u16::MAX - 1, u16::MAX, 0, 1]);
        assert_eq!(s.on_ack(u16::MAX), AckOutcome::Advanced(2));
        assert_eq!(s.on_ack(1), AckOutcome::Advanced(2));
        assert!(s.is_complete());
        assert_eq!(s.end_index(), start + 4);
    }
}
