// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ping/keepalive support (§4.11): `s_ping_req`/`s_ping_ack` carry no
//! body, just a header round-trip used for latency measurement and
//! liveness. [`PingTracker`] is the small piece of state every
//! ping-driven loop (gate master watchdog, gate connector, remote
//! connector) needs: last-write/last-read timestamps plus the RTT of the
//! most recent completed ping.

use std::time::{Duration, Instant};

/// Message ID reserved for a ping request. Carried as an `S2sReq`-category
/// ID with sequence `0` — every ping-capable link recognizes this literal
/// value regardless of what other IDs it assigns.
pub const PING_REQ_MSG_ID: u16 = crate::net::msg_id::MsgId::new(
    crate::net::msg_id::MsgCategory::S2sReq,
    0,
)
.0;

/// Message ID reserved for a ping reply.
pub const PING_ACK_MSG_ID: u16 = crate::net::msg_id::MsgId::new(
    crate::net::msg_id::MsgCategory::S2sAck,
    0,
)
.0;

/// Tracks liveness timing for one ping-driven connection.
#[derive(Debug)]
pub struct PingTracker {
    last_write: Instant,
    last_read: Instant,
    in_flight_since: Option<Instant>,
    last_rtt: Option<Duration>,
}

impl PingTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last_write: now,
            last_read: now,
            in_flight_since: None,
            last_rtt: None,
        }
    }

    /// Call whenever any frame is sent on this connection.
    pub fn note_write(&mut self) {
        self.last_write = Instant::now();
    }

    /// Call whenever any frame is received on this connection.
    pub fn note_read(&mut self) {
        self.last_read = Instant::now();
    }

    /// Call when a ping request is sent.
    pub fn ping_sent(&mut self) {
        self.in_flight_since = Some(Instant::now());
        self.note_write();
    }

    /// Call when the matching ping ack arrives; records RTT.
    pub fn ping_acked(&mut self) {
        if let Some(sent) = self.in_flight_since.take() {
            self.last_rtt = Some(sent.elapsed());
        }
        self.note_read();
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn since_last_read(&self) -> Duration {
        self.last_read.elapsed()
    }

    pub fn since_last_write(&self) -> Duration {
        self.last_write.elapsed()
    }

    /// Whether a ping is outstanding without a reply yet.
    pub fn ping_pending(&self) -> bool {
        self.in_flight_since.is_some()
    }
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trip_records_rtt() {
        let mut tracker = PingTracker::new();
        assert!(!tracker.ping_pending());
        tracker.ping_sent();
        assert!(tracker.ping_pending());
        std::thread::sleep(Duration::from_millis(5));
        tracker.ping_acked();
        assert!(!tracker.ping_pending());
        assert!(tracker.last_rtt().expect("rtt") >= Duration::from_millis(5));
    }

    #[test]
    fn req_and_ack_ids_are_distinct_and_categorized() {
        use crate::net::msg_id::{MsgCategory, MsgId};
        let req = MsgId(PING_REQ_MSG_ID);
        let ack = MsgId(PING_ACK_MSG_ID);
        assert_ne!(req, ack);
        assert_eq!(req.category(), Some(MsgCategory::S2sReq));
        assert_eq!(ack.category(), Some(MsgCategory::S2sAck));
    }
}
