// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RPC session IDs and the wait-map that resumes a caller when its reply
//! arrives (§4.10, §3).
//!
//! A `DashMap` keyed by an ID the caller embeds in the outgoing frame,
//! with an atomic counter generating fresh IDs, generalized from a plain
//! per-process `u32` counter to a packed 64-bit session ID, and from a
//! multi-shot wait-map entry to a `oneshot::Sender`, since an RPC session
//! here resumes exactly once.

use std::{
    process,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{MeshError, MeshResult};

const SEQUENCE_BITS: u32 = 25;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const PID_BITS: u32 = 7;
const PID_MASK: u64 = (1 << PID_BITS) - 1;

/// The reply (or cancellation) an RPC caller is resumed with.
pub type SessionResult = MeshResult<Vec<u8>>;

/// Generates session IDs: `wall_time_seconds << 32 | (pid & 0x7F) << 25 |
/// sequence_25bit`. Monotonic within a process for a given wall-clock
/// second; the sequence resets to zero the instant the second advances.
struct SessionIdGenerator {
    pid_component: u64,
    // (last wall-clock second observed, next sequence value)
    state: Mutex<(u64, u64)>,
}

impl SessionIdGenerator {
    fn new() -> Self {
        Self {
            pid_component: (process::id() as u64 & PID_MASK) << SEQUENCE_BITS,
            state: Mutex::new((0, 0)),
        }
    }

    fn next(&self) -> u64 {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut state = self.state.lock();
        let sequence = if now_secs != state.0 {
            state.0 = now_secs;
            state.1 = 1;
            0
        } else {
            let seq = state.1 & SEQUENCE_MASK;
            state.1 += 1;
            seq
        };

        (now_secs << 32) | self.pid_component | sequence
    }
}

/// Extracts the wall-clock-seconds component a session ID was minted
/// under, mostly useful for logging and tests.
pub fn session_epoch_secs(session_id: u64) -> u64 {
    session_id >> 32
}

/// The RPC wait-map: allocates session IDs and resumes exactly one waiter
/// per ID, at most once (invariant: a session resumes exactly once).
pub struct SessionTable {
    generator: SessionIdGenerator,
    pending: DashMap<u64, oneshot::Sender<SessionResult>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            generator: SessionIdGenerator::new(),
            pending: DashMap::new(),
        }
    }

    /// Mints a fresh session ID and registers a waiter for it. The caller
    /// embeds the ID in the outgoing request and awaits the receiver for
    /// the reply.
    pub fn create_session(&self) -> (u64, oneshot::Receiver<SessionResult>) {
        let id = self.generator.next();
        let (tx, rx) = oneshot::channel();
        self.insert_session(id, tx);
        (id, rx)
    }

    /// Registers a waiter under an already-known ID. Exposed separately
    /// from [`Self::create_session`] for the rare case a caller needs the
    /// ID before the waiter is wired up (e.g. logging it ahead of send).
    pub fn insert_session(&self, id: u64, tx: oneshot::Sender<SessionResult>) {
        self.pending.insert(id, tx);
    }

    /// Delivers `data` to the session awaiting `id`. Returns `false` if no
    /// session is pending under that ID (already resumed, timed out and
    /// dropped, or never registered) — not an error, since a stray reply
    /// for an expired session is ordinary under the design's timeout
    /// semantics.
    pub fn wake_up_session(&self, id: u64, data: Vec<u8>) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(Ok(data)).is_ok(),
            None => false,
        }
    }

    /// Resumes the session awaiting `id` with a cancellation rather than
    /// data (peer disconnected, shutdown). Returns `false` under the same
    /// conditions as [`Self::wake_up_session`].
    pub fn cancel_session(&self, id: u64) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(Err(MeshError::Canceled)).is_ok(),
            None => false,
        }
    }

    /// Cancels every outstanding session, e.g. when the connection backing
    /// them all is torn down.
    pub fn cancel_all(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.cancel_session(id);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Races a session's reply against a timeout. A plain `tokio::select!`
/// rather than `runtime::combinators::first_ok`: that combinator's "fall
/// back to the other side on failure" rule would, on a cancellation,
/// stall out the remaining timeout duration before reporting it — wrong
/// for a call site that wants a cancellation to propagate immediately.
pub async fn call_with_timeout(
    mut rx: oneshot::Receiver<SessionResult>,
    timeout: Duration,
) -> SessionResult {
    tokio::select! {
        resolved = &mut rx => resolved.map_err(|_| MeshError::BrokenPromise)?,
        () = tokio::time::sleep(timeout) => Err(MeshError::invalid_action("rpc call timed out")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn session_ids_are_unique_and_monotonic_within_a_second() {
        let gen = SessionIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
        assert!(b > a || session_epoch_secs(b) > session_epoch_secs(a));
    }

    #[tokio::test]
    async fn wake_up_session_resumes_the_waiter_with_data() {
        let table = SessionTable::new();
        let (id, rx) = table.create_session();
        assert!(table.wake_up_session(id, b"reply".to_vec()));
        let result = rx.await.expect("sender not dropped");
        assert_eq!(result.expect("ok"), b"reply");
    }

    #[tokio::test]
    async fn waking_unknown_session_is_a_harmless_no_op() {
        let table = SessionTable::new();
        assert!(!table.wake_up_session(12345, Vec::new()));
    }

    #[tokio::test]
    async fn a_session_resumes_exactly_once() {
        let table = SessionTable::new();
        let (id, rx) = table.create_session();
        assert!(table.wake_up_session(id, b"first".to_vec()));
        // Second attempt finds nothing pending: already resumed and removed.
        assert!(!table.wake_up_session(id, b"second".to_vec()));
        assert_eq!(rx.await.expect("sender not dropped").expect("ok"), b"first");
    }

    #[tokio::test]
    async fn cancel_session_resumes_with_canceled_error() {
        let table = SessionTable::new();
        let (id, rx) = table.create_session();
        assert!(table.cancel_session(id));
        let err = rx.await.expect("sender not dropped").expect_err("canceled");
        assert!(matches!(err, MeshError::Canceled));
    }

    #[tokio::test]
    async fn call_with_timeout_returns_reply_when_it_arrives_first() {
        let table = SessionTable::new();
        let (id, rx) = table.create_session();
        table.wake_up_session(id, b"fast".to_vec());
        let result = call_with_timeout(rx, Duration::from_secs(5)).await;
        assert_eq!(result.expect("ok"), b"fast");
    }

    #[tokio::test]
    async fn call_with_timeout_times_out_when_nothing_replies() {
        let table = SessionTable::new();
        let (_id, rx) = table.create_session();
        let result = call_with_timeout(rx, Duration::from_millis(5)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancel_all_resumes_every_pending_session() {
        let table = SessionTable::new();
        let (id_a, rx_a) = table.create_session();
        let (id_b, rx_b) = table.create_session();
        table.cancel_all();
        assert!(rx_a.await.expect("sender not dropped").is_err());
        assert!(rx_b.await.expect("sender not dropped").is_err());
        let _ = (id_a, id_b);
    }
}
