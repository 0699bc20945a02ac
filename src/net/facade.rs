// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scheduler-side network façade (§4.9): one record per socket ID,
//! `{read_buffer, accepted_queue, local, remote}`, with `accept`,
//! `read_exact`, `read_until`, and `close`.
//!
//! Transport events cross in via `push_data`/`push_accepted`/`mark_closed`
//! and resume whichever task is suspended in one of the `async fn`s below,
//! through a `tokio::sync::Notify` instead of the source's hand-rolled
//! resume list — the direct tokio analogue of "resume the waiting
//! coroutine".

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{MeshError, MeshResult};

/// Once the consumed prefix of the read buffer exceeds this fraction of
/// its length, it's compacted (§4.9 "shrinks ... when consumed prefix
/// exceeds ¼ capacity").
const COMPACT_THRESHOLD_NUM: usize = 1;
const COMPACT_THRESHOLD_DEN: usize = 4;

struct Inner {
    read_buffer: Vec<u8>,
    consumed: usize,
    accepted_queue: VecDeque<u64>,
    closed: bool,
    close_reason: Option<&'static str>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl Inner {
    fn new(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        Self {
            read_buffer: Vec::new(),
            consumed: 0,
            accepted_queue: VecDeque::new(),
            closed: false,
            close_reason: None,
            local,
            remote,
        }
    }

    fn readable(&self) -> usize {
        self.read_buffer.len() - self.consumed
    }

    fn compact_if_needed(&mut self) {
        if self.consumed * COMPACT_THRESHOLD_DEN > self.read_buffer.len() * COMPACT_THRESHOLD_NUM {
            self.read_buffer.drain(0..self.consumed);
            self.consumed = 0;
        }
    }
}

struct Socket {
    inner: Mutex<Inner>,
    notify: Notify,
}

/// Registry of socket records, keyed by socket ID (§4.9).
#[derive(Default)]
pub struct Facade {
    sockets: DashMap<u64, Arc<Socket>>,
}

impl Facade {
    pub fn new() -> Self {
        Self {
            sockets: DashMap::new(),
        }
    }

    /// Registers a new socket record for `id`, overwriting any prior
    /// record with the same ID.
    pub fn register(&self, id: u64, local: Option<SocketAddr>, remote: Option<SocketAddr>) {
        self.sockets.insert(
            id,
            Arc::new(Socket {
                inner: Mutex::new(Inner::new(local, remote)),
                notify: Notify::new(),
            }),
        );
    }

    pub fn local_addr(&self, id: u64) -> Option<SocketAddr> {
        self.sockets.get(&id).and_then(|s| s.inner.lock().local)
    }

    pub fn remote_addr(&self, id: u64) -> Option<SocketAddr> {
        self.sockets.get(&id).and_then(|s| s.inner.lock().remote)
    }

    fn get(&self, id: u64) -> MeshResult<Arc<Socket>> {
        self.sockets
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(MeshError::InvalidAction(format!("unknown socket id {id}")))
    }

    /// Transport event: more bytes arrived for `id`.
    pub fn push_data(&self, id: u64, bytes: &[u8]) {
        if let Ok(socket) = self.get(id) {
            socket.inner.lock().read_buffer.extend_from_slice(bytes);
            socket.notify.notify_waiters();
        }
    }

    /// Transport event: a listener accepted a new child socket.
    pub fn push_accepted(&self, listen_id: u64, child_id: u64) {
        if let Ok(socket) = self.get(listen_id) {
            socket.inner.lock().accepted_queue.push_back(child_id);
            socket.notify.notify_waiters();
        }
    }

    /// Transport event: the socket stopped, with an optional reason.
    pub fn mark_closed(&self, id: u64, reason: Option<&'static str>) {
        if let Ok(socket) = self.get(id) {
            let mut inner = socket.inner.lock();
            inner.closed = true;
            inner.close_reason = reason;
            drop(inner);
            socket.notify.notify_waiters();
        }
    }

    /// Removes a socket's record entirely (after a confirmed teardown).
    pub fn forget(&self, id: u64) {
        self.sockets.remove(&id);
    }

    /// Suspends until `listen_id`'s accepted queue is non-empty, then
    /// dequeues and returns one child socket ID.
    pub async fn accept(&self, listen_id: u64) -> MeshResult<u64> {
        loop {
            let socket = self.get(listen_id)?;
            {
                let mut inner = socket.inner.lock();
                if let Some(child) = inner.accepted_queue.pop_front() {
                    return Ok(child);
                }
                if inner.closed {
                    return Err(MeshError::PeerDisconnected {
                        reason: "listener closed",
                    });
                }
            }
            socket.notify.notified().await;
        }
    }

    /// Suspends until exactly `n` bytes are available for `id`, then
    /// consumes and returns them.
    pub async fn read_exact(&self, id: u64, n: usize) -> MeshResult<Vec<u8>> {
        loop {
            let socket = self.get(id)?;
            {
                let mut inner = socket.inner.lock();
                if inner.readable() >= n {
                    let start = inner.consumed;
                    let out = inner.read_buffer[start..start + n].to_vec();
                    inner.consumed += n;
                    inner.compact_if_needed();
                    return Ok(out);
                }
                if inner.closed {
                    return Err(MeshError::PeerDisconnected {
                        reason: inner.close_reason.unwrap_or("eof"),
                    });
                }
            }
            socket.notify.notified().await;
        }
    }

    /// Suspends until `delimiter` appears in `id`'s unread bytes, then
    /// consumes and returns everything through and including it.
    pub async fn read_until(&self, id: u64, delimiter: u8) -> MeshResult<Vec<u8>> {
        loop {
            let socket = self.get(id)?;
            {
                let mut inner = socket.inner.lock();
                let start = inner.consumed;
                let pos = inner.read_buffer[start..]
                    .iter()
                    .position(|&b| b == delimiter);
                if let Some(rel) = pos {
                    let end = start + rel + 1;
                    let out = inner.read_buffer[start..end].to_vec();
                    inner.consumed = end;
                    inner.compact_if_needed();
                    return Ok(out);
                }
                if inner.closed {
                    return Err(MeshError::PeerDisconnected {
                        reason: inner.close_reason.unwrap_or("eof"),
                    });
                }
            }
            socket.notify.notified().await;
        }
    }

    /// Marks `id` closed and flushes any waiter with a synthetic stop
    /// event.
    pub fn close(&self, id: u64) {
        self.mark_closed(id, Some("closed"));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn read_exact_waits_then_resolves_on_push() {
        let facade = Facade::new();
        facade.register(1, None, None);

        let reader = tokio::spawn(async move {
            let facade = Arc::new(facade);
            let f2 = Arc::clone(&facade);
            let task = tokio::spawn(async move { f2.read_exact(1, 5).await });
            tokio::time::sleep(Duration::from_millis(10)).await;
            facade.push_data(1, b"hello");
            task.await.expect("join")
        });

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("timeout")
            .expect("join");
        assert_eq!(result.expect("read"), b"hello");
    }

    #[tokio::test]
    async fn read_until_includes_delimiter() {
        let facade = Facade::new();
        facade.register(1, None, None);
        facade.push_data(1, b"abc\ndef");

        let line = facade.read_until(1, b'\n').await.expect("read");
        assert_eq!(line, b"abc\n");

        let rest = facade.read_exact(1, 3).await.expect("read");
        assert_eq!(rest, b"def");
    }

    #[tokio::test]
    async fn accept_called_after_close_raises() {
        let facade = Facade::new();
        facade.register(1, None, None);
        facade.close(1);
        assert!(facade.accept(1).await.is_err());
    }

    #[tokio::test]
    async fn read_exact_errors_after_close_with_no_data() {
        let facade = Facade::new();
        facade.register(1, None, None);
        facade.close(1);
        assert!(facade.read_exact(1, 4).await.is_err());
    }
}
