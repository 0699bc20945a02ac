// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP transport (§4.8): client connect-with-timeout, server accept loop,
//! and the per-connection read/write halves.
//!
//! An `OwnedReadHalf`/`OwnedWriteHalf` pair each behind their own `Mutex`,
//! a dedicated read-loop task spawned at connect time, and a
//! `CancellationToken` pair (`cancel` hard-stops both directions,
//! `stop_writes` soft-stops new writes while the read side drains),
//! framing every message with the fixed `NetHeader` (§4.11).

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::net::{facade::Facade, header::NetHeader};

/// One TCP connection, framed with [`NetHeader`]. Read loop pushes
/// payload bytes (not headers) into the façade under `socket_id`; callers
/// write pre-built header+payload frames.
pub struct TcpLink {
    pub socket_id: u64,
    writer: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
    stop_writes: CancellationToken,
}

impl TcpLink {
    /// Connects to `addr`, racing the attempt against `timeout`, then
    /// spawns the read loop delivering frames into `facade` under
    /// `socket_id`.
    pub async fn connect(
        addr: SocketAddr,
        socket_id: u64,
        facade: Arc<Facade>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .context("connect timed out")??;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        facade.register(socket_id, local, remote);
        Ok(Self::from_stream(stream, socket_id, facade, cancel))
    }

    fn from_stream(
        stream: TcpStream,
        socket_id: u64,
        facade: Arc<Facade>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (r, w) = stream.into_split();
        let link = Arc::new(Self {
            socket_id,
            writer: Mutex::new(w),
            cancel,
            stop_writes: CancellationToken::new(),
        });

        let reader_link = Arc::clone(&link);
        tokio::spawn(async move {
            if let Err(e) = reader_link.read_loop(r, facade).await {
                warn!(socket_id, "tcp read loop exited: {e}");
            }
        });

        link
    }

    async fn read_loop(&self, mut r: OwnedReadHalf, facade: Arc<Facade>) -> Result<()> {
        let mut staging = vec![0u8; 1024];
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let n = r.read(&mut staging).await?;
            if n == 0 {
                facade.mark_closed(self.socket_id, Some("eof"));
                break;
            }
            facade.push_data(self.socket_id, &staging[..n]);
        }
        Ok(())
    }

    /// Writes one fully-framed message (`NetHeader` bytes then payload).
    pub async fn write_frame(&self, header: &NetHeader, payload: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() || self.stop_writes.is_cancelled() {
            bail!("write on closed tcp link {}", self.socket_id);
        }
        let mut w = self.writer.lock().await;
        w.write_all(&header.to_bytes()).await?;
        if !payload.is_empty() {
            w.write_all(payload).await?;
        }
        Ok(())
    }

    /// Soft-stop: reject new writes, let the read loop keep draining.
    pub fn quiesce_writes(&self) {
        self.stop_writes.cancel();
    }

    /// Hard-stop both directions.
    pub fn kill_now(&self) {
        self.cancel.cancel();
    }
}

/// Binds `addr` and runs an accept loop forever, registering each
/// accepted socket with `facade` under an ID from `next_id` and invoking
/// `on_accept` with the new [`TcpLink`].
pub async fn serve<F, Fut>(
    addr: SocketAddr,
    facade: Arc<Facade>,
    cancel: CancellationToken,
    mut next_id: impl FnMut() -> u64,
    mut on_accept: F,
) -> Result<()>
where
    F: FnMut(Arc<TcpLink>, SocketAddr) -> Fut,
    Fut: Future<Output = ()>,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, remote) = accepted?;
                stream.set_nodelay(true)?;
                let socket_id = next_id();
                facade.register(socket_id, stream.local_addr().ok(), Some(remote));
                let link = TcpLink::from_stream(stream, socket_id, Arc::clone(&facade), cancel.child_token());
                on_accept(link, remote).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn client_connects_and_frames_round_trip() {
        let facade = Arc::new(Facade::new());
        let listener_addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let listener = TcpListener::bind(listener_addr).await.expect("bind");
        let bound = listener.local_addr().expect("local addr");

        let server_facade = Arc::clone(&facade);
        let server = tokio::spawn(async move {
            let (stream, _remote) = listener.accept().await.expect("accept");
            stream.set_nodelay(true).expect("nodelay");
            let server_link = TcpLink::from_stream(stream, 2, server_facade, CancellationToken::new());
            let hdr = NetHeader::new(7, 4, 0);
            server_link.write_frame(&hdr, b"pong").await.expect("write");
        });

        let client = TcpLink::connect(
            bound,
            1,
            Arc::clone(&facade),
            Duration::from_secs(2),
            CancellationToken::new(),
        )
        .await
        .expect("connect");

        let header_bytes = facade.read_exact(1, 16).await.expect("header");
        let hdr = NetHeader::parse(&header_bytes).expect("parse");
        assert_eq!(hdr.msg_id(), 7);
        let body = facade.read_exact(1, hdr.length() as usize).await.expect("body");
        assert_eq!(body, b"pong");

        let _ = client;
        server.await.expect("server task");
    }
}
