// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! KCP-like reliable-UDP transport (§4.8): outer framing, handshake,
//! watchdog, and teardown state machine, delegating inner reliability to
//! [`arq`].
//!
//! Grounded in the same event-driven shape as [`super::tcp`]
//! (`started`/`stopped`/`data` events, a dedicated read side, a queued
//! write side) but over `tokio::net::UdpSocket` instead of a stream, and
//! demultiplexed by peer socket address on the server side (one `recv_from`
//! loop per bound port, routing to per-peer session state) rather than by
//! the `conv` the real KCP protocol embeds in every segment — this crate's
//! ARQ segments carry sequence/ack numbers only (see `arq.rs`), so the
//! peer address is the simplest correct demultiplexing key available
//! without vendoring the exact upstream wire format.

pub mod arq;

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use tokio::{
    net::UdpSocket,
    sync::{Mutex, mpsc},
};

use crate::{error::MeshError, net::ping::PingTracker};

const MAGIC: [u8; 3] = [0x62, 0xF9, 0x8E];
/// 470-byte UDP MTU minus the 4-byte outer head (§4.8).
pub const MAX_SEGMENT_PAYLOAD: usize = 470 - 4;
const UPDATE_INTERVAL: Duration = Duration::from_millis(10);
const READ_TIMEOUT: Duration = Duration::from_secs(20);
const WRITE_IDLE_BEFORE_HEARTBEAT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Connect = 1,
    ConnectAck = 2,
    Disconnect = 3,
    Heartbeat = 4,
    HeartbeatAck = 5,
    Data = 6,
}

impl Opcode {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            1 => Opcode::Connect,
            2 => Opcode::ConnectAck,
            3 => Opcode::Disconnect,
            4 => Opcode::Heartbeat,
            5 => Opcode::HeartbeatAck,
            6 => Opcode::Data,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Normal,
    Connected,
    CloseWait,
    Closed,
}

fn encode_frame(opcode: Opcode, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&MAGIC);
    out.push(opcode as u8);
    out.extend_from_slice(body);
    out
}

fn parse_frame(buf: &[u8]) -> Option<(Opcode, &[u8])> {
    if buf.len() < 4 || buf[0..3] != MAGIC {
        return None;
    }
    Some((Opcode::from_u8(buf[3])?, &buf[4..]))
}

/// Inner data-opcode segment: 4-byte seq, 4-byte ack, both network order,
/// followed by the payload.
fn encode_data_segment(seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&ack.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn parse_data_segment(buf: &[u8]) -> Option<(u32, u32, &[u8])> {
    if buf.len() < 8 {
        return None;
    }
    let seq = u32::from_be_bytes(buf[0..4].try_into().ok()?);
    let ack = u32::from_be_bytes(buf[4..8].try_into().ok()?);
    Some((seq, ack, &buf[8..]))
}

/// Outcome of one inbound event surfaced to the session owner.
#[derive(Debug)]
pub enum KcpEvent {
    Data(Vec<u8>),
    Eof,
    InitiativeDisconnect,
    HeartbeatTimeout,
}

/// One KCP-like session, client or server side.
pub struct KcpSession {
    pub conv: u32,
    pub peer: SocketAddr,
    socket: Arc<UdpSocket>,
    state: Mutex<SessionState>,
    send_window: Mutex<arq::SendWindow>,
    recv_window: Mutex<arq::RecvWindow>,
    ping: Mutex<PingTracker>,
    events: mpsc::UnboundedSender<KcpEvent>,
}

impl KcpSession {
    fn new(
        conv: u32,
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        events: mpsc::UnboundedSender<KcpEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conv,
            peer,
            socket,
            state: Mutex::new(SessionState::Normal),
            send_window: Mutex::new(arq::SendWindow::new()),
            recv_window: Mutex::new(arq::RecvWindow::new()),
            ping: Mutex::new(PingTracker::new()),
            events,
        })
    }

    /// Client-side handshake: connects a dedicated UDP socket to `peer`,
    /// sends `connect`, and awaits `connect_ack` to learn the server's
    /// assigned `conv`. Returns the session plus its event stream
    /// (data/eof/timeout notifications, §4.8).
    pub async fn client_connect(
        peer: SocketAddr,
        timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<KcpEvent>)> {
        let local: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        let socket = Arc::new(socket);

        socket.send(&encode_frame(Opcode::Connect, &[])).await?;

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| MeshError::invalid_action("kcp connect_ack timed out"))??;
        let Some((Opcode::ConnectAck, body)) = parse_frame(&buf[..n]) else {
            bail!("expected connect_ack, got something else");
        };
        if body.len() < 4 {
            bail!("connect_ack body too short");
        }
        let conv = u32::from_be_bytes(body[0..4].try_into().expect("len checked"));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self::new(conv, peer, Arc::clone(&socket), events_tx);
        *session.state.lock().await = SessionState::Connected;

        let reader = Arc::clone(&session);
        tokio::spawn(async move { reader.client_read_loop().await });

        Ok((session, events_rx))
    }

    async fn client_read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 2048];
        loop {
            let n = match self.socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if self.handle_frame(&buf[..n]).await.is_break() {
                break;
            }
        }
    }

    async fn handle_frame(&self, frame: &[u8]) -> ControlFlow {
        let Some((opcode, body)) = parse_frame(frame) else {
            return ControlFlow::Continue;
        };
        self.ping.lock().await.note_read();
        match opcode {
            Opcode::Heartbeat => {
                let _ = self.socket.send(&encode_frame(Opcode::HeartbeatAck, &[])).await;
            }
            Opcode::HeartbeatAck => {
                self.ping.lock().await.ping_acked();
            }
            Opcode::Disconnect => {
                *self.state.lock().await = SessionState::Closed;
                let _ = self.events.send(KcpEvent::Eof);
                return ControlFlow::Break;
            }
            Opcode::Data => {
                if let Some((seq, ack, payload)) = parse_data_segment(body) {
                    self.send_window.lock().await.ack(ack);
                    let my_ack = self.recv_window.lock().await.accept(seq, payload.to_vec());
                    let _ = self
                        .socket
                        .send(&encode_frame(Opcode::Data, &encode_data_segment(0, my_ack, &[])))
                        .await;
                    for chunk in self.recv_window.lock().await.drain() {
                        let _ = self.events.send(KcpEvent::Data(chunk));
                    }
                }
            }
            Opcode::Connect | Opcode::ConnectAck => {}
        }
        ControlFlow::Continue
    }

    /// Sends application data, fragmenting into [`MAX_SEGMENT_PAYLOAD`]
    /// chunks and handing each to the ARQ send window.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if *self.state.lock().await != SessionState::Connected {
            bail!("kcp session {} not connected", self.conv);
        }
        for chunk in data.chunks(MAX_SEGMENT_PAYLOAD) {
            loop {
                let mut sw = self.send_window.lock().await;
                if sw.can_send() {
                    let seq = sw.push(chunk.to_vec());
                    drop(sw);
                    let ack = self.recv_window.lock().await.current_ack();
                    let body = encode_data_segment(seq, ack, chunk);
                    self.socket.send(&encode_frame(Opcode::Data, &body)).await?;
                    self.ping.lock().await.note_write();
                    break;
                }
                drop(sw);
                tokio::time::sleep(UPDATE_INTERVAL).await;
            }
        }
        Ok(())
    }

    /// Sends the `disconnect` opcode and transitions to `CLOSED`
    /// (§4.8 "active close sends disconnect then enters CLOSED").
    pub async fn close(&self) -> Result<()> {
        self.socket.send(&encode_frame(Opcode::Disconnect, &[])).await?;
        *self.state.lock().await = SessionState::Closed;
        let _ = self.events.send(KcpEvent::InitiativeDisconnect);
        Ok(())
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// One watchdog check (§4.8): fails with a heartbeat-timeout if the
    /// peer has gone silent for 20s; sends a heartbeat if this side has
    /// been quiet for 10s.
    pub async fn watchdog_tick(&self) -> Result<()> {
        let mut ping = self.ping.lock().await;
        if ping.since_last_read() >= READ_TIMEOUT {
            drop(ping);
            *self.state.lock().await = SessionState::Closed;
            let _ = self.events.send(KcpEvent::HeartbeatTimeout);
            bail!("kcp_heartbeat_timeout");
        }
        if ping.since_last_write() >= WRITE_IDLE_BEFORE_HEARTBEAT {
            ping.ping_sent();
            drop(ping);
            self.socket.send(&encode_frame(Opcode::Heartbeat, &[])).await?;
        }
        Ok(())
    }
}

enum ControlFlow {
    Continue,
    Break,
}

impl ControlFlow {
    fn is_break(&self) -> bool {
        matches!(self, ControlFlow::Break)
    }
}

/// Server side: one shared socket demultiplexing inbound datagrams by
/// peer address, allocating a fresh session (and `conv`) the first time a
/// `connect` opcode arrives from a given peer.
type Accepted = (Arc<KcpSession>, mpsc::UnboundedReceiver<KcpEvent>);

pub struct KcpListener {
    socket: Arc<UdpSocket>,
    next_conv: AtomicU32,
    sessions: Mutex<HashMap<SocketAddr, Arc<KcpSession>>>,
    accepted_tx: mpsc::Sender<Accepted>,
}

impl KcpListener {
    pub async fn bind(addr: SocketAddr) -> Result<(Arc<Self>, mpsc::Receiver<Accepted>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (accepted_tx, accepted_rx) = mpsc::channel(64);
        let listener = Arc::new(Self {
            socket,
            next_conv: AtomicU32::new(1),
            sessions: Mutex::new(HashMap::new()),
            accepted_tx,
        });
        let demux = Arc::clone(&listener);
        tokio::spawn(async move { demux.demux_loop().await });
        Ok((listener, accepted_rx))
    }

    async fn demux_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, peer)) = self.socket.recv_from(&mut buf).await else {
                break;
            };
            let frame = buf[..n].to_vec();
            self.route(peer, &frame).await;
        }
    }

    async fn route(self: &Arc<Self>, peer: SocketAddr, frame: &[u8]) {
        let Some((opcode, body)) = parse_frame(frame) else {
            return;
        };

        if opcode == Opcode::Connect && !self.sessions.lock().await.contains_key(&peer) {
            let conv = self.next_conv.fetch_add(1, Ordering::Relaxed);
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let session = KcpSession::new(conv, peer, Arc::clone(&self.socket), events_tx);
            *session.state.lock().await = SessionState::Connected;
            let ack = encode_frame(Opcode::ConnectAck, &conv.to_be_bytes());
            let _ = self.socket.send_to(&ack, peer).await;
            self.sessions.lock().await.insert(peer, Arc::clone(&session));
            let _ = self.accepted_tx.send((session, events_rx)).await;
            return;
        }

        let session = self.sessions.lock().await.get(&peer).cloned();
        let Some(session) = session else { return };
        session.ping.lock().await.note_read();

        match opcode {
            Opcode::Heartbeat => {
                let _ = self.socket.send_to(&encode_frame(Opcode::HeartbeatAck, &[]), peer).await;
            }
            Opcode::HeartbeatAck => session.ping.lock().await.ping_acked(),
            Opcode::Disconnect => {
                *session.state.lock().await = SessionState::Closed;
                let _ = session.events.send(KcpEvent::Eof);
                self.sessions.lock().await.remove(&peer);
            }
            Opcode::Data => {
                if let Some((seq, ack, payload)) = parse_data_segment(body) {
                    session.send_window.lock().await.ack(ack);
                    let my_ack = session.recv_window.lock().await.accept(seq, payload.to_vec());
                    let reply = encode_data_segment(0, my_ack, &[]);
                    let _ = self.socket.send_to(&encode_frame(Opcode::Data, &reply), peer).await;
                    for chunk in session.recv_window.lock().await.drain() {
                        let _ = session.events.send(KcpEvent::Data(chunk));
                    }
                }
            }
            Opcode::Connect | Opcode::ConnectAck => {}
        }
    }
}
