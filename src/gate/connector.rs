// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Gate connector (§4.15): the client side a service embeds to reach its
//! local gate. A TCP link carries the control plane (register, subscribe,
//! ping); a shared-memory [`SharedChannel`] opened once the gate hands back
//! its ID carries application traffic, since that's the data path the gate
//! forwards cross-service calls over on the same host.
//!
//! The TCP half is one read-loop task with write calls serialized behind a
//! lock; the RPC wait-map is [`crate::rpc::SessionTable`] reused across
//! *both* transports — a session ID minted once resumes its caller
//! whichever path the matching reply arrives on.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    gate::messages::{
        PING_ACK, PING_REQ, SERVICE_REGISTER_ACK, SERVICE_REGISTER_REQ, SERVICE_SUBSCRIBE_ACK,
        SERVICE_SUBSCRIBE_BRD, SERVICE_SUBSCRIBE_REQ, ServiceInfo, ServiceRegisterAck,
        ServiceRegisterReq, ServiceSubscribeAck, ServiceSubscribeBrd, ServiceSubscribeReq,
    },
    net::{
        codec::Codec,
        facade::Facade,
        header::{NET_HEADER_LEN, NetHeader, SHM_HEADER_LEN, ShmHeader},
        msg_id::MsgId,
        ping::PingTracker,
        transport::tcp::TcpLink,
    },
    ring::{channel::SharedChannel, select::ChannelSelect},
    rpc::{SessionTable, call_with_timeout},
};

const AUTO_PING_INTERVAL: Duration = Duration::from_secs(20);
const AUTO_PING_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BUF_INITIAL: usize = 16 * 1024;
const READ_BUF_CAP: usize = 4 * 1024 * 1024;

/// Embedded in a service process, talking to the one gate it registered
/// with (§4.15).
pub struct GateConnector {
    id: u16,
    service_type: u16,
    gate_id: u16,
    link: Arc<TcpLink>,
    facade: Arc<Facade>,
    channel: Arc<SharedChannel>,
    sessions: SessionTable,
    /// Last known online set per subscribed service type, refreshed by
    /// both the subscribe reply and later broadcasts.
    subscriptions: DashMap<u16, Vec<ServiceInfo>>,
    ping: Mutex<PingTracker>,
    send_queue: Mutex<VecDeque<Vec<u8>>>,
    send_notify: Notify,
    inbound_tx: mpsc::UnboundedSender<(ShmHeader, Vec<u8>)>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(ShmHeader, Vec<u8>)>>,
    cancel: CancellationToken,
}

impl GateConnector {
    /// Registers with the gate listening at `addr`, opens the shared-memory
    /// channel it hands back, and starts the background loops.
    pub async fn connect(
        addr: SocketAddr,
        id: u16,
        service_type: u16,
        channel_size: u32,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let facade = Arc::new(Facade::new());
        let link = TcpLink::connect(
            addr,
            1,
            Arc::clone(&facade),
            CONTROL_CONNECT_TIMEOUT,
            cancel.child_token(),
        )
        .await?;

        let req = ServiceRegisterReq { id, service_type, channel_size };
        let payload = req.serialize()?;
        link.write_frame(
            &NetHeader::new(SERVICE_REGISTER_REQ, payload.len() as u32, 0),
            &payload,
        )
        .await?;

        let header_bytes = facade.read_exact(1, NET_HEADER_LEN).await?;
        let header = NetHeader::parse(&header_bytes)?;
        anyhow::ensure!(
            header.msg_id() == SERVICE_REGISTER_ACK,
            "expected service_register_ack, got msg_id {}",
            header.msg_id()
        );
        let body = facade.read_exact(1, header.length() as usize).await?;
        let ack = ServiceRegisterAck::parse(&body)?;

        let channel = SharedChannel::open(
            &id.to_string(),
            &ack.gate_id.to_string(),
            channel_size as u64,
            ChannelSelect::new(),
        )?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let connector = Arc::new(Self {
            id,
            service_type,
            gate_id: ack.gate_id,
            link,
            facade,
            channel: Arc::new(channel),
            sessions: SessionTable::new(),
            subscriptions: DashMap::new(),
            ping: Mutex::new(PingTracker::new()),
            send_queue: Mutex::new(VecDeque::new()),
            send_notify: Notify::new(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            cancel,
        });

        tokio::spawn(Arc::clone(&connector).control_loop());
        tokio::spawn(Arc::clone(&connector).channel_read_loop());
        tokio::spawn(Arc::clone(&connector).channel_write_loop());
        tokio::spawn(Arc::clone(&connector).auto_ping_loop());

        Ok(connector)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn service_type(&self) -> u16 {
        self.service_type
    }

    pub fn gate_id(&self) -> u16 {
        self.gate_id
    }

    /// Subscribes to `service_type`'s online set, returning the current
    /// snapshot and refreshing the cache [`Self::rand_subscribe`] reads.
    pub async fn subscribe(
        &self,
        service_type: u16,
        timeout: Duration,
    ) -> anyhow::Result<Vec<ServiceInfo>> {
        let (session_id, rx) = self.sessions.create_session();
        self.send_control(
            SERVICE_SUBSCRIBE_REQ,
            session_id,
            &ServiceSubscribeReq { service_type },
        )
        .await?;
        let bytes = call_with_timeout(rx, timeout)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let ack = ServiceSubscribeAck::parse(&bytes)?;
        self.subscriptions.insert(service_type, ack.services.clone());
        Ok(ack.services)
    }

    /// Picks a uniformly random *online* service of `service_type` from the
    /// last snapshot [`Self::subscribe`] (or a broadcast) delivered. `None`
    /// if nothing has been subscribed yet, or nothing online.
    pub fn rand_subscribe(&self, service_type: u16) -> Option<ServiceInfo> {
        let services = self.subscriptions.get(&service_type)?;
        let online: Vec<&ServiceInfo> = services.iter().filter(|s| s.online).collect();
        if online.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..online.len());
        Some(online[idx].clone())
    }

    /// Sends `req` to service `to` over the shared-memory channel and waits
    /// for a reply of the expected shape. The data path is the channel, not
    /// TCP — only the register/subscribe/ping control plane rides TCP.
    pub async fn call<Req: Codec, Resp: Codec>(
        &self,
        to: u16,
        msg_id: u16,
        req: &Req,
        timeout: Duration,
    ) -> anyhow::Result<Resp> {
        let (session_id, rx) = self.sessions.create_session();
        let payload = req.serialize()?;
        let shm_header = ShmHeader::new(self.id, to, msg_id, session_id);
        let mut frame = Vec::with_capacity(SHM_HEADER_LEN + payload.len());
        frame.extend_from_slice(&shm_header.to_bytes());
        frame.extend_from_slice(&payload);

        self.send_queue.lock().push_back(frame);
        self.send_notify.notify_one();

        let bytes = call_with_timeout(rx, timeout)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Resp::parse(&bytes).map_err(Into::into)
    }

    /// Receives the next inbound channel frame that wasn't claimed as an
    /// RPC reply — i.e. an incoming call from another service, forwarded
    /// here by the gate. `None` once the connector has shut down.
    pub async fn recv_inbound(&self) -> Option<(ShmHeader, Vec<u8>)> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Answers an inbound call, reusing its `session` so the original
    /// caller's [`crate::rpc::SessionTable`] entry resumes. `msg_id` must be
    /// an `S2sAck`-category id (the only category [`MsgId::routes_to_rpc`]
    /// resumes a pending session for); any other category is delivered to
    /// the peer's [`Self::recv_inbound`] queue instead.
    pub async fn reply<Resp: Codec>(&self, to: u16, msg_id: u16, session: u64, resp: &Resp) -> anyhow::Result<()> {
        let payload = resp.serialize()?;
        let shm_header = ShmHeader::new(self.id, to, msg_id, session);
        let mut frame = Vec::with_capacity(SHM_HEADER_LEN + payload.len());
        frame.extend_from_slice(&shm_header.to_bytes());
        frame.extend_from_slice(&payload);
        self.send_queue.lock().push_back(frame);
        self.send_notify.notify_one();
        Ok(())
    }

    async fn send_control(&self, msg_id: u16, session: u64, body: &impl Codec) -> anyhow::Result<()> {
        let payload = body.serialize()?;
        let header = NetHeader::new(msg_id, payload.len() as u32, session);
        self.link.write_frame(&header, &payload).await
    }

    async fn control_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                header_bytes = self.facade.read_exact(1, NET_HEADER_LEN) => {
                    let header_bytes = match header_bytes {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(gate_id = self.gate_id, "gate connector control link closed: {e}");
                            return;
                        }
                    };
                    let header = match NetHeader::parse(&header_bytes) {
                        Ok(h) => h,
                        Err(e) => {
                            warn!("gate connector: bad control header: {e}");
                            continue;
                        }
                    };
                    let payload = match self.facade.read_exact(1, header.length() as usize).await {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(gate_id = self.gate_id, "gate connector control link closed: {e}");
                            return;
                        }
                    };
                    self.dispatch_control(header.msg_id(), header.session(), payload);
                }
            }
        }
    }

    fn dispatch_control(&self, msg_id: u16, session: u64, payload: Vec<u8>) {
        match msg_id {
            SERVICE_SUBSCRIBE_ACK if session != 0 => {
                self.sessions.wake_up_session(session, payload);
            }
            SERVICE_SUBSCRIBE_BRD => match ServiceSubscribeBrd::parse(&payload) {
                Ok(brd) => {
                    self.subscriptions.insert(brd.service_type, brd.services);
                }
                Err(e) => warn!("gate connector: unparsable service_subscribe_brd: {e}"),
            },
            PING_ACK => self.ping.lock().ping_acked(),
            other => warn!(msg_id = other, "gate connector: unhandled control message"),
        }
    }

    async fn channel_read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; READ_BUF_INITIAL];
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let n = match self.channel.read(&mut buf).await {
                Some(n) => n as usize,
                None => {
                    // The frame that arrived doesn't fit; grow and retry.
                    let grown = (buf.len() * 2).min(READ_BUF_CAP);
                    if grown == buf.len() {
                        warn!("gate connector: inbound frame exceeds max buffer, dropping channel reader");
                        return;
                    }
                    buf.resize(grown, 0);
                    continue;
                }
            };
            if n < SHM_HEADER_LEN {
                warn!("gate connector: inbound shm frame shorter than header, dropping");
                continue;
            }
            let header = match ShmHeader::parse(&buf[..SHM_HEADER_LEN]) {
                Ok(h) => h,
                Err(e) => {
                    warn!("gate connector: bad shm header: {e}");
                    continue;
                }
            };
            let payload = buf[SHM_HEADER_LEN..n].to_vec();
            let msg_id = MsgId(header.msg_id());
            if msg_id.routes_to_rpc(header.session()) {
                self.sessions.wake_up_session(header.session(), payload);
            } else if self.inbound_tx.send((header, payload)).is_err() {
                return;
            }
        }
    }

    async fn channel_write_loop(self: Arc<Self>) {
        loop {
            let frame = loop {
                if self.cancel.is_cancelled() {
                    return;
                }
                if let Some(frame) = self.send_queue.lock().pop_front() {
                    break frame;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.send_notify.notified() => {}
                }
            };
            self.channel.write(&frame).await;
        }
    }

    async fn auto_ping_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(AUTO_PING_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.ping.lock().ping_sent();
                    if let Err(e) = self.link.write_frame(&NetHeader::new(PING_REQ, 0, 0), &[]).await {
                        warn!(gate_id = self.gate_id, "gate connector ping failed: {e}");
                        continue;
                    }
                    tokio::time::sleep(AUTO_PING_TIMEOUT).await;
                    if self.ping.lock().ping_pending() {
                        warn!(gate_id = self.gate_id, "no ping ack from gate within timeout");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use tokio::net::TcpListener;

    use super::*;
    use crate::net::msg_id::MsgCategory;

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    async fn spawn_mock_gate(listener: TcpListener, gate_id: u16) -> SocketAddr {
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let facade = Arc::new(Facade::new());
            let (stream, _remote) = listener.accept().await.expect("accept");
            stream.set_nodelay(true).expect("nodelay");
            let link =
                TcpLink::from_stream(stream, 1, Arc::clone(&facade), CancellationToken::new());

            let header_bytes = facade.read_exact(1, NET_HEADER_LEN).await.expect("header");
            let header = NetHeader::parse(&header_bytes).expect("parse");
            assert_eq!(header.msg_id(), SERVICE_REGISTER_REQ);
            let body = facade
                .read_exact(1, header.length() as usize)
                .await
                .expect("body");
            let req = ServiceRegisterReq::parse(&body).expect("parse req");

            let ack = ServiceRegisterAck { gate_id };
            let ack_bytes = ack.serialize().expect("serialize");
            link.write_frame(
                &NetHeader::new(SERVICE_REGISTER_ACK, ack_bytes.len() as u32, 0),
                &ack_bytes,
            )
            .await
            .expect("write ack");

            let gate_channel = SharedChannel::open(
                &gate_id.to_string(),
                &req.id.to_string(),
                req.channel_size as u64,
                ChannelSelect::new(),
            )
            .expect("open gate-side channel");

            // Echo exactly one inbound application frame back to its sender.
            let mut buf = vec![0u8; 16 * 1024];
            if let Some(n) = gate_channel.read(&mut buf).await {
                let inbound = ShmHeader::parse(&buf[..SHM_HEADER_LEN]).expect("parse shm header");
                let payload = &buf[SHM_HEADER_LEN..n as usize];
                let reply_msg_id = MsgId::new(MsgCategory::S2sAck, 1).0;
                let reply_header =
                    ShmHeader::new(inbound.to_service(), inbound.from_service(), reply_msg_id, inbound.session());
                let mut reply = Vec::new();
                reply.extend_from_slice(&reply_header.to_bytes());
                reply.extend_from_slice(payload);
                gate_channel.write(&reply).await;
            }

            // Keep the task (and its shared-memory handles) alive until the
            // test process exits; dropping them early would tear the rings
            // down mid-read on the connector side.
            std::future::pending::<()>().await;
        });
        addr
    }

    #[tokio::test]
    async fn connect_performs_register_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = spawn_mock_gate(listener, 99).await;

        let connector = GateConnector::connect(addr, 10, 7, 65536, CancellationToken::new())
            .await
            .expect("connect");
        assert_eq!(connector.gate_id(), 99);
        assert_eq!(connector.id(), 10);
    }

    #[tokio::test]
    async fn call_round_trips_over_the_shared_memory_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = spawn_mock_gate(listener, 5).await;

        let connector = GateConnector::connect(addr, 11, 7, 65536, CancellationToken::new())
            .await
            .expect("connect");

        let req = Echo { text: "hello gate".into() };
        let reply: Echo = tokio::time::timeout(
            Duration::from_secs(2),
            connector.call(5, MsgId::new(MsgCategory::S2sReq, 50).0, &req, Duration::from_secs(1)),
        )
        .await
        .expect("no timeout")
        .expect("call ok");
        assert_eq!(reply.text, "hello gate");
    }

    #[tokio::test]
    async fn rand_subscribe_picks_only_online_entries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = spawn_mock_gate(listener, 3).await;
        let connector = GateConnector::connect(addr, 12, 7, 65536, CancellationToken::new())
            .await
            .expect("connect");

        assert!(connector.rand_subscribe(7).is_none());

        connector.dispatch_control(
            SERVICE_SUBSCRIBE_BRD,
            0,
            ServiceSubscribeBrd {
                service_type: 7,
                services: vec![
                    ServiceInfo { id: 1, service_type: 7, online: false },
                    ServiceInfo { id: 2, service_type: 7, online: true },
                ],
            }
            .serialize()
            .expect("serialize"),
        );

        let picked = connector.rand_subscribe(7).expect("one online entry");
        assert_eq!(picked.id, 2);
    }
}
