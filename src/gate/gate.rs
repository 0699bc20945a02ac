// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Gate (§4.13-4.14): the per-host router sitting between locally-attached
//! services (reached over shared memory, through [`crate::gate::connector`]
//! on their side and [`crate::gate::spill::SpillChannel`] on this one) and
//! the rest of the cluster (reached through the gate master's topology feed
//! and a direct TCP link to every peer gate that owns a remote service).
//!
//! Both listeners share the same accept/read-loop shape used everywhere
//! else in this crate; the registry this module keeps a local mirror of
//! is the same `DashMap`-keyed shape as [`crate::gate::service::Registry`].

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    gate::{
        messages::{
            GATE_FORWARD_BRD, GATE_REGISTER_ACK, GATE_REGISTER_BRD, GATE_REGISTER_REQ,
            GateForwardBrd, GateRegisterAck, GateRegisterBrd, GateRegisterReq, PING_ACK, PING_REQ,
            SERVICE_REGISTER_ACK, SERVICE_REGISTER_REQ, SERVICE_UPDATE_BRD, SERVICE_UPDATE_REQ,
            ServiceInfo, ServiceRegisterAck, ServiceRegisterReq, ServiceUpdateBrd,
            ServiceUpdateReq,
        },
        service::Registry,
        spill::SpillChannel,
    },
    net::{
        codec::Codec,
        facade::Facade,
        header::{NetHeader, SHM_HEADER_LEN, ShmHeader},
        transport::tcp::TcpLink,
    },
    ring::{channel::SharedChannel, select::ChannelSelect},
};

const DELAY_QUEUE_CAP: usize = 500;
const READ_BUF_INITIAL: usize = 16 * 1024;
const READ_BUF_CAP: usize = 4 * 1024 * 1024;

struct LocalService {
    channel: Arc<SharedChannel>,
    spill: Arc<SpillChannel>,
}

/// Where a forwarded frame's destination resolves to (§4.13's rule order).
#[derive(Debug, PartialEq, Eq)]
enum RouteDecision {
    Drop,
    Unknown,
    Local,
    Remote(u16),
}

/// The per-host router: one per gate process.
pub struct Gate {
    id: u16,
    addresses: Vec<String>,
    registry: Registry,
    local_services: DashMap<u16, Arc<LocalService>>,
    remote_links: DashMap<u16, Arc<TcpLink>>,
    master_link: Mutex<Option<Arc<TcpLink>>>,
    local_facade: Arc<Facade>,
    remote_facade: Arc<Facade>,
    master_facade: Arc<Facade>,
    /// Frames whose destination wasn't yet known when they arrived.
    /// Bounded, drop-oldest (no wire message exists to tell the original
    /// sender a frame was dropped, so this is a best-effort mailbox, not a
    /// guaranteed-delivery queue).
    delay_queue: Mutex<VecDeque<GateForwardBrd>>,
    next_socket_id: AtomicU64,
}

impl Gate {
    pub fn new(id: u16, addresses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            addresses,
            registry: Registry::new(),
            local_services: DashMap::new(),
            remote_links: DashMap::new(),
            master_link: Mutex::new(None),
            local_facade: Arc::new(Facade::new()),
            remote_facade: Arc::new(Facade::new()),
            master_facade: Arc::new(Facade::new()),
            delay_queue: Mutex::new(VecDeque::new()),
            next_socket_id: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    fn alloc_socket_id(&self) -> u64 {
        self.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }

    fn route_decision(&self, to: u16) -> RouteDecision {
        if to == 0 {
            return RouteDecision::Drop;
        }
        match self.registry.get(to) {
            None => RouteDecision::Unknown,
            Some(rec) if rec.gate_id == self.id => RouteDecision::Local,
            Some(rec) => RouteDecision::Remote(rec.gate_id),
        }
    }

    /// Routes one application frame per §4.13's rule order: drop `to == 0`,
    /// delay-queue an unknown destination, deliver locally over shared
    /// memory, or forward to the owning peer gate over TCP.
    pub async fn route(&self, from: u16, to: u16, msg_id: u16, session: u64, payload: Vec<u8>) {
        match self.route_decision(to) {
            RouteDecision::Drop => {}
            RouteDecision::Unknown => {
                self.delay(GateForwardBrd { from, to, msg_id, session, payload });
            }
            RouteDecision::Local => self.deliver_local(to, from, msg_id, session, &payload),
            RouteDecision::Remote(gate_id) => {
                self.forward_remote(gate_id, GateForwardBrd { from, to, msg_id, session, payload })
                    .await;
            }
        }
    }

    fn delay(&self, brd: GateForwardBrd) {
        let mut q = self.delay_queue.lock();
        if q.len() >= DELAY_QUEUE_CAP {
            q.pop_front();
            warn!("gate delay queue full, dropping oldest pending frame");
        }
        warn!(to = brd.to, "no known route for destination, delaying forward");
        q.push_back(brd);
    }

    /// Replays every delayed frame addressed to `id`, in arrival order, now
    /// that a route for it exists.
    fn flush_delayed_for(self: &Arc<Self>, id: u16) {
        let ready: Vec<GateForwardBrd> = {
            let mut q = self.delay_queue.lock();
            let mut remaining = VecDeque::with_capacity(q.len());
            let mut ready = Vec::new();
            while let Some(brd) = q.pop_front() {
                if brd.to == id {
                    ready.push(brd);
                } else {
                    remaining.push_back(brd);
                }
            }
            *q = remaining;
            ready
        };
        for brd in ready {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.route(brd.from, brd.to, brd.msg_id, brd.session, brd.payload).await;
            });
        }
    }

    fn deliver_local(&self, to: u16, from: u16, msg_id: u16, session: u64, payload: &[u8]) {
        let Some(entry) = self.local_services.get(&to) else {
            return;
        };
        let header = ShmHeader::new(from, to, msg_id, session);
        let mut frame = Vec::with_capacity(SHM_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        entry.spill.write(frame);
    }

    async fn forward_remote(&self, gate_id: u16, brd: GateForwardBrd) {
        let Some(link) = self.remote_links.get(&gate_id).map(|e| Arc::clone(e.value())) else {
            warn!(gate_id, to = brd.to, "no remote link to forward through, dropping");
            return;
        };
        let Ok(payload) = brd.serialize() else { return };
        let header = NetHeader::new(GATE_FORWARD_BRD, payload.len() as u32, 0);
        if let Err(e) = link.write_frame(&header, &payload).await {
            warn!(gate_id, "gate forward failed: {e}");
        }
    }

    /// Connects to the cluster's gate master, registers, applies the
    /// returned topology, dials every peer gate it names, and spawns the
    /// background task that keeps following the master's broadcasts.
    pub async fn connect_master(
        self: &Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let link = TcpLink::connect(
            addr,
            0,
            Arc::clone(&self.master_facade),
            std::time::Duration::from_secs(5),
            cancel.child_token(),
        )
        .await?;

        let req = GateRegisterReq { gate_id: self.id, addresses: self.addresses.clone(), services: vec![] };
        let payload = req.serialize()?;
        link.write_frame(&NetHeader::new(GATE_REGISTER_REQ, payload.len() as u32, 0), &payload)
            .await?;

        let header_bytes = self.master_facade.read_exact(0, crate::net::header::NET_HEADER_LEN).await?;
        let header = NetHeader::parse(&header_bytes)?;
        anyhow::ensure!(header.msg_id() == GATE_REGISTER_ACK, "expected gate_register_ack");
        let body = self.master_facade.read_exact(0, header.length() as usize).await?;
        let ack = GateRegisterAck::parse(&body)?;

        for gate in &ack.topology {
            for svc in &gate.services {
                let _ = self.registry.register_or_update(gate.id, svc.id, svc.service_type, svc.online);
            }
            self.dial_peer(gate.id, &gate.addresses, cancel.child_token()).await;
        }

        *self.master_link.lock() = Some(link);
        tokio::spawn(Arc::clone(self).master_read_loop(cancel));
        Ok(())
    }

    async fn dial_peer(self: &Arc<Self>, gate_id: u16, addresses: &[String], cancel: CancellationToken) {
        if gate_id == self.id || self.remote_links.contains_key(&gate_id) {
            return;
        }
        let Some(addr_str) = addresses.first() else { return };
        let Ok(addr) = addr_str.parse::<SocketAddr>() else {
            warn!(gate_id, addr_str, "unparsable peer gate address");
            return;
        };
        let socket_id = self.alloc_socket_id();
        match TcpLink::connect(addr, socket_id, Arc::clone(&self.remote_facade), std::time::Duration::from_secs(5), cancel).await {
            Ok(link) => {
                info!(gate_id, %addr, "dialed peer gate");
                self.remote_links.insert(gate_id, link);
                self.flush_delayed_for(gate_id);
            }
            Err(e) => warn!(gate_id, %addr, "failed to dial peer gate: {e}"),
        }
    }

    async fn master_read_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                header_bytes = self.master_facade.read_exact(0, crate::net::header::NET_HEADER_LEN) => {
                    let Ok(header_bytes) = header_bytes else {
                        warn!("lost connection to gate master");
                        return;
                    };
                    let Ok(header) = NetHeader::parse(&header_bytes) else { continue };
                    let Ok(payload) = self.master_facade.read_exact(0, header.length() as usize).await else {
                        warn!("lost connection to gate master");
                        return;
                    };
                    self.dispatch_master(header.msg_id(), &payload, &cancel).await;
                }
            }
        }
    }

    async fn dispatch_master(self: &Arc<Self>, msg_id: u16, payload: &[u8], cancel: &CancellationToken) {
        match msg_id {
            GATE_REGISTER_BRD => {
                let Ok(brd) = GateRegisterBrd::parse(payload) else { return };
                for svc in &brd.gate.services {
                    let _ = self.registry.register_or_update(brd.gate.id, svc.id, svc.service_type, svc.online);
                    self.flush_delayed_for(svc.id);
                }
                self.dial_peer(brd.gate.id, &brd.gate.addresses, cancel.child_token()).await;
            }
            SERVICE_UPDATE_BRD => {
                let Ok(brd) = ServiceUpdateBrd::parse(payload) else { return };
                for svc in &brd.services {
                    let _ = self.registry.register_or_update(brd.gate_id, svc.id, svc.service_type, svc.online);
                    if svc.online {
                        self.flush_delayed_for(svc.id);
                    }
                }
            }
            PING_REQ => {
                if let Some(link) = self.master_link.lock().clone() {
                    let _ = link.write_frame(&NetHeader::new(PING_ACK, 0, 0), &[]).await;
                }
            }
            other => warn!(msg_id = other, "gate: unhandled master message"),
        }
    }

    async fn notify_master(&self, svc: ServiceInfo) {
        let Some(link) = self.master_link.lock().clone() else { return };
        let req = ServiceUpdateReq { gate_id: self.id, services: vec![svc] };
        let Ok(payload) = req.serialize() else { return };
        if let Err(e) = link
            .write_frame(&NetHeader::new(SERVICE_UPDATE_REQ, payload.len() as u32, 0), &payload)
            .await
        {
            warn!("failed to notify master of service update: {e}");
        }
    }

    /// Runs the local-service listener forever (or until cancelled).
    pub async fn serve_local(self: Arc<Self>, addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
        let facade = Arc::clone(&self.local_facade);
        let this = Arc::clone(&self);
        crate::net::transport::tcp::serve(
            addr,
            facade,
            cancel.clone(),
            {
                let this = Arc::clone(&this);
                move || this.alloc_socket_id()
            },
            move |link, remote| {
                let this = Arc::clone(&this);
                let cancel = cancel.child_token();
                async move {
                    info!(socket_id = link.socket_id, %remote, "service connected to gate");
                    tokio::spawn(this.local_register_handshake(link, cancel));
                }
            },
        )
        .await
    }

    async fn local_register_handshake(self: Arc<Self>, link: Arc<TcpLink>, cancel: CancellationToken) {
        let socket_id = link.socket_id;
        let header_bytes = match self.local_facade.read_exact(socket_id, crate::net::header::NET_HEADER_LEN).await {
            Ok(b) => b,
            Err(_) => return,
        };
        let Ok(header) = NetHeader::parse(&header_bytes) else { return };
        if header.msg_id() != SERVICE_REGISTER_REQ {
            warn!(socket_id, "expected service_register_req first");
            return;
        }
        let Ok(body) = self.local_facade.read_exact(socket_id, header.length() as usize).await else { return };
        let Ok(req) = ServiceRegisterReq::parse(&body) else { return };

        let channel = match SharedChannel::open(&self.id.to_string(), &req.id.to_string(), req.channel_size as u64, ChannelSelect::new()) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                warn!(socket_id, service_id = req.id, "failed to open local channel: {e}");
                return;
            }
        };
        let spill = SpillChannel::new(Arc::clone(&channel));
        self.local_services.insert(req.id, Arc::new(LocalService { channel: Arc::clone(&channel), spill }));
        let _ = self.registry.register_or_update(self.id, req.id, req.service_type, true);

        let ack = ServiceRegisterAck { gate_id: self.id };
        if let Ok(payload) = ack.serialize() {
            let _ = link.write_frame(&NetHeader::new(SERVICE_REGISTER_ACK, payload.len() as u32, 0), &payload).await;
        }

        self.notify_master(ServiceInfo { id: req.id, service_type: req.service_type, online: true }).await;
        self.flush_delayed_for(req.id);

        tokio::spawn(Arc::clone(&self).local_read_loop(req.id, channel));
        tokio::spawn(Arc::clone(&self).local_control_loop(req.id, req.service_type, link, cancel));
    }

    /// Reads application frames this service wrote into its outbound ring
    /// and routes each one per the destination it carries.
    async fn local_read_loop(self: Arc<Self>, service_id: u16, channel: Arc<SharedChannel>) {
        let mut buf = vec![0u8; READ_BUF_INITIAL];
        loop {
            let n = match channel.read(&mut buf).await {
                Some(n) => n as usize,
                None => {
                    let grown = (buf.len() * 2).min(READ_BUF_CAP);
                    if grown == buf.len() {
                        warn!(service_id, "inbound local frame exceeds max buffer, dropping reader");
                        return;
                    }
                    buf.resize(grown, 0);
                    continue;
                }
            };
            if n < SHM_HEADER_LEN {
                continue;
            }
            let Ok(header) = ShmHeader::parse(&buf[..SHM_HEADER_LEN]) else { continue };
            let payload = buf[SHM_HEADER_LEN..n].to_vec();
            self.route(header.from_service(), header.to_service(), header.msg_id(), header.session(), payload).await;
        }
    }

    /// Keeps the TCP control link to one local service alive for pings and
    /// its online/offline state; the service's own connector drives the
    /// actual ping cadence, this side just answers and notices the hangup.
    async fn local_control_loop(self: Arc<Self>, service_id: u16, service_type: u16, link: Arc<TcpLink>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                header_bytes = self.local_facade.read_exact(link.socket_id, crate::net::header::NET_HEADER_LEN) => {
                    let Ok(header_bytes) = header_bytes else { break; };
                    let Ok(header) = NetHeader::parse(&header_bytes) else { continue };
                    let payload = if header.length() > 0 {
                        match self.local_facade.read_exact(link.socket_id, header.length() as usize).await {
                            Ok(p) => p,
                            Err(_) => break,
                        }
                    } else {
                        Vec::new()
                    };
                    match header.msg_id() {
                        PING_REQ => { let _ = link.write_frame(&NetHeader::new(PING_ACK, 0, 0), &[]).await; }
                        other => warn!(service_id, msg_id = other, "gate: unhandled service control message"),
                    }
                }
            }
        }
        self.local_services.remove(&service_id);
        let _ = self.registry.register_or_update(self.id, service_id, service_type, false);
        self.notify_master(ServiceInfo { id: service_id, service_type, online: false }).await;
    }

    /// Runs the peer-gate listener forever: accepted links only ever carry
    /// forwarded application frames from a peer that already knows the
    /// destination is ours.
    pub async fn serve_remote(self: Arc<Self>, addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
        let facade = Arc::clone(&self.remote_facade);
        let this = Arc::clone(&self);
        crate::net::transport::tcp::serve(
            addr,
            facade,
            cancel.clone(),
            {
                let this = Arc::clone(&this);
                move || this.alloc_socket_id()
            },
            move |link, remote| {
                let this = Arc::clone(&this);
                let cancel = cancel.child_token();
                async move {
                    info!(socket_id = link.socket_id, %remote, "peer gate connected");
                    tokio::spawn(this.remote_peer_loop(link, cancel));
                }
            },
        )
        .await
    }

    async fn remote_peer_loop(self: Arc<Self>, link: Arc<TcpLink>, cancel: CancellationToken) {
        let socket_id = link.socket_id;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                header_bytes = self.remote_facade.read_exact(socket_id, crate::net::header::NET_HEADER_LEN) => {
                    let Ok(header_bytes) = header_bytes else { return; };
                    let Ok(header) = NetHeader::parse(&header_bytes) else { continue };
                    let Ok(payload) = self.remote_facade.read_exact(socket_id, header.length() as usize).await else { return; };
                    match header.msg_id() {
                        GATE_FORWARD_BRD => {
                            if let Ok(brd) = GateForwardBrd::parse(&payload) {
                                self.deliver_local(brd.to, brd.from, brd.msg_id, brd.session, &brd.payload);
                            }
                        }
                        PING_REQ => { let _ = link.write_frame(&NetHeader::new(PING_ACK, 0, 0), &[]).await; }
                        other => warn!(socket_id, msg_id = other, "gate: unhandled peer message"),
                    }
                }
            }
        }
    }
}
