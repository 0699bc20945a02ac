// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Gate master (§4.12): the cluster-wide singleton that tracks every
//! gate's topology and broadcasts deltas.
//!
//! Message dispatch is one task per peer socket reading `NetHeader`-framed
//! messages off [`crate::net::facade::Facade`] and dispatching on `msg_id`,
//! the same read-loop shape used for every other socket in this crate,
//! generalized to N concurrently-connected gates.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    gate::{
        messages::{
            GATE_REGISTER_ACK, GATE_REGISTER_BRD, GATE_REGISTER_REQ, GateInfo, GateRegisterAck,
            GateRegisterBrd, GateRegisterReq, PING_ACK, PING_REQ, SERVICE_UPDATE_BRD,
            SERVICE_UPDATE_REQ, ServiceInfo, ServiceUpdateBrd, ServiceUpdateReq,
        },
        service::{Registry, RegistryError},
    },
    net::{codec::Codec, facade::Facade, header::NetHeader, transport::tcp::TcpLink},
};

/// Per-peer-gate watchdog window: jittered 60-240s (§4.12).
fn watchdog_timeout() -> Duration {
    Duration::from_secs(rand::rng().random_range(60..=240))
}

struct GateRecord {
    id: u16,
    addresses: Vec<String>,
    socket_id: u64,
}

/// The cluster-wide topology tracker plus the TCP wiring that serves it.
pub struct GateMaster {
    registry: Registry,
    gates: DashMap<u16, GateRecord>,
    gate_of_socket: DashMap<u64, u16>,
    facade: Arc<Facade>,
    links: DashMap<u64, Arc<TcpLink>>,
    next_socket_id: AtomicU64,
}

impl GateMaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            gates: DashMap::new(),
            gate_of_socket: DashMap::new(),
            facade: Arc::new(Facade::new()),
            links: DashMap::new(),
            next_socket_id: AtomicU64::new(1),
        })
    }

    fn alloc_socket_id(&self) -> u64 {
        self.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Pure handler: validates and applies a `gate_register_req`, returning
    /// the ack to send back to the registering gate and the broadcast to
    /// fan out to every other currently-connected gate.
    pub fn handle_gate_register(
        &self,
        socket_id: u64,
        req: GateRegisterReq,
    ) -> Result<(GateRegisterAck, GateRegisterBrd), RegistryError> {
        for svc in &req.services {
            self.registry
                .register_or_update(req.gate_id, svc.id, svc.service_type, svc.online)?;
        }

        let topology: Vec<GateInfo> = self
            .gates
            .iter()
            .filter(|e| *e.key() != req.gate_id)
            .map(|e| GateInfo {
                id: e.id,
                addresses: e.addresses.clone(),
                services: self
                    .registry
                    .services_of_gate(e.id)
                    .into_iter()
                    .map(|s| ServiceInfo { id: s.id, service_type: s.service_type, online: s.online })
                    .collect(),
            })
            .collect();

        self.gates.insert(
            req.gate_id,
            GateRecord { id: req.gate_id, addresses: req.addresses.clone(), socket_id },
        );
        self.gate_of_socket.insert(socket_id, req.gate_id);

        let brd = GateRegisterBrd {
            gate: GateInfo {
                id: req.gate_id,
                addresses: req.addresses,
                services: req.services,
            },
        };
        Ok((GateRegisterAck { topology }, brd))
    }

    /// Pure handler: validates and applies a `service_update_req`.
    pub fn handle_service_update(
        &self,
        req: ServiceUpdateReq,
    ) -> Result<ServiceUpdateBrd, RegistryError> {
        for svc in &req.services {
            self.registry
                .register_or_update(req.gate_id, svc.id, svc.service_type, svc.online)?;
        }
        Ok(ServiceUpdateBrd { gate_id: req.gate_id, services: req.services })
    }

    /// A peer socket disconnected: evict every service it owned and build
    /// the broadcast announcing them offline (Open Question 1: the
    /// record itself is removed, not merely flipped — see
    /// `gate::service::Registry::mark_gate_offline_and_evict`).
    pub fn handle_disconnect(&self, socket_id: u64) -> Option<ServiceUpdateBrd> {
        let (_, gate_id) = self.gate_of_socket.remove(&socket_id)?;
        self.gates.remove(&gate_id);
        let removed = self.registry.mark_gate_offline_and_evict(gate_id);
        if removed.is_empty() {
            return None;
        }
        Some(ServiceUpdateBrd {
            gate_id,
            services: removed
                .into_iter()
                .map(|s| ServiceInfo { id: s.id, service_type: s.service_type, online: false })
                .collect(),
        })
    }

    fn other_socket_ids(&self, except_gate: u16) -> Vec<u64> {
        self.gates
            .iter()
            .filter(|e| *e.key() != except_gate)
            .map(|e| e.socket_id)
            .collect()
    }

    async fn send(&self, socket_id: u64, msg_id: u16, body: &impl Codec) {
        let Some(link) = self.links.get(&socket_id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let Ok(payload) = body.serialize() else {
            warn!(socket_id, "failed to serialize outgoing gate-master frame");
            return;
        };
        let header = NetHeader::new(msg_id, payload.len() as u32, 0);
        if let Err(e) = link.write_frame(&header, &payload).await {
            warn!(socket_id, "gate-master write failed: {e}");
        }
    }

    async fn broadcast(&self, except_gate: u16, msg_id: u16, body: &impl Codec) {
        for socket_id in self.other_socket_ids(except_gate) {
            self.send(socket_id, msg_id, body).await;
        }
    }

    /// Sends an empty-body frame — used for the ping round-trip, which
    /// carries no payload at all (§4.11), unlike every other message here
    /// which goes through the JSON `Codec`.
    async fn send_empty(&self, socket_id: u64, msg_id: u16) {
        let Some(link) = self.links.get(&socket_id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let header = NetHeader::new(msg_id, 0, 0);
        if let Err(e) = link.write_frame(&header, &[]).await {
            warn!(socket_id, "gate-master write failed: {e}");
        }
    }

    /// Runs the TCP accept loop forever (or until `cancel` fires), serving
    /// the master protocol on `addr`.
    pub async fn serve(self: Arc<Self>, addr: std::net::SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
        let facade = Arc::clone(&self.facade);
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
                    let socket_id = link.socket_id;
                    this.links.insert(socket_id, Arc::clone(&link));
                    info!(socket_id, %remote, "gate connected to master");
                    tokio::spawn(this.run_peer(socket_id, cancel));
                }
            },
        )
        .await
    }

    async fn run_peer(self: Arc<Self>, socket_id: u64, cancel: CancellationToken) {
        let result = self.peer_loop(socket_id, &cancel).await;
        if let Err(e) = result {
            if !e.is_ordinary_close() {
                warn!(socket_id, "gate-master peer loop failed: {e}");
            }
        }
        self.links.remove(&socket_id);
        if let Some(brd) = self.handle_disconnect(socket_id) {
            let gate_id = brd.gate_id;
            self.broadcast(gate_id, SERVICE_UPDATE_BRD, &brd).await;
        }
    }

    async fn peer_loop(
        &self,
        socket_id: u64,
        cancel: &CancellationToken,
    ) -> crate::error::MeshResult<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(watchdog_timeout()) => {
                    return Err(crate::error::MeshError::PeerDisconnected { reason: "watchdog timeout" });
                }
                header_bytes = self.facade.read_exact(socket_id, 16) => {
                    let header = NetHeader::parse(&header_bytes?).map_err(|_| {
                        crate::error::MeshError::FramingViolated("bad net header")
                    })?;
                    let payload = self.facade.read_exact(socket_id, header.length() as usize).await?;
                    self.dispatch(socket_id, header.msg_id(), &payload).await;
                }
            }
        }
    }

    async fn dispatch(&self, socket_id: u64, msg_id: u16, payload: &[u8]) {
        match msg_id {
            GATE_REGISTER_REQ => {
                let Ok(req) = GateRegisterReq::parse(payload) else {
                    warn!(socket_id, "unparsable gate_register_req");
                    return;
                };
                let gate_id = req.gate_id;
                match self.handle_gate_register(socket_id, req) {
                    Ok((ack, brd)) => {
                        self.send(socket_id, GATE_REGISTER_ACK, &ack).await;
                        self.broadcast(gate_id, GATE_REGISTER_BRD, &brd).await;
                    }
                    Err(e) => warn!(socket_id, "gate_register_req rejected: {e}"),
                }
            }
            SERVICE_UPDATE_REQ => {
                let Ok(req) = ServiceUpdateReq::parse(payload) else {
                    warn!(socket_id, "unparsable service_update_req");
                    return;
                };
                let gate_id = req.gate_id;
                match self.handle_service_update(req) {
                    Ok(brd) => self.broadcast(gate_id, SERVICE_UPDATE_BRD, &brd).await,
                    Err(e) => warn!(socket_id, "service_update_req rejected: {e}"),
                }
            }
            PING_REQ => self.send_empty(socket_id, PING_ACK).await,
            other => warn!(socket_id, msg_id = other, "gate master: unknown message id"),
        }
    }
}
