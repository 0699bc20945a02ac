// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire message bodies exchanged between gate/master/connector (§4.12-4.15).
//!
//! Every body is `Codec`-encoded (`net::codec`, `serde_json` by default)
//! and carried behind a [`crate::net::header::NetHeader`] on TCP/TLS or a
//! [`crate::net::header::ShmHeader`] on a shared-memory channel. `msg_id`
//! constants below are assigned one sequence number per logical message
//! under the category that matches its direction, mirroring
//! `game::msg_*` constants in the original.

use serde::{Deserialize, Serialize};

use crate::net::msg_id::{MsgCategory, MsgId};

/// One service as carried inside registration/topology messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: u16,
    pub service_type: u16,
    pub online: bool,
}

/// One gate's full record as carried inside topology messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateInfo {
    pub id: u16,
    pub addresses: Vec<String>,
    pub services: Vec<ServiceInfo>,
}

/// Gate → master: register this gate (or update its address list) along
/// with the services it currently hosts (§4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRegisterReq {
    pub gate_id: u16,
    pub addresses: Vec<String>,
    pub services: Vec<ServiceInfo>,
}
pub const GATE_REGISTER_REQ: u16 = MsgId::new(MsgCategory::S2sReq, 1).0;

/// Master → gate: acknowledges registration, embedding the full topology
/// of every *other* currently-registered gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRegisterAck {
    pub topology: Vec<GateInfo>,
}
pub const GATE_REGISTER_ACK: u16 = MsgId::new(MsgCategory::S2sAck, 1).0;

/// Master → all other gates: broadcast the new/updated gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRegisterBrd {
    pub gate: GateInfo,
}
pub const GATE_REGISTER_BRD: u16 = MsgId::new(MsgCategory::S2sBrd, 1).0;

/// Gate → master: one or more of this gate's services changed online
/// state or are newly registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceUpdateReq {
    pub gate_id: u16,
    pub services: Vec<ServiceInfo>,
}
pub const SERVICE_UPDATE_REQ: u16 = MsgId::new(MsgCategory::S2sReq, 2).0;

/// Master → all other gates: broadcast a service online-state delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceUpdateBrd {
    pub gate_id: u16,
    pub services: Vec<ServiceInfo>,
}
pub const SERVICE_UPDATE_BRD: u16 = MsgId::new(MsgCategory::S2sBrd, 2).0;

/// Gate-to-master (and gate-to-gate keepalive) ping; empty body, §4.11.
pub const PING_REQ: u16 = crate::net::ping::PING_REQ_MSG_ID;
pub const PING_ACK: u16 = crate::net::ping::PING_ACK_MSG_ID;

/// Service → gate: register on this gate, requesting a shared-memory
/// channel of `channel_size` bytes (§4.15).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegisterReq {
    pub id: u16,
    pub service_type: u16,
    pub channel_size: u32,
}
pub const SERVICE_REGISTER_REQ: u16 = MsgId::new(MsgCategory::C2sReq, 1).0;

/// Gate → service: registration accepted; carries the gate's own ID so
/// the service can name its half of the shared-memory channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegisterAck {
    pub gate_id: u16,
}
pub const SERVICE_REGISTER_ACK: u16 = MsgId::new(MsgCategory::S2cAck, 1).0;

/// Service → gate: subscribe to the online set of a service type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSubscribeReq {
    pub service_type: u16,
}
pub const SERVICE_SUBSCRIBE_REQ: u16 = MsgId::new(MsgCategory::C2sReq, 2).0;

/// Gate → service: the subscribe call's reply, carrying the current set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSubscribeAck {
    pub service_type: u16,
    pub services: Vec<ServiceInfo>,
}
pub const SERVICE_SUBSCRIBE_ACK: u16 = MsgId::new(MsgCategory::S2cAck, 2).0;

/// Gate → subscribers: the online set of `service_type` changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSubscribeBrd {
    pub service_type: u16,
    pub services: Vec<ServiceInfo>,
}
pub const SERVICE_SUBSCRIBE_BRD: u16 = MsgId::new(MsgCategory::S2cBrd, 2).0;

/// Gate → peer gate: forward one application frame whose destination is
/// owned by that peer (§4.13 rule 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateForwardBrd {
    pub from: u16,
    pub to: u16,
    pub msg_id: u16,
    pub session: u64,
    pub payload: Vec<u8>,
}
pub const GATE_FORWARD_BRD: u16 = MsgId::new(MsgCategory::S2sBrd, 3).0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_fall_in_their_declared_category() {
        assert_eq!(MsgId(GATE_REGISTER_REQ).category(), Some(MsgCategory::S2sReq));
        assert_eq!(MsgId(GATE_REGISTER_ACK).category(), Some(MsgCategory::S2sAck));
        assert_eq!(MsgId(GATE_REGISTER_BRD).category(), Some(MsgCategory::S2sBrd));
        assert_eq!(MsgId(SERVICE_REGISTER_REQ).category(), Some(MsgCategory::C2sReq));
        assert_eq!(MsgId(SERVICE_SUBSCRIBE_BRD).category(), Some(MsgCategory::S2cBrd));
        assert_eq!(MsgId(GATE_FORWARD_BRD).category(), Some(MsgCategory::S2sBrd));
    }

    #[test]
    fn gate_forward_brd_round_trips_through_the_codec() {
        use crate::net::codec::Codec;
        let msg = GateForwardBrd {
            from: 20,
            to: 10,
            msg_id: 42,
            session: 0,
            payload: b"hi".to_vec(),
        };
        let bytes = msg.serialize().expect("serialize");
        let back = GateForwardBrd::parse(&bytes).expect("parse");
        assert_eq!(back.from, 20);
        assert_eq!(back.to, 10);
        assert_eq!(back.payload, b"hi");
    }
}
