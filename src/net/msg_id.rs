// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Message ID space (§3): a 16-bit ID partitioned by its top 3 bits into
//! one of seven categories, used to decide whether an inbound frame
//! resumes a pending RPC session or dispatches to a handler — the same
//! role the original's `(header.id & game::msg_mask) != game::msg_s2s_ack`
//! check plays in `gate_connector.cpp`.

const CATEGORY_SHIFT: u16 = 13;
pub const CATEGORY_MASK: u16 = 0b111 << CATEGORY_SHIFT;
pub const SEQUENCE_MASK: u16 = !CATEGORY_MASK;

/// One of the seven message categories named in §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgCategory {
    /// Client-to-server request.
    C2sReq,
    /// Server-to-client reply (ack).
    S2cAck,
    /// Client-to-server broadcast-subscribe traffic.
    C2sBrd,
    /// Server-to-client broadcast.
    S2cBrd,
    /// Service-to-service request.
    S2sReq,
    /// Service-to-service reply (ack) — the category that resumes RPC
    /// sessions (§4.9's `session != 0` check applies only here).
    S2sAck,
    /// Service-to-service broadcast (e.g. `service_subscribe_brd`,
    /// `s_gate_forward_brd`).
    S2sBrd,
}

impl MsgCategory {
    const fn raw(self) -> u16 {
        match self {
            MsgCategory::C2sReq => 0,
            MsgCategory::S2cAck => 1,
            MsgCategory::C2sBrd => 2,
            MsgCategory::S2cBrd => 3,
            MsgCategory::S2sReq => 4,
            MsgCategory::S2sAck => 5,
            MsgCategory::S2sBrd => 6,
        }
    }

    const fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => MsgCategory::C2sReq,
            1 => MsgCategory::S2cAck,
            2 => MsgCategory::C2sBrd,
            3 => MsgCategory::S2cBrd,
            4 => MsgCategory::S2sReq,
            5 => MsgCategory::S2sAck,
            6 => MsgCategory::S2sBrd,
            _ => return None,
        })
    }

    /// Whether a frame in this category is eligible to resume a pending
    /// RPC session — only service-to-service replies are (§4.9, §4.15).
    pub fn resumes_rpc(self) -> bool {
        matches!(self, MsgCategory::S2sAck)
    }
}

/// A full 16-bit message ID: a [`MsgCategory`] in the top 3 bits, a
/// 13-bit sequence/opcode value in the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgId(pub u16);

impl MsgId {
    pub const fn new(category: MsgCategory, sequence: u16) -> Self {
        MsgId((category.raw() << CATEGORY_SHIFT) | (sequence & SEQUENCE_MASK))
    }

    /// The category this ID's top 3 bits name, or `None` for the one
    /// unused code point (`0b111`, reserved).
    pub const fn category(self) -> Option<MsgCategory> {
        MsgCategory::from_raw((self.0 & CATEGORY_MASK) >> CATEGORY_SHIFT)
    }

    pub const fn sequence(self) -> u16 {
        self.0 & SEQUENCE_MASK
    }

    /// Mirrors the original's dispatch check: does this frame's category
    /// route to the RPC wait-map rather than a handler?
    pub fn routes_to_rpc(self, session: u64) -> bool {
        session != 0 && self.category().is_some_and(MsgCategory::resumes_rpc)
    }
}

impl From<u16> for MsgId {
    fn from(raw: u16) -> Self {
        MsgId(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_category_and_sequence() {
        let id = MsgId::new(MsgCategory::S2sReq, 77);
        assert_eq!(id.category(), Some(MsgCategory::S2sReq));
        assert_eq!(id.sequence(), 77);
    }

    #[test]
    fn only_s2s_ack_with_nonzero_session_routes_to_rpc() {
        let ack = MsgId::new(MsgCategory::S2sAck, 5);
        assert!(ack.routes_to_rpc(42));
        assert!(!ack.routes_to_rpc(0));

        let brd = MsgId::new(MsgCategory::S2sBrd, 5);
        assert!(!brd.routes_to_rpc(42));
    }
}
