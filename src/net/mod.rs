// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire-level networking: fixed headers (§3/§6), the message ID space
//! (§3), the façade that scheduler-side code awaits against (§4.9), the
//! TCP/TLS/KCP transports (§4.8), and WebSocket framing (§4.10).

pub mod codec;
pub mod facade;
pub mod header;
pub mod msg_id;
pub mod ping;
pub mod transport;
pub mod ws;

pub use codec::Codec;
pub use header::{NetHeader, ShmHeader};
pub use msg_id::MsgCategory;
