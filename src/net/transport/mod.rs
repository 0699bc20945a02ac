// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Socket transports (§4.8): TCP, TLS, and a KCP-like reliable-UDP state
//! machine. All three read loops push bytes into a [`crate::net::facade::Facade`]
//! record and all three write paths frame through [`crate::net::header::NetHeader`].
//!
//! Per the design notes' "replace virtual dispatch on socket base with a
//! tagged variant", these are concrete structs rather than a shared trait
//! object — TCP and TLS share a framing shape closely enough to read
//! almost identically, while KCP's handshake/ARQ state machine is
//! self-contained and never needs to be used polymorphically alongside
//! them in this crate (gate/master/connector links are always TCP).

pub mod kcp;
pub mod tcp;
pub mod tls;
