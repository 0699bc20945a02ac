// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A distributed service-mesh runtime for a multi-process game backend.
//!
//! Leaves first: a shared-memory SPSC ring buffer, a length-delimited
//! channel built on a pair of rings, a TCP/TLS/KCP network façade, an RPC
//! session registry, and a "gate" mesh that routes messages between
//! services identified by small integer IDs whether they are co-located or
//! remote.

pub mod app;
pub mod cfg;
pub mod error;
pub mod gate;
pub mod net;
pub mod ring;
pub mod rpc;
pub mod runtime;
pub mod utils;
