// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The shared-memory ring buffer (§4.5), the paired-ring channel built on
//! top of it (§4.6), and the background poll loop that lets async code
//! await channel readiness (§4.7).

pub mod buffer;
pub mod channel;
pub mod select;

pub use buffer::RingBuffer;
pub use channel::SharedChannel;
