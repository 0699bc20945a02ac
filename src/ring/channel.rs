// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Paired-ring message channel (§4.6): two [`RingBuffer`]s, one per
//! direction, each message framed as a little-endian `u32` length prefix
//! followed by the body.
//!
//! The pair is named from the ordered pair of endpoint strings so that
//! two processes opening the same logical channel from opposite ends
//! agree on which ring is whose outbound: `(local, remote)` writes to
//! `"local->remote"` and reads from `"remote->local"`. Whichever side
//! gets there first creates each ring; the other attaches.

use std::sync::Arc;

use anyhow::Result;

use crate::ring::buffer::RingBuffer;
use crate::ring::select::ChannelSelect;

const LEN_PREFIX: u64 = 4;

/// Outcome of a non-blocking read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum TryRead {
    /// No complete length prefix is available yet.
    Empty,
    /// A length prefix is available but `buf` is too small to hold the
    /// body; the channel is left untouched so the caller can retry with a
    /// bigger buffer.
    NeedMore(u32),
    /// A full frame of `0` bytes was read into `buf[..0]` — i.e. there was
    /// nothing to read.
    Frame(u32),
}

fn ring_name(local: &str, remote: &str) -> String {
    format!("/gatemesh-chan-{local}->{remote}")
}

fn create_or_open(name: &str, capacity: u64) -> Result<RingBuffer> {
    match RingBuffer::create(name, capacity) {
        Ok(ring) => Ok(ring),
        Err(_) => RingBuffer::open(name, capacity),
    }
}

/// A bidirectional message channel over a pair of shared-memory rings.
pub struct SharedChannel {
    outbound: Arc<RingBuffer>,
    inbound: Arc<RingBuffer>,
    select: ChannelSelect,
}

impl SharedChannel {
    /// Opens (creating either ring as needed) the channel named by the
    /// ordered pair `(local, remote)`, each ring sized `capacity` bytes.
    pub fn open(local: &str, remote: &str, capacity: u64, select: ChannelSelect) -> Result<Self> {
        let outbound = create_or_open(&ring_name(local, remote), capacity)?;
        let inbound = create_or_open(&ring_name(remote, local), capacity)?;
        Ok(Self {
            outbound: Arc::new(outbound),
            inbound: Arc::new(inbound),
            select,
        })
    }

    /// Non-blocking write of one message. Requires `4 + buf.len()` bytes
    /// of outbound capacity; stages the length prefix then the body and
    /// commits both in one step. Returns `false` (writes nothing) if there
    /// isn't enough room.
    pub fn try_write(&self, buf: &[u8]) -> bool {
        let n = buf.len() as u64;
        if self.outbound.writable() < LEN_PREFIX + n {
            return false;
        }
        let len_bytes = (buf.len() as u32).to_le_bytes();
        self.outbound.fill(&len_bytes, 0);
        self.outbound.fill(buf, LEN_PREFIX);
        self.outbound.commit_write(LEN_PREFIX + n);
        true
    }

    /// Non-blocking read of one message into `buf`. Non-consuming unless a
    /// full frame that fits is available.
    pub fn try_read(&self, buf: &mut [u8]) -> TryRead {
        if self.inbound.readable() < LEN_PREFIX {
            return TryRead::Empty;
        }
        let mut len_bytes = [0u8; 4];
        if !self.inbound.peek(&mut len_bytes, 0) {
            return TryRead::Empty;
        }
        let length = u32::from_le_bytes(len_bytes);

        if (buf.len() as u32) < length {
            return TryRead::NeedMore(length);
        }
        if self.inbound.readable() < LEN_PREFIX + length as u64 {
            return TryRead::Empty;
        }

        let dst = &mut buf[..length as usize];
        self.inbound.peek(dst, LEN_PREFIX);
        self.inbound.commit_read(LEN_PREFIX + length as u64);
        TryRead::Frame(length)
    }

    /// Writes one message, suspending on the channel-select loop until
    /// enough outbound capacity frees up.
    pub async fn write(&self, buf: &[u8]) {
        let needed = LEN_PREFIX + buf.len() as u64;
        loop {
            if self.try_write(buf) {
                return;
            }
            self.select
                .wait_writable(Arc::clone(&self.outbound), needed)
                .await;
        }
    }

    /// Reads one message into `buf`, suspending until a frame that fits is
    /// available. Returns the frame length, or `None` if the caller's
    /// buffer was too small for the frame that arrived (mirrors
    /// [`TryRead::NeedMore`] without the busy loop) — the frame is left in
    /// place so a retry with a bigger buffer still sees it.
    pub async fn read(&self, buf: &mut [u8]) -> Option<u32> {
        loop {
            match self.try_read(buf) {
                TryRead::Frame(n) => return Some(n),
                TryRead::NeedMore(_) => return None,
                TryRead::Empty => {
                    self.select
                        .wait_readable(Arc::clone(&self.inbound), LEN_PREFIX)
                        .await;
                }
            }
        }
    }
}
