// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Local channel with a spill queue (§4.14): wraps one direction of a
//! [`SharedChannel`] so a writer never blocks on ring capacity. A full ring
//! spills into an in-process `VecDeque`; a background task drains it one
//! frame at a time as capacity frees up, preserving arrival order.
//!
//! Grounded in [`crate::ring::select::ChannelSelect`]'s own producer/
//! consumer split: the select thread resumes a suspended writer the same
//! way this module's drain loop resumes a spilled one, just one layer up
//! (in-process queue instead of a condvar-polled ring).

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::ring::channel::SharedChannel;

/// One service's outbound half: absorbs backpressure from a possibly-full
/// ring without ever blocking [`Self::write`].
pub struct SpillChannel {
    channel: Arc<SharedChannel>,
    spill: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl SpillChannel {
    /// Wraps `channel` and starts the drain loop.
    pub fn new(channel: Arc<SharedChannel>) -> Arc<Self> {
        let this = Arc::new(Self {
            channel,
            spill: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        tokio::spawn(Arc::clone(&this).drain_loop());
        this
    }

    /// Non-blocking. If nothing is already spilled and the ring has room,
    /// writes immediately; otherwise queues behind whatever's pending so
    /// order is preserved once the drain loop catches up.
    pub fn write(&self, frame: Vec<u8>) {
        let mut spill = self.spill.lock();
        if spill.is_empty() && self.channel.try_write(&frame) {
            return;
        }
        spill.push_back(frame);
        drop(spill);
        self.notify.notify_one();
    }

    pub fn spilled_len(&self) -> usize {
        self.spill.lock().len()
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            let frame = loop {
                if let Some(frame) = self.spill.lock().front().cloned() {
                    break frame;
                }
                self.notify.notified().await;
            };
            self.channel.write(&frame).await;
            self.spill.lock().pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ring::select::ChannelSelect;

    fn unique_tag(tag: &str) -> String {
        format!(
            "{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        )
    }

    #[tokio::test]
    async fn write_goes_straight_through_when_the_ring_has_room() {
        let tag = unique_tag("direct");
        let select = ChannelSelect::new();
        let a = SharedChannel::open(&format!("a-{tag}"), &format!("b-{tag}"), 4096, select.clone())
            .expect("open a");
        let b = SharedChannel::open(&format!("b-{tag}"), &format!("a-{tag}"), 4096, select)
            .expect("open b");

        let spill = SpillChannel::new(Arc::new(a));
        spill.write(b"hello".to_vec());
        assert_eq!(spill.spilled_len(), 0);

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), b.read(&mut buf))
            .await
            .expect("no timeout")
            .expect("frame");
        assert_eq!(&buf[..n as usize], b"hello");
    }

    #[tokio::test]
    async fn a_full_ring_spills_and_the_drain_loop_delivers_once_room_frees() {
        let tag = unique_tag("spill");
        let select = ChannelSelect::new();
        // Capacity just barely fits one small frame at a time.
        let a = SharedChannel::open(&format!("a-{tag}"), &format!("b-{tag}"), 16, select.clone())
            .expect("open a");
        let b = SharedChannel::open(&format!("b-{tag}"), &format!("a-{tag}"), 16, select)
            .expect("open b");

        let spill = SpillChannel::new(Arc::new(a));
        spill.write(b"one".to_vec());
        spill.write(b"two".to_vec());
        spill.write(b"three".to_vec());

        let mut seen = Vec::new();
        let mut buf = [0u8; 16];
        for _ in 0..3 {
            let n = tokio::time::timeout(Duration::from_secs(2), b.read(&mut buf))
                .await
                .expect("no timeout")
                .expect("frame");
            seen.push(buf[..n as usize].to_vec());
        }
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }
}
