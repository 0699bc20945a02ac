// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use gatemesh::ring::{channel::SharedChannel, select::ChannelSelect};

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

// A ring of 32 bytes can hold exactly one in-flight 12-byte frame (4-byte
// length prefix + 8-byte body); writing faster than the reader drains forces
// the writer to suspend on the channel-select loop every other send.
#[tokio::test]
async fn many_frames_survive_backpressure_in_order() {
    let tag = unique_tag("backpressure");
    let select = ChannelSelect::new();
    let producer = Arc::new(
        SharedChannel::open(&format!("p-{tag}"), &format!("c-{tag}"), 32, select.clone())
            .expect("open producer"),
    );
    let consumer = Arc::new(
        SharedChannel::open(&format!("c-{tag}"), &format!("p-{tag}"), 32, select).expect("open consumer"),
    );

    let writer = {
        let producer = Arc::clone(&producer);
        tokio::spawn(async move {
            for i in 0u64..50 {
                producer.write(&i.to_le_bytes()).await;
            }
        })
    };

    let mut received = Vec::new();
    let mut buf = [0u8; 16];
    while received.len() < 50 {
        let n = tokio::time::timeout(Duration::from_secs(5), consumer.read(&mut buf))
            .await
            .expect("no timeout")
            .expect("frame");
        assert_eq!(n, 8);
        received.push(u64::from_le_bytes(buf[..8].try_into().expect("8 bytes")));
    }

    writer.await.expect("writer task");
    assert_eq!(received, (0u64..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn oversized_frame_is_reported_as_need_more_without_consuming() {
    let tag = unique_tag("needmore");
    let select = ChannelSelect::new();
    let a = SharedChannel::open(&format!("a-{tag}"), &format!("b-{tag}"), 128, select.clone())
        .expect("open a");
    let b = SharedChannel::open(&format!("b-{tag}"), &format!("a-{tag}"), 128, select).expect("open b");

    a.write(b"a frame bigger than the reader's buffer").await;

    let mut small = [0u8; 4];
    assert_eq!(b.try_read(&mut small), gatemesh::ring::channel::TryRead::NeedMore(39));

    let mut big = [0u8; 64];
    let n = b.read(&mut big).await.expect("frame fits on retry");
    assert_eq!(&big[..n as usize], b"a frame bigger than the reader's buffer");
}
