// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use gatemesh::rpc::{SessionTable, call_with_timeout};

// Many concurrent callers wait on one shared table; each must be resumed
// with its own reply and nothing else's, even under contention.
#[tokio::test]
async fn concurrent_callers_each_get_their_own_reply() {
    let table = Arc::new(SessionTable::new());

    let mut ids = Vec::new();
    let mut waiters = Vec::new();
    for _ in 0u64..20 {
        let (id, rx) = table.create_session();
        ids.push(id);
        waiters.push(tokio::spawn(async move {
            call_with_timeout(rx, Duration::from_secs(5)).await
        }));
    }
    assert_eq!(table.pending_count(), 20);

    // Wake sessions out of order to confirm each waiter gets the reply
    // keyed to its own id, not whichever session was woken first.
    for id in ids.iter().rev() {
        assert!(table.wake_up_session(*id, id.to_le_bytes().to_vec()));
    }

    for (id, handle) in ids.into_iter().zip(waiters) {
        let reply = handle.await.expect("task").expect("reply");
        assert_eq!(reply, id.to_le_bytes().to_vec());
    }
    assert_eq!(table.pending_count(), 0);
}

#[tokio::test]
async fn cancel_all_unblocks_every_outstanding_caller_on_teardown() {
    let table = Arc::new(SessionTable::new());
    let mut callers = Vec::new();
    for _ in 0..10 {
        let table = Arc::clone(&table);
        callers.push(tokio::spawn(async move {
            let (_id, rx) = table.create_session();
            call_with_timeout(rx, Duration::from_secs(30)).await
        }));
    }

    while table.pending_count() < 10 {
        tokio::task::yield_now().await;
    }
    table.cancel_all();

    for handle in callers {
        let result = handle.await.expect("task");
        assert!(result.is_err());
    }
}

#[tokio::test]
async fn a_reply_that_arrives_after_timeout_finds_nothing_pending() {
    let table = SessionTable::new();
    let (id, rx) = table.create_session();

    let result = call_with_timeout(rx, Duration::from_millis(5)).await;
    assert!(result.is_err());

    // The timed-out receiver is dropped by the time this fires; the table
    // still thinks the session is live until something removes it, so a
    // stray late reply is a harmless no-op rather than a panic or a stale
    // delivery to a waiter that already gave up.
    assert!(!table.wake_up_session(id, b"too late".to_vec()));
}
