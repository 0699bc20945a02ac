// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use gatemesh::{
    gate::{Gate, GateConnector},
    net::{
        codec::Codec,
        msg_id::{MsgCategory, MsgId},
    },
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Ping {
    text: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Pong {
    text: String,
}

// Two services register against the same gate; a call from one to the
// other's id is delivered over shared memory through the gate's local
// routing path (no gate master, no remote peers involved) and the reply
// rides the same path back to resume the caller's session.
#[tokio::test]
async fn a_call_between_two_local_services_routes_through_the_gate() {
    let gate = Gate::new(1, vec![]);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let cancel = CancellationToken::new();
    let serve_gate = gate.clone();
    let serve_cancel = cancel.child_token();
    tokio::spawn(async move { serve_gate.serve_local(addr, serve_cancel).await });

    // Give the listener a moment to bind before connectors dial in.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let caller = GateConnector::connect(addr, 100, 1, 65536, cancel.child_token())
        .await
        .expect("caller connects");
    let callee = GateConnector::connect(addr, 200, 2, 65536, cancel.child_token())
        .await
        .expect("callee connects");

    let responder = tokio::spawn(async move {
        let (header, payload) = callee.recv_inbound().await.expect("inbound call");
        let ping = Ping::parse(&payload).expect("valid ping");
        assert_eq!(ping.text, "ping");

        // Reply on the same session, over the same shared-memory channel,
        // using an S2sAck category id so it resumes the caller's session.
        let pong = Pong { text: "pong".into() };
        let reply_msg_id = MsgId::new(MsgCategory::S2sAck, 1).0;
        callee
            .reply(header.from_service(), reply_msg_id, header.session(), &pong)
            .await
            .expect("reply send");
    });

    let req = Ping { text: "ping".into() };
    let reply: Pong = tokio::time::timeout(
        Duration::from_secs(2),
        caller.call(200, MsgId::new(MsgCategory::S2sReq, 1).0, &req, Duration::from_secs(1)),
    )
    .await
    .expect("no timeout")
    .expect("call ok");

    assert_eq!(reply.text, "pong");
    responder.await.expect("responder task");
}

// A destination id the gate has never heard of is delayed rather than
// dropped outright; once a service registers under that id the gate
// replays the held frame instead of losing it.
#[tokio::test]
async fn a_call_to_a_not_yet_registered_service_is_delivered_once_it_registers() {
    let gate = Gate::new(1, vec![]);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let cancel = CancellationToken::new();
    let serve_gate = gate.clone();
    let serve_cancel = cancel.child_token();
    tokio::spawn(async move { serve_gate.serve_local(addr, serve_cancel).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let caller = GateConnector::connect(addr, 101, 1, 65536, cancel.child_token())
        .await
        .expect("caller connects");

    // Fire the call before the callee has ever registered with the gate.
    let req = Ping { text: "early".into() };
    let call_fut = caller.call::<Ping, Pong>(
        201,
        MsgId::new(MsgCategory::S2sReq, 2).0,
        &req,
        Duration::from_secs(2),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let callee = GateConnector::connect(addr, 201, 2, 65536, cancel.child_token())
        .await
        .expect("callee connects late");

    let responder = tokio::spawn(async move {
        let (header, payload) = callee.recv_inbound().await.expect("inbound call");
        let ping = Ping::parse(&payload).expect("valid ping");
        assert_eq!(ping.text, "early");
        let pong = Pong { text: "late-pong".into() };
        let reply_msg_id = MsgId::new(MsgCategory::S2sAck, 1).0;
        callee
            .reply(header.from_service(), reply_msg_id, header.session(), &pong)
            .await
            .expect("reply send");
    });

    let reply = call_fut.await.expect("call eventually resolves");
    assert_eq!(reply.text, "late-pong");
    responder.await.expect("responder task");
}
