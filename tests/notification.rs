// Copyright 2022 The Agentd Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Notification service over real sockets: the assertion and cancellation
//! flows as a client on the wire observes them.

mod common;

use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use agentd::ipc::frame::Packet;
use agentd::ipc::IpcCodec;
use agentd::notificationservice::api::{decode_response, encode_request, Response};
use agentd::notificationservice::method::ApiMethod;
use agentd::notificationservice::run;
use agentd::status::STATUS_SUCCESS;

use common::{id, stream_pair};

type Client = Framed<tokio::net::UnixStream, IpcCodec>;

async fn send(client: &mut Client, method: ApiMethod, offset: u64, payload: &[u8]) {
    client
        .send(Packet::Data(encode_request(method, offset, payload)))
        .await
        .unwrap();
}

async fn recv(client: &mut Client) -> Response {
    match client.next().await.unwrap().unwrap() {
        Packet::Data(raw) => decode_response(&raw).unwrap(),
        other => panic!("unexpected packet {:?}", other),
    }
}

fn start_service() -> (Client, Client, tokio::net::UnixStream) {
    let (canon_client, canon_server) = stream_pair();
    let (proto_client, proto_server) = stream_pair();
    let (signal_keep, signal_server) = stream_pair();

    tokio::task::spawn(async move {
        let _ = run(canon_server, proto_server, signal_server).await;
    });

    (
        Framed::new(canon_client, IpcCodec::new()),
        Framed::new(proto_client, IpcCodec::new()),
        signal_keep,
    )
}

#[tokio::test]
async fn block_update_invalidates_and_acks_in_order() {
    let (mut canonization, mut protocol, _signal) = start_service();

    // The protocol client asserts X at offset 1000 and is acknowledged.
    send(
        &mut protocol,
        ApiMethod::BlockAssertion,
        1000,
        id(1).as_bytes(),
    )
    .await;
    let ack = recv(&mut protocol).await;
    assert_eq!(ack.method, ApiMethod::BlockAssertion as u32);
    assert_eq!(ack.offset, 1000);
    assert_eq!(ack.status, STATUS_SUCCESS);
    assert!(ack.payload.is_empty());

    // Canonization announces Y.
    send(
        &mut canonization,
        ApiMethod::BlockUpdate,
        7474,
        id(2).as_bytes(),
    )
    .await;

    // The stale assertion is invalidated with the new id...
    let invalidation = recv(&mut protocol).await;
    assert!(invalidation.is_invalidation());
    assert_eq!(invalidation.offset, 1000);
    assert_eq!(invalidation.invalidation_block_id(), Some(id(2)));

    // ...and the announcer gets its success.
    let update_ack = recv(&mut canonization).await;
    assert_eq!(update_ack.method, ApiMethod::BlockUpdate as u32);
    assert_eq!(update_ack.offset, 7474);
    assert_eq!(update_ack.status, STATUS_SUCCESS);

    // A repeat announcement of the same id invalidates nothing further:
    // only the announcer ack arrives.
    send(
        &mut canonization,
        ApiMethod::BlockUpdate,
        7475,
        id(2).as_bytes(),
    )
    .await;
    let update_ack = recv(&mut canonization).await;
    assert_eq!(update_ack.offset, 7475);

    // The protocol connection stays quiet; a fresh assertion of the
    // current id answers with just the ack.
    send(
        &mut protocol,
        ApiMethod::BlockAssertion,
        2000,
        id(2).as_bytes(),
    )
    .await;
    let ack = recv(&mut protocol).await;
    assert_eq!(ack.offset, 2000);
    assert!(ack.payload.is_empty());
}

#[tokio::test]
async fn cancellation_race_yields_exactly_one_cancel_ack() {
    let (mut canonization, mut protocol, _signal) = start_service();

    // Establish a latest block id.
    send(
        &mut canonization,
        ApiMethod::BlockUpdate,
        1,
        id(7).as_bytes(),
    )
    .await;
    recv(&mut canonization).await;

    // Assert the current latest at offset 7, then cancel immediately.
    send(
        &mut protocol,
        ApiMethod::BlockAssertion,
        7,
        id(7).as_bytes(),
    )
    .await;
    send(&mut protocol, ApiMethod::BlockAssertionCancel, 7, &[]).await;

    // Exactly: one registration ack, then one cancel ack. No invalidation.
    let ack = recv(&mut protocol).await;
    assert_eq!(ack.method, ApiMethod::BlockAssertion as u32);
    assert_eq!(ack.offset, 7);
    assert!(ack.payload.is_empty());

    let cancel_ack = recv(&mut protocol).await;
    assert_eq!(cancel_ack.method, ApiMethod::BlockAssertionCancel as u32);
    assert_eq!(cancel_ack.offset, 7);
    assert_eq!(cancel_ack.status, STATUS_SUCCESS);

    // A later update produces nothing at the canceled offset; prove the
    // channel is quiet by completing another round trip.
    send(
        &mut canonization,
        ApiMethod::BlockUpdate,
        2,
        id(8).as_bytes(),
    )
    .await;
    recv(&mut canonization).await;

    send(
        &mut protocol,
        ApiMethod::BlockAssertion,
        99,
        id(8).as_bytes(),
    )
    .await;
    let next = recv(&mut protocol).await;
    assert_eq!(next.offset, 99);
}

#[tokio::test]
async fn second_cancel_still_acknowledged() {
    let (_canonization, mut protocol, _signal) = start_service();

    for _ in 0..2 {
        send(&mut protocol, ApiMethod::BlockAssertionCancel, 31, &[]).await;
        let ack = recv(&mut protocol).await;
        assert_eq!(ack.method, ApiMethod::BlockAssertionCancel as u32);
        assert_eq!(ack.offset, 31);
        assert_eq!(ack.status, STATUS_SUCCESS);
    }
}
