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

//! Protocol service end to end: handshake, capability gating, proxied
//! reads and the assertion flow, over a real TCP connection with real
//! data, notification and random services behind it.

mod common;

use futures::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_util::codec::{Framed, FramedParts};
use uuid::Uuid;

use agentd::crypto::{AgreementKeypair, AgreementPublicKey, CryptoSuite, Nonce};
use agentd::dataservice::api::DataApi;
use agentd::ipc::authed::{AuthedCodec, AuthedSession};
use agentd::ipc::frame::Packet;
use agentd::ipc::IpcCodec;
use agentd::protocolservice::api::{
    decode_response, encode_request, Response, RequestId,
};
use agentd::protocolservice::control::ControlMethod;
use agentd::protocolservice::{capabilities, handshake};
use agentd::status::{protocol as protocol_status, STATUS_SUCCESS};
use agentd::{notificationservice, protocolservice, randomservice, zero_id, Id};

use byteorder::{BigEndian, ByteOrder};
use common::{id, root_block_cert, stream_pair};

type ControlWire = Framed<tokio::net::UnixStream, IpcCodec>;
type ClientWire = Framed<tokio::net::TcpStream, AuthedCodec>;

async fn control_call(control: &mut ControlWire, method: ControlMethod, body: &[u8]) {
    let mut request = Vec::new();
    request.extend_from_slice(&(method as u32).to_be_bytes());
    request.extend_from_slice(&0u32.to_be_bytes());
    request.extend_from_slice(body);
    control.send(Packet::Data(request)).await.unwrap();

    let raw = match control.next().await.unwrap().unwrap() {
        Packet::Data(raw) => raw,
        other => panic!("unexpected packet {:?}", other),
    };
    assert_eq!(BigEndian::read_u32(&raw[0..4]), method as u32);
    assert_eq!(BigEndian::read_u32(&raw[8..12]), STATUS_SUCCESS);
}

struct Stack {
    port: u16,
    agent: AgreementKeypair,
    client_entity: Id,
    client_keys: AgreementKeypair,
    root_block: Id,
}

/// Brings up data, notification and random services plus the protocol
/// service, authorizing one client entity with the given verbs.
async fn start_stack(verbs: &[Uuid]) -> Stack {
    let root_block = id(0xA0);

    // Data service, with the root context installed as the supervisor
    // would.
    let (data_client, data_server) = stream_pair();
    tokio::task::spawn_local(async move {
        let _ = agentd::dataservice::dispatch::run(data_server).await;
    });
    let mut api = DataApi::new(data_client);
    api.root_context_create(1 << 30, "data", &root_block_cert(root_block))
        .await
        .unwrap();
    let data_stream = api.into_inner();

    // Notification service; the canonization side stays idle but alive.
    let (notify_canon_keepalive, notify_canon_server) = stream_pair();
    let (notify_proto_client, notify_proto_server) = stream_pair();
    let (notify_signal_keep, notify_signal_server) = stream_pair();
    tokio::task::spawn_local(async move {
        // Hold the idle ends for the lifetime of the service.
        let _keep = notify_canon_keepalive;
        let _signal = notify_signal_keep;
        futures::future::pending::<()>().await;
    });
    tokio::task::spawn_local(async move {
        let _ = notificationservice::run(
            notify_canon_server,
            notify_proto_server,
            notify_signal_server,
        )
        .await;
    });

    // Random service.
    let (random_client, random_server) = stream_pair();
    tokio::task::spawn_local(async move {
        let _ = randomservice::run(random_server).await;
    });

    // Protocol service.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    listener.set_nonblocking(true).unwrap();

    let (control_client, control_server) = stream_pair();
    let (signal_keep, signal_server) = stream_pair();
    tokio::task::spawn_local(async move {
        let _keep = signal_keep;
        futures::future::pending::<()>().await;
    });
    tokio::task::spawn_local(async move {
        if let Err(err) = protocolservice::run(
            control_server,
            random_client,
            listener,
            data_stream,
            notify_proto_client,
            signal_server,
        )
        .await
        {
            panic!("protocol service failed: {:?}", err);
        }
    });

    // Configure: agent key, one authorized entity, its verbs, finalize.
    let agent = AgreementKeypair::generate();
    let agent_id = id(0x77);
    let client_entity = id(0x31);
    let client_keys = AgreementKeypair::generate();

    let mut control = Framed::new(control_client, IpcCodec::new());
    let mut body = Vec::new();
    body.extend_from_slice(agent_id.as_bytes());
    body.extend_from_slice(&agent.secret_bytes());
    control_call(&mut control, ControlMethod::PrivateKeySet, &body).await;

    let mut body = Vec::new();
    body.extend_from_slice(client_entity.as_bytes());
    body.extend_from_slice(client_keys.public().as_bytes());
    body.extend_from_slice(&[0u8; 32]);
    control_call(&mut control, ControlMethod::AuthEntityAdd, &body).await;

    for verb in verbs {
        let mut body = Vec::new();
        body.extend_from_slice(client_entity.as_bytes());
        body.extend_from_slice(verb.as_bytes());
        body.extend_from_slice(zero_id().as_bytes());
        control_call(&mut control, ControlMethod::CapabilityAdd, &body).await;
    }
    control_call(&mut control, ControlMethod::Finalize, &[]).await;

    // Keep the control socket open for the lifetime of the test.
    tokio::task::spawn_local(async move {
        let _keep = control;
        futures::future::pending::<()>().await;
    });

    Stack {
        port,
        agent,
        client_entity,
        client_keys,
        root_block,
    }
}

/// Performs the client half of the handshake, returning the
/// authenticated wire.
async fn connect(stack: &Stack) -> ClientWire {
    let suite = CryptoSuite::velochain1();
    let stream = tokio::net::TcpStream::connect(("127.0.0.1", stack.port))
        .await
        .unwrap();
    let mut plain = Framed::new(stream, IpcCodec::new());

    let key_nonce = Nonce::random();
    let challenge_nonce = Nonce::random();
    let body = handshake::encode_initiate(suite, stack.client_entity, &key_nonce, &challenge_nonce);
    plain
        .send(Packet::Data(encode_request(
            RequestId::HandshakeInitiate,
            1,
            &body,
        )))
        .await
        .unwrap();

    let raw = match plain.next().await.unwrap().unwrap() {
        Packet::Data(raw) => raw,
        other => panic!("unexpected packet {:?}", other),
    };
    let response = decode_response(&raw).unwrap();
    assert_eq!(response.status, STATUS_SUCCESS, "handshake refused");
    let init = handshake::decode_initiate_response(&response.payload).unwrap();

    let agent_public = AgreementPublicKey::from_bytes(*stack.agent.public().as_bytes());
    let secret = handshake::derive_secret(
        suite,
        &stack.client_keys,
        &agent_public,
        &init.key_nonce,
        &key_nonce,
    )
    .unwrap();
    // The server must have proven the same secret.
    handshake::verify_challenge_digest(suite, &secret, &challenge_nonce, &init.challenge_response)
        .unwrap();

    // Switch to authenticated framing and acknowledge.
    let parts = plain.into_parts();
    let mut authed_parts = FramedParts::new::<Vec<u8>>(
        parts.io,
        AuthedCodec::new(AuthedSession::new(suite, secret.clone())),
    );
    authed_parts.read_buf = parts.read_buf;
    authed_parts.write_buf = parts.write_buf;
    let mut wire = Framed::from_parts(authed_parts);

    let digest = handshake::challenge_digest(suite, &secret, &init.challenge_nonce).unwrap();
    wire.send(encode_request(RequestId::HandshakeAcknowledge, 2, &digest))
        .await
        .unwrap();
    let ack = decode_response(&wire.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(ack.status, STATUS_SUCCESS);
    wire
}

async fn call(wire: &mut ClientWire, request: RequestId, offset: u32, body: &[u8]) -> Response {
    wire.send(encode_request(request, offset, body)).await.unwrap();
    decode_response(&wire.next().await.unwrap().unwrap()).unwrap()
}

#[tokio::test]
async fn authorized_reads_and_capability_gating() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            // Granted: latest block id only.
            let stack = start_stack(&[capabilities::CAP_BLOCK_ID_LATEST_READ]).await;
            let mut wire = connect(&stack).await;

            // The granted verb works and returns the root id.
            let response = call(&mut wire, RequestId::LatestBlockIdGet, 10, &[]).await;
            assert_eq!(response.request_id, RequestId::LatestBlockIdGet as u32);
            assert_eq!(response.offset, 10);
            assert_eq!(response.status, STATUS_SUCCESS);
            assert_eq!(response.payload, stack.root_block.as_bytes().to_vec());

            // An ungranted verb is refused, and the session survives.
            let response =
                call(&mut wire, RequestId::BlockById, 11, stack.root_block.as_bytes()).await;
            assert_eq!(response.status, protocol_status::UNAUTHORIZED);

            let response = call(&mut wire, RequestId::LatestBlockIdGet, 12, &[]).await;
            assert_eq!(response.status, STATUS_SUCCESS);
        })
        .await;
}

#[tokio::test]
async fn unknown_entity_is_refused() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let stack = start_stack(&[]).await;
            let suite = CryptoSuite::velochain1();

            let stream = tokio::net::TcpStream::connect(("127.0.0.1", stack.port))
                .await
                .unwrap();
            let mut plain = Framed::new(stream, IpcCodec::new());

            // A stranger attempts the handshake.
            let body = handshake::encode_initiate(
                suite,
                id(0x66),
                &Nonce::random(),
                &Nonce::random(),
            );
            plain
                .send(Packet::Data(encode_request(
                    RequestId::HandshakeInitiate,
                    1,
                    &body,
                )))
                .await
                .unwrap();

            let raw = match plain.next().await.unwrap().unwrap() {
                Packet::Data(raw) => raw,
                other => panic!("unexpected packet {:?}", other),
            };
            let response = decode_response(&raw).unwrap();
            assert_eq!(response.status, protocol_status::UNAUTHORIZED);
        })
        .await;
}

#[tokio::test]
async fn assertion_and_cancellation_flow() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let stack = start_stack(&[
                capabilities::CAP_BLOCK_ID_LATEST_READ,
                capabilities::CAP_ASSERT_LATEST_BLOCK_ID,
                capabilities::CAP_ASSERT_LATEST_BLOCK_ID_CANCEL,
            ])
            .await;
            let mut wire = connect(&stack).await;

            // Register an assertion; the ack arrives at our offset.
            let ack = call(
                &mut wire,
                RequestId::AssertLatestBlockId,
                1000,
                stack.root_block.as_bytes(),
            )
            .await;
            assert_eq!(ack.request_id, RequestId::AssertLatestBlockId as u32);
            assert_eq!(ack.offset, 1000);
            assert_eq!(ack.status, STATUS_SUCCESS);
            assert!(ack.payload.is_empty());

            // Cancel it; exactly one cancel ack comes back.
            let cancel_ack = call(&mut wire, RequestId::AssertLatestBlockIdCancel, 1000, &[]).await;
            assert_eq!(
                cancel_ack.request_id,
                RequestId::AssertLatestBlockIdCancel as u32
            );
            assert_eq!(cancel_ack.offset, 1000);
            assert_eq!(cancel_ack.status, STATUS_SUCCESS);

            // Cancelling an unknown offset is acknowledged idempotently.
            let cancel_ack = call(&mut wire, RequestId::AssertLatestBlockIdCancel, 2000, &[]).await;
            assert_eq!(cancel_ack.offset, 2000);
            assert_eq!(cancel_ack.status, STATUS_SUCCESS);

            // The session is still healthy.
            let response = timeout(
                Duration::from_secs(2),
                call(&mut wire, RequestId::LatestBlockIdGet, 3000, &[]),
            )
            .await
            .unwrap();
            assert_eq!(response.status, STATUS_SUCCESS);
        })
        .await;
}
