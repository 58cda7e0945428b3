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

//! Canonization rounds against a live data service, with the test playing
//! the notification service.

mod common;

use futures::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_util::codec::Framed;

use agentd::bitcap::Bitcap;
use agentd::canonizationservice::api::{encode_configure, encode_private_key, ControlMethod};
use agentd::canonizationservice::{run, BLOCK_UPDATE_OFFSET};
use agentd::crypto::generate_signing_key;
use agentd::dataservice::api::DataApi;
use agentd::dataservice::dispatch;
use agentd::dataservice::method::cap;
use agentd::ipc::frame::Packet;
use agentd::ipc::IpcCodec;
use agentd::notificationservice::api as notify_api;
use agentd::notificationservice::method::ApiMethod as NotifyMethod;
use agentd::status::STATUS_SUCCESS;
use agentd::zero_id;

use byteorder::{BigEndian, ByteOrder};
use common::{id, root_block_cert, stream_pair, transaction_cert};

type Wire = Framed<tokio::net::UnixStream, IpcCodec>;

async fn control_call(control: &mut Wire, method: ControlMethod, body: &[u8]) {
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

/// Brings up a data service, seeds it through `seed`, then starts the
/// canonization service with a 50 ms timer. Returns the control wire, the
/// notification wire played by the test, and the live signal socket.
async fn start_stack<F, Fut>(seed: F) -> (Wire, Wire, tokio::net::UnixStream)
where
    F: FnOnce(DataApi) -> Fut,
    Fut: std::future::Future<Output = DataApi>,
{
    let (data_client, data_server) = stream_pair();
    tokio::task::spawn(async move {
        let _ = dispatch::run(data_server).await;
    });

    let mut api = DataApi::new(data_client);
    api.root_context_create(1 << 30, "data", &root_block_cert(id(0xA0)))
        .await
        .unwrap();
    let api = seed(api).await;
    let data_stream = api.into_inner();

    let (ctrl_client, ctrl_server) = stream_pair();
    let (notify_test_side, notify_canon_side) = stream_pair();
    let (signal_keep, signal_server) = stream_pair();

    tokio::task::spawn(async move {
        let _ = run(ctrl_server, data_stream, notify_canon_side, signal_server).await;
    });

    let mut control = Framed::new(ctrl_client, IpcCodec::new());
    control_call(&mut control, ControlMethod::Configure, &encode_configure(50, 10)).await;
    control_call(
        &mut control,
        ControlMethod::PrivateKeySet,
        &encode_private_key(id(0x77), &generate_signing_key().to_bytes()),
    )
    .await;
    control_call(&mut control, ControlMethod::Start, &[]).await;

    // The service reduces its notification capabilities first thing.
    let mut notify = Framed::new(notify_test_side, IpcCodec::new());
    let raw = match notify.next().await.unwrap().unwrap() {
        Packet::Data(raw) => raw,
        other => panic!("unexpected packet {:?}", other),
    };
    let request = notify_api::decode_request(&raw).unwrap();
    assert_eq!(request.method, NotifyMethod::ReduceCaps as u32);
    notify
        .send(Packet::Data(notify_api::encode_response(
            NotifyMethod::ReduceCaps as u32,
            request.offset,
            STATUS_SUCCESS,
            &[],
        )))
        .await
        .unwrap();

    (control, notify, signal_keep)
}

#[tokio::test]
async fn dry_round_sends_no_block_update() {
    let (_control, mut notify, _signal) = start_stack(|api| async { api }).await;

    // Several timer periods pass; an empty queue never announces.
    let outcome = timeout(Duration::from_millis(400), notify.next()).await;
    assert!(outcome.is_err(), "dry rounds must not notify");
}

#[tokio::test]
async fn promoted_transactions_become_a_block() {
    let key = generate_signing_key();
    let cert = transaction_cert(id(1), id(0x11), id(9), &key);
    let seed_cert = cert.clone();

    let (_control, mut notify, _signal) = start_stack(move |mut api| async move {
        let child = api
            .child_context_create(&Bitcap::new_true(cap::BITS))
            .await
            .unwrap();
        api.transaction_submit(child, id(1), id(0x11), &seed_cert)
            .await
            .unwrap();
        api.transaction_promote(child, id(1)).await.unwrap();
        api.child_context_close(child).await.unwrap();
        api
    })
    .await;

    // The round commits and announces at the reserved offset.
    let raw = match timeout(Duration::from_secs(2), notify.next())
        .await
        .expect("block update expected")
        .unwrap()
        .unwrap()
    {
        Packet::Data(raw) => raw,
        other => panic!("unexpected packet {:?}", other),
    };
    let request = notify_api::decode_request(&raw).unwrap();
    assert_eq!(request.method, NotifyMethod::BlockUpdate as u32);
    assert_eq!(request.offset, BLOCK_UPDATE_OFFSET);
    assert_eq!(request.payload.len(), 16);
    assert_ne!(request.payload, zero_id().as_bytes().to_vec());

    // Acknowledge the update so the round completes.
    notify
        .send(Packet::Data(notify_api::encode_response(
            NotifyMethod::BlockUpdate as u32,
            BLOCK_UPDATE_OFFSET,
            STATUS_SUCCESS,
            &[],
        )))
        .await
        .unwrap();

    // The queue is now empty; subsequent rounds are dry.
    let outcome = timeout(Duration::from_millis(400), notify.next()).await;
    assert!(outcome.is_err(), "second round must be dry");
}

#[tokio::test]
async fn unpromoted_transactions_are_left_alone() {
    let key = generate_signing_key();
    let cert = transaction_cert(id(1), id(0x11), id(9), &key);

    let (_control, mut notify, _signal) = start_stack(move |mut api| async move {
        let child = api
            .child_context_create(&Bitcap::new_true(cap::BITS))
            .await
            .unwrap();
        // Submitted but never promoted.
        api.transaction_submit(child, id(1), id(0x11), &cert)
            .await
            .unwrap();
        api.child_context_close(child).await.unwrap();
        api
    })
    .await;

    let outcome = timeout(Duration::from_millis(400), notify.next()).await;
    assert!(
        outcome.is_err(),
        "submitted-but-unpromoted transactions must not canonize"
    );
}
