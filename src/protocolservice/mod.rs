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

//! The protocol service.
//!
//! Terminates client TCP connections. Each connection handshakes into an
//! authenticated session, presents its entity id, and then every request
//! is gated by a `(subject, verb, object)` capability lookup before being
//! proxied: chain reads and submissions to the data service through this
//! service's child context, assertions and cancellations to the
//! notification service with offset correlation across both hops, and
//! extended-API traffic to provider connections.
//!
//! One task per connection on a single-threaded scheduler; the shared
//! sockets to the data, notification and random services are each owned
//! by a dedicated task fed over channels.

pub mod api;
pub mod capabilities;
pub mod control;
pub mod handshake;

use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio_util::codec::{Framed, FramedParts};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bitcap::Bitcap;
use crate::crypto::{AgreementKeypair, AgreementPublicKey, CryptoSuite};
use crate::dataservice::api::{ApiError as DataApiError, DataApi};
use crate::dataservice::method::cap as data_cap;
use crate::ipc::authed::{AuthedCodec, AuthedSession};
use crate::ipc::frame::Packet;
use crate::ipc::IpcCodec;
use crate::notificationservice::api as notify_api;
use crate::notificationservice::method::ApiMethod as NotifyMethod;
use crate::randomservice::RandomApi;
use crate::signalthread::SignalState;
use crate::status::{self, StatusWord, STATUS_SUCCESS};
use crate::{zero_id, Id};

use self::api::{decode_request, encode_response, RequestId};
use self::capabilities::CapabilityTable;
use self::control::{decode_request as decode_control, encode_response as encode_control_response, ControlMethod};

/// An entity allowed to connect.
#[derive(Debug, Clone)]
pub struct AuthorizedEntity {
    pub encryption_key: AgreementPublicKey,
    pub signing_key: [u8; 32],
}

type Outbound = mpsc::UnboundedSender<Vec<u8>>;

/// Shared state of the protocol service.
pub struct Instance {
    agent_id: Option<Id>,
    agreement: Option<AgreementKeypair>,
    entities: HashMap<Id, AuthorizedEntity>,
    caps: CapabilityTable,
    finalized: bool,
    providers: HashMap<Id, Outbound>,
    pending_api: HashMap<u32, PendingApi>,
    next_api_offset: u32,
}

#[derive(Debug)]
struct PendingApi {
    reply: Outbound,
    client_offset: u32,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("agent_id", &self.agent_id)
            .field("entities", &self.entities.len())
            .field("caps", &self.caps.len())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

impl Instance {
    pub fn new() -> Self {
        Self {
            agent_id: None,
            agreement: None,
            entities: HashMap::new(),
            caps: CapabilityTable::new(),
            finalized: false,
            providers: HashMap::new(),
            pending_api: HashMap::new(),
            next_api_offset: 1,
        }
    }

    /// Whether the control surface has been locked.
    pub fn finalized(&self) -> bool {
        self.finalized
    }

    /// Whether enough configuration exists to accept clients.
    pub fn ready(&self) -> bool {
        self.finalized && self.agent_id.is_some() && self.agreement.is_some()
    }

    /// Handles one control request, returning the response frame.
    pub fn handle_control(&mut self, raw: &[u8]) -> Vec<u8> {
        let request = match decode_control(raw) {
            Some(request) => request,
            None => {
                return encode_control_response(
                    0,
                    0,
                    status::protocol::REQUEST_PACKET_INVALID_SIZE,
                );
            }
        };
        let method = match ControlMethod::from_u32(request.method) {
            Some(method) => method,
            None => {
                return encode_control_response(
                    request.method,
                    request.offset,
                    status::protocol::INVALID_REQUEST_ID,
                );
            }
        };

        if self.finalized {
            return encode_control_response(
                request.method,
                request.offset,
                status::protocol::ALREADY_CONFIGURED,
            );
        }

        let status = match method {
            ControlMethod::AuthEntityAdd => match control::decode_entity_add(&request.payload) {
                Some((entity, encryption, signing)) => {
                    self.entities.insert(
                        entity,
                        AuthorizedEntity {
                            encryption_key: AgreementPublicKey::from_bytes(encryption),
                            signing_key: signing,
                        },
                    );
                    STATUS_SUCCESS
                }
                None => status::protocol::REQUEST_PACKET_INVALID_SIZE,
            },
            ControlMethod::CapabilityAdd => {
                match control::decode_capability_add(&request.payload) {
                    Some((subject, verb, object)) => {
                        self.caps.grant(subject, verb, object);
                        STATUS_SUCCESS
                    }
                    None => status::protocol::REQUEST_PACKET_INVALID_SIZE,
                }
            }
            ControlMethod::PrivateKeySet => {
                match control::decode_private_key_set(&request.payload) {
                    Some((agent, secret)) => {
                        self.agent_id = Some(agent);
                        self.agreement = Some(AgreementKeypair::from_secret_bytes(secret));
                        STATUS_SUCCESS
                    }
                    None => status::protocol::REQUEST_PACKET_INVALID_SIZE,
                }
            }
            ControlMethod::Finalize => {
                if !request.payload.is_empty() {
                    status::protocol::REQUEST_PACKET_INVALID_SIZE
                } else if self.agent_id.is_none() || self.agreement.is_none() {
                    status::protocol::NOT_YET_CONFIGURED
                } else {
                    self.finalized = true;
                    STATUS_SUCCESS
                }
            }
        };
        encode_control_response(request.method, request.offset, status)
    }
}

/// Commands for the task owning the data-service socket.
enum DataCommand {
    LatestBlockId(oneshot::Sender<Result<Vec<u8>, DataApiError>>),
    BlockRead(Id, oneshot::Sender<Result<Vec<u8>, DataApiError>>),
    BlockIdByHeight(u64, oneshot::Sender<Result<Vec<u8>, DataApiError>>),
    CanonizedTransactionRead(Id, oneshot::Sender<Result<Vec<u8>, DataApiError>>),
    ArtifactRead(Id, oneshot::Sender<Result<Vec<u8>, DataApiError>>),
    TransactionSubmit {
        transaction_id: Id,
        artifact_id: Id,
        cert: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, DataApiError>>,
    },
}

/// The capability set the protocol service's own child context holds.
pub fn protocol_data_caps() -> Bitcap {
    let mut caps = Bitcap::new_false(data_cap::BITS);
    caps.set(data_cap::CHILD_CONTEXT_CREATE, true);
    caps.set(data_cap::CHILD_CONTEXT_CLOSE, true);
    caps.set(data_cap::BLOCK_ID_LATEST_READ, true);
    caps.set(data_cap::BLOCK_ID_BY_HEIGHT_READ, true);
    caps.set(data_cap::BLOCK_READ, true);
    caps.set(data_cap::PQ_TRANSACTION_SUBMIT, true);
    caps.set(data_cap::TRANSACTION_READ, true);
    caps.set(data_cap::ARTIFACT_READ, true);
    caps
}

async fn data_client_task(
    mut data: DataApi,
    child: u32,
    mut rx: mpsc::UnboundedReceiver<DataCommand>,
) {
    while let Some(command) = rx.next().await {
        match command {
            DataCommand::LatestBlockId(reply) => {
                let result = data
                    .block_id_latest_read(child)
                    .await
                    .map(|id| id.as_bytes().to_vec());
                let _ = reply.send(result);
            }
            DataCommand::BlockRead(block_id, reply) => {
                let result = data
                    .block_read(child, block_id, true)
                    .await
                    .map(|record| record.encode(true));
                let _ = reply.send(result);
            }
            DataCommand::BlockIdByHeight(height, reply) => {
                let result = data
                    .block_id_by_height_read(child, height)
                    .await
                    .map(|id| id.as_bytes().to_vec());
                let _ = reply.send(result);
            }
            DataCommand::CanonizedTransactionRead(transaction_id, reply) => {
                let result = data
                    .canonized_transaction_read(child, transaction_id, true)
                    .await
                    .map(|record| record.encode(true));
                let _ = reply.send(result);
            }
            DataCommand::ArtifactRead(artifact_id, reply) => {
                let result = data
                    .artifact_read(child, artifact_id)
                    .await
                    .map(|record| record.encode());
                let _ = reply.send(result);
            }
            DataCommand::TransactionSubmit {
                transaction_id,
                artifact_id,
                cert,
                reply,
            } => {
                let result = data
                    .transaction_submit(child, transaction_id, artifact_id, &cert)
                    .await
                    .map(|_| Vec::new());
                let _ = reply.send(result);
            }
        }
    }
}

/// Commands for the task owning the notification-service socket.
enum NotifyCommand {
    Assert {
        conn: u64,
        client_offset: u32,
        block_id: Id,
        out: Outbound,
    },
    Cancel {
        conn: u64,
        client_offset: u32,
        out: Outbound,
    },
    Disconnect {
        conn: u64,
    },
}

struct NotifyRoute {
    conn: u64,
    client_offset: u32,
    out: Outbound,
}

/// Owns the notification socket: forwards assertions upstream under
/// server-allocated offsets and routes acks, invalidations and cancel
/// acks back to the right connection at the client's own offset.
async fn notify_router_task(
    stream: tokio::net::UnixStream,
    mut rx: mpsc::UnboundedReceiver<NotifyCommand>,
) {
    let mut framed = Framed::new(stream, IpcCodec::new());
    let mut routes: HashMap<u64, NotifyRoute> = HashMap::new();
    let mut by_client: HashMap<(u64, u32), u64> = HashMap::new();
    let mut next_offset: u64 = 1;

    // This side of the notification service only asserts and cancels.
    let mut caps = Bitcap::new_false(crate::notificationservice::method::cap::BITS);
    caps.set(crate::notificationservice::method::cap::BLOCK_ASSERTION, true);
    caps.set(
        crate::notificationservice::method::cap::BLOCK_ASSERTION_CANCEL,
        true,
    );
    let reduce = notify_api::encode_request(NotifyMethod::ReduceCaps, 0, &caps.to_bytes());
    if framed.send(Packet::Data(reduce)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            command = rx.next() => {
                let command = match command {
                    Some(command) => command,
                    None => break,
                };
                match command {
                    NotifyCommand::Assert { conn, client_offset, block_id, out } => {
                        let server_offset = next_offset;
                        next_offset += 1;
                        routes.insert(server_offset, NotifyRoute { conn, client_offset, out });
                        by_client.insert((conn, client_offset), server_offset);
                        let request = notify_api::encode_request(
                            NotifyMethod::BlockAssertion,
                            server_offset,
                            block_id.as_bytes(),
                        );
                        if framed.send(Packet::Data(request)).await.is_err() {
                            break;
                        }
                    }
                    NotifyCommand::Cancel { conn, client_offset, out } => {
                        match by_client.get(&(conn, client_offset)) {
                            Some(server_offset) => {
                                let request = notify_api::encode_request(
                                    NotifyMethod::BlockAssertionCancel,
                                    *server_offset,
                                    &[],
                                );
                                if framed.send(Packet::Data(request)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                // Nothing outstanding; acknowledge directly.
                                let _ = out.unbounded_send(encode_response(
                                    RequestId::AssertLatestBlockIdCancel as u32,
                                    client_offset,
                                    STATUS_SUCCESS,
                                    &[],
                                ));
                            }
                        }
                    }
                    NotifyCommand::Disconnect { conn } => {
                        let dead: Vec<u64> = routes
                            .iter()
                            .filter(|(_, route)| route.conn == conn)
                            .map(|(offset, _)| *offset)
                            .collect();
                        for server_offset in dead {
                            if let Some(route) = routes.remove(&server_offset) {
                                by_client.remove(&(route.conn, route.client_offset));
                            }
                            let request = notify_api::encode_request(
                                NotifyMethod::BlockAssertionCancel,
                                server_offset,
                                &[],
                            );
                            if framed.send(Packet::Data(request)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            frame = framed.next() => {
                let raw = match frame {
                    Some(Ok(Packet::Data(raw))) => raw,
                    _ => break,
                };
                let response = match notify_api::decode_response(&raw) {
                    Ok(response) => response,
                    Err(_) => break,
                };

                let is_cancel_ack =
                    response.method == NotifyMethod::BlockAssertionCancel as u32;
                let is_invalidation = response.is_invalidation();
                let is_ack = response.method == NotifyMethod::BlockAssertion as u32
                    && !is_invalidation;

                if is_invalidation || is_cancel_ack || response.status != STATUS_SUCCESS {
                    if let Some(route) = routes.remove(&response.offset) {
                        by_client.remove(&(route.conn, route.client_offset));
                        let (request_id, payload) = if is_cancel_ack {
                            (RequestId::AssertLatestBlockIdCancel as u32, Vec::new())
                        } else {
                            (RequestId::AssertLatestBlockId as u32, response.payload)
                        };
                        let _ = route.out.unbounded_send(encode_response(
                            request_id,
                            route.client_offset,
                            response.status,
                            &payload,
                        ));
                    }
                } else if is_ack {
                    if let Some(route) = routes.get(&response.offset) {
                        let _ = route.out.unbounded_send(encode_response(
                            RequestId::AssertLatestBlockId as u32,
                            route.client_offset,
                            STATUS_SUCCESS,
                            &[],
                        ));
                    }
                }
            }
        }
    }
}

/// Commands for the task owning the random-service socket.
type RandomCommand = (u32, oneshot::Sender<Option<Vec<u8>>>);

async fn random_client_task(stream: tokio::net::UnixStream, mut rx: mpsc::UnboundedReceiver<RandomCommand>) {
    let mut random = RandomApi::new(stream);
    let mut offset = 0u32;
    while let Some((count, reply)) = rx.next().await {
        offset = offset.wrapping_add(1);
        let result = random.random_bytes_get(offset, count).await.ok();
        let _ = reply.send(result);
    }
}

struct ConnectionEnv {
    shared: Rc<RefCell<Instance>>,
    data_tx: mpsc::UnboundedSender<DataCommand>,
    notify_tx: mpsc::UnboundedSender<NotifyCommand>,
    random_tx: mpsc::UnboundedSender<RandomCommand>,
}

/// Maps an upstream data failure onto a client response status.
fn upstream_status(err: &DataApiError) -> StatusWord {
    match err {
        DataApiError::Status(status) => *status,
        _ => status::protocol::UPSTREAM_FAILURE,
    }
}

/// Drives one client connection to completion.
async fn serve_connection(
    env: ConnectionEnv,
    stream: tokio::net::TcpStream,
    conn_id: u64,
) -> anyhow::Result<()> {
    let mut plain = Framed::new(stream, IpcCodec::new());

    // Handshake initiate, in plaintext framing.
    let first = match plain.next().await {
        Some(Ok(Packet::Data(raw))) => raw,
        _ => return Ok(()),
    };
    let request = match decode_request(&first) {
        Some(request) if request.request_id == RequestId::HandshakeInitiate as u32 => request,
        Some(request) => {
            let response = encode_response(
                request.request_id,
                request.offset,
                status::protocol::HANDSHAKE_FAILURE,
                &[],
            );
            let _ = plain.send(Packet::Data(response)).await;
            return Ok(());
        }
        None => return Ok(()),
    };

    let init = match handshake::decode_initiate(&request.body) {
        Some(init) if init.version == handshake::PROTOCOL_VERSION => init,
        _ => {
            let response = encode_response(
                request.request_id,
                request.offset,
                status::protocol::HANDSHAKE_FAILURE,
                &[],
            );
            let _ = plain.send(Packet::Data(response)).await;
            return Ok(());
        }
    };
    let suite = match CryptoSuite::from_id(init.suite_id) {
        Ok(suite) => suite,
        Err(_) => {
            let response = encode_response(
                request.request_id,
                request.offset,
                status::protocol::HANDSHAKE_FAILURE,
                &[],
            );
            let _ = plain.send(Packet::Data(response)).await;
            return Ok(());
        }
    };

    // Authorize the entity and capture agent key material.
    let entity_id = init.entity_id;
    let looked_up = {
        let instance = env.shared.borrow();
        match (
            instance.entities.get(&entity_id),
            instance.agent_id,
            instance.agreement.as_ref(),
        ) {
            (Some(entity), Some(agent_id), Some(agreement)) => Some((
                entity.encryption_key.clone(),
                agent_id,
                AgreementKeypair::from_secret_bytes(agreement.secret_bytes()),
            )),
            _ => None,
        }
    };
    let (entity_key, agent_id, agreement) = match looked_up {
        Some(looked_up) => looked_up,
        None => {
            warn!("handshake from unknown entity {}", entity_id);
            let response = encode_response(
                request.request_id,
                request.offset,
                status::protocol::UNAUTHORIZED,
                &[],
            );
            let _ = plain.send(Packet::Data(response)).await;
            return Ok(());
        }
    };

    // Server nonces come from the random service.
    let (reply_tx, reply_rx) = oneshot::channel();
    let _ = env
        .random_tx
        .unbounded_send(((crate::crypto::NONCE_SIZE * 2) as u32, reply_tx));
    let nonce_bytes = match reply_rx.await {
        Ok(Some(bytes)) => bytes,
        _ => anyhow::bail!("random service unavailable"),
    };
    let server_key_nonce =
        crate::crypto::Nonce::from_slice(&nonce_bytes[..crate::crypto::NONCE_SIZE])
            .expect("nonce slice size");
    let server_challenge_nonce =
        crate::crypto::Nonce::from_slice(&nonce_bytes[crate::crypto::NONCE_SIZE..])
            .expect("nonce slice size");

    let secret = handshake::derive_secret(
        suite,
        &agreement,
        &entity_key,
        &server_key_nonce,
        &init.key_nonce,
    )?;
    let challenge_response =
        handshake::challenge_digest(suite, &secret, &init.challenge_nonce)?;

    let payload = handshake::encode_initiate_response(
        agent_id,
        &server_key_nonce,
        &server_challenge_nonce,
        &challenge_response,
    );
    plain
        .send(Packet::Data(encode_response(
            request.request_id,
            request.offset,
            STATUS_SUCCESS,
            &payload,
        )))
        .await?;

    // Every frame from here on is an authenticated packet.
    let parts = plain.into_parts();
    let mut authed_parts = FramedParts::new::<Vec<u8>>(
        parts.io,
        AuthedCodec::new(AuthedSession::new(suite, secret.clone())),
    );
    authed_parts.read_buf = parts.read_buf;
    authed_parts.write_buf = parts.write_buf;
    let mut framed = Framed::from_parts(authed_parts);

    // Handshake acknowledge: the client proves the secret.
    let ack_raw = match framed.next().await {
        Some(Ok(raw)) => raw,
        _ => return Ok(()),
    };
    let ack = match decode_request(&ack_raw) {
        Some(ack) if ack.request_id == RequestId::HandshakeAcknowledge as u32 => ack,
        _ => return Ok(()),
    };
    if handshake::verify_challenge_digest(suite, &secret, &server_challenge_nonce, &ack.body)
        .is_err()
    {
        warn!("handshake acknowledge failed for entity {}", entity_id);
        return Ok(());
    }
    framed
        .send(encode_response(
            ack.request_id,
            ack.offset,
            STATUS_SUCCESS,
            &[],
        ))
        .await?;
    info!("entity {} authenticated on connection {}", entity_id, conn_id);

    let (out_tx, mut out_rx) = mpsc::unbounded::<Vec<u8>>();
    let mut registered_provider: Option<Id> = None;

    // Request loop.
    let result: anyhow::Result<()> = loop {
        let raw = tokio::select! {
            inbound = framed.next() => match inbound {
                Some(Ok(raw)) => raw,
                Some(Err(err)) => break Err(err.into()),
                None => break Ok(()),
            },
            pushed = out_rx.next() => {
                if let Some(frame) = pushed {
                    framed.send(frame).await?;
                }
                continue;
            }
        };

        let request = match decode_request(&raw) {
            Some(request) => request,
            None => {
                framed
                    .send(encode_response(
                        0,
                        0,
                        status::protocol::REQUEST_PACKET_INVALID_SIZE,
                        &[],
                    ))
                    .await?;
                break Ok(());
            }
        };
        let request_id = match RequestId::from_u32(request.request_id) {
            Some(request_id) => request_id,
            None => {
                framed
                    .send(encode_response(
                        request.request_id,
                        request.offset,
                        status::protocol::INVALID_REQUEST_ID,
                        &[],
                    ))
                    .await?;
                break Ok(());
            }
        };

        // Capability gate: subject is the authenticated entity, the object
        // is the agent for chain verbs and the provider for extended
        // sends.
        if let Some(verb) = request_id.required_verb() {
            let object = match request_id {
                RequestId::ExtendedApiSendRecv => {
                    api::body_id(&request.body).unwrap_or_else(zero_id)
                }
                _ => agent_id,
            };
            let allowed = env.shared.borrow().caps.check(entity_id, verb, object);
            if !allowed {
                framed
                    .send(encode_response(
                        request.request_id,
                        request.offset,
                        status::protocol::UNAUTHORIZED,
                        &[],
                    ))
                    .await?;
                continue;
            }
        }

        match request_id {
            RequestId::HandshakeInitiate | RequestId::HandshakeAcknowledge => {
                // A second handshake on a live session is a protocol error.
                framed
                    .send(encode_response(
                        request.request_id,
                        request.offset,
                        status::protocol::HANDSHAKE_FAILURE,
                        &[],
                    ))
                    .await?;
                break Ok(());
            }
            RequestId::Close => {
                framed
                    .send(encode_response(
                        request.request_id,
                        request.offset,
                        STATUS_SUCCESS,
                        &[],
                    ))
                    .await?;
                break Ok(());
            }
            RequestId::LatestBlockIdGet => {
                let (tx, rx) = oneshot::channel();
                let _ = env.data_tx.unbounded_send(DataCommand::LatestBlockId(tx));
                respond_from_data(&mut framed, &request, rx).await?;
            }
            RequestId::BlockById => match api::body_id(&request.body) {
                Some(block_id) if request.body.len() == 16 => {
                    let (tx, rx) = oneshot::channel();
                    let _ = env
                        .data_tx
                        .unbounded_send(DataCommand::BlockRead(block_id, tx));
                    respond_from_data(&mut framed, &request, rx).await?;
                }
                _ => {
                    framed
                        .send(invalid_size_response(&request))
                        .await?;
                }
            },
            RequestId::BlockIdByHeight => {
                if request.body.len() != 8 {
                    framed.send(invalid_size_response(&request)).await?;
                } else {
                    let height = u64::from_be_bytes([
                        request.body[0],
                        request.body[1],
                        request.body[2],
                        request.body[3],
                        request.body[4],
                        request.body[5],
                        request.body[6],
                        request.body[7],
                    ]);
                    let (tx, rx) = oneshot::channel();
                    let _ = env
                        .data_tx
                        .unbounded_send(DataCommand::BlockIdByHeight(height, tx));
                    respond_from_data(&mut framed, &request, rx).await?;
                }
            }
            RequestId::TransactionById => match api::body_id(&request.body) {
                Some(transaction_id) if request.body.len() == 16 => {
                    let (tx, rx) = oneshot::channel();
                    let _ = env
                        .data_tx
                        .unbounded_send(DataCommand::CanonizedTransactionRead(transaction_id, tx));
                    respond_from_data(&mut framed, &request, rx).await?;
                }
                _ => {
                    framed.send(invalid_size_response(&request)).await?;
                }
            },
            RequestId::ArtifactById => match api::body_id(&request.body) {
                Some(artifact_id) if request.body.len() == 16 => {
                    let (tx, rx) = oneshot::channel();
                    let _ = env
                        .data_tx
                        .unbounded_send(DataCommand::ArtifactRead(artifact_id, tx));
                    respond_from_data(&mut framed, &request, rx).await?;
                }
                _ => {
                    framed.send(invalid_size_response(&request)).await?;
                }
            },
            RequestId::TransactionSubmit => {
                if request.body.len() <= 32 {
                    framed.send(invalid_size_response(&request)).await?;
                } else {
                    let transaction_id = api::body_id(&request.body[0..16]).expect("sized");
                    let artifact_id = api::body_id(&request.body[16..32]).expect("sized");
                    let cert = request.body[32..].to_vec();
                    let (tx, rx) = oneshot::channel();
                    let _ = env.data_tx.unbounded_send(DataCommand::TransactionSubmit {
                        transaction_id,
                        artifact_id,
                        cert,
                        reply: tx,
                    });
                    respond_from_data(&mut framed, &request, rx).await?;
                }
            }
            RequestId::AssertLatestBlockId => match api::body_id(&request.body) {
                Some(block_id) if request.body.len() == 16 => {
                    // The ack and any invalidation arrive via the outbound
                    // channel, correlated by this client's offset.
                    let _ = env.notify_tx.unbounded_send(NotifyCommand::Assert {
                        conn: conn_id,
                        client_offset: request.offset,
                        block_id,
                        out: out_tx.clone(),
                    });
                }
                _ => {
                    framed.send(invalid_size_response(&request)).await?;
                }
            },
            RequestId::AssertLatestBlockIdCancel => {
                let _ = env.notify_tx.unbounded_send(NotifyCommand::Cancel {
                    conn: conn_id,
                    client_offset: request.offset,
                    out: out_tx.clone(),
                });
            }
            RequestId::ExtendedApiEnable => {
                env.shared
                    .borrow_mut()
                    .providers
                    .insert(entity_id, out_tx.clone());
                registered_provider = Some(entity_id);
                framed
                    .send(encode_response(
                        request.request_id,
                        request.offset,
                        STATUS_SUCCESS,
                        &[],
                    ))
                    .await?;
            }
            RequestId::ExtendedApiSendRecv => {
                if request.body.len() < 16 {
                    framed.send(invalid_size_response(&request)).await?;
                    continue;
                }
                let provider_id = api::body_id(&request.body).expect("sized");
                let payload = request.body[16..].to_vec();

                let forwarded = {
                    let mut instance = env.shared.borrow_mut();
                    match instance.providers.get(&provider_id).cloned() {
                        Some(provider) => {
                            let server_offset = instance.next_api_offset;
                            instance.next_api_offset = instance.next_api_offset.wrapping_add(1);
                            instance.pending_api.insert(
                                server_offset,
                                PendingApi {
                                    reply: out_tx.clone(),
                                    client_offset: request.offset,
                                },
                            );
                            let mut body = Vec::with_capacity(16 + payload.len());
                            body.extend_from_slice(entity_id.as_bytes());
                            body.extend_from_slice(&payload);
                            let frame = api::encode_request(
                                RequestId::ExtendedApiSendRecv,
                                server_offset,
                                &body,
                            );
                            provider.unbounded_send(frame).is_ok()
                        }
                        None => false,
                    }
                };
                if !forwarded {
                    framed
                        .send(encode_response(
                            request.request_id,
                            request.offset,
                            status::protocol::EXTENDED_API_UNAVAILABLE,
                            &[],
                        ))
                        .await?;
                }
            }
            RequestId::ExtendedApiResponse => {
                let routed = {
                    let mut instance = env.shared.borrow_mut();
                    match instance.pending_api.remove(&request.offset) {
                        Some(pending) => {
                            let frame = encode_response(
                                RequestId::ExtendedApiSendRecv as u32,
                                pending.client_offset,
                                STATUS_SUCCESS,
                                &request.body,
                            );
                            let _ = pending.reply.unbounded_send(frame);
                            true
                        }
                        None => false,
                    }
                };
                let status = if routed {
                    STATUS_SUCCESS
                } else {
                    status::protocol::EXTENDED_API_UNAVAILABLE
                };
                framed
                    .send(encode_response(
                        request.request_id,
                        request.offset,
                        status,
                        &[],
                    ))
                    .await?;
            }
        }
    };

    // Connection teardown: unregister and cancel outstanding state.
    if let Some(provider_id) = registered_provider {
        env.shared.borrow_mut().providers.remove(&provider_id);
    }
    let _ = env
        .notify_tx
        .unbounded_send(NotifyCommand::Disconnect { conn: conn_id });
    debug!("connection {} closed", conn_id);
    result
}

fn invalid_size_response(request: &api::Request) -> Vec<u8> {
    encode_response(
        request.request_id,
        request.offset,
        status::protocol::REQUEST_PACKET_INVALID_SIZE,
        &[],
    )
}

async fn respond_from_data(
    framed: &mut Framed<tokio::net::TcpStream, AuthedCodec>,
    request: &api::Request,
    rx: oneshot::Receiver<Result<Vec<u8>, DataApiError>>,
) -> anyhow::Result<()> {
    let frame = match rx.await {
        Ok(Ok(payload)) => {
            encode_response(request.request_id, request.offset, STATUS_SUCCESS, &payload)
        }
        Ok(Err(err)) => {
            encode_response(request.request_id, request.offset, upstream_status(&err), &[])
        }
        Err(_) => encode_response(
            request.request_id,
            request.offset,
            status::protocol::UPSTREAM_FAILURE,
            &[],
        ),
    };
    framed.send(frame).await?;
    Ok(())
}

/// Serves the protocol service: control phase, then the accept loop.
pub async fn run(
    control: tokio::net::UnixStream,
    random: tokio::net::UnixStream,
    accept: std::net::TcpListener,
    data: tokio::net::UnixStream,
    notify: tokio::net::UnixStream,
    signal: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(run_inner(control, random, accept, data, notify, signal))
        .await
}

async fn run_inner(
    control: tokio::net::UnixStream,
    random: tokio::net::UnixStream,
    accept: std::net::TcpListener,
    data: tokio::net::UnixStream,
    notify: tokio::net::UnixStream,
    mut signal: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let shared = Rc::new(RefCell::new(Instance::new()));
    let mut control = Framed::new(control, IpcCodec::new());
    let mut signal_byte = [0u8; 1];

    // Control phase: the supervisor configures entities, capabilities and
    // the agent key, then finalizes.
    info!("protocol service awaiting configuration");
    while !shared.borrow().finalized() {
        tokio::select! {
            frame = control.next() => {
                let request = match frame {
                    Some(Ok(Packet::Data(request))) => request,
                    Some(Ok(_)) | Some(Err(_)) => anyhow::bail!("control socket failure"),
                    None => return Ok(()),
                };
                let response = shared.borrow_mut().handle_control(&request);
                control.send(Packet::Data(response)).await?;
            }
            read = signal.read(&mut signal_byte) => {
                match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(_) => {
                        if SignalState::from_byte(signal_byte[0]) == Some(SignalState::Terminate) {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    // One child context on the data service, shared by all connections.
    let mut data = DataApi::new(data);
    let child = data.child_context_create(&protocol_data_caps()).await?;

    let (data_tx, data_rx) = mpsc::unbounded();
    let (notify_tx, notify_rx) = mpsc::unbounded();
    let (random_tx, random_rx) = mpsc::unbounded();
    tokio::task::spawn_local(data_client_task(data, child, data_rx));
    tokio::task::spawn_local(notify_router_task(notify, notify_rx));
    tokio::task::spawn_local(random_client_task(random, random_rx));

    let listener = tokio::net::TcpListener::from_std(accept)?;
    let mut next_conn: u64 = 1;
    info!("protocol service accepting connections");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let conn_id = next_conn;
                next_conn += 1;
                debug!("accepted connection {} from {}", conn_id, peer);
                let env = ConnectionEnv {
                    shared: Rc::clone(&shared),
                    data_tx: data_tx.clone(),
                    notify_tx: notify_tx.clone(),
                    random_tx: random_tx.clone(),
                };
                tokio::task::spawn_local(async move {
                    if let Err(err) = serve_connection(env, stream, conn_id).await {
                        warn!("connection {} failed: {}", conn_id, err);
                    }
                });
            }
            frame = control.next() => {
                match frame {
                    Some(Ok(Packet::Data(request))) => {
                        let response = shared.borrow_mut().handle_control(&request);
                        control.send(Packet::Data(response)).await?;
                    }
                    _ => {
                        info!("control socket closed; protocol service exiting");
                        break;
                    }
                }
            }
            read = signal.read(&mut signal_byte) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if SignalState::from_byte(signal_byte[0]) == Some(SignalState::Terminate) {
                            info!("terminate signal; protocol service exiting");
                            break;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};
    use uuid::Uuid;

    fn id(tail: u8) -> Id {
        let mut bytes = [0u8; 16];
        bytes[15] = tail;
        Uuid::from_bytes(bytes)
    }

    fn control_frame(method: ControlMethod, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(method as u32).to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn status_of(resp: &[u8]) -> u32 {
        BigEndian::read_u32(&resp[8..12])
    }

    fn entity_body(entity: Id) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(entity.as_bytes());
        body.extend_from_slice(&[1u8; 32]);
        body.extend_from_slice(&[2u8; 32]);
        body
    }

    #[test]
    fn control_flow_to_finalize() {
        let mut instance = Instance::new();

        // Finalize before the key is set fails.
        let resp = instance.handle_control(&control_frame(ControlMethod::Finalize, &[]));
        assert_eq!(status_of(&resp), status::protocol::NOT_YET_CONFIGURED);

        let resp = instance.handle_control(&control_frame(
            ControlMethod::AuthEntityAdd,
            &entity_body(id(1)),
        ));
        assert_eq!(status_of(&resp), STATUS_SUCCESS);

        let mut key_body = Vec::new();
        key_body.extend_from_slice(id(9).as_bytes());
        key_body.extend_from_slice(&[7u8; 32]);
        let resp =
            instance.handle_control(&control_frame(ControlMethod::PrivateKeySet, &key_body));
        assert_eq!(status_of(&resp), STATUS_SUCCESS);

        let mut cap_body = Vec::new();
        cap_body.extend_from_slice(id(1).as_bytes());
        cap_body.extend_from_slice(capabilities::CAP_BLOCK_READ.as_bytes());
        cap_body.extend_from_slice(zero_id().as_bytes());
        let resp =
            instance.handle_control(&control_frame(ControlMethod::CapabilityAdd, &cap_body));
        assert_eq!(status_of(&resp), STATUS_SUCCESS);

        let resp = instance.handle_control(&control_frame(ControlMethod::Finalize, &[]));
        assert_eq!(status_of(&resp), STATUS_SUCCESS);
        assert!(instance.ready());

        // Post-finalize control requests fail.
        let resp = instance.handle_control(&control_frame(
            ControlMethod::AuthEntityAdd,
            &entity_body(id(2)),
        ));
        assert_eq!(status_of(&resp), status::protocol::ALREADY_CONFIGURED);

        // The capability survives and checks out.
        assert!(instance
            .caps
            .check(id(1), capabilities::CAP_BLOCK_READ, id(42)));
    }

    #[test]
    fn malformed_control_bodies_rejected() {
        let mut instance = Instance::new();
        let resp = instance.handle_control(&control_frame(ControlMethod::AuthEntityAdd, &[1, 2]));
        assert_eq!(
            status_of(&resp),
            status::protocol::REQUEST_PACKET_INVALID_SIZE
        );

        let resp = instance.handle_control(&[0, 0, 0, 99, 0, 0, 0, 0]);
        assert_eq!(status_of(&resp), status::protocol::INVALID_REQUEST_ID);
    }

    #[test]
    fn protocol_child_caps_exclude_queue_maintenance() {
        let caps = protocol_data_caps();
        assert!(caps.is_set(data_cap::PQ_TRANSACTION_SUBMIT));
        assert!(caps.is_set(data_cap::BLOCK_READ));
        assert!(!caps.is_set(data_cap::PQ_TRANSACTION_PROMOTE));
        assert!(!caps.is_set(data_cap::PQ_TRANSACTION_DROP));
        assert!(!caps.is_set(data_cap::BLOCK_WRITE));
    }
}
