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

//! The notification service.
//!
//! Tracks latest-block assertions on behalf of its two clients and fans
//! out invalidations when the chain head moves. Per offset, a client sees
//! a registration acknowledgment first, then exactly one of an
//! invalidation or a cancel acknowledgment for the registered assertion.
//! A block update's own success response is enqueued only after every
//! invalidation it caused, which is what makes the announcer's view
//! consistent: once the ack arrives, no stale assertion survives.

pub mod api;
pub mod method;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio_util::codec::Framed;
use uuid::Uuid;

use std::collections::BTreeMap;

use crate::bitcap::Bitcap;
use crate::ipc::frame::Packet;
use crate::ipc::IpcCodec;
use crate::signalthread::SignalState;
use crate::status::{self, STATUS_SUCCESS};
use crate::Id;

use self::api::{decode_request, encode_response};
use self::method::{cap, ApiMethod, METHOD_LOWER_BOUND, METHOD_UPPER_BOUND};

/// Connection index of the canonization client.
pub const CANONIZATION_CONNECTION: usize = 0;

/// Connection index of the protocol-service client.
pub const PROTOCOL_CONNECTION: usize = 1;

const CONNECTION_COUNT: usize = 2;

/// An outbound response frame targeted at one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub connection: usize,
    pub frame: Vec<u8>,
}

#[derive(Debug)]
struct Connection {
    caps: Bitcap,
    /// Outstanding assertions keyed by client-chosen offset.
    assertions: BTreeMap<u64, Id>,
}

impl Connection {
    fn new() -> Self {
        Self {
            caps: Bitcap::new_true(cap::BITS),
            assertions: BTreeMap::new(),
        }
    }
}

/// The assertion state machine, independent of transport.
#[derive(Debug)]
pub struct Instance {
    latest: Option<Id>,
    connections: Vec<Connection>,
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

impl Instance {
    pub fn new() -> Self {
        Self {
            latest: None,
            connections: (0..CONNECTION_COUNT).map(|_| Connection::new()).collect(),
        }
    }

    /// The latest block id this service has been told about.
    pub fn latest_block_id(&self) -> Option<Id> {
        self.latest
    }

    /// Handles one request from `connection`, producing response frames in
    /// emission order. Responses may target any connection; within each
    /// connection the order is binding.
    pub fn handle_request(&mut self, connection: usize, raw: &[u8]) -> Vec<Outbound> {
        let request = match decode_request(raw) {
            Ok(request) => request,
            Err(_) => {
                return vec![Outbound {
                    connection,
                    frame: encode_response(
                        0,
                        0,
                        status::notify::REQUEST_PACKET_INVALID_SIZE,
                        &[],
                    ),
                }];
            }
        };

        if request.method < METHOD_LOWER_BOUND || request.method >= METHOD_UPPER_BOUND {
            return vec![Outbound {
                connection,
                frame: encode_response(
                    request.method,
                    request.offset,
                    status::notify::INVALID_REQUEST_ID,
                    &[],
                ),
            }];
        }
        let method = ApiMethod::from_u32(request.method).expect("checked against bounds");

        let authorized = match method {
            ApiMethod::ReduceCaps => true,
            ApiMethod::BlockUpdate => self.connections[connection].caps.is_set(cap::BLOCK_UPDATE),
            ApiMethod::BlockAssertion => {
                self.connections[connection].caps.is_set(cap::BLOCK_ASSERTION)
            }
            ApiMethod::BlockAssertionCancel => self.connections[connection]
                .caps
                .is_set(cap::BLOCK_ASSERTION_CANCEL),
        };
        if !authorized {
            return vec![Outbound {
                connection,
                frame: encode_response(
                    request.method,
                    request.offset,
                    status::notify::NOT_AUTHORIZED,
                    &[],
                ),
            }];
        }

        match method {
            ApiMethod::ReduceCaps => self.reduce_caps(connection, &request),
            ApiMethod::BlockUpdate => self.block_update(connection, &request),
            ApiMethod::BlockAssertion => self.block_assertion(connection, &request),
            ApiMethod::BlockAssertionCancel => self.assertion_cancel(connection, &request),
        }
    }

    fn reduce_caps(&mut self, connection: usize, request: &api::Request) -> Vec<Outbound> {
        let status = match Bitcap::from_bytes(cap::BITS, &request.payload) {
            Some(requested) => {
                self.connections[connection].caps.intersect(&requested);
                STATUS_SUCCESS
            }
            None => status::notify::REQUEST_PACKET_INVALID_SIZE,
        };
        vec![Outbound {
            connection,
            frame: encode_response(request.method, request.offset, status, &[]),
        }]
    }

    fn block_update(&mut self, connection: usize, request: &api::Request) -> Vec<Outbound> {
        let new_id = match id_payload(&request.payload) {
            Some(new_id) => new_id,
            None => {
                return vec![Outbound {
                    connection,
                    frame: encode_response(
                        request.method,
                        request.offset,
                        status::notify::REQUEST_PACKET_INVALID_SIZE,
                        &[],
                    ),
                }];
            }
        };

        self.latest = Some(new_id);
        let mut out = Vec::new();

        // Every stale assertion across every connection is invalidated
        // before the announcer sees its own success.
        for (index, conn) in self.connections.iter_mut().enumerate() {
            let stale: Vec<u64> = conn
                .assertions
                .iter()
                .filter(|(_, asserted)| **asserted != new_id)
                .map(|(offset, _)| *offset)
                .collect();
            for offset in stale {
                conn.assertions.remove(&offset);
                out.push(Outbound {
                    connection: index,
                    frame: encode_response(
                        ApiMethod::BlockAssertion as u32,
                        offset,
                        STATUS_SUCCESS,
                        new_id.as_bytes(),
                    ),
                });
            }
        }
        debug!(
            "block update to {}: {} invalidation(s)",
            new_id,
            out.len()
        );

        out.push(Outbound {
            connection,
            frame: encode_response(request.method, request.offset, STATUS_SUCCESS, &[]),
        });
        out
    }

    fn block_assertion(&mut self, connection: usize, request: &api::Request) -> Vec<Outbound> {
        let asserted = match id_payload(&request.payload) {
            Some(asserted) => asserted,
            None => {
                return vec![Outbound {
                    connection,
                    frame: encode_response(
                        request.method,
                        request.offset,
                        status::notify::REQUEST_PACKET_INVALID_SIZE,
                        &[],
                    ),
                }];
            }
        };

        // Registration ack always precedes any invalidation.
        let mut out = vec![Outbound {
            connection,
            frame: encode_response(request.method, request.offset, STATUS_SUCCESS, &[]),
        }];

        match self.latest {
            Some(latest) if latest != asserted => {
                // Already stale: invalidate immediately, nothing to hold.
                out.push(Outbound {
                    connection,
                    frame: encode_response(
                        ApiMethod::BlockAssertion as u32,
                        request.offset,
                        STATUS_SUCCESS,
                        latest.as_bytes(),
                    ),
                });
            }
            _ => {
                self.connections[connection]
                    .assertions
                    .insert(request.offset, asserted);
            }
        }
        out
    }

    fn assertion_cancel(&mut self, connection: usize, request: &api::Request) -> Vec<Outbound> {
        // Removal happens at most once; the acknowledgment is idempotent.
        self.connections[connection]
            .assertions
            .remove(&request.offset);
        vec![Outbound {
            connection,
            frame: encode_response(request.method, request.offset, STATUS_SUCCESS, &[]),
        }]
    }
}

fn id_payload(payload: &[u8]) -> Option<Id> {
    if payload.len() != 16 {
        return None;
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(payload);
    Some(Uuid::from_bytes(bytes))
}

/// Serves both client connections until one closes or a terminate signal
/// arrives on the internal signal socket.
pub async fn run(
    canonization: tokio::net::UnixStream,
    protocol: tokio::net::UnixStream,
    mut signal: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let mut instance = Instance::new();
    let mut canonization = Framed::new(canonization, IpcCodec::new());
    let mut protocol = Framed::new(protocol, IpcCodec::new());
    let mut signal_byte = [0u8; 1];

    info!("notification service ready");
    loop {
        let (index, frame) = tokio::select! {
            frame = canonization.next() => (CANONIZATION_CONNECTION, frame),
            frame = protocol.next() => (PROTOCOL_CONNECTION, frame),
            read = signal.read(&mut signal_byte) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => match SignalState::from_byte(signal_byte[0]) {
                        Some(SignalState::Terminate) => {
                            info!("terminate signal; notification service exiting");
                            break;
                        }
                        _ => {
                            info!("quiesce signal");
                            continue;
                        }
                    },
                }
            }
        };

        let request = match frame {
            Some(Ok(Packet::Data(request))) => request,
            Some(Ok(other)) => {
                warn!(
                    "unexpected packet type {:#010x} on connection {}",
                    other.wire_type(),
                    index
                );
                break;
            }
            Some(Err(err)) => {
                warn!("transport failure on connection {}: {}", index, err);
                break;
            }
            None => {
                info!("connection {} closed", index);
                break;
            }
        };

        for outbound in instance.handle_request(index, &request) {
            let packet = Packet::Data(outbound.frame);
            if outbound.connection == CANONIZATION_CONNECTION {
                canonization.send(packet).await?;
            } else {
                protocol.send(packet).await?;
            }
        }
    }
    Ok(())
}
